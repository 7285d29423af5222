//! Session lifecycle, fan-out, liveness, and verification scenarios.
//!
//! Runs pairs of sessions against in-memory gateways with shortened
//! protocol timings. Datagram delivery is explicit: a test moves each
//! gateway's outbox into the peer session, so "the network drops
//! everything" is simply not pumping.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use secp256k1::{Keypair, Secp256k1};
use tokio::runtime::Handle;

use super::*;
use crate::cert::{Certificate, OverlayPrefix, Subkey, UserId, FLAG_CAN_AUTHENTICATE};
use crate::config::VerifyPolicy;
use crate::dtls::{CertType, Credentials};
use crate::keyring::{Keyring, MemoryKeyring, MemoryKeyserver};

// ============================================================================
// Test Gateway
// ============================================================================

#[derive(Default)]
struct GatewayState {
    outbox: Vec<(SocketAddr, Vec<u8>)>,
    endpoints: HashMap<u64, (SocketAddr, Arc<Session>)>,
    prefixes: HashMap<u64, (OverlayPrefix, Arc<Session>)>,
    decrypted: Vec<Vec<u8>>,
    next_handle: u64,
    endpoint_disconnects: usize,
    prefix_disconnects: usize,
}

struct TestGateway {
    credentials: Arc<Credentials>,
    state: Mutex<GatewayState>,
}

impl TestGateway {
    fn new(credentials: Arc<Credentials>) -> Arc<Self> {
        Arc::new(Self {
            credentials,
            state: Mutex::new(GatewayState::default()),
        })
    }

    fn take_outbox(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.state.lock().outbox)
    }

    fn session_at(&self, endpoint: SocketAddr) -> Option<Arc<Session>> {
        self.state
            .lock()
            .endpoints
            .values()
            .find(|(addr, _)| *addr == endpoint)
            .map(|(_, session)| Arc::clone(session))
    }

    fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    fn prefix_count(&self) -> usize {
        self.state.lock().prefixes.len()
    }

    fn decrypted_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().decrypted.clone()
    }

    fn disconnect_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.endpoint_disconnects, state.prefix_disconnects)
    }
}

impl Gateway for TestGateway {
    fn credentials(&self) -> Arc<Credentials> {
        Arc::clone(&self.credentials)
    }

    fn send(&self, buf: &[u8], endpoint: SocketAddr) -> std::io::Result<usize> {
        self.state.lock().outbox.push((endpoint, buf.to_vec()));
        Ok(buf.len())
    }

    fn connect_endpoint(&self, endpoint: SocketAddr, session: Arc<Session>) -> EndpointHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = EndpointHandle::new(state.next_handle);
        state.endpoints.insert(handle.as_u64(), (endpoint, session));
        handle
    }

    fn connect_prefix(&self, prefix: OverlayPrefix, session: Arc<Session>) -> PrefixHandle {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = PrefixHandle::new(state.next_handle);
        state.prefixes.insert(handle.as_u64(), (prefix, session));
        handle
    }

    fn disconnect_endpoint(&self, handle: EndpointHandle) {
        let mut state = self.state.lock();
        state.endpoints.remove(&handle.as_u64());
        state.endpoint_disconnects += 1;
    }

    fn disconnect_prefix(&self, handle: PrefixHandle) {
        let mut state = self.state.lock();
        state.prefixes.remove(&handle.as_u64());
        state.prefix_disconnects += 1;
    }

    fn decrypted(&self, buf: &[u8]) {
        self.state.lock().decrypted.push(buf.to_vec());
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Node {
    gateway: Arc<TestGateway>,
    keyring: Arc<MemoryKeyring>,
    cert: Certificate,
}

fn make_identity(name: &str) -> (Arc<Credentials>, Certificate) {
    let secp = Secp256k1::new();
    let (_, primary_pub) = secp.generate_keypair(&mut rand::rng());
    let (subkey_secret, _) = secp.generate_keypair(&mut rand::rng());
    let subkey = Keypair::from_secret_key(&secp, &subkey_secret);

    let cert = Certificate {
        primary: primary_pub.x_only_public_key().0,
        created: 1_700_000_000,
        expires: 0,
        uids: vec![UserId::new(name).unwrap()],
        subkeys: vec![Subkey {
            pubkey: subkey.x_only_public_key().0,
            flags: FLAG_CAN_AUTHENTICATE,
            created: 1_700_000_000,
            expires: 0,
        }],
    };
    let credentials = Credentials::new(cert.clone(), subkey, "NORMAL").unwrap();
    (credentials, cert)
}

fn make_node(name: &str) -> Node {
    let (credentials, cert) = make_identity(name);
    Node {
        gateway: TestGateway::new(credentials),
        keyring: Arc::new(MemoryKeyring::new()),
        cert,
    }
}

/// Import `peer`'s certificate into `node`'s keyring.
fn trust(node: &Node, peer: &Node) {
    node.keyring.import(&peer.cert.encode()).unwrap();
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        verify: VerifyPolicy::default(),
        handshake_retransmit_ms: 20,
        handshake_timeout_ms: 200,
        heartbeat_interval_ms: 40,
        heartbeat_payload: 64,
        heartbeat_max_missed: 3,
        destroy_grace_ms: 40,
        data_mtu: 1280,
    }
}

fn make_env(node: &Node, config: SessionConfig) -> SessionEnv {
    SessionEnv {
        runtime: Handle::current(),
        gateway: node.gateway.clone(),
        keyring: node.keyring.clone(),
        keyserver: None,
        config: Arc::new(config),
    }
}

fn client_addr() -> SocketAddr {
    "10.0.0.1:4433".parse().unwrap()
}

fn server_addr() -> SocketAddr {
    "10.0.0.2:4433".parse().unwrap()
}

/// Shuttle pending datagrams between the two sessions until both outboxes
/// drain.
fn pump(a: &Node, sa: &Arc<Session>, b: &Node, sb: &Arc<Session>) {
    let mut scratch = [0u8; 2048];
    for _ in 0..32 {
        let out_a = a.gateway.take_outbox();
        let out_b = b.gateway.take_outbox();
        if out_a.is_empty() && out_b.is_empty() {
            return;
        }
        for (_, datagram) in out_a {
            sb.receive(&datagram, &mut scratch);
        }
        for (_, datagram) in out_b {
            sa.receive(&datagram, &mut scratch);
        }
    }
}

/// Build a trusted client/server pair and run the handshake to completion.
fn established_pair(
    config: SessionConfig,
) -> (Node, Arc<Session>, Node, Arc<Session>) {
    let client = make_node("client");
    let server = make_node("server");
    trust(&client, &server);
    trust(&server, &client);

    let server_session = Session::accept(make_env(&server, config.clone()), client_addr());
    let client_session =
        Session::connect(make_env(&client, config), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);
    assert!(client_session.handshake_completed());
    assert!(server_session.handshake_completed());
    (client, client_session, server, server_session)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_handshake_and_round_trip() {
    let (client, client_session, server, server_session) = established_pair(fast_config());

    assert!(client_session.is_verified());
    assert!(server_session.is_verified());
    assert_eq!(client.gateway.prefix_count(), 1);
    assert_eq!(server.gateway.prefix_count(), 1);

    client_session.send(b"hello overlay").unwrap();
    pump(&client, &client_session, &server, &server_session);
    assert!(server
        .gateway
        .decrypted_frames()
        .contains(&b"hello overlay".to_vec()));

    server_session.send(b"hello back").unwrap();
    pump(&client, &client_session, &server, &server_session);
    assert!(client
        .gateway
        .decrypted_frames()
        .contains(&b"hello back".to_vec()));
}

#[tokio::test]
async fn test_prefix_registered_under_peer_fingerprint() {
    let (client, _client_session, server, _server_session) = established_pair(fast_config());

    let expected_server_prefix = OverlayPrefix::from_fingerprint(&server.cert.fingerprint());
    let registered: Vec<OverlayPrefix> = client
        .gateway
        .state
        .lock()
        .prefixes
        .values()
        .map(|(prefix, _)| *prefix)
        .collect();
    assert_eq!(registered, vec![expected_server_prefix]);

    let expected_client_prefix = OverlayPrefix::from_fingerprint(&client.cert.fingerprint());
    let registered: Vec<OverlayPrefix> = server
        .gateway
        .state
        .lock()
        .prefixes
        .values()
        .map(|(prefix, _)| *prefix)
        .collect();
    assert_eq!(registered, vec![expected_client_prefix]);
}

#[tokio::test]
async fn test_send_before_established() {
    let client = make_node("client");
    let session = Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();
    assert!(matches!(
        session.send(b"early"),
        Err(SessionError::NotEstablished)
    ));
    session.terminate();
}

#[tokio::test]
async fn test_client_endpoint_fan_over() {
    let client = make_node("client");
    let config = fast_config();

    let a: SocketAddr = "10.1.0.1:1".parse().unwrap();
    let b: SocketAddr = "10.1.0.2:2".parse().unwrap();
    let c: SocketAddr = "10.1.0.3:3".parse().unwrap();

    // The network drops everything: no pumping.
    let first = Session::connect(make_env(&client, config), vec![a, b, c]).unwrap();
    assert_eq!(first.endpoint(), a);
    assert_eq!(first.remaining_candidates(), vec![b, c]);

    tokio::time::sleep(Duration::from_millis(320)).await;
    assert!(first.is_terminated());
    let second = client.gateway.session_at(b).expect("successor for B");
    assert_eq!(second.remaining_candidates(), vec![c]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(second.is_terminated());
    let third = client.gateway.session_at(c).expect("successor for C");
    assert!(third.remaining_candidates().is_empty());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(third.is_terminated());
    assert_eq!(client.gateway.endpoint_count(), 0);

    let (endpoint_disconnects, prefix_disconnects) = client.gateway.disconnect_counts();
    assert_eq!(endpoint_disconnects, 3);
    assert_eq!(prefix_disconnects, 0);
}

#[tokio::test]
async fn test_heartbeat_loss_terminates() {
    let (_client, client_session, _server, server_session) = established_pair(fast_config());

    // Drop all traffic from here on: pongs never arrive, so the miss
    // counter walks past the limit.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client_session.is_terminated());
    assert!(server_session.is_terminated());
}

#[tokio::test]
async fn test_heartbeats_keep_session_alive() {
    let (client, client_session, server, server_session) = established_pair(fast_config());

    // Keep pumping past several heartbeat intervals; pongs reset the
    // counter and nothing terminates.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        pump(&client, &client_session, &server, &server_session);
    }
    assert!(!client_session.is_terminated());
    assert!(!server_session.is_terminated());
}

#[tokio::test]
async fn test_alert_on_bad_certificate_type() {
    let secp = Secp256k1::new();
    let (subkey_secret, _) = secp.generate_keypair(&mut rand::rng());
    let subkey = Keypair::from_secret_key(&secp, &subkey_secret);

    // A client presenting an opaque non-OpenPGP certificate.
    let client_creds = Credentials::from_raw_parts(
        b"-----BEGIN CERTIFICATE-----".to_vec(),
        CertType::X509,
        subkey,
        [0u8; 8],
        "NORMAL",
    )
    .unwrap();
    let client = Node {
        gateway: TestGateway::new(client_creds),
        keyring: Arc::new(MemoryKeyring::new()),
        cert: make_identity("unused").1,
    };
    let server = make_node("server");
    trust(&client, &server);

    let server_session = Session::accept(make_env(&server, fast_config()), client_addr());
    let client_session =
        Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);

    // Verification fails at the certificate-type gate; the alert reaches
    // the client and both sides come down without a server-side prefix.
    assert!(server_session.is_terminated());
    assert!(client_session.is_terminated());
    assert!(!server_session.is_verified());
    assert_eq!(server.gateway.prefix_count(), 0);
}

#[tokio::test]
async fn test_subkey_mismatch_rejected() {
    let client = make_node("client");
    let server = make_node("server");
    trust(&client, &server);

    // The server knows the client's key, but under subkey fingerprints
    // whose tails cannot match the advertised subkey id.
    let mut entry = MemoryKeyring::entry_for(&client.cert);
    for subkey in &mut entry.subkeys {
        subkey.fingerprint_hex = "00".repeat(20);
    }
    server.keyring.insert(entry);

    let server_session = Session::accept(make_env(&server, fast_config()), client_addr());
    let client_session =
        Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);

    assert!(server_session.is_terminated());
    assert!(!server_session.is_verified());
    assert_eq!(server.gateway.prefix_count(), 0);
    assert!(client_session.is_terminated());
}

#[tokio::test]
async fn test_unknown_peer_rejected_silently() {
    let client = make_node("client");
    let server = make_node("server");
    trust(&client, &server);
    // Server keyring never learns the client's key.

    let server_session = Session::accept(make_env(&server, fast_config()), client_addr());
    let client_session =
        Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);

    assert!(server_session.is_terminated());
    assert!(!server_session.is_verified());
    assert_eq!(server.gateway.prefix_count(), 0);
}

#[tokio::test]
async fn test_import_policy_trusts_presented_certificate() {
    let client = make_node("client");
    let server = make_node("server");
    trust(&client, &server);

    // No pre-seeded entry, but the import policy stores the presented
    // certificate before lookup.
    let mut config = fast_config();
    config.verify.import = true;

    let server_session = Session::accept(make_env(&server, config.clone()), client_addr());
    let client_session =
        Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);

    assert!(server_session.is_verified());
    assert!(client_session.handshake_completed());
    assert_eq!(server.keyring.len(), 1);
}

#[tokio::test]
async fn test_keyserver_fetch_populates_keyring() {
    let client = make_node("client");
    let server = make_node("server");
    trust(&client, &server);

    let keyserver = Arc::new(MemoryKeyserver::new());
    keyserver.publish(client.cert.encode()).unwrap();

    let mut config = fast_config();
    config.verify.keyserver = "hkp://keys.overlay.test".to_string();
    let mut env = make_env(&server, config);
    env.keyserver = Some(keyserver);

    let server_session = Session::accept(env, client_addr());
    let client_session =
        Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);

    assert!(server_session.is_verified());
    assert_eq!(server.keyring.len(), 1);
}

#[tokio::test]
async fn test_validity_threshold_rejects_unknown_uids() {
    let client = make_node("client");
    let server = make_node("server");
    trust(&client, &server);
    trust(&server, &client); // default import leaves UID validity unknown

    let mut config = fast_config();
    config.verify.validity = 4; // require full validity

    let server_session = Session::accept(make_env(&server, config), client_addr());
    let client_session =
        Session::connect(make_env(&client, fast_config()), vec![server_addr()]).unwrap();

    pump(&client, &client_session, &server, &server_session);

    assert!(server_session.is_terminated());
    assert!(!server_session.is_verified());
}

#[tokio::test]
async fn test_clean_bye() {
    let (client, client_session, server, server_session) = established_pair(fast_config());

    client_session.terminate();
    pump(&client, &client_session, &server, &server_session);

    // The peer observes the close alert and comes down too.
    assert!(server_session.is_terminated());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.gateway.endpoint_count(), 0);
    assert_eq!(client.gateway.prefix_count(), 0);
    assert_eq!(server.gateway.endpoint_count(), 0);
    assert_eq!(server.gateway.prefix_count(), 0);

    assert_eq!(client.gateway.disconnect_counts(), (1, 1));
    assert_eq!(server.gateway.disconnect_counts(), (1, 1));
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let (_client, client_session, _server, _server_session) = established_pair(fast_config());

    client_session.terminate();
    client_session.terminate();
    client_session.terminate();
    assert!(client_session.is_terminated());

    // Sends after terminate are dropped, not errors.
    assert!(client_session.send(b"late").is_ok());
}

#[tokio::test]
async fn test_receive_after_terminate_is_dropped() {
    let (client, client_session, server, server_session) = established_pair(fast_config());

    server_session.terminate();
    client_session.send(b"into the void").unwrap();
    pump(&client, &client_session, &server, &server_session);

    assert!(server.gateway.decrypted_frames().is_empty());
}

#[tokio::test]
async fn test_cookie_prestate_rejected_after_handshake() {
    let (_client, _client_session, _server, server_session) = established_pair(fast_config());

    let cookie = crate::dtls::Cookie::from_bytes([1u8; 32]);
    assert!(server_session.set(cookie).is_err());
}

#[tokio::test]
async fn test_cookie_prestate_accepted_before_handshake() {
    let server = make_node("server");
    let server_session = Session::accept(make_env(&server, fast_config()), client_addr());

    let cookie = crate::dtls::Cookie::from_bytes([1u8; 32]);
    assert!(server_session.set(cookie).is_ok());
    server_session.terminate();
}
