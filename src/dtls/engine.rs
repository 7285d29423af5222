//! The datagram security engine.
//!
//! Owns the handshake state machine, flight retransmission, and the sealed
//! record layer. Driven entirely by the caller: inbound datagrams arrive
//! through the pull hook, outbound datagrams leave through the push hook,
//! and retransmission happens when `handshake` is called on the caller's
//! timer cadence with the current time.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use secp256k1::{schnorr::Signature, Keypair, PublicKey, Secp256k1};
use tracing::{debug, trace};

use super::cipher::{CipherState, TAG_SIZE};
use super::replay::ReplayWindow;
use super::transcript::{ecdh, Transcript, LABEL_CLIENT_FINISHED, LABEL_SERVER_FINISHED};
use super::wire::{
    self, ClientFlight, ClientHello, HelloVerify, PlainAlert, Prefix, ServerFinished,
    ServerFlight, FLAG_CERT_REQUEST, KIND_CLIENT_FLIGHT, KIND_CLIENT_HELLO, KIND_HELLO_VERIFY,
    KIND_PLAIN_ALERT, KIND_SEALED, KIND_SERVER_FINISHED, KIND_SERVER_FLIGHT, REC_ALERT, REC_DATA,
    REC_HB_PING, REC_HB_PONG, SEALED_HEADER_SIZE,
};
use super::{
    AlertKind, AlertLevel, CertType, CertVerifier, Cookie, Credentials, EngineError,
    HandshakePeer, LinkIo, Role, DEFAULT_DATA_MTU, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_RETRANSMIT_MS, MAX_DATAGRAM_SIZE,
};
use crate::cert::{Certificate, SUBKEY_ID_SIZE};

/// Handshake state machine phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Client: nothing sent yet. Server: awaiting a client hello.
    Start,
    /// Client: hello sent, awaiting hello-verify or the server flight.
    HelloSent,
    /// Server: flight sent, awaiting the client flight.
    AwaitClientFlight,
    /// Client: flight sent, awaiting the server finished.
    FlightSent,
    /// Handshake complete, record layer keyed.
    Complete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Start => "start",
            Phase::HelloSent => "hello_sent",
            Phase::AwaitClientFlight => "await_client_flight",
            Phase::FlightSent => "flight_sent",
            Phase::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a record-receive operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Record {
    /// Application data of the given length was written into the caller's
    /// buffer.
    Data(usize),
    /// Peer sent a heartbeat ping; answer with [`Engine::pong`].
    HeartbeatPing,
    /// Peer answered a heartbeat ping.
    HeartbeatPong,
    /// A non-closing alert arrived; it is left pending for inspection.
    Alert(AlertLevel, AlertKind),
    /// Peer sent close-notify; the session is over.
    Closed,
}

/// Engine construction parameters.
#[derive(Clone)]
pub struct EngineConfig {
    pub role: Role,
    pub credentials: Arc<Credentials>,
    /// Request and require a peer certificate (server side).
    pub require_peer_certificate: bool,
    /// Whether the peer is allowed to send heartbeat pings.
    pub peer_heartbeats: bool,
    /// Initial flight retransmit timeout in milliseconds.
    pub retransmit_ms: u64,
    /// Total handshake deadline in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Plaintext MTU for data records.
    pub data_mtu: usize,
}

impl EngineConfig {
    pub fn new(role: Role, credentials: Arc<Credentials>) -> Self {
        Self {
            role,
            credentials,
            require_peer_certificate: true,
            peer_heartbeats: true,
            retransmit_ms: DEFAULT_RETRANSMIT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            data_mtu: DEFAULT_DATA_MTU,
        }
    }
}

/// A datagram security session.
pub struct Engine {
    role: Role,
    creds: Arc<Credentials>,
    require_peer_cert: bool,
    peer_heartbeats: bool,
    retransmit_base_ms: u64,
    handshake_timeout_ms: u64,
    data_mtu: usize,

    phase: Phase,
    closed: bool,
    transcript: Option<Transcript>,

    /// Client: our hello random. Server: unused.
    local_random: [u8; 32],
    /// Server: the accepted hello's random (dup detection).
    peer_random: Option<[u8; 32]>,
    /// Client: cookie to echo in the next hello.
    cookie: Vec<u8>,
    /// Server: secret for self-issued hello-verify cookies.
    cookie_secret: [u8; 32],
    /// Server: gateway-verified cookie installed via prestate.
    prestate: Option<Cookie>,

    ephemeral: Option<Keypair>,
    peer_chain: Vec<Vec<u8>>,
    peer_cert_type: Option<CertType>,
    peer_subkey_id: [u8; SUBKEY_ID_SIZE],
    expected_server_mac: Option<[u8; 32]>,

    send_cipher: Option<CipherState>,
    recv_cipher: Option<CipherState>,
    send_seq: u64,
    recv_window: ReplayWindow,

    /// Last retransmittable flight, as wire bytes.
    flight: Option<Vec<u8>>,
    flight_sent_at_ms: u64,
    rto_ms: u64,
    started_ms: Option<u64>,

    pending_alert: Option<(AlertLevel, AlertKind)>,
    last_ping: Option<Vec<u8>>,
    recv_buf: Vec<u8>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let mut local_random = [0u8; 32];
        rand::rng().fill_bytes(&mut local_random);
        let mut cookie_secret = [0u8; 32];
        rand::rng().fill_bytes(&mut cookie_secret);

        Self {
            role: config.role,
            creds: config.credentials,
            require_peer_cert: config.require_peer_certificate,
            peer_heartbeats: config.peer_heartbeats,
            retransmit_base_ms: config.retransmit_ms,
            handshake_timeout_ms: config.handshake_timeout_ms,
            data_mtu: config.data_mtu,
            phase: Phase::Start,
            closed: false,
            transcript: None,
            local_random,
            peer_random: None,
            cookie: Vec::new(),
            cookie_secret,
            prestate: None,
            ephemeral: None,
            peer_chain: Vec::new(),
            peer_cert_type: None,
            peer_subkey_id: [0u8; SUBKEY_ID_SIZE],
            expected_server_mac: None,
            send_cipher: None,
            recv_cipher: None,
            send_seq: 0,
            recv_window: ReplayWindow::new(),
            flight: None,
            flight_sent_at_ms: 0,
            rto_ms: config.retransmit_ms,
            started_ms: None,
            pending_alert: None,
            last_ping: None,
            recv_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.phase == Phase::Complete
    }

    /// Whether the engine holds an unacknowledged outbound flight, i.e. it
    /// owns the retransmission direction and wants to write again.
    pub fn awaiting_write(&self) -> bool {
        self.phase != Phase::Complete && self.flight.is_some()
    }

    /// Milliseconds until the engine next wants a handshake step: the next
    /// scheduled flight retransmission or the total deadline, whichever
    /// comes first.
    pub fn retransmit_timeout(&self, now_ms: u64) -> u64 {
        let next_retransmit = match &self.flight {
            Some(_) => self.flight_sent_at_ms + self.rto_ms,
            None => now_ms + self.retransmit_base_ms,
        };
        let deadline = self.started_ms.unwrap_or(now_ms) + self.handshake_timeout_ms;
        next_retransmit.min(deadline).saturating_sub(now_ms).max(1)
    }

    /// Set the plaintext MTU for data records.
    pub fn set_data_mtu(&mut self, mtu: usize) {
        self.data_mtu = mtu;
    }

    /// Install a gateway-verified cookie so the next matching client hello
    /// is accepted without another hello-verify round. Server side, before
    /// the handshake starts.
    pub fn set_prestate(&mut self, cookie: Cookie) -> Result<(), EngineError> {
        if self.role != Role::Server {
            return Err(EngineError::BadState("prestate on a client engine"));
        }
        if self.phase != Phase::Start {
            return Err(EngineError::BadState("prestate after hello accepted"));
        }
        self.prestate = Some(cookie);
        Ok(())
    }

    /// Take the most recently received alert, if one is pending.
    pub fn take_pending_alert(&mut self) -> Option<(AlertLevel, AlertKind)> {
        self.pending_alert.take()
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Perform one handshake step.
    ///
    /// Consumes any pending inbound datagram, performs due retransmissions,
    /// and returns `Ok(())` once the handshake is complete. `WouldBlock`
    /// means more input or another timer tick is needed; `TimedOut` means
    /// the total deadline elapsed.
    pub fn handshake(
        &mut self,
        io: &mut dyn LinkIo,
        verifier: &mut dyn CertVerifier,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        if self.phase == Phase::Complete {
            return Ok(());
        }
        if self.closed {
            return Err(EngineError::Closed);
        }

        let started = *self.started_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(started) >= self.handshake_timeout_ms {
            debug!(role = %self.role, phase = %self.phase, "Handshake deadline elapsed");
            return Err(EngineError::TimedOut);
        }

        // Drain pending input.
        while io.pull_ready() > 0 {
            let n = match io.pull(&mut self.recv_buf) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(EngineError::Io(e)),
            };
            let datagram = std::mem::replace(&mut self.recv_buf, Vec::new());
            let result = self.process_handshake_datagram(&datagram[..n], io, verifier, now_ms);
            self.recv_buf = datagram;
            result?;
            if self.phase == Phase::Complete {
                return Ok(());
            }
        }

        // Client opens the exchange.
        if self.role == Role::Client && self.phase == Phase::Start {
            self.send_hello(io, now_ms)?;
            return Err(EngineError::WouldBlock);
        }

        // Due retransmission of the outstanding flight.
        if let Some(flight) = &self.flight {
            if now_ms.saturating_sub(self.flight_sent_at_ms) >= self.rto_ms {
                trace!(role = %self.role, phase = %self.phase, rto_ms = self.rto_ms, "Retransmitting flight");
                io.push(flight)?;
                self.flight_sent_at_ms = now_ms;
                self.rto_ms = self.rto_ms.saturating_mul(2);
            }
        }

        Err(EngineError::WouldBlock)
    }

    fn process_handshake_datagram(
        &mut self,
        data: &[u8],
        io: &mut dyn LinkIo,
        verifier: &mut dyn CertVerifier,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let Some(prefix) = Prefix::parse(data) else {
            trace!("Discarding runt datagram");
            return Ok(());
        };

        match (self.role, prefix.kind) {
            (Role::Server, KIND_CLIENT_HELLO) => self.on_client_hello(data, io, now_ms),
            (Role::Client, KIND_HELLO_VERIFY) => self.on_hello_verify(data, io, now_ms),
            (Role::Client, KIND_SERVER_FLIGHT) => {
                self.on_server_flight(data, io, verifier, now_ms)
            }
            (Role::Server, KIND_CLIENT_FLIGHT) => {
                self.on_client_flight(data, io, verifier, now_ms)
            }
            (Role::Client, KIND_SERVER_FINISHED) => self.on_server_finished(data),
            (_, KIND_PLAIN_ALERT) => self.on_plain_alert(data),
            _ => {
                trace!(kind = prefix.kind, phase = %self.phase, "Ignoring unexpected datagram");
                Ok(())
            }
        }
    }

    /// Client: build and send a (possibly cookie-bearing) hello, restarting
    /// the transcript at this hello.
    fn send_hello(&mut self, io: &mut dyn LinkIo, now_ms: u64) -> Result<(), EngineError> {
        let hello = ClientHello {
            random: self.local_random,
            cert_type: self.creds.cert_type().code(),
            suite: self.creds.suites()[0],
            cookie: self.cookie.clone(),
        };
        let body = hello.encode();

        let mut transcript = Transcript::initialize();
        transcript.mix_msg(KIND_CLIENT_HELLO, &body);
        self.transcript = Some(transcript);

        let dgram = wire::datagram(KIND_CLIENT_HELLO, &body);
        self.send_flight(io, dgram, now_ms)?;
        self.phase = Phase::HelloSent;
        Ok(())
    }

    fn on_client_hello(
        &mut self,
        data: &[u8],
        io: &mut dyn LinkIo,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        let (_, body) = wire::body(data, "client hello")?;
        let hello = ClientHello::parse(body)?;

        match self.phase {
            Phase::Start => {}
            Phase::AwaitClientFlight => {
                // Duplicate of the accepted hello: our flight was lost.
                if self.peer_random == Some(hello.random) {
                    if let Some(flight) = &self.flight {
                        trace!("Duplicate hello, retransmitting server flight");
                        io.push(flight)?;
                        self.flight_sent_at_ms = now_ms;
                    }
                }
                return Ok(());
            }
            _ => return Ok(()),
        }

        if !self.creds.suites().contains(&hello.suite) {
            self.send_plain_alert(io, AlertLevel::Fatal, AlertKind::HandshakeFailure)?;
            self.closed = true;
            return Err(EngineError::Malformed("cipher suite"));
        }

        let cookie_ok = !hello.cookie.is_empty()
            && (self
                .prestate
                .as_ref()
                .is_some_and(|c| c.as_bytes()[..] == hello.cookie[..])
                || Cookie::issue(&self.cookie_secret, &hello.random).as_bytes()[..]
                    == hello.cookie[..]);

        if !cookie_ok {
            let verify = HelloVerify {
                cookie: *Cookie::issue(&self.cookie_secret, &hello.random).as_bytes(),
            };
            trace!("Hello without valid cookie, sending hello-verify");
            // Stateless: not a retransmittable flight.
            io.push(&wire::datagram(KIND_HELLO_VERIFY, &verify.encode()))?;
            return Ok(());
        }
        self.prestate = None;

        let mut transcript = Transcript::initialize();
        transcript.mix_msg(KIND_CLIENT_HELLO, body);
        self.peer_random = Some(hello.random);
        self.peer_cert_type = CertType::from_code(hello.cert_type);

        // Build the server flight around a fresh ephemeral key.
        let secp = Secp256k1::new();
        let (eph_secret, eph_public) = secp.generate_keypair(&mut rand::rng());
        let ephemeral = Keypair::from_secret_key(&secp, &eph_secret);

        let mut server_random = [0u8; 32];
        rand::rng().fill_bytes(&mut server_random);

        let mut flight = ServerFlight {
            random: server_random,
            suite: hello.suite,
            cert_type: self.creds.cert_type().code(),
            cert: self.creds.raw_certificate().to_vec(),
            subkey_id: self.creds.subkey_id(),
            ephemeral: eph_public.serialize(),
            sig: [0u8; 64],
            flags: if self.require_peer_cert {
                FLAG_CERT_REQUEST
            } else {
                0
            },
        };

        transcript.mix_msg(KIND_SERVER_FLIGHT, &flight.encode_presig());
        flight.sig = sign_digest(&secp, &transcript.signing_digest(), self.creds.subkey());
        transcript.mix_hash(&flight.sig);

        self.ephemeral = Some(ephemeral);
        self.transcript = Some(transcript);

        let dgram = wire::datagram(KIND_SERVER_FLIGHT, &flight.encode());
        self.send_flight(io, dgram, now_ms)?;
        self.phase = Phase::AwaitClientFlight;
        debug!(role = %self.role, "Accepted client hello, flight sent");
        Ok(())
    }

    fn on_hello_verify(
        &mut self,
        data: &[u8],
        io: &mut dyn LinkIo,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        if self.phase != Phase::HelloSent {
            return Ok(());
        }
        let (_, body) = wire::body(data, "hello verify")?;
        let verify = HelloVerify::parse(body)?;
        trace!("Received hello-verify, echoing cookie");
        self.cookie = verify.cookie.to_vec();
        self.send_hello(io, now_ms)
    }

    fn on_server_flight(
        &mut self,
        data: &[u8],
        io: &mut dyn LinkIo,
        verifier: &mut dyn CertVerifier,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        if self.phase != Phase::HelloSent {
            return Ok(());
        }
        let (_, body) = wire::body(data, "server flight")?;
        let (flight, presig_len) = ServerFlight::parse(body)?;

        let cert_type = CertType::from_code(flight.cert_type)
            .ok_or(EngineError::Malformed("certificate type"))?;
        let peer_ephemeral =
            PublicKey::from_slice(&flight.ephemeral).map_err(|_| EngineError::Malformed("key"))?;

        let transcript = self
            .transcript
            .as_mut()
            .expect("transcript exists past hello");
        transcript.mix_msg(KIND_SERVER_FLIGHT, &body[..presig_len]);

        // The transcript signature is checked against the advertised subkey
        // of the presented certificate. Only native certificates can be
        // checked here; foreign types are left to the verification callback,
        // which rejects them.
        if cert_type == CertType::OpenPgp {
            let cert = Certificate::decode(&flight.cert)?;
            let subkey = cert
                .subkey_by_id(&flight.subkey_id)
                .ok_or(EngineError::BadSignature)?;
            verify_digest(
                &transcript.signing_digest(),
                &flight.sig,
                &subkey.pubkey,
            )?;
        }
        transcript.mix_hash(&flight.sig);

        self.peer_chain = vec![flight.cert.clone()];
        self.peer_cert_type = Some(cert_type);
        self.peer_subkey_id = flight.subkey_id;

        let verdict = {
            let peer = HandshakePeer {
                cert_type,
                chain: &self.peer_chain,
                subkey_id: self.peer_subkey_id,
            };
            verifier.verify(&peer)
        };
        if let Err(rejection) = verdict {
            if let Some(kind) = rejection.alert {
                self.send_plain_alert(io, AlertLevel::Fatal, kind)?;
            }
            self.closed = true;
            return Err(EngineError::CertificateError);
        }

        // Key exchange and our flight.
        let secp = Secp256k1::new();
        let (eph_secret, eph_public) = secp.generate_keypair(&mut rand::rng());

        let mut cf = ClientFlight {
            cert: self.creds.raw_certificate().to_vec(),
            subkey_id: self.creds.subkey_id(),
            ephemeral: eph_public.serialize(),
            sig: [0u8; 64],
            mac: [0u8; 32],
        };

        let transcript = self
            .transcript
            .as_mut()
            .expect("transcript exists past hello");
        transcript.mix_msg(KIND_CLIENT_FLIGHT, &cf.encode_presig());
        cf.sig = sign_digest(&secp, &transcript.signing_digest(), self.creds.subkey());
        transcript.mix_hash(&cf.sig);

        let shared = ecdh(&eph_secret, &peer_ephemeral);
        transcript.mix_key(&shared);

        cf.mac = transcript.finished(LABEL_CLIENT_FINISHED);
        transcript.mix_hash(&cf.mac);

        // The transcript is final; derive the verdict MAC and the keys now.
        self.expected_server_mac = Some(transcript.finished(LABEL_SERVER_FINISHED));
        let (client_key, server_key) = transcript.split();
        self.send_cipher = Some(CipherState::new(client_key));
        self.recv_cipher = Some(CipherState::new(server_key));

        let dgram = wire::datagram(KIND_CLIENT_FLIGHT, &cf.encode());
        self.send_flight(io, dgram, now_ms)?;
        self.phase = Phase::FlightSent;
        debug!(role = %self.role, "Server verified, client flight sent");
        Ok(())
    }

    fn on_client_flight(
        &mut self,
        data: &[u8],
        io: &mut dyn LinkIo,
        verifier: &mut dyn CertVerifier,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        if self.phase != Phase::AwaitClientFlight {
            return Ok(());
        }
        let (_, body) = wire::body(data, "client flight")?;
        let (flight, presig_len) = ClientFlight::parse(body)?;

        let cert_type = self
            .peer_cert_type
            .ok_or(EngineError::Malformed("certificate type"))?;
        let peer_ephemeral =
            PublicKey::from_slice(&flight.ephemeral).map_err(|_| EngineError::Malformed("key"))?;

        let transcript = self
            .transcript
            .as_mut()
            .expect("transcript exists past hello");
        transcript.mix_msg(KIND_CLIENT_FLIGHT, &body[..presig_len]);

        if cert_type == CertType::OpenPgp {
            let cert = Certificate::decode(&flight.cert)?;
            let subkey = cert
                .subkey_by_id(&flight.subkey_id)
                .ok_or(EngineError::BadSignature)?;
            verify_digest(
                &transcript.signing_digest(),
                &flight.sig,
                &subkey.pubkey,
            )?;
        }
        transcript.mix_hash(&flight.sig);

        let ephemeral = self
            .ephemeral
            .as_ref()
            .expect("ephemeral exists past server flight");
        let shared = ecdh(&ephemeral.secret_key(), &peer_ephemeral);
        transcript.mix_key(&shared);

        if transcript.finished(LABEL_CLIENT_FINISHED) != flight.mac {
            return Err(EngineError::BadFinishedMac);
        }
        transcript.mix_hash(&flight.mac);

        self.peer_chain = vec![flight.cert.clone()];
        self.peer_subkey_id = flight.subkey_id;

        if self.require_peer_cert {
            let verdict = {
                let peer = HandshakePeer {
                    cert_type,
                    chain: &self.peer_chain,
                    subkey_id: self.peer_subkey_id,
                };
                verifier.verify(&peer)
            };
            if let Err(rejection) = verdict {
                if let Some(kind) = rejection.alert {
                    self.send_plain_alert(io, AlertLevel::Fatal, kind)?;
                }
                self.closed = true;
                return Err(EngineError::CertificateError);
            }
        }

        let transcript = self
            .transcript
            .as_ref()
            .expect("transcript exists past hello");
        let finished = ServerFinished {
            mac: transcript.finished(LABEL_SERVER_FINISHED),
        };
        let (client_key, server_key) = transcript.split();
        self.send_cipher = Some(CipherState::new(server_key));
        self.recv_cipher = Some(CipherState::new(client_key));

        let dgram = wire::datagram(KIND_SERVER_FINISHED, &finished.encode());
        io.push(&dgram)?;
        // Kept for duplicate-triggered resend, not timer retransmission.
        self.flight = Some(dgram);
        self.flight_sent_at_ms = now_ms;
        self.phase = Phase::Complete;
        debug!(role = %self.role, "Client verified, handshake complete");
        Ok(())
    }

    fn on_server_finished(&mut self, data: &[u8]) -> Result<(), EngineError> {
        if self.phase != Phase::FlightSent {
            return Ok(());
        }
        let (_, body) = wire::body(data, "server finished")?;
        let finished = ServerFinished::parse(body)?;

        if Some(finished.mac) != self.expected_server_mac {
            return Err(EngineError::BadFinishedMac);
        }
        self.flight = None;
        self.phase = Phase::Complete;
        debug!(role = %self.role, "Handshake complete");
        Ok(())
    }

    fn on_plain_alert(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let (_, body) = wire::body(data, "alert")?;
        let alert = PlainAlert::parse(body)?;
        let level = AlertLevel::from_code(alert.level).ok_or(EngineError::Malformed("alert"))?;
        let kind = AlertKind::from_code(alert.code).ok_or(EngineError::Malformed("alert"))?;

        debug!(%level, %kind, "Alert received during handshake");
        self.pending_alert = Some((level, kind));
        self.closed = true;
        Err(EngineError::FatalAlert(kind))
    }

    /// Transmit a flight and (re)start its retransmission schedule.
    fn send_flight(
        &mut self,
        io: &mut dyn LinkIo,
        dgram: Vec<u8>,
        now_ms: u64,
    ) -> Result<(), EngineError> {
        io.push(&dgram)?;
        self.flight = Some(dgram);
        self.flight_sent_at_ms = now_ms;
        self.rto_ms = self.retransmit_base_ms;
        Ok(())
    }

    fn send_plain_alert(
        &mut self,
        io: &mut dyn LinkIo,
        level: AlertLevel,
        kind: AlertKind,
    ) -> Result<(), EngineError> {
        let alert = PlainAlert {
            level: level.code(),
            code: kind.code(),
        };
        io.push(&wire::datagram(KIND_PLAIN_ALERT, &alert.encode()))?;
        Ok(())
    }

    // ========================================================================
    // Record Layer
    // ========================================================================

    /// Encrypt and transmit application data, fragmenting to the data MTU.
    pub fn record_send(
        &mut self,
        io: &mut dyn LinkIo,
        plaintext: &[u8],
    ) -> Result<usize, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.phase != Phase::Complete {
            return Err(EngineError::NotReady);
        }
        for chunk in plaintext.chunks(self.data_mtu) {
            self.seal_and_push(io, REC_DATA, chunk)?;
        }
        Ok(plaintext.len())
    }

    /// Receive and decrypt one record into `dst`.
    pub fn record_recv(
        &mut self,
        io: &mut dyn LinkIo,
        dst: &mut [u8],
    ) -> Result<Record, EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.phase != Phase::Complete {
            return Err(EngineError::NotReady);
        }

        let n = match io.pull(&mut self.recv_buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(EngineError::WouldBlock)
            }
            Err(e) => return Err(EngineError::Io(e)),
        };

        let datagram = std::mem::replace(&mut self.recv_buf, Vec::new());
        let result = self.dispatch_record(&datagram[..n], io, dst);
        self.recv_buf = datagram;
        result
    }

    fn dispatch_record(
        &mut self,
        data: &[u8],
        io: &mut dyn LinkIo,
        dst: &mut [u8],
    ) -> Result<Record, EngineError> {
        let Some(prefix) = Prefix::parse(data) else {
            return Err(EngineError::WouldBlock);
        };

        if prefix.kind != KIND_SEALED {
            // The peer may have lost our final flight and retransmitted.
            if self.role == Role::Server && prefix.kind == KIND_CLIENT_FLIGHT {
                if let Some(flight) = &self.flight {
                    trace!("Duplicate client flight, resending finished");
                    io.push(flight)?;
                }
            } else {
                trace!(kind = prefix.kind, "Ignoring non-record datagram");
            }
            return Err(EngineError::WouldBlock);
        }

        let (aad, seq, ciphertext) = wire::parse_sealed(data)?;
        if !self.recv_window.check(seq) {
            return Err(EngineError::Replay(seq));
        }
        let cipher = self.recv_cipher.as_ref().ok_or(EngineError::NotReady)?;
        let plain = cipher.open(seq, aad, ciphertext)?;
        self.recv_window.commit(seq);

        let (&rtype, payload) = plain
            .split_first()
            .ok_or(EngineError::Malformed("record"))?;

        match rtype {
            REC_DATA => {
                if dst.len() < payload.len() {
                    return Err(EngineError::BufferTooSmall {
                        needed: payload.len(),
                        got: dst.len(),
                    });
                }
                dst[..payload.len()].copy_from_slice(payload);
                Ok(Record::Data(payload.len()))
            }
            REC_ALERT => {
                let alert = PlainAlert::parse(payload)?;
                let level =
                    AlertLevel::from_code(alert.level).ok_or(EngineError::Malformed("alert"))?;
                let kind =
                    AlertKind::from_code(alert.code).ok_or(EngineError::Malformed("alert"))?;
                self.pending_alert = Some((level, kind));
                if kind == AlertKind::CloseNotify {
                    self.closed = true;
                    Ok(Record::Closed)
                } else {
                    Ok(Record::Alert(level, kind))
                }
            }
            REC_HB_PING => {
                if !self.peer_heartbeats {
                    return Err(EngineError::UnexpectedMessage("heartbeat"));
                }
                self.last_ping = Some(payload.to_vec());
                Ok(Record::HeartbeatPing)
            }
            REC_HB_PONG => Ok(Record::HeartbeatPong),
            _ => Err(EngineError::Malformed("record type")),
        }
    }

    /// Send a close-notify alert and mark the session closed. Before the
    /// handshake completes there are no record keys, so closing is silent.
    pub fn bye(&mut self, io: &mut dyn LinkIo) -> Result<(), EngineError> {
        if self.phase == Phase::Complete && !self.closed {
            let body = [
                AlertLevel::Warning.code(),
                AlertKind::CloseNotify.code(),
            ];
            self.seal_and_push(io, REC_ALERT, &body)?;
        }
        self.closed = true;
        Ok(())
    }

    /// Send a heartbeat ping with a random payload of the given size.
    pub fn ping(&mut self, io: &mut dyn LinkIo, payload_len: usize) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.phase != Phase::Complete {
            return Err(EngineError::NotReady);
        }
        let mut payload = vec![0u8; payload_len];
        rand::rng().fill_bytes(&mut payload);
        self.seal_and_push(io, REC_HB_PING, &payload)
    }

    /// Answer the most recent heartbeat ping, echoing its payload.
    pub fn pong(&mut self, io: &mut dyn LinkIo) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        if self.phase != Phase::Complete {
            return Err(EngineError::NotReady);
        }
        let payload = self.last_ping.take().unwrap_or_default();
        self.seal_and_push(io, REC_HB_PONG, &payload)
    }

    fn seal_and_push(
        &mut self,
        io: &mut dyn LinkIo,
        rtype: u8,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        if self.send_seq == u64::MAX {
            return Err(EngineError::NonceOverflow);
        }
        let seq = self.send_seq;
        let cipher = self.send_cipher.as_ref().ok_or(EngineError::NotReady)?;

        let mut inner = Vec::with_capacity(1 + payload.len());
        inner.push(rtype);
        inner.extend_from_slice(payload);

        let aad = wire::sealed_header(seq, inner.len() + TAG_SIZE);
        let ciphertext = cipher.seal(seq, &aad, &inner)?;

        let mut dgram = Vec::with_capacity(SEALED_HEADER_SIZE + ciphertext.len());
        dgram.extend_from_slice(&aad);
        dgram.extend_from_slice(&ciphertext);
        io.push(&dgram)?;

        self.send_seq += 1;
        Ok(())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("closed", &self.closed)
            .field("send_seq", &self.send_seq)
            .field("has_flight", &self.flight.is_some())
            .finish_non_exhaustive()
    }
}

/// Schnorr-sign a digest with a subkey.
fn sign_digest(secp: &Secp256k1<secp256k1::All>, digest: &[u8; 32], keypair: &Keypair) -> [u8; 64] {
    secp.sign_schnorr(digest, keypair).serialize()
}

/// Verify a transcript signature against a subkey public key.
fn verify_digest(
    digest: &[u8; 32],
    sig: &[u8; 64],
    pubkey: &secp256k1::XOnlyPublicKey,
) -> Result<(), EngineError> {
    let secp = Secp256k1::new();
    let sig = Signature::from_slice(sig).map_err(|_| EngineError::BadSignature)?;
    secp.verify_schnorr(&sig, digest, pubkey)
        .map_err(|_| EngineError::BadSignature)
}
