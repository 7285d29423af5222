//! Datagram security engine.
//!
//! A compact datagram-TLS-style protocol: cookie-verified hello exchange,
//! certificate-authenticated ECDH handshake, then an AEAD record layer with
//! alerts and heartbeats. secp256k1 for key agreement and transcript
//! signatures, HKDF-SHA256 for the key schedule, ChaCha20-Poly1305 for
//! records.
//!
//! ```text
//! Client                                            Server
//!
//! 1   ClientHello                 -------->
//! 2                               <--------     HelloVerify
//!                                             (stateless cookie)
//! 3   ClientHello (cookie)        -------->
//! 4                               <--------     ServerFlight
//!                                     (random, certificate, subkey id,
//!                                      ephemeral key, signature)
//! 5   ClientFlight                -------->
//!       (certificate, subkey id,
//!        ephemeral key, signature,
//!        finished MAC)
//! 6                               <--------  ServerFinished
//!     Sealed records              <------->  Sealed records
//! ```
//!
//! The engine is driven synchronously through [`LinkIo`] pull/push hooks and
//! never blocks: every entry point takes an explicit `now_ms` timestamp and
//! returns [`EngineError::WouldBlock`] when it needs more input. Flight
//! retransmission happens inside [`Engine::handshake`] on the caller's
//! timer cadence.

mod cipher;
mod engine;
mod replay;
mod transcript;
mod wire;

use std::fmt;
use std::sync::Arc;

use secp256k1::Keypair;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cert::{CertError, Certificate, SUBKEY_ID_SIZE};

pub use engine::{Engine, EngineConfig, Record};
pub use replay::ReplayWindow;

/// Initial handshake retransmit timeout in milliseconds.
pub const DEFAULT_RETRANSMIT_MS: u64 = 500;

/// Default total handshake deadline in milliseconds.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Default plaintext MTU for data records.
pub const DEFAULT_DATA_MTU: usize = 1280;

/// Largest datagram the engine will process.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Size of the stateless cookie.
pub const COOKIE_SIZE: usize = 32;

/// The single supported cipher suite: secp256k1 / ChaCha20-Poly1305 / SHA-256.
pub const SUITE_SECP256K1_CHACHAPOLY: u8 = 0x01;

/// Errors from engine operations.
///
/// `WouldBlock` and `TimedOut` are control-flow results of the non-blocking
/// discipline rather than failures; everything else is terminal for the
/// session driving the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("operation would block")]
    WouldBlock,

    #[error("handshake deadline exceeded")]
    TimedOut,

    #[error("session closed")]
    Closed,

    #[error("handshake not complete")]
    NotReady,

    #[error("peer certificate rejected")]
    CertificateError,

    #[error("fatal alert received: {0}")]
    FatalAlert(AlertKind),

    #[error("malformed {0} message")]
    Malformed(&'static str),

    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("invalid state: {0}")]
    BadState(&'static str),

    #[error("transcript signature verification failed")]
    BadSignature,

    #[error("finished MAC verification failed")]
    BadFinishedMac,

    #[error("record decryption failed")]
    Decrypt,

    #[error("replay detected: sequence {0}")]
    Replay(u64),

    #[error("record sequence space exhausted")]
    NonceOverflow,

    #[error("plaintext buffer too small: need {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    #[error("unsupported priority string: {0}")]
    UnsupportedPriority(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(&'static str),

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Role in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// We initiated the connection.
    Client,
    /// They initiated the connection.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Certificate types a peer can present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertType {
    OpenPgp,
    X509,
}

impl CertType {
    pub(crate) fn code(self) -> u8 {
        match self {
            CertType::OpenPgp => 1,
            CertType::X509 => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CertType::OpenPgp),
            2 => Some(CertType::X509),
            _ => None,
        }
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertType::OpenPgp => write!(f, "openpgp"),
            CertType::X509 => write!(f, "x509"),
        }
    }
}

/// TLS-style alert severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    pub(crate) fn code(self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// Alert descriptions, with TLS alert code values on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertKind {
    CloseNotify,
    HandshakeFailure,
    BadCertificate,
    UnsupportedCertificate,
    CertificateRevoked,
    CertificateExpired,
    CertificateUnknown,
    InternalError,
}

impl AlertKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            AlertKind::CloseNotify => 0,
            AlertKind::HandshakeFailure => 40,
            AlertKind::BadCertificate => 42,
            AlertKind::UnsupportedCertificate => 43,
            AlertKind::CertificateRevoked => 44,
            AlertKind::CertificateExpired => 45,
            AlertKind::CertificateUnknown => 46,
            AlertKind::InternalError => 80,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AlertKind::CloseNotify),
            40 => Some(AlertKind::HandshakeFailure),
            42 => Some(AlertKind::BadCertificate),
            43 => Some(AlertKind::UnsupportedCertificate),
            44 => Some(AlertKind::CertificateRevoked),
            45 => Some(AlertKind::CertificateExpired),
            46 => Some(AlertKind::CertificateUnknown),
            80 => Some(AlertKind::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertKind::CloseNotify => "close_notify",
            AlertKind::HandshakeFailure => "handshake_failure",
            AlertKind::BadCertificate => "bad_certificate",
            AlertKind::UnsupportedCertificate => "unsupported_certificate",
            AlertKind::CertificateRevoked => "certificate_revoked",
            AlertKind::CertificateExpired => "certificate_expired",
            AlertKind::CertificateUnknown => "certificate_unknown",
            AlertKind::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

/// Transport hooks the engine drives.
///
/// These are the only bridge between the synchronous engine and the caller's
/// datagram transport. None of the methods may block: `pull` returns an
/// `io::ErrorKind::WouldBlock` error when no datagram is pending, and `push`
/// hands the datagram to a non-blocking send. `pull_ready` reports the
/// pending datagram's byte count (0 when empty) so the engine can poll
/// readiness without consuming.
pub trait LinkIo {
    /// Consume the pending datagram into `buf`, returning the copied length
    /// (`min(buf.len(), datagram length)`). At most one datagram is pending
    /// at a time and it is consumed by exactly one call.
    fn pull(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Transmit one datagram, returning the byte count reported by the
    /// underlying transport.
    fn push(&mut self, buf: &[u8]) -> std::io::Result<usize>;

    /// Byte count of the pending datagram, 0 if none.
    fn pull_ready(&mut self) -> usize;
}

/// Peer handshake material handed to the verification callback.
#[derive(Debug)]
pub struct HandshakePeer<'a> {
    /// Certificate type the peer advertised.
    pub cert_type: CertType,
    /// Raw certificates presented by the peer, leaf first.
    pub chain: &'a [Vec<u8>],
    /// Identifier of the subkey the peer authenticated the handshake with.
    pub subkey_id: [u8; SUBKEY_ID_SIZE],
}

/// Verification refusal, optionally naming an alert to send before failing.
#[derive(Clone, Copy, Debug)]
pub struct Rejection {
    pub alert: Option<AlertKind>,
}

impl Rejection {
    /// Reject and send the given fatal alert first.
    pub fn with_alert(alert: AlertKind) -> Self {
        Self {
            alert: Some(alert),
        }
    }

    /// Reject without sending an alert.
    pub fn silent() -> Self {
        Self { alert: None }
    }
}

/// Peer identity verification, invoked from within the handshake.
///
/// A return of `Ok(())` accepts the peer; `Err` fails the handshake with a
/// certificate error, after sending the rejection's alert if one is named.
pub trait CertVerifier {
    fn verify(&mut self, peer: &HandshakePeer<'_>) -> Result<(), Rejection>;
}

/// A stateless handshake cookie binding a client hello to a prior
/// hello-verify round.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_SIZE]);

impl Cookie {
    /// Derive the cookie for a client random under a secret.
    ///
    /// The gateway runs the hello-verify round statelessly with its own
    /// secret; a server engine without a prestate runs it with a private one.
    pub fn issue(secret: &[u8; 32], client_random: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"fcgate-cookie-v1");
        hasher.update(secret);
        hasher.update(client_random);
        let hash = hasher.finalize();
        let mut bytes = [0u8; COOKIE_SIZE];
        bytes.copy_from_slice(&hash[..COOKIE_SIZE]);
        Self(bytes)
    }

    /// Create a cookie from raw bytes (as echoed by a client hello).
    pub fn from_bytes(bytes: [u8; COOKIE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; COOKIE_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie").finish_non_exhaustive()
    }
}

/// Certificate credentials plus priority string, shared by all sessions of a
/// gateway.
pub struct Credentials {
    certificate: Option<Certificate>,
    raw: Vec<u8>,
    cert_type: CertType,
    subkey: Keypair,
    subkey_id: [u8; SUBKEY_ID_SIZE],
    priority: String,
}

impl Credentials {
    /// Build credentials from a certificate and the keypair of one of its
    /// authentication subkeys.
    pub fn new(
        certificate: Certificate,
        subkey: Keypair,
        priority: impl Into<String>,
    ) -> Result<Arc<Self>, EngineError> {
        let priority = priority.into();
        parse_priority(&priority)?;

        let subkey_pub = subkey.x_only_public_key().0;
        let entry = certificate
            .subkeys
            .iter()
            .find(|sk| sk.pubkey == subkey_pub)
            .ok_or(EngineError::InvalidCredentials(
                "signing key is not a subkey of the certificate",
            ))?;
        if !entry.can_authenticate() {
            return Err(EngineError::InvalidCredentials(
                "subkey lacks the authenticate capability",
            ));
        }

        let subkey_id = entry.id();
        let raw = certificate.encode();
        Ok(Arc::new(Self {
            certificate: Some(certificate),
            raw,
            cert_type: CertType::OpenPgp,
            subkey,
            subkey_id,
            priority,
        }))
    }

    /// Build credentials around opaque certificate bytes of a foreign type.
    ///
    /// The engine cannot validate such a certificate; peers are expected to
    /// reject it during verification. Exists for interop testing.
    pub fn from_raw_parts(
        raw: Vec<u8>,
        cert_type: CertType,
        subkey: Keypair,
        subkey_id: [u8; SUBKEY_ID_SIZE],
        priority: impl Into<String>,
    ) -> Result<Arc<Self>, EngineError> {
        let priority = priority.into();
        parse_priority(&priority)?;
        Ok(Arc::new(Self {
            certificate: None,
            raw,
            cert_type,
            subkey,
            subkey_id,
            priority,
        }))
    }

    /// The parsed certificate, if these credentials carry a native one.
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    /// Raw certificate bytes presented in handshakes.
    pub fn raw_certificate(&self) -> &[u8] {
        &self.raw
    }

    /// Advertised certificate type.
    pub fn cert_type(&self) -> CertType {
        self.cert_type
    }

    /// The priority string these credentials were built with.
    pub fn priority(&self) -> &str {
        &self.priority
    }

    pub(crate) fn subkey(&self) -> &Keypair {
        &self.subkey
    }

    pub(crate) fn subkey_id(&self) -> [u8; SUBKEY_ID_SIZE] {
        self.subkey_id
    }

    /// Cipher suites allowed by the priority string, in preference order.
    pub(crate) fn suites(&self) -> Vec<u8> {
        parse_priority(&self.priority).expect("priority validated at construction")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cert_type", &self.cert_type)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Map a priority string to the cipher suites it permits.
///
/// Only the leading keyword is interpreted; modifier tokens after ':' are
/// accepted and ignored since every profile resolves to the single supported
/// suite.
fn parse_priority(priority: &str) -> Result<Vec<u8>, EngineError> {
    let keyword = priority.split(':').next().unwrap_or("");
    match keyword {
        "NORMAL" | "PERFORMANCE" | "SECURE128" | "SECURE256" => {
            Ok(vec![SUITE_SECP256K1_CHACHAPOLY])
        }
        _ => Err(EngineError::UnsupportedPriority(priority.to_string())),
    }
}
