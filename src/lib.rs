//! FCGATE: secure datagram sessions for a peer-to-peer overlay gateway.
//!
//! Each [`Session`] is a cryptographically authenticated, datagram-oriented
//! tunnel between this node and one remote endpoint. The session core drives
//! the handshake against a set of candidate endpoints, authenticates the
//! peer via an OpenPGP-style certificate with fingerprint-derived identity,
//! maintains liveness with heartbeats, and moves plaintext and ciphertext
//! between the crypto engine and the owning [`Gateway`].

pub mod cert;
pub mod config;
pub mod dtls;
pub mod gateway;
pub mod keyring;
pub mod session;

// Re-export certificate and identity types
pub use cert::{CertError, Certificate, Fingerprint, OverlayPrefix, Subkey, UserId};

// Re-export configuration types
pub use config::{SessionConfig, VerifyPolicy};

// Re-export engine types
pub use dtls::{
    AlertKind, AlertLevel, CertType, CertVerifier, Cookie, Credentials, Engine, EngineConfig,
    EngineError, HandshakePeer, LinkIo, Record, Rejection, ReplayWindow, Role,
};

// Re-export gateway contract types
pub use gateway::{EndpointHandle, Gateway, PrefixHandle};

// Re-export keyring types
pub use keyring::{
    KeyEntry, KeyState, Keyring, KeyringError, Keyserver, MemoryKeyring, MemoryKeyserver,
    SubkeyEntry, UidEntry, Validity,
};

// Re-export session types
pub use session::{Session, SessionEnv, SessionError};
