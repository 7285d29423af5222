//! Keyring and keyserver interfaces.
//!
//! The gateway owns the real key storage; sessions only consume these traits
//! during peer verification. A `KeyEntry` is the keyring's trust-side view of
//! a key: operational state, subkey states, and user-ID validity, all of
//! which the verification callback gates on. `MemoryKeyring` is an in-memory
//! implementation for tests and embedders without persistent storage.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use thiserror::Error;

use crate::cert::{hex_encode, CertError, Certificate};

/// Errors from keyring operations.
#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("malformed certificate: {0}")]
    Malformed(#[from] CertError),

    #[error("keyserver unreachable: {0}")]
    KeyserverUnavailable(String),
}

/// User-ID validity levels, ordered from least to most trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Validity {
    #[default]
    Unknown,
    Undefined,
    Never,
    Marginal,
    Full,
    Ultimate,
}

impl Validity {
    /// Map a numeric policy level to a validity floor.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Validity::Unknown,
            1 => Validity::Undefined,
            2 => Validity::Never,
            3 => Validity::Marginal,
            4 => Validity::Full,
            _ => Validity::Ultimate,
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Validity::Unknown => "unknown",
            Validity::Undefined => "undefined",
            Validity::Never => "never",
            Validity::Marginal => "marginal",
            Validity::Full => "full",
            Validity::Ultimate => "ultimate",
        };
        write!(f, "{}", s)
    }
}

/// Operational state shared by keys and subkeys.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyState {
    pub disabled: bool,
    pub invalid: bool,
    pub revoked: bool,
    pub expired: bool,
}

impl KeyState {
    /// Whether the key is unusable for reasons other than expiry.
    pub fn is_bad(&self) -> bool {
        self.disabled || self.invalid || self.revoked
    }
}

/// Trust-side view of a subkey.
#[derive(Clone, Debug)]
pub struct SubkeyEntry {
    /// Lowercase hex of the subkey fingerprint.
    pub fingerprint_hex: String,
    /// Operational state.
    pub state: KeyState,
    /// Whether the subkey may authenticate handshakes.
    pub can_authenticate: bool,
}

/// Trust-side view of a user ID.
#[derive(Clone, Debug)]
pub struct UidEntry {
    pub uid: String,
    pub validity: Validity,
}

/// Trust-side view of a key held in the keyring.
#[derive(Clone, Debug)]
pub struct KeyEntry {
    /// Lowercase hex of the primary fingerprint (lookup key).
    pub fingerprint_hex: String,
    /// Operational state of the primary key.
    pub state: KeyState,
    /// Subkeys, in certificate order.
    pub subkeys: Vec<SubkeyEntry>,
    /// User IDs with their computed validity.
    pub uids: Vec<UidEntry>,
}

impl KeyEntry {
    /// Maximum validity over all user IDs.
    pub fn max_uid_validity(&self) -> Validity {
        self.uids
            .iter()
            .map(|u| u.validity)
            .max()
            .unwrap_or(Validity::Unknown)
    }

    /// Find a subkey whose fingerprint tail (last 16 hex chars) matches the
    /// advertised subkey id hex.
    pub fn subkey_by_id_hex(&self, id_hex: &str) -> Option<&SubkeyEntry> {
        self.subkeys
            .iter()
            .find(|sk| sk.fingerprint_hex.ends_with(id_hex))
    }
}

/// Local key storage consumed during peer verification.
pub trait Keyring: Send + Sync {
    /// Import raw certificate bytes. Replaces any existing entry for the
    /// same fingerprint; trust state of a fresh import defaults to valid
    /// with unknown UID validity.
    fn import(&self, raw: &[u8]) -> Result<(), KeyringError>;

    /// Look up a key by lowercase fingerprint hex.
    fn lookup(&self, fingerprint_hex: &str) -> Option<KeyEntry>;
}

/// Remote key lookup by fingerprint.
pub trait Keyserver: Send + Sync {
    /// Fetch raw certificate bytes for a fingerprint, if the server has them.
    fn fetch(&self, fingerprint_hex: &str) -> Result<Option<Vec<u8>>, KeyringError>;
}

/// In-memory keyring for tests and embedders without persistent storage.
#[derive(Default)]
pub struct MemoryKeyring {
    entries: RwLock<HashMap<String, KeyEntry>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry directly, bypassing certificate parsing.
    /// Tests use this to stage revoked/expired/distrusted states.
    pub fn insert(&self, entry: KeyEntry) {
        self.entries
            .write()
            .insert(entry.fingerprint_hex.clone(), entry);
    }

    /// Build the default trusting entry for a parsed certificate.
    pub fn entry_for(cert: &Certificate) -> KeyEntry {
        KeyEntry {
            fingerprint_hex: cert.fingerprint().hex(),
            state: KeyState::default(),
            subkeys: cert
                .subkeys
                .iter()
                .map(|sk| SubkeyEntry {
                    fingerprint_hex: sk.fingerprint().hex(),
                    state: KeyState::default(),
                    can_authenticate: sk.can_authenticate(),
                })
                .collect(),
            uids: cert
                .uids
                .iter()
                .map(|u| UidEntry {
                    uid: u.as_str().to_string(),
                    validity: Validity::Unknown,
                })
                .collect(),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the keyring is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Keyring for MemoryKeyring {
    fn import(&self, raw: &[u8]) -> Result<(), KeyringError> {
        let cert = Certificate::decode(raw)?;
        let entry = Self::entry_for(&cert);
        self.entries
            .write()
            .insert(entry.fingerprint_hex.clone(), entry);
        Ok(())
    }

    fn lookup(&self, fingerprint_hex: &str) -> Option<KeyEntry> {
        self.entries.read().get(fingerprint_hex).cloned()
    }
}

/// Keyserver backed by a map, for tests.
#[derive(Default)]
pub struct MemoryKeyserver {
    certs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a certificate under its fingerprint.
    pub fn publish(&self, raw: Vec<u8>) -> Result<(), KeyringError> {
        let cert = Certificate::decode(&raw)?;
        self.certs.write().insert(cert.fingerprint().hex(), raw);
        Ok(())
    }
}

impl Keyserver for MemoryKeyserver {
    fn fetch(&self, fingerprint_hex: &str) -> Result<Option<Vec<u8>>, KeyringError> {
        Ok(self.certs.read().get(fingerprint_hex).cloned())
    }
}

/// Hex-encode a subkey id for tail matching against subkey fingerprints.
pub fn subkey_id_hex(id: &[u8]) -> String {
    hex_encode(id)
}
