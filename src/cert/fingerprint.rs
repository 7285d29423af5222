//! 20-byte certificate fingerprint derived from truncated SHA-256(pubkey).

use secp256k1::XOnlyPublicKey;
use sha2::{Digest, Sha256};
use std::fmt;

use super::{hex_encode, CertError};

/// Fingerprint width in bytes.
pub const FINGERPRINT_SIZE: usize = 20;

/// A certificate fingerprint.
///
/// The first 20 bytes of SHA-256 over the serialized primary key. The
/// fingerprint is the peer's identity: keyring lookups are keyed by its hex
/// form and the overlay prefix is carved out of its bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Create a fingerprint from a 20-byte array.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a fingerprint from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CertError> {
        if slice.len() != FINGERPRINT_SIZE {
            return Err(CertError::TooShort {
                expected: FINGERPRINT_SIZE,
                got: slice.len(),
            });
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Parse a fingerprint from its hex form (as listed in gateway peer
    /// configuration).
    pub fn from_hex(s: &str) -> Result<Self, CertError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Derive the fingerprint of a public key.
    pub fn of_key(pubkey: &XOnlyPublicKey) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(pubkey.serialize());
        let hash = hasher.finalize();
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&hash[..FINGERPRINT_SIZE]);
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Lowercase hex rendering (keyring lookup key).
    pub fn hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex_encode(&self.0[..8]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
