//! OpenPGP-style certificates and overlay identity.
//!
//! A certificate carries a primary secp256k1 key, a set of user IDs, and a
//! set of authentication subkeys. Peer identity in the overlay is derived
//! from the certificate fingerprint: SHA-256 of the primary key truncated to
//! 20 bytes. Hashing the public key prevents grinding attacks that exploit
//! secp256k1's algebraic structure.

mod fingerprint;
mod prefix;

use secp256k1::XOnlyPublicKey;
use thiserror::Error;

pub use fingerprint::{Fingerprint, FINGERPRINT_SIZE};
pub use prefix::{OverlayPrefix, PREFIX_LEAD, PREFIX_SIZE};

/// Certificate wire-format version.
pub const CERT_VERSION: u8 = 1;

/// Size of a serialized x-only public key.
pub const PUBKEY_SIZE: usize = 32;

/// Size of a subkey identifier (trailing bytes of the subkey fingerprint).
pub const SUBKEY_ID_SIZE: usize = 8;

/// Fixed-size portion of a serialized subkey: pubkey + flags + created + expires.
const SUBKEY_WIRE_SIZE: usize = PUBKEY_SIZE + 1 + 8 + 8;

/// Maximum user ID length in bytes.
const MAX_UID_LEN: usize = 255;

/// Subkey capability: may authenticate handshakes.
pub const FLAG_CAN_AUTHENTICATE: u8 = 0x01;

/// Subkey capability: may sign data.
pub const FLAG_CAN_SIGN: u8 = 0x02;

/// Subkey capability: may be used for encryption key agreement.
pub const FLAG_CAN_ENCRYPT: u8 = 0x04;

/// Errors from certificate parsing and construction.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate too short: expected at least {expected}, got {got}")]
    TooShort { expected: usize, got: usize },

    #[error("unsupported certificate version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid public key")]
    InvalidKey,

    #[error("user ID is not valid UTF-8")]
    InvalidUid,

    #[error("user ID too long: {0} bytes")]
    UidTooLong(usize),

    #[error("{0} trailing bytes after certificate")]
    TrailingBytes(usize),

    #[error("invalid prefix lead byte: expected 0xfc, got 0x{0:02x}")]
    InvalidPrefix(u8),

    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A user ID attached to a certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserId(String);

impl UserId {
    /// Create a user ID. The string must fit the wire length prefix.
    pub fn new(uid: impl Into<String>) -> Result<Self, CertError> {
        let uid = uid.into();
        if uid.len() > MAX_UID_LEN {
            return Err(CertError::UidTooLong(uid.len()));
        }
        Ok(Self(uid))
    }

    /// The user ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An authentication subkey carried by a certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subkey {
    /// Subkey public key.
    pub pubkey: XOnlyPublicKey,
    /// Capability flags (`FLAG_CAN_*`).
    pub flags: u8,
    /// Creation time (Unix seconds).
    pub created: u64,
    /// Expiry time (Unix seconds), 0 = never expires.
    pub expires: u64,
}

impl Subkey {
    /// Compute the subkey fingerprint (same derivation as the primary key).
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_key(&self.pubkey)
    }

    /// The subkey identifier: trailing 8 bytes of the subkey fingerprint.
    pub fn id(&self) -> [u8; SUBKEY_ID_SIZE] {
        let fpr = self.fingerprint();
        let bytes = fpr.as_bytes();
        let mut id = [0u8; SUBKEY_ID_SIZE];
        id.copy_from_slice(&bytes[bytes.len() - SUBKEY_ID_SIZE..]);
        id
    }

    /// Whether the subkey may authenticate handshakes.
    pub fn can_authenticate(&self) -> bool {
        self.flags & FLAG_CAN_AUTHENTICATE != 0
    }
}

/// An OpenPGP-style certificate.
///
/// ## Wire format
///
/// ```text
/// [version:1][primary:32][created:8 LE][expires:8 LE]
/// [n_uids:1]    n x [len:1][utf8 bytes]
/// [n_subkeys:1] n x [pubkey:32][flags:1][created:8 LE][expires:8 LE]
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    /// Primary public key. The fingerprint hashes this key.
    pub primary: XOnlyPublicKey,
    /// Creation time (Unix seconds).
    pub created: u64,
    /// Expiry time (Unix seconds), 0 = never expires.
    pub expires: u64,
    /// User IDs.
    pub uids: Vec<UserId>,
    /// Authentication subkeys.
    pub subkeys: Vec<Subkey>,
}

impl Certificate {
    /// Compute the certificate fingerprint: SHA-256(primary) truncated to 20 bytes.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_key(&self.primary)
    }

    /// Derive the overlay prefix for this certificate's identity.
    pub fn prefix(&self) -> OverlayPrefix {
        OverlayPrefix::from_fingerprint(&self.fingerprint())
    }

    /// Find the subkey matching an advertised subkey identifier.
    pub fn subkey_by_id(&self, id: &[u8; SUBKEY_ID_SIZE]) -> Option<&Subkey> {
        self.subkeys.iter().find(|sk| &sk.id() == id)
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + PUBKEY_SIZE
                + 16
                + 1
                + self.uids.iter().map(|u| 1 + u.0.len()).sum::<usize>()
                + 1
                + self.subkeys.len() * SUBKEY_WIRE_SIZE,
        );
        out.push(CERT_VERSION);
        out.extend_from_slice(&self.primary.serialize());
        out.extend_from_slice(&self.created.to_le_bytes());
        out.extend_from_slice(&self.expires.to_le_bytes());

        out.push(self.uids.len() as u8);
        for uid in &self.uids {
            out.push(uid.0.len() as u8);
            out.extend_from_slice(uid.0.as_bytes());
        }

        out.push(self.subkeys.len() as u8);
        for sk in &self.subkeys {
            out.extend_from_slice(&sk.pubkey.serialize());
            out.push(sk.flags);
            out.extend_from_slice(&sk.created.to_le_bytes());
            out.extend_from_slice(&sk.expires.to_le_bytes());
        }
        out
    }

    /// Parse a certificate from raw bytes.
    ///
    /// Rejects trailing garbage so a certificate's raw bytes are a canonical
    /// keyring import unit.
    pub fn decode(data: &[u8]) -> Result<Self, CertError> {
        let mut r = Reader::new(data);

        let version = r.u8()?;
        if version != CERT_VERSION {
            return Err(CertError::UnsupportedVersion(version));
        }

        let primary = XOnlyPublicKey::from_slice(r.take(PUBKEY_SIZE)?)
            .map_err(|_| CertError::InvalidKey)?;
        let created = r.u64()?;
        let expires = r.u64()?;

        let n_uids = r.u8()? as usize;
        let mut uids = Vec::with_capacity(n_uids);
        for _ in 0..n_uids {
            let len = r.u8()? as usize;
            let bytes = r.take(len)?;
            let uid = std::str::from_utf8(bytes).map_err(|_| CertError::InvalidUid)?;
            uids.push(UserId(uid.to_string()));
        }

        let n_subkeys = r.u8()? as usize;
        let mut subkeys = Vec::with_capacity(n_subkeys);
        for _ in 0..n_subkeys {
            let pubkey = XOnlyPublicKey::from_slice(r.take(PUBKEY_SIZE)?)
                .map_err(|_| CertError::InvalidKey)?;
            let flags = r.u8()?;
            let created = r.u64()?;
            let expires = r.u64()?;
            subkeys.push(Subkey {
                pubkey,
                flags,
                created,
                expires,
            });
        }

        if !r.is_empty() {
            return Err(CertError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            primary,
            created,
            expires,
            uids,
            subkeys,
        })
    }
}

/// Cursor over a byte slice with bounds-checked reads.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CertError> {
        if self.data.len() - self.pos < n {
            return Err(CertError::TooShort {
                expected: self.pos + n,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CertError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, CertError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Encode bytes as lowercase hex string.
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests;
