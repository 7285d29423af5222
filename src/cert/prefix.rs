//! 64-bit overlay prefix derived from a certificate fingerprint.

use std::fmt;

use super::{hex_encode, CertError, Fingerprint};

/// Overlay prefix leading byte (ULA-style range).
pub const PREFIX_LEAD: u8 = 0xFC;

/// Prefix width in bytes.
pub const PREFIX_SIZE: usize = 8;

/// 64-bit overlay routing identity of a peer.
///
/// Bytes [4, 12) of the fingerprint with the leading byte forced to `0xFC`.
/// This derivation is a wire-compatibility constraint: it defines the peer's
/// key in the gateway's prefix routing table and must not change.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayPrefix([u8; PREFIX_SIZE]);

impl OverlayPrefix {
    /// Derive the prefix from a fingerprint.
    pub fn from_fingerprint(fpr: &Fingerprint) -> Self {
        let mut bytes = [0u8; PREFIX_SIZE];
        bytes.copy_from_slice(&fpr.as_bytes()[4..12]);
        bytes[0] = PREFIX_LEAD;
        Self(bytes)
    }

    /// Create a prefix from an 8-byte array. The leading byte must be `0xFC`.
    pub fn from_bytes(bytes: [u8; PREFIX_SIZE]) -> Result<Self, CertError> {
        if bytes[0] != PREFIX_LEAD {
            return Err(CertError::InvalidPrefix(bytes[0]));
        }
        Ok(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PREFIX_SIZE] {
        &self.0
    }

    /// The prefix as a big-endian integer.
    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Debug for OverlayPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayPrefix({})", hex_encode(&self.0))
    }
}

impl fmt::Display for OverlayPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}
