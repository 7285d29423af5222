//! Record AEAD cipher state.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};

use super::EngineError;

/// Size of the AEAD tag.
pub(super) const TAG_SIZE: usize = 16;

/// One direction's record cipher: a ChaCha20-Poly1305 key with explicit
/// sequence-number nonces. The record header travels as associated data so
/// the tag binds it.
#[derive(Clone)]
pub(super) struct CipherState {
    key: [u8; 32],
}

impl CipherState {
    pub(super) fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Encrypt a record body under its sequence number, authenticating the
    /// header as AAD. Returns ciphertext with appended tag.
    pub(super) fn seal(
        &self,
        seq: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| EngineError::Decrypt)?;
        let nonce = seq_to_nonce(seq);
        cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| EngineError::Decrypt)
    }

    /// Decrypt a record body under its wire sequence number. The AAD must
    /// match exactly what was sealed or tag verification fails.
    pub(super) fn open(
        &self,
        seq: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(EngineError::Decrypt);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|_| EngineError::Decrypt)?;
        let nonce = seq_to_nonce(seq);
        cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| EngineError::Decrypt)
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("key", &"[redacted]")
            .finish()
    }
}

/// Convert a sequence number to a nonce: 8-byte counter, 4-byte zero prefix.
fn seq_to_nonce(seq: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&seq.to_le_bytes());
    *Nonce::from_slice(&nonce_bytes)
}
