//! Handshake transcript and key schedule.
//!
//! Maintains the chaining key (ck) and transcript hash (h). Every handshake
//! message is mixed into the hash, ECDH output is mixed into the chaining
//! key, and the transport keys are split off once the exchange is complete.
//! Transcript signatures and finished MACs both bind to the running hash.

use hkdf::Hkdf;
use secp256k1::{ecdh::shared_secret_point, PublicKey, SecretKey};
use sha2::{Digest, Sha256};

/// Protocol name mixed into the initial transcript state.
/// Longer than 32 bytes, so it is hashed down.
const PROTOCOL_NAME: &[u8] = b"fcgate/1 dtls secp256k1-chacha20poly1305-sha256";

/// Domain separation for transcript signatures.
const SIG_DOMAIN: &[u8] = b"fcgate-hs-sig-v1";

/// Finished MAC labels.
pub(super) const LABEL_CLIENT_FINISHED: &[u8] = b"client finished";
pub(super) const LABEL_SERVER_FINISHED: &[u8] = b"server finished";

/// Running handshake transcript state.
#[derive(Clone)]
pub(super) struct Transcript {
    /// Chaining key for key derivation.
    ck: [u8; 32],
    /// Transcript hash for message binding.
    h: [u8; 32],
}

impl Transcript {
    /// Initialize with the protocol name.
    pub(super) fn initialize() -> Self {
        let mut hasher = Sha256::new();
        hasher.update(PROTOCOL_NAME);
        let h: [u8; 32] = hasher.finalize().into();
        Self { ck: h, h }
    }

    /// Mix a handshake message (kind byte + body bytes) into the hash.
    pub(super) fn mix_msg(&mut self, kind: u8, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update([kind]);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    /// Mix raw bytes (signatures, MACs) into the hash.
    pub(super) fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    /// Mix key material into the chaining key.
    pub(super) fn mix_key(&mut self, input_key_material: &[u8]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), input_key_material);
        let mut output = [0u8; 32];
        hk.expand(b"ck", &mut output)
            .expect("32 bytes is valid output length");
        self.ck = output;
    }

    /// Compute a finished MAC over the current transcript under a label.
    pub(super) fn finished(&self, label: &[u8]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), &self.h);
        let mut mac = [0u8; 32];
        hk.expand(label, &mut mac)
            .expect("32 bytes is valid output length");
        mac
    }

    /// Split into the two transport keys (client-write, server-write).
    pub(super) fn split(&self) -> ([u8; 32], [u8; 32]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), &[]);
        let mut output = [0u8; 64];
        hk.expand(b"transport", &mut output)
            .expect("64 bytes is valid output length");

        let mut k1 = [0u8; 32];
        let mut k2 = [0u8; 32];
        k1.copy_from_slice(&output[..32]);
        k2.copy_from_slice(&output[32..64]);
        (k1, k2)
    }

    /// Digest signed by transcript signatures: domain-separated hash of h.
    pub(super) fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(SIG_DOMAIN);
        hasher.update(self.h);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript").finish_non_exhaustive()
    }
}

/// ECDH between our secret and their public key.
///
/// Hashes only the x-coordinate of the shared point so the result is
/// independent of key parity.
pub(super) fn ecdh(our_secret: &SecretKey, their_public: &PublicKey) -> [u8; 32] {
    let point = shared_secret_point(their_public, our_secret);
    let mut hasher = Sha256::new();
    hasher.update(&point[..32]);
    let hash = hasher.finalize();
    let mut result = [0u8; 32];
    result.copy_from_slice(&hash);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::Secp256k1;

    #[test]
    fn test_transcripts_converge() {
        let mut a = Transcript::initialize();
        let mut b = Transcript::initialize();

        a.mix_msg(1, b"hello");
        b.mix_msg(1, b"hello");
        a.mix_key(b"shared");
        b.mix_key(b"shared");

        assert_eq!(a.finished(LABEL_CLIENT_FINISHED), b.finished(LABEL_CLIENT_FINISHED));
        assert_eq!(a.split().0, b.split().0);
        assert_eq!(a.signing_digest(), b.signing_digest());
    }

    #[test]
    fn test_transcripts_diverge_on_different_messages() {
        let mut a = Transcript::initialize();
        let mut b = Transcript::initialize();

        a.mix_msg(1, b"hello");
        b.mix_msg(1, b"olleh");

        assert_ne!(a.signing_digest(), b.signing_digest());
        assert_ne!(a.finished(LABEL_CLIENT_FINISHED), b.finished(LABEL_CLIENT_FINISHED));
    }

    #[test]
    fn test_finished_labels_differ() {
        let t = Transcript::initialize();
        assert_ne!(
            t.finished(LABEL_CLIENT_FINISHED),
            t.finished(LABEL_SERVER_FINISHED)
        );
    }

    #[test]
    fn test_split_keys_differ() {
        let mut t = Transcript::initialize();
        t.mix_key(b"ikm");
        let (k1, k2) = t.split();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_ecdh_agreement() {
        let secp = Secp256k1::new();
        let (sk_a, pk_a) = secp.generate_keypair(&mut rand::rng());
        let (sk_b, pk_b) = secp.generate_keypair(&mut rand::rng());

        assert_eq!(ecdh(&sk_a, &pk_b), ecdh(&sk_b, &pk_a));
        let (sk_c, _) = secp.generate_keypair(&mut rand::rng());
        assert_ne!(ecdh(&sk_a, &pk_b), ecdh(&sk_c, &pk_b));
    }
}
