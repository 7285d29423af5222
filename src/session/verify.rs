//! Peer certificate verification.
//!
//! Runs inside the engine's handshake with the session lock held. The
//! checks gate, in order: certificate type, chain shape, optional keyring
//! import, fingerprint extraction, optional keyserver fetch, local keyring
//! lookup, key state, subkey match and state, and user-ID validity. Passing
//! all of them derives the peer's overlay prefix and registers the session
//! in the gateway's prefix routing table.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cert::{Certificate, OverlayPrefix};
use crate::dtls::{AlertKind, CertType, CertVerifier, HandshakePeer, Rejection};
use crate::gateway::PrefixHandle;
use crate::keyring::{subkey_id_hex, Validity};

use super::Session;

/// The session's verification callback, wired to the engine per handshake
/// step. Recovers the session through the borrowed reference and writes the
/// verification outcome back into the session state it borrows.
pub(super) struct PeerVerifier<'a> {
    session: &'a Arc<Session>,
    verified: &'a mut bool,
    prefix_reg: &'a mut Option<PrefixHandle>,
}

impl<'a> PeerVerifier<'a> {
    pub(super) fn new(
        session: &'a Arc<Session>,
        verified: &'a mut bool,
        prefix_reg: &'a mut Option<PrefixHandle>,
    ) -> Self {
        Self {
            session,
            verified,
            prefix_reg,
        }
    }

    /// Run the verification steps, returning the peer's overlay prefix on
    /// acceptance.
    fn check(&self, peer: &HandshakePeer<'_>) -> Result<OverlayPrefix, Rejection> {
        let env = &self.session.env;
        let policy = &env.config.verify;
        let endpoint = self.session.endpoint;

        if peer.cert_type != CertType::OpenPgp {
            info!(%endpoint, cert_type = %peer.cert_type, "Rejecting peer: unsupported certificate type");
            return Err(Rejection::with_alert(AlertKind::UnsupportedCertificate));
        }

        if peer.chain.len() != 1 {
            info!(%endpoint, chain_len = peer.chain.len(), "Rejecting peer: unexpected certificate chain");
            return Err(Rejection::with_alert(AlertKind::BadCertificate));
        }
        let raw = &peer.chain[0];

        // Opportunistic: a failed import never rejects on its own.
        if policy.import {
            if let Err(e) = env.keyring.import(raw) {
                warn!(%endpoint, error = %e, "Peer certificate import failed");
            }
        }

        let cert = match Certificate::decode(raw) {
            Ok(cert) => cert,
            Err(e) => {
                info!(%endpoint, error = %e, "Rejecting peer: unparseable certificate");
                return Err(Rejection::with_alert(AlertKind::BadCertificate));
            }
        };
        let fingerprint = cert.fingerprint();
        let fpr_hex = fingerprint.hex();

        if !policy.keyserver.is_empty() {
            if let Some(keyserver) = &env.keyserver {
                match keyserver.fetch(&fpr_hex) {
                    Ok(Some(bytes)) => {
                        if let Err(e) = env.keyring.import(&bytes) {
                            warn!(%endpoint, error = %e, "Keyserver certificate import failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(keyserver = %policy.keyserver, error = %e, "Keyserver fetch failed")
                    }
                }
            }
        }

        let Some(entry) = env.keyring.lookup(&fpr_hex) else {
            info!(%endpoint, fingerprint = %fingerprint, "Rejecting peer: key not in keyring");
            return Err(Rejection::silent());
        };

        if entry.state.is_bad() {
            info!(%endpoint, fingerprint = %fingerprint, "Rejecting peer: key disabled, invalid, or revoked");
            return Err(Rejection::with_alert(AlertKind::CertificateRevoked));
        }
        if entry.state.expired {
            info!(%endpoint, fingerprint = %fingerprint, "Rejecting peer: key expired");
            return Err(Rejection::with_alert(AlertKind::CertificateExpired));
        }

        let id_hex = subkey_id_hex(&peer.subkey_id);
        match entry.subkey_by_id_hex(&id_hex) {
            Some(subkey) => {
                if subkey.state.disabled || subkey.state.invalid || !subkey.can_authenticate {
                    info!(%endpoint, subkey = %id_hex, "Rejecting peer: subkey unusable for authentication");
                    return Err(Rejection::with_alert(AlertKind::CertificateUnknown));
                }
                if subkey.state.expired {
                    info!(%endpoint, subkey = %id_hex, "Rejecting peer: subkey expired");
                    return Err(Rejection::with_alert(AlertKind::CertificateExpired));
                }
                if subkey.state.revoked {
                    info!(%endpoint, subkey = %id_hex, "Rejecting peer: subkey revoked");
                    return Err(Rejection::with_alert(AlertKind::CertificateRevoked));
                }
            }
            None => {
                info!(%endpoint, subkey = %id_hex, "Rejecting peer: no matching subkey");
                return Err(Rejection::with_alert(AlertKind::CertificateRevoked));
            }
        }

        let validity = entry.max_uid_validity();
        let required = Validity::from_level(policy.validity);
        if validity < required {
            info!(%endpoint, %validity, %required, "Rejecting peer: user-ID validity below threshold");
            return Err(Rejection::with_alert(AlertKind::CertificateExpired));
        }

        Ok(OverlayPrefix::from_fingerprint(&fingerprint))
    }
}

impl CertVerifier for PeerVerifier<'_> {
    fn verify(&mut self, peer: &HandshakePeer<'_>) -> Result<(), Rejection> {
        let prefix = self.check(peer)?;

        let handle = self
            .session
            .env
            .gateway
            .connect_prefix(prefix, Arc::clone(self.session));
        *self.prefix_reg = Some(handle);
        *self.verified = true;
        info!(endpoint = %self.session.endpoint, %prefix, "Peer verified");
        Ok(())
    }
}
