//! Session configuration.
//!
//! All the `session.*` parameters a gateway plumbs into its sessions:
//! verification policy and protocol timings. The gateway loads these from its
//! own configuration system; this crate only defines the structures and their
//! defaults.

use serde::{Deserialize, Serialize};

// ============================================================================
// Verification Policy
// ============================================================================

/// Peer verification policy (`session.verify.*`).
///
/// Passed into sessions at construction so verification never reads global
/// state and sessions stay testable in isolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Import presented peer certificates into the local keyring
    /// (`session.verify.import`).
    #[serde(default = "VerifyPolicy::default_import")]
    pub import: bool,
    /// Keyserver to query by fingerprint before local lookup; empty string
    /// disables the fetch (`session.verify.keyserver`).
    #[serde(default = "VerifyPolicy::default_keyserver")]
    pub keyserver: String,
    /// Minimum acceptable user-ID validity level (`session.verify.validity`).
    #[serde(default = "VerifyPolicy::default_validity")]
    pub validity: u8,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            import: false,
            keyserver: String::new(),
            validity: 0,
        }
    }
}

impl VerifyPolicy {
    fn default_import() -> bool {
        false
    }
    fn default_keyserver() -> String {
        String::new()
    }
    fn default_validity() -> u8 {
        0
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Session protocol parameters (`session.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Verification policy (`session.verify.*`).
    #[serde(default)]
    pub verify: VerifyPolicy,

    /// Initial handshake retransmit timeout in milliseconds
    /// (`session.handshake_retransmit_ms`).
    #[serde(default = "SessionConfig::default_handshake_retransmit_ms")]
    pub handshake_retransmit_ms: u64,

    /// Total handshake deadline in milliseconds
    /// (`session.handshake_timeout_ms`).
    #[serde(default = "SessionConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Heartbeat cadence in milliseconds (`session.heartbeat_interval_ms`).
    #[serde(default = "SessionConfig::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat ping payload size in bytes (`session.heartbeat_payload`).
    #[serde(default = "SessionConfig::default_heartbeat_payload")]
    pub heartbeat_payload: usize,

    /// Consecutive unanswered heartbeats tolerated before teardown
    /// (`session.heartbeat_max_missed`).
    #[serde(default = "SessionConfig::default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,

    /// Grace period between terminate and destruction in milliseconds
    /// (`session.destroy_grace_ms`).
    #[serde(default = "SessionConfig::default_destroy_grace_ms")]
    pub destroy_grace_ms: u64,

    /// Plaintext MTU applied once the handshake completes
    /// (`session.data_mtu`).
    #[serde(default = "SessionConfig::default_data_mtu")]
    pub data_mtu: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verify: VerifyPolicy::default(),
            handshake_retransmit_ms: 500,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_payload: 256,
            heartbeat_max_missed: 3,
            destroy_grace_ms: 3_000,
            data_mtu: 1280,
        }
    }
}

impl SessionConfig {
    fn default_handshake_retransmit_ms() -> u64 {
        500
    }
    fn default_handshake_timeout_ms() -> u64 {
        10_000
    }
    fn default_heartbeat_interval_ms() -> u64 {
        30_000
    }
    fn default_heartbeat_payload() -> usize {
        256
    }
    fn default_heartbeat_max_missed() -> u32 {
        3
    }
    fn default_destroy_grace_ms() -> u64 {
        3_000
    }
    fn default_data_mtu() -> usize {
        1280
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.handshake_retransmit_ms, 500);
        assert_eq!(cfg.handshake_timeout_ms, 10_000);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.heartbeat_payload, 256);
        assert_eq!(cfg.heartbeat_max_missed, 3);
        assert_eq!(cfg.destroy_grace_ms, 3_000);
        assert_eq!(cfg.data_mtu, 1280);
        assert!(!cfg.verify.import);
        assert!(cfg.verify.keyserver.is_empty());
    }
}
