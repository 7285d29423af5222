//! Gateway interface consumed by sessions.
//!
//! The gateway owns the datagram socket, the credentials, the two routing
//! tables (by remote endpoint and by peer prefix), and the upstream
//! plaintext path. Sessions register themselves into the routing tables and
//! hand every outbound ciphertext datagram to [`Gateway::send`].
//!
//! ## Re-entrancy
//!
//! `send`, `decrypted`, and the routing-table methods are called while the
//! invoking session's serialisation lock is held. A gateway implementation
//! must never call back into the same session synchronously from these
//! methods, or it will deadlock. Deliver follow-up work to a session from a
//! separate task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::cert::OverlayPrefix;
use crate::dtls::Credentials;
use crate::session::Session;

/// Routing-table registration for a session's remote endpoint.
///
/// Returned by [`Gateway::connect_endpoint`]; the owning entry is expected
/// to hold a strong reference to the session until
/// [`Gateway::disconnect_endpoint`] releases it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointHandle(u64);

impl EndpointHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint:{}", self.0)
    }
}

/// Routing-table registration for a verified peer's overlay prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrefixHandle(u64);

impl PrefixHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PrefixHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prefix:{}", self.0)
    }
}

/// The owning gateway, shared by all of its sessions.
pub trait Gateway: Send + Sync {
    /// The gateway's certificate credentials and priority string.
    fn credentials(&self) -> Arc<Credentials>;

    /// Transmit one datagram to an endpoint. Non-blocking; returns the byte
    /// count reported by the socket.
    fn send(&self, buf: &[u8], endpoint: SocketAddr) -> std::io::Result<usize>;

    /// Register a session in the endpoint routing table.
    fn connect_endpoint(&self, endpoint: SocketAddr, session: Arc<Session>) -> EndpointHandle;

    /// Register a verified session in the prefix routing table.
    fn connect_prefix(&self, prefix: OverlayPrefix, session: Arc<Session>) -> PrefixHandle;

    /// Drop an endpoint routing entry.
    fn disconnect_endpoint(&self, handle: EndpointHandle);

    /// Drop a prefix routing entry.
    fn disconnect_prefix(&self, handle: PrefixHandle);

    /// Deliver decrypted plaintext upstream.
    fn decrypted(&self, buf: &[u8]);
}
