//! Transport shim between the engine and the gateway.
//!
//! Adapts the engine's synchronous pull/push hooks to the gateway's
//! non-blocking datagram transport. The pull side is a single-datagram
//! buffer: `receive` installs the inbound datagram for the duration of the
//! call and the engine consumes it at most once; when empty, pull reports
//! would-block. Neither direction ever blocks.

use std::io;
use std::net::SocketAddr;

use crate::dtls::LinkIo;
use crate::gateway::Gateway;

pub(super) struct GatewayLink<'a> {
    gateway: &'a dyn Gateway,
    endpoint: SocketAddr,
    /// The one pending inbound datagram. Borrows the caller's buffer and is
    /// valid only for the duration of the `receive` call that installed it.
    pending: Option<&'a [u8]>,
}

impl<'a> GatewayLink<'a> {
    pub(super) fn new(
        gateway: &'a dyn Gateway,
        endpoint: SocketAddr,
        pending: Option<&'a [u8]>,
    ) -> Self {
        Self {
            gateway,
            endpoint,
            pending,
        }
    }
}

impl LinkIo for GatewayLink<'_> {
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.pending.take() {
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
        }
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.gateway.send(buf, self.endpoint)
    }

    fn pull_ready(&mut self) -> usize {
        self.pending.map_or(0, |d| d.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::Credentials;
    use crate::gateway::{EndpointHandle, PrefixHandle};
    use crate::session::Session;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct SinkGateway {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Gateway for SinkGateway {
        fn credentials(&self) -> Arc<Credentials> {
            unreachable!("not used by the shim")
        }
        fn send(&self, buf: &[u8], _endpoint: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push(buf.to_vec());
            Ok(buf.len())
        }
        fn connect_endpoint(&self, _: SocketAddr, _: Arc<Session>) -> EndpointHandle {
            EndpointHandle::new(0)
        }
        fn connect_prefix(
            &self,
            _: crate::cert::OverlayPrefix,
            _: Arc<Session>,
        ) -> PrefixHandle {
            PrefixHandle::new(0)
        }
        fn disconnect_endpoint(&self, _: EndpointHandle) {}
        fn disconnect_prefix(&self, _: PrefixHandle) {}
        fn decrypted(&self, _: &[u8]) {}
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn test_pull_consumes_exactly_once() {
        let gateway = SinkGateway {
            sent: Mutex::new(Vec::new()),
        };
        let datagram = [1u8, 2, 3, 4];
        let mut link = GatewayLink::new(&gateway, addr(), Some(&datagram));

        assert_eq!(link.pull_ready(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(link.pull(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &datagram);

        // Second pull reports would-block: the datagram is gone.
        assert_eq!(link.pull_ready(), 0);
        let err = link.pull(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_pull_truncates_to_buffer() {
        let gateway = SinkGateway {
            sent: Mutex::new(Vec::new()),
        };
        let datagram = [9u8; 8];
        let mut link = GatewayLink::new(&gateway, addr(), Some(&datagram));

        let mut buf = [0u8; 3];
        assert_eq!(link.pull(&mut buf).unwrap(), 3);
        assert_eq!(buf, [9u8; 3]);
    }

    #[test]
    fn test_push_reports_gateway_count() {
        let gateway = SinkGateway {
            sent: Mutex::new(Vec::new()),
        };
        let mut link = GatewayLink::new(&gateway, addr(), None);
        assert_eq!(link.push(b"out").unwrap(), 3);
        assert_eq!(gateway.sent.lock().as_slice(), &[b"out".to_vec()]);
    }

    #[test]
    fn test_empty_link_would_block() {
        let gateway = SinkGateway {
            sent: Mutex::new(Vec::new()),
        };
        let mut link = GatewayLink::new(&gateway, addr(), None);
        assert_eq!(link.pull_ready(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(
            link.pull(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }
}
