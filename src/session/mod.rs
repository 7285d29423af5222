//! Secure datagram sessions.
//!
//! One [`Session`] per remote peer connection attempt. A session drives the
//! crypto engine's handshake against its primary endpoint, authenticates the
//! peer certificate against the keyring, keeps the tunnel alive with
//! heartbeats, and moves ciphertext/plaintext between the gateway and the
//! engine. Client sessions carry an ordered set of fallback endpoints: a
//! handshake timeout spawns a successor for the next candidate and tears the
//! current session down.
//!
//! Sessions are `Arc`-owned. The gateway's routing-table entries hold the
//! strong references; `terminate` schedules a grace timer whose expiry
//! deregisters them, after which the last clone drops and the engine is
//! released. Every entry into the engine is serialised by one lock, so a
//! session may be driven concurrently from receive paths, send paths, and
//! timer tasks.

mod link;
mod timer;
mod verify;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::dtls::{Cookie, Engine, EngineConfig, EngineError, Record, Role};
use crate::gateway::{EndpointHandle, Gateway, PrefixHandle};
use crate::keyring::{Keyring, Keyserver};

use link::GatewayLink;
use timer::{Timer, TimerKind};
use verify::PeerVerifier;

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no candidate endpoints")]
    NoEndpoints,

    #[error("session not established")]
    NotEstablished,

    #[error("crypto engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Everything a session needs from its environment.
#[derive(Clone)]
pub struct SessionEnv {
    /// Runtime the session's timers run on (the local I/O context).
    pub runtime: Handle,
    /// The owning gateway.
    pub gateway: Arc<dyn Gateway>,
    /// Local key storage for peer verification.
    pub keyring: Arc<dyn Keyring>,
    /// Optional remote key lookup.
    pub keyserver: Option<Arc<dyn Keyserver>>,
    /// Protocol timings and verification policy.
    pub config: Arc<SessionConfig>,
}

/// Engine state and flags behind the serialisation lock.
struct Inner {
    engine: Engine,
    /// Remaining fallback endpoints (client role only).
    candidates: Vec<SocketAddr>,
    /// Single timer reused for handshake retry, the hard deadline, and the
    /// heartbeat cadence.
    timer: Timer,
    handshake_done: bool,
    /// Peer identity accepted and prefix registered.
    verified: bool,
    /// Shutdown initiated; only the deferred destruction may still run.
    terminated: bool,
    bye_sent: bool,
    /// Consecutive heartbeats without a pong.
    pings_missed: u32,
    endpoint_reg: Option<EndpointHandle>,
    /// Valid iff `verified`.
    prefix_reg: Option<PrefixHandle>,
}

/// One authenticated secure-datagram connection to a peer.
pub struct Session {
    role: Role,
    /// The endpoint currently being tried.
    endpoint: SocketAddr,
    env: SessionEnv,
    inner: Mutex<Inner>,
}

impl Session {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Create a server session for an inbound endpoint.
    ///
    /// The gateway calls this on the first datagram from an unknown
    /// endpoint; the handshake starts when that datagram is fed through
    /// [`Session::receive`].
    pub fn accept(env: SessionEnv, remote: SocketAddr) -> Arc<Self> {
        Self::build(env, Role::Server, remote, Vec::new())
    }

    /// Create a client session for an ordered set of candidate endpoints.
    ///
    /// The head becomes the primary endpoint and the handshake starts
    /// immediately; the tail is retained for fan-out on handshake timeout.
    pub fn connect(
        env: SessionEnv,
        mut candidates: Vec<SocketAddr>,
    ) -> Result<Arc<Self>, SessionError> {
        if candidates.is_empty() {
            return Err(SessionError::NoEndpoints);
        }
        let endpoint = candidates.remove(0);
        let session = Self::build(env, Role::Client, endpoint, candidates);

        let mut guard = session.inner.lock();
        let mut io = GatewayLink::new(&*session.env.gateway, session.endpoint, None);
        session.drive_handshake(&mut guard, &mut io);
        drop(guard);

        Ok(session)
    }

    fn build(
        env: SessionEnv,
        role: Role,
        endpoint: SocketAddr,
        candidates: Vec<SocketAddr>,
    ) -> Arc<Self> {
        let mut engine_config = EngineConfig::new(role, env.gateway.credentials());
        engine_config.require_peer_certificate = true;
        engine_config.peer_heartbeats = true;
        engine_config.retransmit_ms = env.config.handshake_retransmit_ms;
        engine_config.handshake_timeout_ms = env.config.handshake_timeout_ms;
        engine_config.data_mtu = env.config.data_mtu;
        let engine = Engine::new(engine_config);

        let session = Arc::new(Self {
            role,
            endpoint,
            env,
            inner: Mutex::new(Inner {
                engine,
                candidates,
                timer: Timer::new(),
                handshake_done: false,
                verified: false,
                terminated: false,
                bye_sent: false,
                pings_missed: 0,
                endpoint_reg: None,
                prefix_reg: None,
            }),
        });

        let handle = session
            .env
            .gateway
            .connect_endpoint(endpoint, Arc::clone(&session));
        session.inner.lock().endpoint_reg = Some(handle);

        debug!(role = %role, endpoint = %endpoint, "Session created");
        session
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The endpoint this session is connected to (or trying).
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Whether the handshake has completed.
    pub fn handshake_completed(&self) -> bool {
        self.inner.lock().handshake_done
    }

    /// Whether the peer identity was accepted and the prefix registered.
    pub fn is_verified(&self) -> bool {
        self.inner.lock().verified
    }

    /// Whether shutdown has been initiated.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminated
    }

    /// Fallback endpoints not yet tried.
    pub fn remaining_candidates(&self) -> Vec<SocketAddr> {
        self.inner.lock().candidates.clone()
    }

    // ========================================================================
    // Gateway-facing operations
    // ========================================================================

    /// Feed an inbound ciphertext datagram through the session.
    ///
    /// `plaintext` is scratch space for the decrypted record; decrypted data
    /// is delivered upstream through `Gateway::decrypted` before the call
    /// returns. Datagrams arriving after terminate are dropped silently.
    pub fn receive(self: &Arc<Self>, datagram: &[u8], plaintext: &mut [u8]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.terminated {
            trace!(endpoint = %self.endpoint, "Dropping datagram after terminate");
            return;
        }

        let mut io = GatewayLink::new(&*self.env.gateway, self.endpoint, Some(datagram));

        if !inner.handshake_done {
            self.drive_handshake(inner, &mut io);
            return;
        }

        match inner.engine.record_recv(&mut io, plaintext) {
            Ok(Record::Data(n)) => {
                trace!(endpoint = %self.endpoint, len = n, "Decrypted datagram");
                self.env.gateway.decrypted(&plaintext[..n]);
            }
            Err(EngineError::WouldBlock) => {}
            Ok(Record::HeartbeatPing) => {
                if let Err(e) = inner.engine.pong(&mut io) {
                    warn!(endpoint = %self.endpoint, error = %e, "Heartbeat pong failed");
                    self.terminate_locked(inner);
                }
            }
            Ok(Record::HeartbeatPong) => {
                inner.pings_missed = 0;
            }
            Ok(Record::Alert(level, kind)) => {
                // Terminate only if the alert is actually pending; the level
                // is deliberately not distinguished.
                if inner.engine.take_pending_alert().is_some() {
                    info!(endpoint = %self.endpoint, %level, %kind, "Alert received");
                    self.terminate_locked(inner);
                }
            }
            Ok(Record::Closed) => {
                info!(endpoint = %self.endpoint, "Peer closed the session");
                self.terminate_locked(inner);
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Record receive failed");
                self.terminate_locked(inner);
            }
        }
    }

    /// Encrypt and transmit plaintext to the peer.
    ///
    /// Fragmentation to the data MTU is the engine's responsibility. Sends
    /// after terminate are dropped silently.
    pub fn send(self: &Arc<Self>, plaintext: &[u8]) -> Result<(), SessionError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.terminated {
            trace!(endpoint = %self.endpoint, "Dropping send after terminate");
            return Ok(());
        }
        if !inner.handshake_done {
            return Err(SessionError::NotEstablished);
        }

        let mut io = GatewayLink::new(&*self.env.gateway, self.endpoint, None);
        match inner.engine.record_send(&mut io, plaintext) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Record send failed");
                self.terminate_locked(inner);
                Err(e.into())
            }
        }
    }

    /// Install a gateway-verified handshake cookie (server-side anti-spoof
    /// resume), consuming it.
    pub fn set(&self, cookie: Cookie) -> Result<(), SessionError> {
        let mut guard = self.inner.lock();
        guard.engine.set_prestate(cookie)?;
        Ok(())
    }

    /// Initiate shutdown. Idempotent.
    ///
    /// Sends a close alert to the peer (best-effort), cancels the timer, and
    /// schedules the deferred destruction after the configured grace period.
    /// The grace permits in-flight work to complete; once scheduled,
    /// destruction is inevitable.
    pub fn terminate(self: &Arc<Self>) {
        let mut guard = self.inner.lock();
        self.terminate_locked(&mut guard);
    }

    // ========================================================================
    // Handshake driver
    // ========================================================================

    /// Perform one handshake step and act on the result.
    fn drive_handshake(self: &Arc<Self>, inner: &mut Inner, io: &mut GatewayLink<'_>) {
        let now = now_ms();

        let Inner {
            engine,
            verified,
            prefix_reg,
            ..
        } = inner;
        let mut verifier = PeerVerifier::new(self, verified, prefix_reg);
        let result = engine.handshake(io, &mut verifier, now);

        match result {
            Ok(()) => {
                inner.handshake_done = true;
                inner.engine.set_data_mtu(self.env.config.data_mtu);
                inner.timer.cancel();
                info!(role = %self.role, endpoint = %self.endpoint, "Handshake completed");
                match self.role {
                    Role::Server => inner.timer.arm(
                        &self.env.runtime,
                        Arc::downgrade(self),
                        TimerKind::Heartbeat,
                        self.env.config.heartbeat_interval_ms,
                    ),
                    Role::Client => self.heartbeat_tick(inner, io),
                }
            }
            Err(EngineError::WouldBlock) => {
                // Re-arm only while the engine owns the retransmission
                // direction; when it is waiting to read, the next inbound
                // datagram re-enters the driver.
                if inner.engine.awaiting_write() {
                    let delay = inner.engine.retransmit_timeout(now);
                    inner.timer.arm(
                        &self.env.runtime,
                        Arc::downgrade(self),
                        TimerKind::HandshakeRetry,
                        delay,
                    );
                }
            }
            Err(EngineError::TimedOut) => {
                info!(
                    endpoint = %self.endpoint,
                    remaining = inner.candidates.len(),
                    "Handshake timed out"
                );
                self.fan_out(inner);
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Handshake failed");
                self.terminate_locked(inner);
            }
        }
    }

    /// Try the next candidate endpoint, then tear this session down.
    fn fan_out(self: &Arc<Self>, inner: &mut Inner) {
        let remaining = std::mem::take(&mut inner.candidates);
        if remaining.is_empty() {
            info!(endpoint = %self.endpoint, "No candidate endpoints left");
        } else {
            info!(endpoint = %self.endpoint, next = %remaining[0], "Trying next candidate endpoint");
            match Session::connect(self.env.clone(), remaining) {
                Ok(successor) => {
                    debug!(endpoint = %successor.endpoint(), "Successor session created");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create successor session");
                }
            }
        }
        self.terminate_locked(inner);
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// One heartbeat invocation: count it, give up past the miss limit,
    /// otherwise ping and re-arm.
    fn heartbeat_tick(self: &Arc<Self>, inner: &mut Inner, io: &mut GatewayLink<'_>) {
        inner.pings_missed += 1;
        if inner.pings_missed > self.env.config.heartbeat_max_missed {
            warn!(
                endpoint = %self.endpoint,
                missed = inner.pings_missed,
                "Peer stopped answering heartbeats"
            );
            self.terminate_locked(inner);
            return;
        }

        match inner
            .engine
            .ping(io, self.env.config.heartbeat_payload)
        {
            Ok(()) => inner.timer.arm(
                &self.env.runtime,
                Arc::downgrade(self),
                TimerKind::Heartbeat,
                self.env.config.heartbeat_interval_ms,
            ),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Heartbeat ping failed");
                self.terminate_locked(inner);
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub(super) fn timer_fired(self: &Arc<Self>, kind: TimerKind, generation: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.timer.generation() != generation {
            // Cancelled or re-armed while this expiry was in flight.
            return;
        }
        if inner.terminated {
            return;
        }

        trace!(endpoint = %self.endpoint, timer = %kind, "Timer fired");
        let mut io = GatewayLink::new(&*self.env.gateway, self.endpoint, None);
        match kind {
            TimerKind::HandshakeRetry => {
                if inner.handshake_done {
                    return;
                }
                // Arm the hard deadline first; the handshake step below
                // replaces it whenever it still owes a retransmission, so it
                // only survives in states where nothing else can progress.
                inner.timer.arm(
                    &self.env.runtime,
                    Arc::downgrade(self),
                    TimerKind::HandshakeDeadline,
                    self.env.config.handshake_timeout_ms,
                );
                self.drive_handshake(inner, &mut io);
            }
            TimerKind::HandshakeDeadline => {
                info!(endpoint = %self.endpoint, "Handshake deadline reached");
                self.terminate_locked(inner);
            }
            TimerKind::Heartbeat => {
                if !inner.handshake_done {
                    return;
                }
                self.heartbeat_tick(inner, &mut io);
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    fn terminate_locked(self: &Arc<Self>, inner: &mut Inner) {
        if inner.terminated {
            return;
        }
        inner.terminated = true;

        if !inner.bye_sent {
            let mut io = GatewayLink::new(&*self.env.gateway, self.endpoint, None);
            let _ = inner.engine.bye(&mut io);
            inner.bye_sent = true;
        }

        inner.timer.cancel();

        info!(role = %self.role, endpoint = %self.endpoint, "Session terminating");
        let session = Arc::clone(self);
        let grace = Duration::from_millis(self.env.config.destroy_grace_ms);
        self.env.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            session.destroy();
        });
    }

    /// Deferred destruction: deregister from the gateway's routing tables,
    /// dropping the strong references that keep this session alive. The
    /// engine is released when the last clone drops.
    fn destroy(self: &Arc<Self>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.bye_sent {
            let mut io = GatewayLink::new(&*self.env.gateway, self.endpoint, None);
            let _ = inner.engine.bye(&mut io);
            inner.bye_sent = true;
        }

        if let Some(handle) = inner.endpoint_reg.take() {
            self.env.gateway.disconnect_endpoint(handle);
        }
        if let Some(handle) = inner.prefix_reg.take() {
            self.env.gateway.disconnect_prefix(handle);
        }
        debug!(endpoint = %self.endpoint, "Session destroyed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Current Unix time in milliseconds.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
