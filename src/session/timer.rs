//! The session's single reusable timer.
//!
//! One timer slot serves handshake retry, the handshake hard deadline, and
//! the heartbeat cadence; arming it replaces whatever was pending. A
//! generation counter makes cancelled or superseded expirations inert: the
//! spawned task re-checks the generation under the session lock before
//! acting, so an abort that loses the race still has no effect.

use std::fmt;
use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::Session;

/// What a timer expiry should do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum TimerKind {
    /// Perform another handshake step.
    HandshakeRetry,
    /// Hard upper bound on handshake progress; tears the session down.
    HandshakeDeadline,
    /// Heartbeat cadence.
    Heartbeat,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerKind::HandshakeRetry => "handshake_retry",
            TimerKind::HandshakeDeadline => "handshake_deadline",
            TimerKind::Heartbeat => "heartbeat",
        };
        write!(f, "{}", s)
    }
}

pub(super) struct Timer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub(super) fn new() -> Self {
        Self {
            generation: 0,
            task: None,
        }
    }

    /// Arm the timer, replacing any pending expiry.
    ///
    /// Holds only a weak session reference so the timer never extends a
    /// session's lifetime.
    pub(super) fn arm(
        &mut self,
        runtime: &Handle,
        session: Weak<Session>,
        kind: TimerKind,
        delay_ms: u64,
    ) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.task = Some(runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(session) = session.upgrade() {
                session.timer_fired(kind, generation);
            }
        }));
    }

    /// Cancel the pending expiry, if any.
    pub(super) fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Generation the pending expiry was armed with.
    pub(super) fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
