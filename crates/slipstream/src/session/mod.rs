// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Per-peer sessions and the session manager.
//!
//! A session binds a peer address to a socket and a flow-control instance
//! and tracks liveness: every inbound message `touch()`es it, and the
//! manager's periodic cleanup retires sessions that stayed silent past the
//! disconnect timeout or were terminated explicitly.

/// The live-session set with timeout cleanup.
pub mod manager;

pub use manager::SessionManager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::net::addr::Address;

/// Why a session ended, as reported to `on_terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// No traffic within the disconnect timeout.
    Timeout,
    /// The peer disconnected or the socket failed terminally.
    Disconnect,
}

/// Shared per-session bookkeeping embedded in every session type.
pub struct SessionState {
    peer: Address,
    last_received: Mutex<Instant>,
    terminated: AtomicBool,
}

impl SessionState {
    pub fn new(peer: Address) -> Self {
        Self {
            peer,
            last_received: Mutex::new(Instant::now()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Peer this session talks to.
    pub fn peer_address(&self) -> &Address {
        &self.peer
    }

    /// Record inbound traffic; resets the idle clock.
    pub fn touch(&self) {
        *self.last_received.lock() = Instant::now();
    }

    /// Idle time since the last inbound message.
    pub fn elapsed_since_last_request(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// True once [`SessionState::terminate`] ran.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Flag the session for removal; safe from any thread, idempotent.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

/// Behavior every session type provides to the manager and the servers.
pub trait Session: Send + Sync {
    /// Shared bookkeeping.
    fn state(&self) -> &SessionState;

    /// The session went idle past the disconnect timeout. Implementations
    /// notify the application and release resources; the manager drops the
    /// session afterwards.
    fn on_session_timeout(&self);

    /// The session was terminated explicitly and is being removed.
    fn on_session_close(&self);

    /// Stop the session from any thread (flag + socket shutdown).
    fn terminate(&self) {
        self.state().terminate();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_touch_resets_idle_clock() {
        let state = SessionState::new(Address::loopback(1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(state.elapsed_since_last_request() >= Duration::from_millis(30));
        state.touch();
        assert!(state.elapsed_since_last_request() < Duration::from_millis(30));
    }

    #[test]
    fn test_session_terminate_is_sticky() {
        let state = SessionState::new(Address::loopback(1));
        assert!(!state.is_terminated());
        state.terminate();
        state.terminate();
        assert!(state.is_terminated());
    }
}
