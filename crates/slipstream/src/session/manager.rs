// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! The live-session set.
//!
//! Safe under concurrent registration, cleanup and termination. Cleanup
//! walks the set once per reader-loop iteration: idle sessions get their
//! timeout hook, terminated ones their close hook, everything else stays.
//! Timeout enforcement can be switched off globally so long-running tests
//! do not lose their quiet sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::session::Session;
use crate::{Error, Result};

/// Registry of live sessions with periodic timeout cleanup.
///
/// Generic over the concrete session type so servers get their own type
/// back from lookups; `SessionManager<dyn Session>` works where only the
/// trait surface matters.
pub struct SessionManager<S: Session + ?Sized = dyn Session> {
    sessions: Mutex<Vec<Arc<S>>>,
    timeout_enabled: AtomicBool,
}

impl<S: Session + ?Sized> Default for SessionManager<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session + ?Sized> SessionManager<S> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            timeout_enabled: AtomicBool::new(true),
        }
    }

    /// Enable or disable idle-timeout enforcement (tests disable it).
    pub fn set_session_timeout_enabled(&self, enabled: bool) {
        self.timeout_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Add a session; rejects a second registration for the same peer.
    pub fn register_session(&self, session: Arc<S>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let peer = session.state().peer_address().clone();
        if sessions
            .iter()
            .any(|s| s.state().peer_address() == &peer)
        {
            log::error!("[SessionManager] session for {} already registered", peer);
            return Err(Error::AlreadyExists);
        }
        log::info!(
            "[SessionManager] registered session for {} ({} live)",
            peer,
            sessions.len() + 1
        );
        sessions.push(session);
        Ok(())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Snapshot of the current sessions, for selector construction.
    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.sessions.lock().clone()
    }

    /// Find the session bound to `peer`.
    pub fn find_by_peer(&self, peer: &crate::net::addr::Address) -> Option<Arc<S>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.state().peer_address() == peer)
            .cloned()
    }

    /// Retire idle and terminated sessions.
    ///
    /// Idle past `disconnect_timeout` (when enforcement is on) fires
    /// `on_session_timeout`; a terminated flag fires `on_session_close`.
    /// The timeout check runs first, so a session that is both idle and
    /// terminated reports a timeout. Both kinds leave the set; everything
    /// else is retained.
    pub fn cleanup_timed_out_sessions(&self, disconnect_timeout: Duration) {
        let timeout_enabled = self.timeout_enabled.load(Ordering::Relaxed);
        let mut sessions = self.sessions.lock();
        let mut retained: Vec<Arc<S>> = Vec::with_capacity(sessions.len());

        for session in sessions.drain(..) {
            if timeout_enabled
                && session.state().elapsed_since_last_request() > disconnect_timeout
            {
                log::info!(
                    "[SessionManager] session {} timed out",
                    session.state().peer_address()
                );
                session.on_session_timeout();
            } else if session.state().is_terminated() {
                log::debug!(
                    "[SessionManager] closing terminated session {}",
                    session.state().peer_address()
                );
                session.on_session_close();
            } else {
                retained.push(session);
            }
        }
        *sessions = retained;
    }

    /// Terminate and drop every session (server shutdown).
    pub fn terminate_sessions(&self) {
        let mut sessions = self.sessions.lock();
        for session in sessions.iter() {
            session.terminate();
            session.on_session_close();
        }
        sessions.clear();
    }
}
