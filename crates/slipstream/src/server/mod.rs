// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Server side of the transport.
//!
//! Two servers share one callback surface and the session manager:
//!
//! - [`StreamServer`] owns a TCP listener, accepts connections into
//!   per-socket sessions and drains them from a single reader thread.
//! - [`DatagramServer`] owns one bound UDP socket shared by every peer;
//!   inbound datagrams are routed to per-peer sessions by source address.
//!
//! Both answer `DISCOVERY`/`HELLO` on the service channel themselves and
//! hand every other delivered message to the application callbacks.

/// UDP server: shared socket, per-peer flow-control sessions.
pub mod dgram;
/// TCP server: listener, accept loop, reader thread.
pub mod stream;

pub use dgram::DatagramServer;
pub use stream::StreamServer;

use std::time::Duration;

use crate::config::{DEFAULT_DISCONNECT_TIMEOUT, DEFAULT_PORT, MAX_DATAGRAM_SIZE};
use crate::flow::dgram::MessageId;
use crate::net::addr::Address;
use crate::session::TerminationReason;

/// Application callbacks shared by both server flavors.
///
/// Handshake traffic (`DISCOVERY`, `HELLO`, refusals) never reaches these;
/// everything else delivered on any channel does.
pub trait ServerEvents: Send + Sync {
    /// A logical message arrived from `peer`.
    fn on_message_received(&self, peer: &Address, channel_id: u8, msg_id: MessageId, body: &[u8]);

    /// A session ended; the peer is gone from the session set.
    fn on_session_terminated(&self, peer: &Address, reason: TerminationReason) {
        let _ = (peer, reason);
    }
}

/// Server identity and limits advertised in handshake responses.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in `ServerName`.
    pub name: String,
    /// Port advertised in the handshake (the service port).
    pub port: u16,
    /// Datagram size offered to clients (and our initial send MTU).
    pub datagram_size: usize,
    /// Idle time after which a session is retired.
    pub disconnect_timeout: Duration,
    /// Transport names advertised in `Transports`.
    pub transports: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "slipstream server".to_string(),
            port: DEFAULT_PORT,
            datagram_size: MAX_DATAGRAM_SIZE,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            transports: vec!["UDP".to_string(), "TCP".to_string()],
        }
    }
}
