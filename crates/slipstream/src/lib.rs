// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! # slipstream - low-latency multi-channel streaming transport
//!
//! A message-oriented transport for interactive remote-streaming sessions:
//! a server captures and encodes a scene, one or more clients decode, render
//! and send input back. Compressed video, audio, input events and control
//! traffic travel over independent logical channels of a single session.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Application callbacks                    |
//! |        on_message_received | on_terminate | discovery        |
//! +--------------------------------------------------------------+
//! |                    Client / Server / Session                 |
//! |   handshake (HELLO/JSON) | session manager | reader thread   |
//! +--------------------------------------------------------------+
//! |                      Flow-control layer                      |
//! |  UDP: fragmentation, reassembly, gap repair, MTU adaptation  |
//! |  TCP: length-prefixed framing                                |
//! +--------------------------------------------------------------+
//! |                        Socket layer                          |
//! |   datagram/stream sockets | selector | broadcast | urls      |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key properties
//!
//! - Per-channel in-order delivery; one channel's losses never stall another.
//! - Missing fragments are re-requested from a bounded sender-side history.
//! - The maximum fragment size adapts downward when loss statistics show the
//!   path cannot carry the current size.
//! - The same message API runs over UDP (full recovery protocol) and TCP
//!   (framing only).

/// Client side: server discovery, handshake, long-lived session loop.
pub mod client;
/// Protocol constants and tunables.
pub mod config;
/// Datagram and stream flow-control protocols.
pub mod flow;
/// Service messages: HELLO, HELLO_RESPONSE, refusal, codec descriptors.
pub mod msg;
/// Socket and address abstractions.
pub mod net;
/// Server side: listeners, accept/dispatch, datagram peer routing.
pub mod server;
/// Per-peer session state and the session manager.
pub mod session;

pub use client::{Client, ClientConnection, ClientEvents, DiscoveryCtrl, ServerInfo};
pub use flow::channel::Channel;
pub use flow::dgram::{FlowControl, MessageId};
pub use net::addr::Address;
pub use net::socket::SocketError;
pub use net::url::Url;
pub use server::{DatagramServer, ServerConfig, ServerEvents, StreamServer};
pub use session::{SessionManager, TerminationReason};

/// Errors returned by slipstream operations at the transport boundary.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Generic
    // ========================================================================
    /// Unspecified failure (prefer specific variants below).
    Fail,
    /// An argument was invalid for the requested operation.
    InvalidArg(String),

    // ========================================================================
    // Connection / handshake
    // ========================================================================
    /// Handshake or request did not complete within the allotted time.
    ConnectionTimeout,
    /// The peer explicitly refused the connection.
    ConnectionRefused,
    /// Version ranges of the two peers do not overlap.
    ConnectionInvalidVersion,
    /// No server answered at the given address.
    ServerNotAvailable,
    /// Discovery has not produced any servers yet.
    ServersNotEnumerated,

    // ========================================================================
    // Session
    // ========================================================================
    /// The session went idle past the disconnect timeout.
    SessionTimeout,
    /// A session for this peer is already registered.
    AlreadyExists,

    // ========================================================================
    // Transport
    // ========================================================================
    /// Socket-level failure, already mapped to the unified enumeration.
    Socket(SocketError),
    /// URL could not be parsed.
    InvalidUrl(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Fail => write!(f, "Operation failed"),
            Error::InvalidArg(msg) => write!(f, "Invalid argument: {}", msg),
            Error::ConnectionTimeout => write!(f, "Connection timed out"),
            Error::ConnectionRefused => write!(f, "Connection refused by peer"),
            Error::ConnectionInvalidVersion => {
                write!(f, "Peer protocol version range is not supported")
            }
            Error::ServerNotAvailable => write!(f, "Server not available"),
            Error::ServersNotEnumerated => write!(f, "No servers enumerated"),
            Error::SessionTimeout => write!(f, "Session timed out"),
            Error::AlreadyExists => write!(f, "Session already registered"),
            Error::Socket(e) => write!(f, "Socket error: {}", e),
            Error::InvalidUrl(url) => write!(f, "Invalid URL: {}", url),
        }
    }
}

impl std::error::Error for Error {}

impl From<SocketError> for Error {
    fn from(e: SocketError) -> Self {
        Error::Socket(e)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
