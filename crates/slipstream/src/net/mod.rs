// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Socket and address abstractions.
//!
//! Wraps OS sockets behind a small, uniform surface: datagram send/receive
//! with peer addresses, stream send/receive with exact-length helpers, a
//! readiness selector, broadcast with cached interface enumeration, and URL
//! parsing. All OS error codes are mapped once, in [`socket`], into
//! [`SocketError`](socket::SocketError).

/// Address tagged union (IPv4, IPv6, unix-domain) with a total ordering.
pub mod addr;
/// Broadcast-interface enumeration with a TTL-bounded cache.
pub mod nic;
/// Datagram/stream sockets and the unified error enumeration.
pub mod socket;
/// Readability/writability multiplexing with a timeout.
pub mod selector;
/// `proto://host:port` parsing.
pub mod url;

pub use addr::Address;
pub use nic::NicCache;
pub use selector::Selector;
pub use socket::{DatagramSocket, SocketError, StreamListener, StreamSocket};
#[cfg(unix)]
pub use socket::{UnixStreamListener, UnixStreamSocket};
pub use url::Url;
