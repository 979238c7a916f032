// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Protocol constants and tunables - single source of truth.
//!
//! Every wire-format constant, default timeout and protocol limit lives here.
//! **Never hardcode these elsewhere!**

use std::time::Duration;

// =======================================================================
// Protocol versions
// =======================================================================

/// Sentinel returned by version negotiation when the ranges do not overlap.
pub const PROTOCOL_VERSION_UNSUPPORTED: u32 = 0;

/// Highest protocol version this implementation speaks.
///
/// Version 4 fixes the retransmission-request manifest to little-endian
/// (version 3 copied it in host byte order).
pub const PROTOCOL_VERSION_CURRENT: u32 = 4;

/// Lowest protocol version this implementation accepts from a peer.
pub const PROTOCOL_VERSION_MIN: u32 = 3;

// =======================================================================
// Datagram sizing (rfc879-derived)
// =======================================================================

/// Largest UDP payload deliverable at all (65535 - IP header - UDP header).
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// IP MSS per rfc879.
pub const IP_MSS_SIZE: usize = 576;

/// 20-byte IP header plus up to 40 bytes of options.
pub const IP_MAX_HEADER_LEN: usize = 60;

/// Minimal UDP payload every conforming path must carry.
pub const UDP_MSS_SIZE: usize = IP_MSS_SIZE - (IP_MAX_HEADER_LEN + 8);

/// Largest UDP payload that avoids IP-level fragmentation on ethernet.
pub const UDP_MAX_MSS_NO_FRAGMENTATION: usize = 1472;

// =======================================================================
// Flow control
// =======================================================================

/// Messages retained per channel on the sender for retransmission.
pub const SEND_HISTORY_LIMIT: u16 = 10;

/// How long a complete but head-of-line-blocked message may wait before it
/// is promoted past the hole in front of it.
pub const MSG_FLUSH_TIMEOUT: Duration = Duration::from_millis(150);

/// Number of application-visible channels (SYSTEM excluded).
pub const CHANNEL_COUNT: usize = 10;

// =======================================================================
// MTU monitor defaults
// =======================================================================

/// Seconds between loss-statistics evaluations.
pub const MONITOR_INTERVAL_SECS: u64 = 10;

/// Minimum distinct lost messages before the monitor decides anything.
pub const MONITOR_LOST_THRESHOLD: usize = 10;

/// Percentage-point jump in loss rate that marks the turning-point bucket.
pub const MONITOR_DECISION_THRESHOLD: f64 = 20.0;

// =======================================================================
// Networking defaults
// =======================================================================

/// Default service/discovery port.
pub const DEFAULT_PORT: u16 = 1235;

/// Default URL scheme when the caller gives a bare host.
pub const DEFAULT_PROTOCOL: &str = "udp";

/// Idle time after which a session is considered dead.
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the cached NIC broadcast-address list stays valid.
/// Interface enumeration is slow enough to be worth amortizing.
pub const NIC_CACHE_TTL: Duration = Duration::from_secs(1);
