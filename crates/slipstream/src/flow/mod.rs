// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Flow-control protocols.
//!
//! Two protocols share one message-oriented contract:
//!
//! | Substrate | Protocol | Adds |
//! |-----------|----------|------|
//! | UDP | [`dgram::FlowControl`] | fragmentation, reassembly, gap repair, MTU adaptation |
//! | TCP | [`stream::StreamFlow`] | length-prefixed framing only |
//!
//! ## Datagram protocol flow
//!
//! ```text
//! Sender                                        Receiver
//!   |--- frag(id=1, ch=1, ofs=0)  -------------->|
//!   |--- frag(id=1, ch=1, ofs=n)  ----X (lost)   |
//!   |--- frag(id=2, ch=1, ofs=0)  -------------->|
//!   |                                            | (gap: id=1 incomplete)
//!   |<-- SYSTEM manifest {ch=1, id=1, [n..m)} ---|
//!   |--- frag(id=1, ch=1, ofs=n) [resend] ------>|
//!   |                                            | deliver 1, deliver 2
//! ```

/// Logical channel and opcode enumerations.
pub mod channel;
/// Datagram flow-control engine: fragmentation, reassembly, repair.
pub mod dgram;
/// Fragment wire format (15-byte header).
pub mod fragment;
/// Bounded per-channel send history for retransmission.
pub mod history;
/// Retransmission-request chunk manifest codec.
pub mod manifest;
/// Loss-bucket statistics driving MTU adaptation.
pub mod monitor;
/// Per-message reassembly buffers.
pub mod reassembly;
/// Length-prefixed framing over TCP.
pub mod stream;

pub use channel::Channel;
pub use dgram::{FlowControl, IncomingEvents, MessageId, OutgoingEvents};
pub use fragment::{Fragment, FRAGMENT_HEADER_SIZE};
pub use monitor::MessageMonitor;
pub use stream::{StreamFlow, StreamFlowError, STREAM_HEADER_SIZE};
