// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Fragment wire format.
//!
//! Every datagram carries exactly one fragment: a 15-byte header followed
//! by `fragment_size` payload bytes. Integers are big-endian on the wire.
//!
//! ```text
//! +------------+--------------+-----------------+---------------+------------+---------+
//! | message_id | message_size | fragment_offset | fragment_size | channel_id | payload |
//! |   u16 BE   |    u32 BE    |     u32 BE      |    u32 BE     |     u8     |  bytes  |
//! +------------+--------------+-----------------+---------------+------------+---------+
//! ```
//!
//! Invariants: `fragment_offset + fragment_size <= message_size` and the
//! datagram length equals `15 + fragment_size`.

use crate::flow::dgram::MessageId;

/// Size of the fragment header on the wire.
pub const FRAGMENT_HEADER_SIZE: usize = 15;

/// Why a datagram failed to parse as a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentParseError {
    /// Empty input.
    InvalidArg,
    /// Length does not match `header + fragment_size`, or the fragment
    /// range overflows the declared message size.
    IncompleteFragment,
}

/// One datagram-sized slice of a logical message, header included.
///
/// Owns its bytes in the exact wire layout, so sending is a single
/// `send_to(fragment.wire_bytes())`.
#[derive(Debug, Clone)]
pub struct Fragment {
    buf: Vec<u8>,
}

impl Fragment {
    /// Build a fragment for `message[fragment_offset..fragment_offset + fragment_size]`.
    pub fn new(
        message_id: MessageId,
        message: &[u8],
        message_size: u32,
        fragment_offset: u32,
        fragment_size: u32,
        channel_id: u8,
    ) -> Self {
        debug_assert!(u64::from(fragment_offset) + u64::from(fragment_size) <= u64::from(message_size));
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + fragment_size as usize);
        buf.extend_from_slice(&message_id.to_be_bytes());
        buf.extend_from_slice(&message_size.to_be_bytes());
        buf.extend_from_slice(&fragment_offset.to_be_bytes());
        buf.extend_from_slice(&fragment_size.to_be_bytes());
        buf.push(channel_id);
        let start = fragment_offset as usize;
        buf.extend_from_slice(&message[start..start + fragment_size as usize]);
        Self { buf }
    }

    /// Parse a received datagram.
    ///
    /// Rejects datagrams no longer than the bare header and datagrams whose
    /// length disagrees with the declared fragment size - a truncated
    /// datagram must never corrupt a reassembly buffer.
    pub fn parse(datagram: &[u8]) -> Result<Self, FragmentParseError> {
        if datagram.is_empty() {
            return Err(FragmentParseError::InvalidArg);
        }
        if datagram.len() <= FRAGMENT_HEADER_SIZE {
            return Err(FragmentParseError::IncompleteFragment);
        }
        let fragment_size = u32::from_be_bytes(
            datagram[10..14]
                .try_into()
                .expect("slice length checked above"),
        );
        if fragment_size as usize + FRAGMENT_HEADER_SIZE != datagram.len() {
            return Err(FragmentParseError::IncompleteFragment);
        }
        let parsed = Self {
            buf: datagram.to_vec(),
        };
        if u64::from(parsed.fragment_offset()) + u64::from(fragment_size)
            > u64::from(parsed.message_size())
        {
            return Err(FragmentParseError::IncompleteFragment);
        }
        Ok(parsed)
    }

    /// Message this fragment belongs to.
    pub fn message_id(&self) -> MessageId {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    /// Total size of the logical message.
    pub fn message_size(&self) -> u32 {
        u32::from_be_bytes(self.buf[2..6].try_into().expect("header present"))
    }

    /// Byte offset of this fragment within the message.
    pub fn fragment_offset(&self) -> u32 {
        u32::from_be_bytes(self.buf[6..10].try_into().expect("header present"))
    }

    /// Payload bytes carried by this fragment.
    pub fn fragment_size(&self) -> u32 {
        u32::from_be_bytes(self.buf[10..14].try_into().expect("header present"))
    }

    /// Logical channel of the message.
    pub fn channel_id(&self) -> u8 {
        self.buf[14]
    }

    /// Payload slice (header stripped).
    pub fn payload(&self) -> &[u8] {
        &self.buf[FRAGMENT_HEADER_SIZE..]
    }

    /// Full wire form, ready for `send_to`.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.buf
    }
}
