// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Retransmission-request manifest.
//!
//! When the receiver detects missing messages or fragments it sends the
//! sender a manifest of wanted byte ranges on channel `SYSTEM`. The
//! manifest is self-describing and may itself span several datagrams, in
//! which case it travels through the ordinary fragmentation path and the
//! sender reassembles it before acting.
//!
//! Wire layout, little-endian (fixed byte order since protocol version 4;
//! version 3 copied host memory):
//!
//! ```text
//! u64  total_size          size of the encoded manifest, self included
//! u8   version             protocol version that produced the manifest
//! u8   reserved            transmitter code, currently zero
//! u8   n_channels
//!   { u8  channel_id
//!     u32 n_messages
//!       { u16 message_id
//!         u32 n_chunks
//!           { u64 offset, u64 size } * n_chunks
//!       } * n_messages
//!   } * n_channels
//! ```
//!
//! A chunk of `(0, 0)` requests the entire message.

use std::collections::BTreeMap;

use crate::config::PROTOCOL_VERSION_CURRENT;
use crate::flow::dgram::MessageId;
use crate::flow::reassembly::Chunk;

/// Missing-range manifest: channel -> message -> wanted chunks.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChunkManifest {
    channels: BTreeMap<u8, BTreeMap<MessageId, Vec<Chunk>>>,
}

impl ChunkManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one wanted chunk.
    pub fn add_chunk(&mut self, channel_id: u8, message_id: MessageId, chunk: Chunk) {
        self.channels
            .entry(channel_id)
            .or_default()
            .entry(message_id)
            .or_default()
            .push(chunk);
    }

    /// Record a set of wanted chunks for one message.
    pub fn add_chunks(&mut self, channel_id: u8, message_id: MessageId, chunks: Vec<Chunk>) {
        self.channels
            .entry(channel_id)
            .or_default()
            .entry(message_id)
            .or_default()
            .extend(chunks);
    }

    /// True when at least one chunk has been recorded.
    pub fn has_chunks(&self) -> bool {
        self.channels
            .values()
            .flat_map(|m| m.values())
            .any(|chunks| !chunks.is_empty())
    }

    /// Iterate `(channel, message, chunks)` in wire order.
    pub fn entries(&self) -> impl Iterator<Item = (u8, MessageId, &[Chunk])> {
        self.channels.iter().flat_map(|(&ch, messages)| {
            messages
                .iter()
                .map(move |(&id, chunks)| (ch, id, chunks.as_slice()))
        })
    }

    /// Encoded size of the manifest in bytes.
    pub fn encoded_size(&self) -> usize {
        let mut size = 8 + 1 + 1 + 1; // total_size + version + reserved + n_channels
        for messages in self.channels.values() {
            size += 1 + 4; // channel_id + n_messages
            for chunks in messages.values() {
                size += 2 + 4; // message_id + n_chunks
                size += chunks.len() * 16; // offset + size per chunk
            }
        }
        size
    }

    /// Serialize into the little-endian wire form.
    pub fn pack(&self) -> Vec<u8> {
        let total = self.encoded_size();
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&(total as u64).to_le_bytes());
        buf.push(PROTOCOL_VERSION_CURRENT as u8);
        buf.push(0); // reserved
        buf.push(self.channels.len() as u8);
        for (&channel_id, messages) in &self.channels {
            buf.push(channel_id);
            buf.extend_from_slice(&(messages.len() as u32).to_le_bytes());
            for (&message_id, chunks) in messages {
                buf.extend_from_slice(&message_id.to_le_bytes());
                buf.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
                for chunk in chunks {
                    buf.extend_from_slice(&chunk.offset.to_le_bytes());
                    buf.extend_from_slice(&chunk.size.to_le_bytes());
                }
            }
        }
        debug_assert_eq!(buf.len(), total);
        buf
    }

    /// Decode a received manifest. Returns `None` on any structural
    /// inconsistency - a malformed repair request is dropped, never acted on.
    pub fn unpack(buf: &[u8]) -> Option<Self> {
        let mut reader = Reader::new(buf);
        let total_size = reader.u64()?;
        if total_size as usize != buf.len() {
            log::debug!(
                "[Manifest] declared size {} != buffer {}, dropped",
                total_size,
                buf.len()
            );
            return None;
        }
        let _version = reader.u8()?;
        let _reserved = reader.u8()?;
        let n_channels = reader.u8()?;

        let mut manifest = ChunkManifest::new();
        for _ in 0..n_channels {
            let channel_id = reader.u8()?;
            let n_messages = reader.u32()?;
            for _ in 0..n_messages {
                let message_id = reader.u16()?;
                let n_chunks = reader.u32()?;
                for _ in 0..n_chunks {
                    let offset = reader.u64()?;
                    let size = reader.u64()?;
                    manifest.add_chunk(channel_id, message_id, Chunk::new(offset, size));
                }
            }
        }
        Some(manifest)
    }
}

// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2)
            .map(|s| u16::from_le_bytes(s.try_into().expect("length checked")))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_le_bytes(s.try_into().expect("length checked")))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)
            .map(|s| u64::from_le_bytes(s.try_into().expect("length checked")))
    }
}
