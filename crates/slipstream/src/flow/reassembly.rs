// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Per-message reassembly buffers.
//!
//! One [`ReassemblyBuffer`] exists per in-flight incoming message. Fragments
//! may arrive in any order; each is written at its absolute offset and the
//! ordered chunk ledger records which byte ranges have landed so the missing
//! ranges can be computed for a retransmission request.

use std::time::Instant;

use crate::net::addr::Address;

/// A contiguous byte range `[offset, offset + size)` within a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub size: u64,
}

impl Chunk {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// The `(0, 0)` chunk meaning "the whole message is missing".
    pub fn whole_message() -> Self {
        Self { offset: 0, size: 0 }
    }

    /// True for the whole-message marker.
    pub fn is_whole_message(&self) -> bool {
        self.offset == 0 && self.size == 0
    }
}

/// Accumulates the fragments of one incoming logical message.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: Vec<u8>,
    bytes_remaining: usize,
    last_updated: Instant,
    received_from: Address,
    channel_id: u8,
    // Ordered by offset; cleared once the message completes
    chunks: Vec<Chunk>,
}

impl ReassemblyBuffer {
    /// Allocate a buffer for a `size`-byte message from `received_from`.
    pub fn new(size: usize, received_from: Address, channel_id: u8) -> Self {
        Self {
            buf: vec![0u8; size],
            bytes_remaining: size,
            last_updated: Instant::now(),
            received_from,
            channel_id,
            chunks: Vec::new(),
        }
    }

    /// Peer the fragments came from.
    pub fn peer_address(&self) -> &Address {
        &self.received_from
    }

    /// Message bytes (only meaningful once complete).
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Declared size of the message.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes not yet received. Zero means complete.
    pub fn bytes_remaining(&self) -> usize {
        self.bytes_remaining
    }

    /// Channel the message belongs to.
    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// When the last fragment landed.
    pub fn last_update(&self) -> Instant {
        self.last_updated
    }

    /// True once every byte has been received.
    pub fn is_complete(&self) -> bool {
        self.bytes_remaining == 0
    }

    /// Write a fragment at its absolute offset; returns true when this
    /// fragment completed the message.
    ///
    /// Duplicate fragments are detected through the chunk ledger and do not
    /// corrupt the remaining-byte count.
    pub fn add_fragment(&mut self, offset: usize, bytes: &[u8]) -> bool {
        if offset + bytes.len() > self.buf.len() {
            log::debug!(
                "[Reassembly] fragment [{}, {}) exceeds message size {}, dropped",
                offset,
                offset + bytes.len(),
                self.buf.len()
            );
            return self.is_complete();
        }
        if self.overlaps_received(offset as u64, bytes.len() as u64) {
            // Retransmitted duplicate; the bytes are identical, only refresh
            // the clock so the flush timer sees activity.
            self.last_updated = Instant::now();
            return self.is_complete();
        }

        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.last_updated = Instant::now();
        self.bytes_remaining = self.bytes_remaining.saturating_sub(bytes.len());

        if self.is_complete() {
            self.chunks.clear();
        } else {
            self.insert_chunk(Chunk::new(offset as u64, bytes.len() as u64));
        }
        self.is_complete()
    }

    /// Fill a range without chunk accounting - used for outgoing-history
    /// buffers that are written exactly once, in full.
    pub fn add_buffer(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.last_updated = Instant::now();
        self.bytes_remaining = self.bytes_remaining.saturating_sub(bytes.len());
    }

    /// Compute the byte ranges that have not arrived yet.
    ///
    /// Walks the ordered chunk ledger collecting the holes between received
    /// ranges, including the hole before the first chunk and the tail after
    /// the last one.
    pub fn missing_chunks(&self) -> Vec<Chunk> {
        let mut missing = Vec::new();
        let mut cursor: u64 = 0;
        for chunk in &self.chunks {
            if cursor < chunk.offset {
                missing.push(Chunk::new(cursor, chunk.offset - cursor));
            }
            cursor = chunk.offset + chunk.size;
        }
        let total = self.buf.len() as u64;
        if !self.chunks.is_empty() && cursor < total {
            missing.push(Chunk::new(cursor, total - cursor));
        }
        missing
    }

    fn overlaps_received(&self, offset: u64, size: u64) -> bool {
        self.chunks
            .iter()
            .any(|c| offset < c.offset + c.size && c.offset < offset + size)
    }

    // Keep the ledger sorted by offset and coalesce neighbours so it stays
    // small for high-fragment-count messages.
    fn insert_chunk(&mut self, chunk: Chunk) {
        let pos = self
            .chunks
            .iter()
            .position(|c| c.offset > chunk.offset)
            .unwrap_or(self.chunks.len());
        self.chunks.insert(pos, chunk);

        let mut merged: Vec<Chunk> = Vec::with_capacity(self.chunks.len());
        for c in &self.chunks {
            match merged.last_mut() {
                Some(prev) if prev.offset + prev.size == c.offset => prev.size += c.size,
                _ => merged.push(*c),
            }
        }
        self.chunks = merged;
    }
}
