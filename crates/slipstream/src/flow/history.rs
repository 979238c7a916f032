// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Bounded per-channel send history.
//!
//! The sender keeps the last [`SEND_HISTORY_LIMIT`] messages of every
//! channel so a receiver can ask for lost fragments. FIFO eviction; a
//! message id is stored at most once.

use std::collections::VecDeque;

use crate::config::SEND_HISTORY_LIMIT;
use crate::flow::dgram::MessageId;

/// One retained outgoing message.
#[derive(Debug)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// Ring of recently sent messages for a single channel.
#[derive(Debug, Default)]
pub struct SendHistory {
    ring: VecDeque<HistoryEntry>,
}

impl SendHistory {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(SEND_HISTORY_LIMIT as usize),
        }
    }

    /// Retain `payload` under `id`, evicting the oldest entry once the ring
    /// holds more than [`SEND_HISTORY_LIMIT`] messages. Re-storing an id
    /// already present is a no-op (retransmissions must not duplicate).
    pub fn store(&mut self, id: MessageId, payload: &[u8]) {
        if self.ring.iter().any(|e| e.id == id) {
            return;
        }
        self.ring.push_back(HistoryEntry {
            id,
            payload: payload.to_vec(),
        });
        if self.ring.len() > SEND_HISTORY_LIMIT as usize {
            if let Some(evicted) = self.ring.pop_front() {
                log::trace!("[SendHistory] evicted message {}", evicted.id);
            }
        }
    }

    /// Look up a retained message.
    pub fn get(&self, id: MessageId) -> Option<&[u8]> {
        self.ring
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.payload.as_slice())
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Drop everything (protocol upgrade / session teardown).
    pub fn clear(&mut self) {
        self.ring.clear();
    }
}
