// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! MTU adaptation from loss statistics.
//!
//! The sender buckets outgoing and lost messages by size class. Once per
//! interval, if enough distinct messages were lost, the monitor walks the
//! buckets in ascending size order looking for the turning point: the first
//! bucket whose loss percentage jumps more than `decision_threshold` points
//! above the minimum seen so far. The bucket below the turning point becomes
//! the new maximum fragment size. Adaptation only ever shrinks the MTU;
//! growth would require path probing the protocol does not do.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::config::{
    MONITOR_DECISION_THRESHOLD, MONITOR_INTERVAL_SECS, MONITOR_LOST_THRESHOLD, UDP_MSS_SIZE,
};
use crate::flow::dgram::MessageId;

/// Message size classes, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Bucket {
    UpToMinSize = 0, // <= 508 bytes, the minimal agreed datagram
    UpTo1K = 1,
    UpTo4K = 2,
    UpTo8K = 3,
    UpTo16K = 4,
    UpTo32K = 5,
    UpTo64K = 6,
    Over64K = 7,
}

const BUCKET_COUNT: usize = 8;

fn kb(v: usize) -> usize {
    v << 10
}

fn size_to_bucket(message_size: usize) -> Bucket {
    if message_size <= UDP_MSS_SIZE {
        Bucket::UpToMinSize
    } else if message_size <= kb(1) {
        Bucket::UpTo1K
    } else if message_size <= kb(4) {
        Bucket::UpTo4K
    } else if message_size <= kb(8) {
        Bucket::UpTo8K
    } else if message_size <= kb(16) {
        Bucket::UpTo16K
    } else if message_size <= kb(32) {
        Bucket::UpTo32K
    } else if message_size <= kb(64) {
        Bucket::UpTo64K
    } else {
        Bucket::Over64K
    }
}

// Largest message size the bucket covers - what the MTU becomes when the
// bucket sits just below the turning point.
fn bucket_upper_bound(bucket: usize) -> usize {
    match bucket {
        0 => UDP_MSS_SIZE,
        1 => kb(1),
        2 => kb(4),
        3 => kb(8),
        4 => kb(16),
        5 => kb(32),
        _ => kb(64),
    }
}

/// Sender-side loss statistics and MTU decisions.
#[derive(Debug)]
pub struct MessageMonitor {
    sent: [usize; BUCKET_COUNT],
    lost: [usize; BUCKET_COUNT],
    lost_ids: HashSet<MessageId>,
    window_start: Instant,
    interval: Duration,
    lost_threshold: usize,
    decision_threshold: f64,
}

impl Default for MessageMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageMonitor {
    pub fn new() -> Self {
        Self {
            sent: [0; BUCKET_COUNT],
            lost: [0; BUCKET_COUNT],
            lost_ids: HashSet::new(),
            window_start: Instant::now(),
            interval: Duration::from_secs(MONITOR_INTERVAL_SECS),
            lost_threshold: MONITOR_LOST_THRESHOLD,
            decision_threshold: MONITOR_DECISION_THRESHOLD,
        }
    }

    /// Seconds between evaluations.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Minimum distinct lost messages before an evaluation runs.
    pub fn set_lost_threshold(&mut self, threshold: usize) {
        self.lost_threshold = threshold;
    }

    /// Percentage-point jump that marks the turning point.
    pub fn set_decision_threshold(&mut self, threshold: f64) {
        self.decision_threshold = threshold;
    }

    /// Account one sent message.
    pub fn add_sent(&mut self, message_size: usize) {
        self.sent[size_to_bucket(message_size) as usize] += 1;
    }

    /// Account one lost message, deduplicated by id (several missing
    /// fragments of one message count once).
    pub fn add_lost(&mut self, message_size: usize, message_id: MessageId) {
        if self.lost_ids.insert(message_id) {
            self.lost[size_to_bucket(message_size) as usize] += 1;
        }
    }

    /// Distinct messages lost in the current window.
    pub fn lost_message_count(&self) -> usize {
        self.lost_ids.len()
    }

    /// Run an evaluation if the interval elapsed and enough loss accrued.
    ///
    /// Returns `Some(new_mtu)` only when the statistics call for a smaller
    /// fragment size than `current_mtu`; the window restarts either way once
    /// an evaluation ran.
    pub fn process_when_time(&mut self, current_mtu: usize) -> Option<usize> {
        if self.window_start.elapsed() < self.interval
            || self.lost_message_count() < self.lost_threshold
        {
            return None;
        }
        let decision = self.process(current_mtu);
        self.window_start = Instant::now();
        self.reset();
        decision
    }

    /// Evaluate the current window against `current_mtu` without resetting.
    ///
    /// Never returns a value larger than `current_mtu`.
    pub fn process(&self, current_mtu: usize) -> Option<usize> {
        if current_mtu <= UDP_MSS_SIZE {
            // Already at the floor; nothing below to shrink to
            return None;
        }

        let mut lost_pct = [0.0f64; BUCKET_COUNT];
        for bucket in 0..BUCKET_COUNT {
            if self.sent[bucket] > 0 {
                lost_pct[bucket] = self.lost[bucket] as f64 / self.sent[bucket] as f64 * 100.0;
            }
        }

        let mut min_so_far = 100.0f64;
        for bucket in 0..BUCKET_COUNT {
            let pct = lost_pct[bucket];
            if pct > min_so_far + self.decision_threshold {
                let new_mtu = bucket_upper_bound(bucket.saturating_sub(1));
                log::info!(
                    "[MsgMonitor] turning point at bucket {} ({:.1}% lost, min {:.1}%), max fragment size {} -> {}",
                    bucket,
                    pct,
                    min_so_far,
                    current_mtu,
                    new_mtu
                );
                return (new_mtu < current_mtu).then_some(new_mtu);
            }
            if pct < min_so_far {
                min_so_far = pct;
            }
        }
        None
    }

    fn reset(&mut self) {
        self.sent = [0; BUCKET_COUNT];
        self.lost = [0; BUCKET_COUNT];
        self.lost_ids.clear();
    }
}
