// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Datagram flow-control engine.
//!
//! Sits between the application's logical messages and the unreliable
//! datagram socket. On the way out it fragments messages, retains a bounded
//! history per channel and feeds the MTU monitor. On the way in it
//! reassembles fragments per channel, detects id gaps, requests
//! retransmission of missing messages and byte ranges over the reserved
//! `SYSTEM` channel, and delivers completed messages in per-channel id
//! order. A complete message blocked behind a hole for longer than
//! [`MSG_FLUSH_TIMEOUT`] is promoted past it so one lost packet cannot
//! stall a channel forever.
//!
//! # Locking
//!
//! Two locks per instance: `tx` serializes the send path (id assignment,
//! history, monitor), `rx` serializes reassembly state. The repair path
//! acquires `rx` then `tx` (a repair request arrives on the receive side
//! and resends through the send side); no path acquires them in the other
//! order. Callbacks run under the respective lock; a delivery callback may
//! call [`FlowControl::send`] (that is the sanctioned `rx` -> `tx` nesting)
//! but must never feed fragments back into the same instance.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{
    CHANNEL_COUNT, MAX_DATAGRAM_SIZE, MSG_FLUSH_TIMEOUT, PROTOCOL_VERSION_UNSUPPORTED,
    SEND_HISTORY_LIMIT,
};
use crate::flow::channel::Channel;
use crate::flow::fragment::{Fragment, FragmentParseError, FRAGMENT_HEADER_SIZE};
use crate::flow::history::SendHistory;
use crate::flow::manifest::ChunkManifest;
use crate::flow::monitor::MessageMonitor;
use crate::flow::reassembly::{Chunk, ReassemblyBuffer};
use crate::net::addr::Address;
use crate::net::socket::SocketResult;

/// Per-(sender, channel) message identifier; wraps at 2^16.
pub type MessageId = u16;

/// Outcome of feeding a datagram into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    /// Empty datagram.
    InvalidArg,
    /// Datagram length disagrees with its header.
    IncompleteFragment,
    /// Channel id outside the known range.
    UnknownChannel(u8),
}

/// Receive-side events raised by the engine.
pub trait IncomingEvents {
    /// A logical message completed and is being delivered in channel order.
    fn on_complete_message(
        &mut self,
        msg_id: MessageId,
        channel_id: u8,
        payload: &[u8],
        from: &Address,
    );

    /// A repair-request fragment (channel `SYSTEM`) must reach the peer.
    fn on_request_fragment(&mut self, fragment: &Fragment) -> SocketResult<()>;
}

/// Send-side events raised by the engine.
pub trait OutgoingEvents {
    /// One wire-ready fragment; `more` is true while fragments of the same
    /// message are still coming.
    fn on_fragment_ready(&mut self, fragment: &Fragment, more: bool) -> SocketResult<()>;

    /// The MTU monitor decided on a smaller maximum fragment size.
    fn on_set_max_fragment_size(&mut self, size: usize);
}

// ============================================================================
// Per-channel state
// ============================================================================

#[derive(Default)]
struct ChannelRx {
    /// In-flight incoming messages, keyed by id.
    incoming: std::collections::BTreeMap<MessageId, ReassemblyBuffer>,
    /// Last id delivered to the application.
    last_delivered: MessageId,
    /// Ids requested for retransmission; value = "received since".
    requested: std::collections::BTreeMap<MessageId, bool>,
    /// Set until the first fragment seeds `last_delivered`.
    first_message: bool,
}

struct ChannelTx {
    next_id: MessageId,
    history: SendHistory,
}

impl Default for ChannelTx {
    fn default() -> Self {
        Self {
            next_id: 1,
            history: SendHistory::new(),
        }
    }
}

// Reassembly of an inbound repair manifest that arrived in several
// fragments. Manifests are processed one at a time; a different id resets
// the slot.
#[derive(Default)]
struct ManifestAssembly {
    id: MessageId,
    buf: Vec<u8>,
    size_so_far: usize,
}

impl ManifestAssembly {
    fn reset(&mut self) {
        self.id = 0;
        self.buf.clear();
        self.size_so_far = 0;
    }

    fn is_complete(&self) -> bool {
        !self.buf.is_empty() && self.size_so_far == self.buf.len()
    }
}

struct RxState {
    channels: Vec<ChannelRx>,
    manifest_asm: ManifestAssembly,
}

struct TxState {
    channels: Vec<ChannelTx>,
    monitor: MessageMonitor,
}

// ============================================================================
// Engine
// ============================================================================

/// One flow-control instance per peer direction pair.
pub struct FlowControl {
    version: AtomicU32,
    profile: AtomicBool,
    max_fragment_size: AtomicUsize,
    repair_seq: AtomicU16,
    rx: Mutex<RxState>,
    tx: Mutex<TxState>,
}

impl FlowControl {
    /// Create an engine speaking `version` with the default MTU.
    pub fn new(version: u32) -> Self {
        let mut rx_channels = Vec::with_capacity(CHANNEL_COUNT);
        let mut tx_channels = Vec::with_capacity(CHANNEL_COUNT);
        for _ in 0..CHANNEL_COUNT {
            rx_channels.push(ChannelRx {
                first_message: true,
                ..ChannelRx::default()
            });
            tx_channels.push(ChannelTx::default());
        }
        Self {
            version: AtomicU32::new(version),
            profile: AtomicBool::new(false),
            max_fragment_size: AtomicUsize::new(MAX_DATAGRAM_SIZE),
            repair_seq: AtomicU16::new(1),
            rx: Mutex::new(RxState {
                channels: rx_channels,
                manifest_asm: ManifestAssembly::default(),
            }),
            tx: Mutex::new(TxState {
                channels: tx_channels,
                monitor: MessageMonitor::new(),
            }),
        }
    }

    /// Active protocol version.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Current maximum fragment size (header included).
    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size.load(Ordering::Relaxed)
    }

    /// Set the maximum fragment size (negotiated datagram size).
    pub fn set_max_fragment_size(&self, size: usize) {
        let clamped = size.clamp(FRAGMENT_HEADER_SIZE + 1, MAX_DATAGRAM_SIZE);
        self.max_fragment_size.store(clamped, Ordering::Relaxed);
    }

    /// Stale-drop bypass used by test instrumentation only.
    #[doc(hidden)]
    pub fn set_profile_mode(&self, enabled: bool) {
        self.profile.store(enabled, Ordering::Relaxed);
    }

    /// Negotiated version for the given local/remote ranges, or
    /// [`PROTOCOL_VERSION_UNSUPPORTED`] when the ranges do not overlap.
    pub fn max_supported_version(
        min_local: u32,
        max_local: u32,
        min_remote: u32,
        max_remote: u32,
    ) -> u32 {
        if min_local > max_remote || max_local < min_remote {
            return PROTOCOL_VERSION_UNSUPPORTED;
        }
        max_local.min(max_remote)
    }

    /// Adopt the version negotiated in the handshake.
    ///
    /// Re-arms the first-message seeding on every channel, clears in-flight
    /// reassembly and waiting maps, and makes sure every channel's next
    /// outgoing id is at least 1.
    pub fn upgrade_protocol(&self, version: u32) {
        if version == self.version.load(Ordering::Relaxed) {
            return;
        }
        log::debug!(
            "[FlowCtrl] protocol upgrade {} -> {}",
            self.version.load(Ordering::Relaxed),
            version
        );
        self.version.store(version, Ordering::Relaxed);

        let mut rx = self.rx.lock();
        for channel in &mut rx.channels {
            channel.incoming.clear();
            channel.requested.clear();
            channel.first_message = true;
            channel.last_delivered = 0;
        }
        rx.manifest_asm.reset();
        drop(rx);

        let mut tx = self.tx.lock();
        for channel in &mut tx.channels {
            if channel.next_id == 0 {
                channel.next_id = 1;
            }
        }
    }

    /// Tune the MTU monitor's evaluation interval.
    pub fn set_monitor_interval(&self, interval: std::time::Duration) {
        self.tx.lock().monitor.set_interval(interval);
    }

    /// Tune the MTU monitor's lost-message threshold.
    pub fn set_monitor_lost_threshold(&self, threshold: usize) {
        self.tx.lock().monitor.set_lost_threshold(threshold);
    }

    /// Tune the MTU monitor's turning-point threshold.
    pub fn set_monitor_decision_threshold(&self, threshold: f64) {
        self.tx.lock().monitor.set_decision_threshold(threshold);
    }

    // ------------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------------

    /// Fragment `payload` onto `channel` and emit each fragment through
    /// `events`. Returns the payload bytes handed to the callback.
    pub fn send(
        &self,
        payload: &[u8],
        channel: Channel,
        events: &mut dyn OutgoingEvents,
    ) -> SocketResult<u32> {
        let ch = channel.id() as usize;
        if ch >= CHANNEL_COUNT {
            log::error!(
                "[FlowCtrl] cannot send on reserved channel {}",
                channel.id()
            );
            return Err(crate::net::socket::SocketError::UnknownError);
        }

        let mut tx = self.tx.lock();
        let max_fragment_size = self.max_fragment_size.load(Ordering::Relaxed);
        let message_id = tx.channels[ch].next_id;
        tx.channels[ch].next_id = tx.channels[ch].next_id.wrapping_add(1);
        tx.channels[ch].history.store(message_id, payload);

        let message_size = payload.len() as u32;
        let body_limit = (max_fragment_size - FRAGMENT_HEADER_SIZE) as u32;
        let mut bytes_sent = 0u32;
        let mut remaining = message_size;
        let mut result = Ok(());

        while remaining > 0 {
            let fragment_size = remaining.min(body_limit);
            let offset = message_size - remaining;
            let fragment = Fragment::new(
                message_id,
                payload,
                message_size,
                offset,
                fragment_size,
                channel.id(),
            );
            remaining -= fragment_size;

            #[cfg(feature = "trace")]
            log::trace!(
                "[FlowCtrl] ===> ch={} id={} ofs={} size={}/{}",
                channel.id(),
                message_id,
                offset,
                fragment_size,
                message_size
            );

            if let Err(e) = events.on_fragment_ready(&fragment, remaining != 0) {
                log::debug!("[FlowCtrl] fragment emit failed: {}", e);
                result = Err(e);
                break;
            }
            bytes_sent += fragment_size;
        }

        tx.monitor.add_sent(message_size as usize);
        if let Some(new_mtu) = tx.monitor.process_when_time(max_fragment_size) {
            self.max_fragment_size.store(new_mtu, Ordering::Relaxed);
            events.on_set_max_fragment_size(new_mtu);
            log::info!(
                "[FlowCtrl] max fragment size reduced {} -> {}",
                max_fragment_size,
                new_mtu
            );
        }

        result.map(|()| bytes_sent)
    }

    // Resend `message[offset .. offset+chunk_size)` from the stored history,
    // fragment headers still describing the full message.
    fn fragment_stored_message(
        message: &[u8],
        message_id: MessageId,
        offset: u64,
        chunk_size: u64,
        max_fragment_size: usize,
        channel_id: u8,
        events: &mut dyn OutgoingEvents,
    ) -> SocketResult<()> {
        let message_size = message.len() as u32;
        let body_limit = (max_fragment_size - FRAGMENT_HEADER_SIZE) as u64;
        let mut cursor = offset;
        let end = (offset + chunk_size).min(message.len() as u64);
        while cursor < end {
            let fragment_size = (end - cursor).min(body_limit) as u32;
            let fragment = Fragment::new(
                message_id,
                message,
                message_size,
                cursor as u32,
                fragment_size,
                channel_id,
            );
            cursor += u64::from(fragment_size);
            events.on_fragment_ready(&fragment, cursor < end)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    /// Feed one received datagram into the engine.
    ///
    /// `outgoing` is needed by senders so inbound repair requests can be
    /// answered; pure receivers may pass `None`.
    pub fn process_fragment(
        &self,
        datagram: &[u8],
        from: &Address,
        incoming: &mut dyn IncomingEvents,
        outgoing: Option<&mut dyn OutgoingEvents>,
    ) -> Result<(), FlowError> {
        let fragment = Fragment::parse(datagram).map_err(|e| match e {
            FragmentParseError::InvalidArg => FlowError::InvalidArg,
            FragmentParseError::IncompleteFragment => FlowError::IncompleteFragment,
        })?;

        let channel_id = fragment.channel_id();
        if channel_id == Channel::System.id() {
            return self.process_repair_request(&fragment, outgoing);
        }
        let ch = channel_id as usize;
        if ch >= CHANNEL_COUNT {
            log::debug!("[FlowCtrl] unknown channel {}, datagram dropped", channel_id);
            return Err(FlowError::UnknownChannel(channel_id));
        }

        let message_id = fragment.message_id();
        let message_size = fragment.message_size() as usize;
        let profile = self.profile.load(Ordering::Relaxed);
        let mut deliverable = false;

        {
            let mut rx = self.rx.lock();
            let state = &mut rx.channels[ch];

            if state.first_message {
                // Seed the delivery cursor so the very first message is
                // never dropped as stale, whatever id the peer starts at.
                state.last_delivered = message_id.wrapping_sub(1);
                state.first_message = false;
            }

            let distance = calc_distance(state.last_delivered, message_id);
            if distance > 0 || profile {
                let buffer = state.incoming.entry(message_id).or_insert_with(|| {
                    ReassemblyBuffer::new(message_size, from.clone(), channel_id)
                });
                if buffer.size() != message_size {
                    // Stale leftover from an id wrap collision; start over
                    *buffer =
                        ReassemblyBuffer::new(message_size, from.clone(), channel_id);
                }
                deliverable = buffer.add_fragment(
                    fragment.fragment_offset() as usize,
                    fragment.payload(),
                );

                if (distance > 1 && distance < 0x7FFF) || waiting_for_requests(state) {
                    deliverable = self.request_missing_messages(
                        state,
                        channel_id,
                        message_id,
                        deliverable,
                        incoming,
                    );
                }
            } else {
                log::debug!(
                    "[FlowCtrl] stale message dropped ch={} id={} last={} dist={}",
                    channel_id,
                    message_id,
                    state.last_delivered,
                    distance
                );
            }
        }

        if deliverable {
            let mut any = false;
            while self.promote_message(incoming, ch) {
                any = true;
            }
            if !any {
                self.tick_notify_channel(incoming, ch);
            }
        }

        Ok(())
    }

    /// Deliver complete messages and flush timed-out holes on every channel.
    ///
    /// Must run at least every `MSG_FLUSH_TIMEOUT / 2` even when no traffic
    /// arrives, so recovery proceeds through quiet periods.
    pub fn tick_notify(&self, incoming: &mut dyn IncomingEvents) -> bool {
        let mut any = false;
        for ch in 0..CHANNEL_COUNT {
            any |= self.tick_notify_channel(incoming, ch);
        }
        any
    }

    /// Single-channel flush pass; returns false when the channel is idle.
    pub fn tick_notify_channel(&self, incoming: &mut dyn IncomingEvents, ch: usize) -> bool {
        let now = Instant::now();
        {
            let mut rx = self.rx.lock();
            let state = &mut rx.channels[ch];
            if state.incoming.is_empty() {
                return false;
            }

            // Oldest complete message closest (by id) to the delivery cursor
            let mut best: Option<(MessageId, std::time::Duration)> = None;
            let mut best_distance = i32::from(u16::MAX) + 1;
            for (&id, buffer) in &state.incoming {
                if !buffer.is_complete() {
                    continue;
                }
                let distance = calc_distance(state.last_delivered, id);
                if distance >= 0 && distance < best_distance {
                    best_distance = distance;
                    best = Some((id, now.duration_since(buffer.last_update())));
                }
            }

            if let Some((id, waited)) = best {
                if waited >= MSG_FLUSH_TIMEOUT && best_distance > 1 {
                    log::info!(
                        "[FlowCtrl] flush: promoting past gap ch={} last={} -> {} waited={:?}",
                        ch,
                        state.last_delivered,
                        id,
                        waited
                    );
                    state.last_delivered = id.wrapping_sub(1);
                }
            }
        }

        while self.promote_message(incoming, ch) {}
        self.purge_stale_buffers(ch);
        true
    }

    // Deliver the message at the cursor, advancing it; in profile mode any
    // complete message goes out in map order. Returns true when something
    // was delivered.
    fn promote_message(&self, incoming: &mut dyn IncomingEvents, ch: usize) -> bool {
        let mut rx = self.rx.lock();
        let state = &mut rx.channels[ch];
        let profile = self.profile.load(Ordering::Relaxed);

        let next = state.last_delivered.wrapping_add(1);
        let candidate = if profile {
            state
                .incoming
                .iter()
                .find(|(_, b)| b.is_complete())
                .map(|(&id, _)| id)
        } else {
            state
                .incoming
                .get(&next)
                .filter(|b| b.is_complete())
                .map(|_| next)
        };

        let Some(id) = candidate else {
            return false;
        };
        let buffer = state.incoming.remove(&id).expect("candidate looked up above");
        state.last_delivered = id;
        if let Some(received) = state.requested.get_mut(&id) {
            *received = true;
        }
        incoming.on_complete_message(id, ch as u8, buffer.data(), buffer.peer_address());
        true
    }

    // Drop reassembly buffers strictly behind the delivery cursor.
    fn purge_stale_buffers(&self, ch: usize) {
        let mut rx = self.rx.lock();
        let state = &mut rx.channels[ch];
        let last = state.last_delivered;
        state
            .incoming
            .retain(|&id, _| calc_distance(last, id) >= 0);
        // Requests behind the cursor can never be satisfied usefully
        state
            .requested
            .retain(|&id, _| calc_distance(last, id) > 0);
    }

    // ------------------------------------------------------------------------
    // Gap detection and repair requests (receiver side)
    // ------------------------------------------------------------------------

    // Handle a newly arrived id against the waiting map and any holes
    // between the cursor and `current_id`. Returns whether delivery may
    // proceed right now.
    fn request_missing_messages(
        &self,
        state: &mut ChannelRx,
        channel_id: u8,
        current_id: MessageId,
        complete: bool,
        incoming: &mut dyn IncomingEvents,
    ) -> bool {
        // A retransmission we asked for earlier
        if let Some(received) = state.requested.get_mut(&current_id) {
            if complete {
                *received = true;
            }
            let stop_waiting = !waiting_for_requests(state);
            if stop_waiting {
                state.requested.clear();
            }
            return stop_waiting;
        }

        let distance = calc_distance(state.last_delivered, current_id);
        if distance > i32::from(SEND_HISTORY_LIMIT) {
            // The sender's history no longer covers the hole; stop waiting
            // and let the flush timeout move the cursor forward.
            log::debug!(
                "[FlowCtrl] gap beyond history ch={} last={} id={} dist={}",
                channel_id,
                state.last_delivered,
                current_id,
                distance
            );
            state.requested.clear();
            return true;
        }

        let mut manifest = ChunkManifest::new();

        // Missing byte ranges of incomplete messages within history reach
        collect_missing_chunks(state, channel_id, current_id, &mut manifest);

        // Whole messages never seen between the cursor and the new id
        let mut wanted = Vec::new();
        let mut walk = state.last_delivered.wrapping_add(1);
        while walk != current_id {
            if !state.requested.contains_key(&walk) && !state.incoming.contains_key(&walk) {
                manifest.add_chunk(channel_id, walk, Chunk::whole_message());
                state.requested.insert(walk, false);
                wanted.push(walk);
            }
            walk = walk.wrapping_add(1);
        }
        if complete {
            state.requested.insert(current_id, true);
        }

        if manifest.has_chunks() {
            log::info!(
                "[FlowCtrl] requesting retransmission ch={} missing={:?} outstanding={}",
                channel_id,
                wanted,
                state.requested.len()
            );
            self.send_repair_request(&manifest, incoming);
        }

        false
    }

    // Pack the manifest and push it to the peer on channel SYSTEM,
    // fragmenting when it exceeds the current MTU.
    fn send_repair_request(&self, manifest: &ChunkManifest, incoming: &mut dyn IncomingEvents) {
        let packed = manifest.pack();
        let message_size = packed.len() as u32;
        // Not a real per-channel id; only pairs up the manifest's own
        // fragments if it has to travel in several datagrams.
        let pseudo_id = self.repair_seq.fetch_add(1, Ordering::Relaxed);
        let body_limit =
            (self.max_fragment_size.load(Ordering::Relaxed) - FRAGMENT_HEADER_SIZE) as u32;

        let mut remaining = message_size;
        while remaining > 0 {
            let fragment_size = remaining.min(body_limit);
            let offset = message_size - remaining;
            let fragment = Fragment::new(
                pseudo_id,
                &packed,
                message_size,
                offset,
                fragment_size,
                Channel::System.id(),
            );
            remaining -= fragment_size;
            if let Err(e) = incoming.on_request_fragment(&fragment) {
                log::debug!("[FlowCtrl] repair request emit failed: {}", e);
                break;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Repair handling (sender side)
    // ------------------------------------------------------------------------

    // A SYSTEM-channel fragment arrived: reassemble the manifest if needed,
    // then resend every requested range that is still in history.
    fn process_repair_request(
        &self,
        fragment: &Fragment,
        outgoing: Option<&mut dyn OutgoingEvents>,
    ) -> Result<(), FlowError> {
        let Some(events) = outgoing else {
            // Receive-only instances have nothing to resend from
            return Ok(());
        };

        let complete_manifest: Option<Vec<u8>> = {
            let mut rx = self.rx.lock();
            let asm = &mut rx.manifest_asm;

            if !asm.buf.is_empty() && asm.id != fragment.message_id() {
                asm.reset();
            }

            if fragment.fragment_size() == fragment.message_size() {
                Some(fragment.payload().to_vec())
            } else {
                if asm.buf.is_empty() {
                    asm.buf = vec![0u8; fragment.message_size() as usize];
                    asm.id = fragment.message_id();
                    asm.size_so_far = 0;
                }
                let offset = fragment.fragment_offset() as usize;
                let payload = fragment.payload();
                if offset + payload.len() <= asm.buf.len() {
                    asm.buf[offset..offset + payload.len()].copy_from_slice(payload);
                    asm.size_so_far += payload.len();
                }
                if asm.is_complete() {
                    let data = std::mem::take(&mut asm.buf);
                    asm.reset();
                    Some(data)
                } else {
                    None
                }
            }
        };

        if let Some(data) = complete_manifest {
            self.resend_from_manifest(&data, events)?;
        }
        Ok(())
    }

    fn resend_from_manifest(
        &self,
        data: &[u8],
        events: &mut dyn OutgoingEvents,
    ) -> Result<(), FlowError> {
        let Some(manifest) = ChunkManifest::unpack(data) else {
            log::debug!("[FlowCtrl] malformed repair manifest dropped");
            return Err(FlowError::IncompleteFragment);
        };

        let mut tx = self.tx.lock();
        let max_fragment_size = self.max_fragment_size.load(Ordering::Relaxed);

        for (channel_id, message_id, chunks) in manifest.entries() {
            let ch = channel_id as usize;
            if ch >= CHANNEL_COUNT {
                continue;
            }
            let Some(message) = tx.channels[ch].history.get(message_id).map(<[u8]>::to_vec)
            else {
                log::debug!(
                    "[FlowCtrl] repair for ch={} id={} no longer in history",
                    channel_id,
                    message_id
                );
                continue;
            };

            for chunk in chunks {
                let (offset, size) = if chunk.is_whole_message() {
                    (0, message.len() as u64)
                } else {
                    (chunk.offset, chunk.size)
                };
                if let Err(e) = Self::fragment_stored_message(
                    &message,
                    message_id,
                    offset,
                    size,
                    max_fragment_size,
                    channel_id,
                    events,
                ) {
                    log::debug!("[FlowCtrl] repair resend failed: {}", e);
                }
            }
            log::info!(
                "[FlowCtrl] resent ch={} id={} ({} chunk(s))",
                channel_id,
                message_id,
                chunks.len()
            );
            tx.monitor.add_lost(message.len(), message_id);
        }
        Ok(())
    }
}

// Requests not yet answered?
fn waiting_for_requests(state: &ChannelRx) -> bool {
    state.requested.values().any(|received| !received)
}

// Byte ranges still missing from incomplete messages the sender can still
// resend (within history reach, behind the current id, not yet requested).
fn collect_missing_chunks(
    state: &mut ChannelRx,
    channel_id: u8,
    current_id: MessageId,
    manifest: &mut ChunkManifest,
) {
    let mut newly_requested = Vec::new();
    for (&id, buffer) in &state.incoming {
        let diff = calc_distance(id, current_id);
        if diff <= 0 || diff > i32::from(SEND_HISTORY_LIMIT) {
            continue;
        }
        if buffer.bytes_remaining() == 0 || state.requested.contains_key(&id) {
            continue;
        }
        let missing = buffer.missing_chunks();
        if missing.is_empty() {
            continue;
        }
        log::info!(
            "[FlowCtrl] requesting {} missing range(s) of ch={} id={}",
            missing.len(),
            channel_id,
            id
        );
        manifest.add_chunks(channel_id, id, missing);
        newly_requested.push(id);
    }
    for id in newly_requested {
        state.requested.insert(id, false);
    }
}

/// Signed wrap-aware distance between two 16-bit message ids.
///
/// `calc_distance(a, b)` is positive when `b` is ahead of `a` on the
/// circle, correct for every pair across the 2^16 wrap.
pub fn calc_distance(from: MessageId, to: MessageId) -> i32 {
    let mut dist = i32::from(to) - i32::from(from);
    if dist > 0x7FFF {
        dist -= 0x10000;
    } else if dist < -0x7FFF {
        dist += 0x10000;
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PROTOCOL_VERSION_CURRENT;

    // Test doubles: record deliveries and emitted fragments.
    #[derive(Default)]
    struct Deliveries {
        messages: Vec<(MessageId, u8, Vec<u8>)>,
        repair_frames: Vec<Vec<u8>>,
    }

    impl IncomingEvents for Deliveries {
        fn on_complete_message(
            &mut self,
            msg_id: MessageId,
            channel_id: u8,
            payload: &[u8],
            _from: &Address,
        ) {
            self.messages.push((msg_id, channel_id, payload.to_vec()));
        }

        fn on_request_fragment(&mut self, fragment: &Fragment) -> SocketResult<()> {
            self.repair_frames.push(fragment.wire_bytes().to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Emitted {
        datagrams: Vec<Vec<u8>>,
        mtu_updates: Vec<usize>,
    }

    impl OutgoingEvents for Emitted {
        fn on_fragment_ready(&mut self, fragment: &Fragment, _more: bool) -> SocketResult<()> {
            self.datagrams.push(fragment.wire_bytes().to_vec());
            Ok(())
        }

        fn on_set_max_fragment_size(&mut self, size: usize) {
            self.mtu_updates.push(size);
        }
    }

    fn payload(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    fn peer() -> Address {
        Address::loopback(9999)
    }

    #[test]
    fn test_calc_distance_simple() {
        assert_eq!(calc_distance(1, 2), 1);
        assert_eq!(calc_distance(2, 1), -1);
        assert_eq!(calc_distance(5, 5), 0);
    }

    #[test]
    fn test_calc_distance_across_wrap() {
        assert_eq!(calc_distance(65535, 0), 1);
        assert_eq!(calc_distance(65535, 4), 5);
        assert_eq!(calc_distance(0, 65535), -1);
        assert_eq!(calc_distance(65530, 5), 11);
    }

    #[test]
    fn test_send_single_fragment_small_message() {
        let flow = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        flow.set_max_fragment_size(1400);
        let mut out = Emitted::default();

        let data = payload(200);
        let sent = flow.send(&data, Channel::VideoOut, &mut out).expect("send");
        assert_eq!(sent, 200);
        assert_eq!(out.datagrams.len(), 1);

        let frag = Fragment::parse(&out.datagrams[0]).expect("parse");
        assert_eq!(frag.message_id(), 1);
        assert_eq!(frag.message_size(), 200);
        assert_eq!(frag.fragment_offset(), 0);
        assert_eq!(frag.fragment_size(), 200);
        assert_eq!(frag.channel_id(), Channel::VideoOut.id());
    }

    #[test]
    fn test_send_fragment_count_matches_mtu() {
        let flow = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        flow.set_max_fragment_size(548);
        let mut out = Emitted::default();

        let data = payload(5000);
        flow.send(&data, Channel::VideoOut, &mut out).expect("send");
        // 548 - 15 = 533 payload bytes per fragment
        let expected = 5000usize.div_ceil(533);
        assert_eq!(out.datagrams.len(), expected);
    }

    #[test]
    fn test_roundtrip_loss_free() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        sender.set_max_fragment_size(548);

        let data = payload(5000);
        let mut out = Emitted::default();
        sender.send(&data, Channel::VideoOut, &mut out).expect("send");

        let mut rx_events = Deliveries::default();
        for datagram in &out.datagrams {
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("process");
        }

        assert_eq!(rx_events.messages.len(), 1);
        let (id, ch, bytes) = &rx_events.messages[0];
        assert_eq!(*id, 1);
        assert_eq!(*ch, Channel::VideoOut.id());
        assert_eq!(bytes, &data);
    }

    #[test]
    fn test_roundtrip_reordered_fragments() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        sender.set_max_fragment_size(548);

        let data = payload(4000);
        let mut out = Emitted::default();
        sender.send(&data, Channel::VideoOut, &mut out).expect("send");

        let mut shuffled = out.datagrams.clone();
        fastrand::seed(7);
        fastrand::shuffle(&mut shuffled);

        let mut rx_events = Deliveries::default();
        for datagram in &shuffled {
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("process");
        }

        assert_eq!(rx_events.messages.len(), 1);
        assert_eq!(rx_events.messages[0].2, data);
    }

    #[test]
    fn test_per_channel_ordering_preserved() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        for i in 0..5u8 {
            sender
                .send(&[i; 32], Channel::AudioOut, &mut out)
                .expect("send");
        }

        let mut rx_events = Deliveries::default();
        for datagram in &out.datagrams {
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("process");
        }

        let ids: Vec<_> = rx_events.messages.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_datagram_delivers_once() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        sender
            .send(&payload(100), Channel::MiscOut, &mut out)
            .expect("send");

        let mut rx_events = Deliveries::default();
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("process");
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("process duplicate");

        assert_eq!(rx_events.messages.len(), 1);
    }

    #[test]
    fn test_whole_message_gap_requests_retransmission() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        for _ in 0..3 {
            sender
                .send(&payload(64), Channel::VideoOut, &mut out)
                .expect("send");
        }
        assert_eq!(out.datagrams.len(), 3);

        let mut rx_events = Deliveries::default();
        // Deliver 1, drop 2, deliver 3
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("id 1");
        receiver
            .process_fragment(&out.datagrams[2], &peer(), &mut rx_events, None)
            .expect("id 3");

        // Only id 1 delivered, and a repair frame for id 2 went out
        assert_eq!(rx_events.messages.len(), 1);
        assert_eq!(rx_events.messages[0].0, 1);
        assert_eq!(rx_events.repair_frames.len(), 1);

        let frame = Fragment::parse(&rx_events.repair_frames[0]).expect("parse");
        assert_eq!(frame.channel_id(), Channel::System.id());
        let manifest = ChunkManifest::unpack(frame.payload()).expect("manifest");
        let entries: Vec<_> = manifest.entries().collect();
        assert_eq!(entries.len(), 1);
        let (ch, id, chunks) = entries[0];
        assert_eq!(ch, Channel::VideoOut.id());
        assert_eq!(id, 2);
        assert_eq!(chunks, &[Chunk::whole_message()]);
    }

    #[test]
    fn test_repair_roundtrip_recovers_dropped_message() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        let messages: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8 + 10; 80]).collect();
        for m in &messages {
            sender.send(m, Channel::VideoOut, &mut out).expect("send");
        }

        let mut rx_events = Deliveries::default();
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("id 1");
        receiver
            .process_fragment(&out.datagrams[2], &peer(), &mut rx_events, None)
            .expect("id 3");
        assert_eq!(rx_events.repair_frames.len(), 1);

        // Feed the repair request back into the sender; it resends id 2
        let mut resent = Emitted::default();
        let mut sender_incoming = Deliveries::default();
        for frame in rx_events.repair_frames.clone() {
            sender
                .process_fragment(&frame, &peer(), &mut sender_incoming, Some(&mut resent))
                .expect("repair");
        }
        assert!(!resent.datagrams.is_empty());

        // Resent datagrams complete the receiver's sequence: 1, 2, 3
        for datagram in &resent.datagrams {
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("resend");
        }
        let ids: Vec<_> = rx_events.messages.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(rx_events.messages[1].2, messages[1]);
    }

    #[test]
    fn test_missing_fragment_range_requested_and_repaired() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        sender.set_max_fragment_size(548);

        let data = payload(5000);
        let mut out = Emitted::default();
        sender.send(&data, Channel::VideoOut, &mut out).expect("send 1");
        let first_count = out.datagrams.len();
        sender
            .send(&payload(40), Channel::VideoOut, &mut out)
            .expect("send 2");

        let mut rx_events = Deliveries::default();
        // Drop fragment index 3 of message 1, deliver the rest plus message 2
        for (i, datagram) in out.datagrams.iter().enumerate() {
            if i == 3 {
                continue;
            }
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("process");
        }
        assert!(first_count > 4);
        assert_eq!(rx_events.messages.len(), 0, "hole blocks both messages");
        assert!(!rx_events.repair_frames.is_empty());

        // The manifest names the exact missing byte range of message 1
        let frame = Fragment::parse(&rx_events.repair_frames[0]).expect("parse");
        let manifest = ChunkManifest::unpack(frame.payload()).expect("manifest");
        let wants: Vec<_> = manifest.entries().collect();
        assert_eq!(wants[0].1, 1);
        assert_eq!(wants[0].2, &[Chunk::new(3 * 533, 533)]);

        // Close the loop
        let mut resent = Emitted::default();
        let mut sender_incoming = Deliveries::default();
        for frame in rx_events.repair_frames.clone() {
            sender
                .process_fragment(&frame, &peer(), &mut sender_incoming, Some(&mut resent))
                .expect("repair");
        }
        for datagram in &resent.datagrams {
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("resend");
        }

        assert_eq!(rx_events.messages.len(), 2);
        assert_eq!(rx_events.messages[0].2, data);
    }

    #[test]
    fn test_gap_beyond_history_abandons_requests() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        for _ in 0..15 {
            sender
                .send(&payload(32), Channel::VideoOut, &mut out)
                .expect("send");
        }

        let mut rx_events = Deliveries::default();
        // id 1 arrives, then nothing until id 15: distance 14 > history 10
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("id 1");
        receiver
            .process_fragment(&out.datagrams[14], &peer(), &mut rx_events, None)
            .expect("id 15");

        assert!(
            rx_events.repair_frames.is_empty(),
            "no requests once the sender history is gone"
        );
        // id 1 was delivered immediately; 15 waits for the flush timeout
        assert_eq!(rx_events.messages.len(), 1);

        std::thread::sleep(MSG_FLUSH_TIMEOUT + std::time::Duration::from_millis(20));
        receiver.tick_notify(&mut rx_events);
        let ids: Vec<_> = rx_events.messages.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 15]);
    }

    #[test]
    fn test_flush_timeout_promotes_past_hole() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        for _ in 0..3 {
            sender
                .send(&payload(16), Channel::SensorsIn, &mut out)
                .expect("send");
        }

        let mut rx_events = Deliveries::default();
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("id 1");
        receiver
            .process_fragment(&out.datagrams[2], &peer(), &mut rx_events, None)
            .expect("id 3");
        assert_eq!(rx_events.messages.len(), 1);

        // Without the retransmission arriving, the flush promotes id 3
        std::thread::sleep(MSG_FLUSH_TIMEOUT + std::time::Duration::from_millis(20));
        receiver.tick_notify(&mut rx_events);
        let ids: Vec<_> = rx_events.messages.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_channels_are_independent() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out_video = Emitted::default();
        let mut out_audio = Emitted::default();
        for _ in 0..2 {
            sender
                .send(&payload(32), Channel::VideoOut, &mut out_video)
                .expect("send video");
            sender
                .send(&payload(32), Channel::AudioOut, &mut out_audio)
                .expect("send audio");
        }

        let mut rx_events = Deliveries::default();
        // Video loses its first message; audio arrives whole
        receiver
            .process_fragment(&out_video.datagrams[1], &peer(), &mut rx_events, None)
            .expect("video id 2");
        for datagram in &out_audio.datagrams {
            receiver
                .process_fragment(datagram, &peer(), &mut rx_events, None)
                .expect("audio");
        }

        let audio: Vec<_> = rx_events
            .messages
            .iter()
            .filter(|(_, ch, _)| *ch == Channel::AudioOut.id())
            .map(|(id, _, _)| *id)
            .collect();
        assert_eq!(audio, vec![1, 2], "audio not stalled by video loss");
    }

    #[test]
    fn test_first_message_not_dropped_whatever_its_id() {
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let data = payload(48);
        // Peer starts counting at 40000 for some reason
        let frag = Fragment::new(40000, &data, 48, 0, 48, Channel::MiscOut.id());

        let mut rx_events = Deliveries::default();
        receiver
            .process_fragment(frag.wire_bytes(), &peer(), &mut rx_events, None)
            .expect("process");
        assert_eq!(rx_events.messages.len(), 1);
        assert_eq!(rx_events.messages[0].0, 40000);
    }

    #[test]
    fn test_id_wrap_does_not_misdeliver() {
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let mut rx_events = Deliveries::default();

        // Walk the receiver cursor to the wrap boundary and across it
        for id in [65534u16, 65535, 0, 1, 2] {
            let data = vec![id as u8; 32];
            let frag = Fragment::new(id, &data, 32, 0, 32, Channel::UserDefined.id());
            receiver
                .process_fragment(frag.wire_bytes(), &peer(), &mut rx_events, None)
                .expect("process");
        }

        let ids: Vec<_> = rx_events.messages.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![65534, 65535, 0, 1, 2]);
    }

    #[test]
    fn test_stale_buffer_replaced_on_size_mismatch() {
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let mut rx_events = Deliveries::default();

        // Seed cursor at 5 so both test ids are "ahead"
        let seed = Fragment::new(5, &[1; 8], 8, 0, 8, Channel::MiscOut.id());
        receiver
            .process_fragment(seed.wire_bytes(), &peer(), &mut rx_events, None)
            .expect("seed");

        // Partial message id 7 sized 100
        let data_old = payload(100);
        let frag_old = Fragment::new(7, &data_old, 100, 0, 50, Channel::MiscOut.id());
        receiver
            .process_fragment(frag_old.wire_bytes(), &peer(), &mut rx_events, None)
            .expect("old");

        // Same id returns after a wrap with a different size: buffer restarts
        let data_new = payload(60);
        let frag_new = Fragment::new(7, &data_new, 60, 0, 60, Channel::MiscOut.id());
        receiver
            .process_fragment(frag_new.wire_bytes(), &peer(), &mut rx_events, None)
            .expect("new");

        std::thread::sleep(MSG_FLUSH_TIMEOUT + std::time::Duration::from_millis(20));
        receiver.tick_notify(&mut rx_events);
        let last = rx_events.messages.last().expect("delivered");
        assert_eq!(last.0, 7);
        assert_eq!(last.2, data_new);
    }

    #[test]
    fn test_version_negotiation_table() {
        assert_eq!(FlowControl::max_supported_version(3, 3, 3, 3), 3);
        assert_eq!(FlowControl::max_supported_version(3, 4, 3, 4), 4);
        assert_eq!(FlowControl::max_supported_version(3, 4, 3, 3), 3);
        assert_eq!(
            FlowControl::max_supported_version(3, 3, 4, 5),
            PROTOCOL_VERSION_UNSUPPORTED
        );
        assert_eq!(
            FlowControl::max_supported_version(4, 5, 3, 3),
            PROTOCOL_VERSION_UNSUPPORTED
        );
    }

    #[test]
    fn test_upgrade_protocol_resets_receive_state() {
        let flow = FlowControl::new(3);
        let mut rx_events = Deliveries::default();

        let frag = Fragment::new(9, &[7; 16], 16, 0, 16, Channel::Service.id());
        flow.process_fragment(frag.wire_bytes(), &peer(), &mut rx_events, None)
            .expect("process");
        assert_eq!(rx_events.messages.len(), 1);

        flow.upgrade_protocol(4);
        assert_eq!(flow.version(), 4);

        // After the upgrade the first-message seeding applies again
        let frag = Fragment::new(3, &[8; 16], 16, 0, 16, Channel::Service.id());
        flow.process_fragment(frag.wire_bytes(), &peer(), &mut rx_events, None)
            .expect("process after upgrade");
        assert_eq!(rx_events.messages.len(), 2);
        assert_eq!(rx_events.messages[1].0, 3);
    }

    #[test]
    fn test_retransmission_requested_once_per_id() {
        let sender = FlowControl::new(PROTOCOL_VERSION_CURRENT);
        let receiver = FlowControl::new(PROTOCOL_VERSION_CURRENT);

        let mut out = Emitted::default();
        for _ in 0..4 {
            sender
                .send(&payload(32), Channel::VideoOut, &mut out)
                .expect("send");
        }

        let mut rx_events = Deliveries::default();
        receiver
            .process_fragment(&out.datagrams[0], &peer(), &mut rx_events, None)
            .expect("id 1");
        // id 2 lost; ids 3 and 4 both arrive: only one request for id 2
        receiver
            .process_fragment(&out.datagrams[2], &peer(), &mut rx_events, None)
            .expect("id 3");
        let after_first_gap = rx_events.repair_frames.len();
        receiver
            .process_fragment(&out.datagrams[3], &peer(), &mut rx_events, None)
            .expect("id 4");

        let all_wanted: Vec<MessageId> = rx_events
            .repair_frames
            .iter()
            .filter_map(|f| Fragment::parse(f).ok())
            .filter_map(|f| ChunkManifest::unpack(f.payload()))
            .flat_map(|m| m.entries().map(|(_, id, _)| id).collect::<Vec<_>>())
            .collect();
        assert_eq!(after_first_gap, 1);
        assert_eq!(
            all_wanted.iter().filter(|&&id| id == 2).count(),
            1,
            "id 2 requested exactly once"
        );
    }
}
