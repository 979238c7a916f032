// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Stream flow-control: length-prefixed framing over TCP.
//!
//! TCP already delivers an ordered, reliable byte stream, so the protocol
//! reduces to message boundaries:
//!
//! ```text
//! +----------+------------+------------+----------------+
//! | msg_size | channel_id | message_id |      body      |
//! |  u32 BE  |     u8     |   u16 BE   | msg_size bytes |
//! +----------+------------+------------+----------------+
//! ```
//!
//! There is no retransmission logic and no MTU monitor here. The receive
//! buffer grows to the largest message seen and is reused across messages;
//! partial reads resume where they stopped so a slow peer never corrupts
//! framing.

use crate::flow::dgram::MessageId;
use crate::flow::channel::Channel;
use crate::net::socket::{SocketError, StreamSocket};

/// Size of the stream frame header on the wire.
pub const STREAM_HEADER_SIZE: usize = 7;

/// Stream-level failures, mapped from socket errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlowError {
    /// Bounded read elapsed; caller re-enters its wait loop.
    Timeout,
    /// The peer is gone; the session must be torn down.
    ConnectionTerminated,
}

fn map_stream_error(err: SocketError) -> StreamFlowError {
    match err {
        SocketError::ConnectionTimeout | SocketError::WouldBlock => StreamFlowError::Timeout,
        _ => StreamFlowError::ConnectionTerminated,
    }
}

/// A received frame, borrowed from the protocol's receive buffer.
#[derive(Debug)]
pub struct StreamMessage<'a> {
    pub channel_id: u8,
    pub message_id: MessageId,
    pub body: &'a [u8],
}

/// Framing state for one TCP session direction pair.
///
/// Send and receive sides are independent; the session layer serializes
/// concurrent senders with its own mutex.
pub struct StreamFlow {
    // Outgoing message counter, shared across channels (TCP orders globally)
    next_id: MessageId,
    send_buf: Vec<u8>,

    // Incremental receive state
    new_incoming: bool,
    in_channel: u8,
    in_msg_id: MessageId,
    in_msg_size: usize,
    in_offset: usize,
    recv_buf: Vec<u8>,
}

impl Default for StreamFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFlow {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            send_buf: Vec::new(),
            new_incoming: true,
            in_channel: 0,
            in_msg_id: 0,
            in_msg_size: 0,
            in_offset: 0,
            recv_buf: Vec::new(),
        }
    }

    /// Frame `body` for `channel`; returns the assigned message id.
    /// The framed bytes are available from [`StreamFlow::send_bytes`] until
    /// the next `prepare_message` call.
    pub fn prepare_message(&mut self, channel: Channel, body: &[u8]) -> MessageId {
        if body.is_empty() {
            log::warn!("[StreamFlow] preparing zero-size message");
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.send_buf.clear();
        self.send_buf.reserve(STREAM_HEADER_SIZE + body.len());
        self.send_buf
            .extend_from_slice(&(body.len() as u32).to_be_bytes());
        self.send_buf.push(channel.id());
        self.send_buf.extend_from_slice(&id.to_be_bytes());
        self.send_buf.extend_from_slice(body);
        id
    }

    /// Wire bytes of the last prepared message.
    pub fn send_bytes(&self) -> &[u8] {
        &self.send_buf
    }

    /// Read from `socket` until one full message is buffered.
    ///
    /// Returns `Ok(None)` when the body is still partial (the next call
    /// resumes) and `Ok(Some(..))` once a message completed. Timeouts on a
    /// partial body surface as [`StreamFlowError::Timeout`] and do not
    /// abandon the message.
    pub fn read_and_process(
        &mut self,
        socket: &StreamSocket,
    ) -> Result<Option<StreamMessage<'_>>, StreamFlowError> {
        if self.new_incoming {
            let mut header = [0u8; STREAM_HEADER_SIZE];
            socket.receive_all(&mut header).map_err(|e| {
                let mapped = map_stream_error(e);
                if mapped == StreamFlowError::ConnectionTerminated {
                    log::debug!("[StreamFlow] header read failed: {}", e);
                }
                mapped
            })?;

            self.in_msg_size =
                u32::from_be_bytes(header[0..4].try_into().expect("fixed header")) as usize;
            self.in_channel = header[4];
            self.in_msg_id = u16::from_be_bytes([header[5], header[6]]);
            self.in_offset = 0;
            self.new_incoming = false;

            if self.in_msg_size > self.recv_buf.len() {
                self.recv_buf.resize(self.in_msg_size, 0);
            }
        }

        if self.in_msg_size == 0 {
            // Header-only message; complete immediately
            self.new_incoming = true;
            return Ok(Some(StreamMessage {
                channel_id: self.in_channel,
                message_id: self.in_msg_id,
                body: &[],
            }));
        }

        let read = socket
            .receive(&mut self.recv_buf[self.in_offset..self.in_msg_size])
            .map_err(map_stream_error)?;
        if read == 0 {
            return Err(StreamFlowError::ConnectionTerminated);
        }
        self.in_offset += read;

        if self.in_offset == self.in_msg_size {
            self.new_incoming = true;
            Ok(Some(StreamMessage {
                channel_id: self.in_channel,
                message_id: self.in_msg_id,
                body: &self.recv_buf[..self.in_msg_size],
            }))
        } else {
            Ok(None)
        }
    }
}
