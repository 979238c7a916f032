// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Service messages.
//!
//! Every message on [`Channel::Service`](crate::Channel::Service) is a
//! single opcode byte followed by a UTF-8 JSON body. The JSON tag schema is
//! fixed on the wire; parsing tolerates unknown tags so peers can extend
//! their options without breaking older implementations.

/// Codec descriptors advertised during the handshake.
pub mod codec;
/// HELLO / HELLO_RESPONSE / refusal bodies.
pub mod hello;

pub use codec::{AudioCodec, CodecSet, VideoCodec};
pub use hello::{HelloRequest, HelloResponse, Refusal};

use serde::Serialize;

use crate::flow::channel::ServiceOpcode;

/// Frame a service message: opcode byte + JSON body.
pub fn encode_service<T: Serialize>(opcode: ServiceOpcode, body: &T) -> Vec<u8> {
    let json = serde_json::to_vec(body).unwrap_or_else(|e| {
        // A schema struct failing to serialize is a programming error;
        // degrade to an empty object rather than poisoning the channel.
        log::error!("[ServiceMsg] serialization failed: {}", e);
        b"{}".to_vec()
    });
    let mut wire = Vec::with_capacity(1 + json.len());
    wire.push(opcode as u8);
    wire.extend_from_slice(&json);
    wire
}

/// Split a received service message into opcode and JSON body.
///
/// Returns `None` for an empty message; an unknown opcode is the caller's
/// concern (the body may still parse).
pub fn split_service(message: &[u8]) -> Option<(u8, &[u8])> {
    let (&opcode, body) = message.split_first()?;
    Some((opcode, body))
}
