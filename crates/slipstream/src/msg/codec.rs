// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Codec descriptors.
//!
//! Codec lists travel as JSON sub-objects inside the handshake options.
//! Only the name is mandatory; attributes are codec-specific and optional,
//! and unknown attributes survive a round-trip untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A video codec the peer can encode or decode (e.g. `h264`, `h265`, `av1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoCodec {
    #[serde(rename = "Codec")]
    pub name: String,
    #[serde(rename = "Profile", default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<i64>,
    #[serde(rename = "Level", default, skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
    #[serde(rename = "BitDepth", default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<i64>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl VideoCodec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            profile: None,
            level: None,
            bit_depth: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// An audio codec the peer can encode or decode (e.g. `opus`, `aac`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioCodec {
    #[serde(rename = "Codec")]
    pub name: String,
    #[serde(rename = "SampleRate", default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i64>,
    #[serde(rename = "Channels", default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<i64>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl AudioCodec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sample_rate: None,
            channels: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// The `Codecs` object nested in the handshake options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodecSet {
    #[serde(rename = "VideoCodecs", default, skip_serializing_if = "Vec::is_empty")]
    pub video: Vec<VideoCodec>,
    #[serde(rename = "AudioCodecs", default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<AudioCodec>,
}

impl CodecSet {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}
