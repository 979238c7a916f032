// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Handshake bodies: HELLO request, HELLO response, refusal.
//!
//! A `HelloRequest` travels under opcode `HELLO` (connect) or `DISCOVERY`
//! (enumeration); a `HelloResponse` answers either; a `Refusal` carries
//! only the opcode and an empty JSON object.
//!
//! Version negotiation: the accepted version is `min(max_local, max_remote)`
//! provided it is at least `max(min_local, min_remote)`; anything else gets
//! a refusal on the server and `ConnectionInvalidVersion` on the client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{MAX_DATAGRAM_SIZE, PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN};
use crate::msg::codec::CodecSet;

/// Platform tag carried in the HELLO request.
#[cfg(target_os = "linux")]
pub const PLATFORM: &str = "Linux";
#[cfg(target_os = "windows")]
pub const PLATFORM: &str = "Windows";
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const PLATFORM: &str = "iOS";
#[cfg(target_os = "android")]
pub const PLATFORM: &str = "Android";
#[cfg(not(any(
    target_os = "linux",
    target_os = "windows",
    target_os = "macos",
    target_os = "ios",
    target_os = "android"
)))]
pub const PLATFORM: &str = "Unknown";

/// Options object carried by a HELLO request: typed codecs plus free-form
/// key/values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloOptions {
    #[serde(rename = "Codecs", default, skip_serializing_if = "Option::is_none")]
    pub codecs: Option<CodecSet>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl HelloOptions {
    pub fn is_empty(&self) -> bool {
        self.codecs.as_ref().map_or(true, CodecSet::is_empty) && self.extra.is_empty()
    }
}

/// HELLO / DISCOVERY request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloRequest {
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "ProtocolMinVersion")]
    pub protocol_min_version: u32,
    #[serde(rename = "MaxDatagramSize")]
    pub max_datagram_size: u32,
    #[serde(rename = "DeviceID", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(rename = "PlatformInfo", default)]
    pub platform_info: String,
    #[serde(rename = "Options", default, skip_serializing_if = "HelloOptions::is_empty")]
    pub options: HelloOptions,
}

impl HelloRequest {
    /// Request with this implementation's version range and platform tag.
    pub fn new(device_id: &str, max_datagram_size: usize) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_CURRENT,
            protocol_min_version: PROTOCOL_VERSION_MIN,
            max_datagram_size: max_datagram_size as u32,
            device_id: (!device_id.is_empty()).then(|| device_id.to_string()),
            platform_info: PLATFORM.to_string(),
            options: HelloOptions::default(),
        }
    }

    /// Attach advertised codecs.
    pub fn with_codecs(mut self, codecs: CodecSet) -> Self {
        if !codecs.is_empty() {
            self.options.codecs = Some(codecs);
        }
        self
    }

    /// Attach a free-form option.
    pub fn with_option(mut self, name: &str, value: serde_json::Value) -> Self {
        self.options.extra.insert(name.to_string(), value);
        self
    }

    pub fn from_json(body: &[u8]) -> Option<Self> {
        match serde_json::from_slice(body) {
            Ok(req) => Some(req),
            Err(e) => {
                log::debug!("[Hello] request body rejected: {}", e);
                None
            }
        }
    }
}

/// HELLO / DISCOVERY response body (the server descriptor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(rename = "ServerName")]
    pub server_name: String,
    #[serde(rename = "ProtocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "ProtocolMinVersion")]
    pub protocol_min_version: u32,
    #[serde(rename = "DatagramSize")]
    pub datagram_size: u32,
    #[serde(rename = "MaxDatagramSize")]
    pub max_datagram_size: u32,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "OsName", default, skip_serializing_if = "String::is_empty")]
    pub os_name: String,
    #[serde(rename = "Transports", default, skip_serializing_if = "Option::is_none")]
    transports: Option<Vec<String>>,
    #[serde(rename = "StreamID", default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<i64>,
    #[serde(rename = "Options", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl HelloResponse {
    pub fn new(server_name: &str, port: u16, datagram_size: u32) -> Self {
        Self {
            server_name: if server_name.is_empty() {
                "slipstream server".to_string()
            } else {
                server_name.to_string()
            },
            protocol_version: PROTOCOL_VERSION_CURRENT,
            protocol_min_version: PROTOCOL_VERSION_MIN,
            datagram_size: if datagram_size == 0 {
                MAX_DATAGRAM_SIZE as u32
            } else {
                datagram_size
            },
            max_datagram_size: MAX_DATAGRAM_SIZE as u32,
            port,
            os_name: PLATFORM.to_string(),
            transports: None,
            stream_id: None,
            options: BTreeMap::new(),
        }
    }

    /// Advertise the supported transport set.
    pub fn with_transports(mut self, transports: &[&str]) -> Self {
        self.transports = Some(transports.iter().map(|s| (*s).to_string()).collect());
        self
    }

    /// Supported transports; absent on the wire means `["UDP"]`.
    pub fn transports(&self) -> Vec<String> {
        match &self.transports {
            Some(list) if !list.is_empty() => list.clone(),
            _ => vec!["UDP".to_string()],
        }
    }

    pub fn from_json(body: &[u8]) -> Option<Self> {
        match serde_json::from_slice(body) {
            Ok(resp) => Some(resp),
            Err(e) => {
                log::debug!("[Hello] response body rejected: {}", e);
                None
            }
        }
    }
}

/// CONNECTION_REFUSED body: deliberately empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refusal {}

/// Negotiated version for the two ranges, if any.
pub fn negotiate_version(
    min_local: u32,
    max_local: u32,
    min_remote: u32,
    max_remote: u32,
) -> Option<u32> {
    let accepted = max_local.min(max_remote);
    (accepted >= min_local.max(min_remote)).then_some(accepted)
}
