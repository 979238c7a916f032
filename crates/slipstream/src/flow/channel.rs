// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Logical channels and per-channel opcode spaces.
//!
//! A session multiplexes independent channels; each channel orders its own
//! messages and never stalls another. Channel 255 (`SYSTEM`) carries only
//! retransmission-request frames and is never delivered to the application.

use crate::config::CHANNEL_COUNT;

/// Logical channel identifiers with stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Handshake, discovery and control messages.
    Service = 0,
    /// Compressed video, server to client.
    VideoOut = 1,
    /// Compressed audio, server to client.
    AudioOut = 2,
    /// Microphone audio, client to server.
    AudioIn = 3,
    /// Sensor/input events, client to server.
    SensorsIn = 4,
    /// Reserved; superseded by `SensorsIn`.
    ControllerIn = 5,
    /// Miscellaneous server-to-client data.
    MiscOut = 6,
    /// Sensor events, server to client (haptics etc.).
    SensorsOut = 7,
    /// Application-defined traffic.
    UserDefined = 8,
    /// Video from the client (camera passthrough).
    VideoIn = 9,
    /// Transport-internal repair frames. Never surfaced upward.
    System = 255,
}

impl Channel {
    /// Wire code of the channel.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// True for channels applications may send on.
    pub fn is_application(self) -> bool {
        (self.id() as usize) < CHANNEL_COUNT
    }
}

impl TryFrom<u8> for Channel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Channel::Service),
            1 => Ok(Channel::VideoOut),
            2 => Ok(Channel::AudioOut),
            3 => Ok(Channel::AudioIn),
            4 => Ok(Channel::SensorsIn),
            5 => Ok(Channel::ControllerIn),
            6 => Ok(Channel::MiscOut),
            7 => Ok(Channel::SensorsOut),
            8 => Ok(Channel::UserDefined),
            9 => Ok(Channel::VideoIn),
            255 => Ok(Channel::System),
            other => Err(other),
        }
    }
}

/// Opcodes carried on [`Channel::Service`].
///
/// Gaps are opcodes retired from the original protocol; the codes stay
/// reserved so live deployments never see them reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceOpcode {
    /// Broadcast by clients looking for servers.
    Discovery = 0,
    /// Server's refusal to a HELLO or DISCOVERY.
    ConnectionRefused = 1,
    /// Begin streaming.
    Start = 3,
    /// Stop streaming.
    Stop = 4,
    /// Capabilities of a trackable input device.
    TrackableDeviceCaps = 5,
    /// Mid-session option update.
    Update = 6,
    /// Connection handshake request.
    Hello = 7,
    /// Latency statistics exchange.
    StatLatency = 8,
    /// Orderly session termination.
    TerminateSession = 13,
    /// Server-side statistics report.
    ServerStat = 14,
    /// Mid-session codec renegotiation.
    CodecsUpdate = 15,
}

impl TryFrom<u8> for ServiceOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(ServiceOpcode::Discovery),
            1 => Ok(ServiceOpcode::ConnectionRefused),
            3 => Ok(ServiceOpcode::Start),
            4 => Ok(ServiceOpcode::Stop),
            5 => Ok(ServiceOpcode::TrackableDeviceCaps),
            6 => Ok(ServiceOpcode::Update),
            7 => Ok(ServiceOpcode::Hello),
            8 => Ok(ServiceOpcode::StatLatency),
            13 => Ok(ServiceOpcode::TerminateSession),
            14 => Ok(ServiceOpcode::ServerStat),
            15 => Ok(ServiceOpcode::CodecsUpdate),
            other => Err(other),
        }
    }
}

/// Opcodes carried on the video channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoOpcode {
    Init = 0,
    Data = 1,
    Qos = 2,
    Cursor = 3,
    ForceUpdate = 4,
    InitRequest = 5,
    InitAck = 6,
}

/// Opcodes carried on the audio channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioOpcode {
    Init = 0,
    Data = 1,
    InitRequest = 2,
    InitAck = 3,
}

/// Opcodes carried on the sensor channels. Codes 0-3 belonged to a retired
/// layout and stay reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorOpcode {
    DeviceEvent = 4,
    TrackableDeviceCaps = 5,
    TrackableDeviceDisconnected = 6,
}

impl TryFrom<u8> for VideoOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(VideoOpcode::Init),
            1 => Ok(VideoOpcode::Data),
            2 => Ok(VideoOpcode::Qos),
            3 => Ok(VideoOpcode::Cursor),
            4 => Ok(VideoOpcode::ForceUpdate),
            5 => Ok(VideoOpcode::InitRequest),
            6 => Ok(VideoOpcode::InitAck),
            other => Err(other),
        }
    }
}

impl TryFrom<u8> for AudioOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(AudioOpcode::Init),
            1 => Ok(AudioOpcode::Data),
            2 => Ok(AudioOpcode::InitRequest),
            3 => Ok(AudioOpcode::InitAck),
            other => Err(other),
        }
    }
}

impl TryFrom<u8> for SensorOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            4 => Ok(SensorOpcode::DeviceEvent),
            5 => Ok(SensorOpcode::TrackableDeviceCaps),
            6 => Ok(SensorOpcode::TrackableDeviceDisconnected),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_wire_codes_stable() {
        assert_eq!(Channel::Service.id(), 0);
        assert_eq!(Channel::VideoOut.id(), 1);
        assert_eq!(Channel::AudioOut.id(), 2);
        assert_eq!(Channel::AudioIn.id(), 3);
        assert_eq!(Channel::SensorsIn.id(), 4);
        assert_eq!(Channel::ControllerIn.id(), 5);
        assert_eq!(Channel::MiscOut.id(), 6);
        assert_eq!(Channel::SensorsOut.id(), 7);
        assert_eq!(Channel::UserDefined.id(), 8);
        assert_eq!(Channel::VideoIn.id(), 9);
        assert_eq!(Channel::System.id(), 255);
    }

    #[test]
    fn test_channel_roundtrip_and_rejects() {
        for id in 0u8..=9 {
            let ch = Channel::try_from(id).expect("valid channel");
            assert_eq!(ch.id(), id);
            assert!(ch.is_application());
        }
        assert_eq!(Channel::try_from(255), Ok(Channel::System));
        assert!(!Channel::System.is_application());
        assert!(Channel::try_from(10).is_err());
        assert!(Channel::try_from(254).is_err());
    }

    #[test]
    fn test_service_opcode_reserved_gaps() {
        // 2 (transmission failure) and 9-12 (profiling) are retired
        assert!(ServiceOpcode::try_from(2).is_err());
        for code in 9u8..=12 {
            assert!(ServiceOpcode::try_from(code).is_err());
        }
        assert_eq!(ServiceOpcode::try_from(7), Ok(ServiceOpcode::Hello));
        assert_eq!(
            ServiceOpcode::try_from(13),
            Ok(ServiceOpcode::TerminateSession)
        );
    }
}
