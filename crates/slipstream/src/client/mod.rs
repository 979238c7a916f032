// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Client side: discovery, handshake, long-lived session.
//!
//! Three activities:
//!
//! 1. **Discovery** - broadcast a `DISCOVERY` service message and collect
//!    server descriptors until the timeout, with an optional per-server
//!    callback that can stop the scan early.
//! 2. **Direct query** - the same exchange, unicast to one URL.
//! 3. **Connect** - send `HELLO` every tick until a response, a refusal or
//!    the timeout; on success the negotiated version and datagram size are
//!    adopted and a message-loop thread runs the session until a terminal
//!    error fires `on_terminate`.

/// The established connection and its message loop.
pub mod connection;

pub use connection::{ClientConnection, ClientEvents};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{DEFAULT_PORT, DEFAULT_PROTOCOL, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN};
use crate::flow::channel::{Channel, ServiceOpcode};
use crate::flow::dgram::{FlowControl, IncomingEvents, MessageId, OutgoingEvents};
use crate::flow::fragment::Fragment;
use crate::msg::codec::CodecSet;
use crate::msg::hello::{negotiate_version, HelloRequest, HelloResponse};
use crate::msg::{encode_service, split_service};
use crate::net::addr::Address;
use crate::net::socket::{DatagramSocket, SocketResult};
use crate::net::url::Url;
use crate::{Error, Result};

/// Whether discovery should keep scanning after a server was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryCtrl {
    Continue,
    Stop,
}

/// A discovered server: its descriptor plus how to reach it.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub descriptor: HelloResponse,
    pub address: Address,
    pub url: String,
}

impl ServerInfo {
    fn new(descriptor: HelloResponse, mut address: Address) -> Self {
        // Descriptors advertise the service port; the datagram may have
        // come from an ephemeral one
        if descriptor.port != 0 {
            address.set_port(descriptor.port);
        }
        let url = format!(
            "{}://{}",
            descriptor
                .transports()
                .first()
                .map(|t| t.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            address
        );
        Self {
            descriptor,
            address,
            url,
        }
    }
}

/// Client configuration and discovery entry points.
pub struct Client {
    device_id: String,
    timeout: Duration,
    max_datagram_size: usize,
    codecs: CodecSet,
}

impl Client {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            timeout: Duration::from_secs(10),
            max_datagram_size: MAX_DATAGRAM_SIZE,
            codecs: CodecSet::default(),
        }
    }

    /// Bound on discovery and connect waits.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArg("timeout must be positive".into()));
        }
        self.timeout = timeout;
        Ok(())
    }

    /// Largest datagram this client accepts.
    pub fn set_max_datagram_size(&mut self, size: usize) {
        self.max_datagram_size = size.min(MAX_DATAGRAM_SIZE);
    }

    /// Codecs advertised in the HELLO options.
    pub fn set_codecs(&mut self, codecs: CodecSet) {
        self.codecs = codecs;
    }

    /// Broadcast discovery on `port`; collect every server that answers
    /// within the timeout. The callback may return
    /// [`DiscoveryCtrl::Stop`] to end the scan early.
    pub fn enumerate_servers(
        &self,
        port: u16,
        mut callback: Option<&mut dyn FnMut(&ServerInfo) -> DiscoveryCtrl>,
    ) -> Result<Vec<ServerInfo>> {
        let socket = DatagramSocket::bind_any()?;
        socket.set_receive_timeout(Some(Duration::from_millis(250)))?;

        let request = HelloRequest::new(&self.device_id, self.max_datagram_size);
        let wire = encode_service(ServiceOpcode::Discovery, &request);

        let broadcast_flow = FlowControl::new(PROTOCOL_VERSION_MIN);
        let mut tx = BroadcastWriter {
            socket: &socket,
            port,
        };
        broadcast_flow.send(&wire, Channel::Service, &mut tx)?;
        log::info!("[Client] discovery broadcast on port {}", port);

        let mut servers: Vec<ServerInfo> = Vec::new();
        // Every responding server numbers its own messages; keep the
        // reassembly state separate per peer or their ids would collide
        let mut peer_flows: std::collections::BTreeMap<Address, FlowControl> =
            std::collections::BTreeMap::new();
        let mut inbox = ResponseInbox::default();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let deadline = Instant::now() + self.timeout;

        'scan: while Instant::now() < deadline {
            let Ok((len, from)) = socket.receive_from(&mut buf) else {
                continue;
            };
            let flow = peer_flows
                .entry(from.clone())
                .or_insert_with(|| FlowControl::new(PROTOCOL_VERSION_MIN));
            let _ = flow.process_fragment(&buf[..len], &from, &mut inbox, None);
            for (payload, from) in inbox.drain() {
                let Some(descriptor) = parse_discovery_response(&payload) else {
                    continue;
                };
                if servers.iter().any(|s| s.address == from) {
                    continue; // several NICs can deliver the same answer
                }
                let info = ServerInfo::new(descriptor, from);
                log::info!("[Client] discovered '{}' at {}", info.descriptor.server_name, info.url);
                servers.push(info);
                if let Some(cb) = callback.as_deref_mut() {
                    if cb(servers.last().expect("just pushed")) == DiscoveryCtrl::Stop {
                        break 'scan;
                    }
                }
            }
        }

        if servers.is_empty() {
            return Err(Error::ServersNotEnumerated);
        }
        Ok(servers)
    }

    /// Unicast the discovery exchange to one URL; exactly one answer.
    pub fn query_server_info(&self, url: &str) -> Result<ServerInfo> {
        let url = Url::parse(url, DEFAULT_PROTOCOL, DEFAULT_PORT)?;
        let target = resolve(&url)?;

        let socket = DatagramSocket::bind_any()?;
        socket.set_receive_timeout(Some(Duration::from_millis(250)))?;

        let request = HelloRequest::new(&self.device_id, self.max_datagram_size);
        let wire = encode_service(ServiceOpcode::Discovery, &request);
        let flow = FlowControl::new(PROTOCOL_VERSION_MIN);

        let deadline = Instant::now() + self.timeout;
        let mut inbox = ResponseInbox::default();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while Instant::now() < deadline {
            let mut tx = UnicastWriter {
                socket: &socket,
                target: &target,
            };
            flow.send(&wire, Channel::Service, &mut tx)?;

            let Ok((len, from)) = socket.receive_from(&mut buf) else {
                continue;
            };
            let _ = flow.process_fragment(&buf[..len], &from, &mut inbox, None);
            for (payload, from) in inbox.drain() {
                if let Some(descriptor) = parse_discovery_response(&payload) {
                    return Ok(ServerInfo::new(descriptor, from));
                }
            }
        }
        Err(Error::ServerNotAvailable)
    }

    /// Connect to `server_url` and start the session message loop.
    pub fn connect(
        &self,
        server_url: &str,
        events: Arc<dyn ClientEvents>,
    ) -> Result<ClientConnection> {
        let url = Url::parse(server_url, DEFAULT_PROTOCOL, DEFAULT_PORT)?;
        match url.protocol() {
            "udp" => self.connect_udp(&url, events),
            "tcp" => connection::connect_tcp(self, &url, events),
            other => Err(Error::InvalidUrl(format!("unsupported protocol {}", other))),
        }
    }

    fn connect_udp(&self, url: &Url, events: Arc<dyn ClientEvents>) -> Result<ClientConnection> {
        let target = resolve(url)?;
        let socket = DatagramSocket::bind_any()?;
        socket.set_receive_timeout(Some(Duration::from_millis(250)))?;

        let flow = FlowControl::new(PROTOCOL_VERSION_MIN);
        let request = HelloRequest::new(&self.device_id, self.max_datagram_size)
            .with_codecs(self.codecs.clone());
        let wire = encode_service(ServiceOpcode::Hello, &request);

        let deadline = Instant::now() + self.timeout;
        let mut inbox = ResponseInbox::default();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_hello = None::<Instant>;

        let response = 'handshake: loop {
            if Instant::now() >= deadline {
                log::error!("[Client] connect to {} timed out", url);
                return Err(Error::ConnectionTimeout);
            }
            // Retry the HELLO every second until something answers
            if last_hello.map_or(true, |at| at.elapsed() >= Duration::from_secs(1)) {
                let mut tx = UnicastWriter {
                    socket: &socket,
                    target: &target,
                };
                flow.send(&wire, Channel::Service, &mut tx)?;
                last_hello = Some(Instant::now());
            }

            let Ok((len, from)) = socket.receive_from(&mut buf) else {
                continue;
            };
            let _ = flow.process_fragment(&buf[..len], &from, &mut inbox, None);
            for (payload, _from) in inbox.drain() {
                match handshake_reply(&payload)? {
                    Some(response) => break 'handshake response,
                    None => continue,
                }
            }
        };

        let version = negotiate_version(
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_CURRENT,
            response.protocol_min_version,
            response.protocol_version,
        )
        .ok_or(Error::ConnectionInvalidVersion)?;

        // Adopt the smaller of our limit and the server's offer as the MTU
        let datagram_size = self
            .max_datagram_size
            .min(response.datagram_size as usize);
        flow.upgrade_protocol(version);
        flow.set_max_fragment_size(datagram_size);

        log::info!(
            "[Client] connected to '{}' at {} (version {}, datagram {})",
            response.server_name,
            target,
            version,
            datagram_size
        );

        connection::spawn_udp(socket, target, flow, response, events)
    }
}

// Interpret one service message during the handshake: the response, a
// refusal, or something to ignore.
fn handshake_reply(payload: &[u8]) -> Result<Option<HelloResponse>> {
    let Some((opcode, body)) = split_service(payload) else {
        return Ok(None);
    };
    match ServiceOpcode::try_from(opcode) {
        Ok(ServiceOpcode::Hello) | Ok(ServiceOpcode::Discovery) => {
            Ok(HelloResponse::from_json(body))
        }
        Ok(ServiceOpcode::ConnectionRefused) => {
            // A refusal during the handshake means our version range did
            // not fit the server's
            log::error!("[Client] server refused the connection");
            Err(Error::ConnectionInvalidVersion)
        }
        _ => Ok(None),
    }
}

fn parse_discovery_response(payload: &[u8]) -> Option<HelloResponse> {
    let (opcode, body) = split_service(payload)?;
    match ServiceOpcode::try_from(opcode) {
        Ok(ServiceOpcode::Discovery) | Ok(ServiceOpcode::Hello) => HelloResponse::from_json(body),
        _ => None,
    }
}

fn resolve(url: &Url) -> Result<Address> {
    use std::net::ToSocketAddrs;
    let candidates = (url.host(), url.port())
        .to_socket_addrs()
        .map_err(|_| Error::InvalidUrl(format!("cannot resolve {}", url.host())))?;
    candidates
        .into_iter()
        .next()
        .map(Address::from)
        .ok_or_else(|| Error::InvalidUrl(format!("no addresses for {}", url.host())))
}

// ============================================================================
// Flow-control adapters
// ============================================================================

struct UnicastWriter<'a> {
    socket: &'a DatagramSocket,
    target: &'a Address,
}

impl OutgoingEvents for UnicastWriter<'_> {
    fn on_fragment_ready(&mut self, fragment: &Fragment, _more: bool) -> SocketResult<()> {
        self.socket.send_to(fragment.wire_bytes(), self.target).map(|_| ())
    }

    fn on_set_max_fragment_size(&mut self, _size: usize) {}
}

struct BroadcastWriter<'a> {
    socket: &'a DatagramSocket,
    port: u16,
}

impl OutgoingEvents for BroadcastWriter<'_> {
    fn on_fragment_ready(&mut self, fragment: &Fragment, _more: bool) -> SocketResult<()> {
        self.socket.broadcast(fragment.wire_bytes(), self.port).map(|_| ())
    }

    fn on_set_max_fragment_size(&mut self, _size: usize) {}
}

// Collects complete service messages with their sender.
#[derive(Default)]
struct ResponseInbox {
    replies: Vec<(Vec<u8>, Address)>,
}

impl ResponseInbox {
    fn drain(&mut self) -> Vec<(Vec<u8>, Address)> {
        std::mem::take(&mut self.replies)
    }
}

impl IncomingEvents for ResponseInbox {
    fn on_complete_message(
        &mut self,
        _msg_id: MessageId,
        channel_id: u8,
        payload: &[u8],
        from: &Address,
    ) {
        if channel_id == Channel::Service.id() {
            self.replies.push((payload.to_vec(), from.clone()));
        }
    }

    fn on_request_fragment(&mut self, _fragment: &Fragment) -> SocketResult<()> {
        // Handshake exchanges are single datagrams; no repair channel yet
        Ok(())
    }
}
