// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! UDP server.
//!
//! One bound socket serves every peer; sessions are created on first
//! contact and keyed by source address. Each session owns a full
//! flow-control engine, so retransmission requests from one client are
//! answered from that client's own send history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{MAX_DATAGRAM_SIZE, MSG_FLUSH_TIMEOUT, PROTOCOL_VERSION_CURRENT,
    PROTOCOL_VERSION_MIN};
use crate::flow::channel::{Channel, ServiceOpcode};
use crate::flow::dgram::{FlowControl, IncomingEvents, MessageId, OutgoingEvents};
use crate::flow::fragment::Fragment;
use crate::msg::hello::{negotiate_version, HelloRequest, HelloResponse, Refusal};
use crate::msg::{encode_service, split_service};
use crate::net::addr::Address;
use crate::net::selector::{SelectOutcome, Selector};
use crate::net::socket::{DatagramSocket, SocketResult};
use crate::server::{ServerConfig, ServerEvents};
use crate::session::{Session, SessionManager, SessionState, TerminationReason};
use crate::{Error, Result};

/// Per-peer state of the UDP server.
pub struct DgramServerSession {
    state: SessionState,
    flow: FlowControl,
    socket: Arc<DatagramSocket>,
    events: Arc<dyn ServerEvents>,
}

impl DgramServerSession {
    fn new(
        peer: Address,
        socket: Arc<DatagramSocket>,
        events: Arc<dyn ServerEvents>,
    ) -> Self {
        Self {
            state: SessionState::new(peer),
            flow: FlowControl::new(PROTOCOL_VERSION_MIN),
            socket,
            events,
        }
    }

    /// Send a logical message to this peer.
    pub fn send(&self, channel: Channel, body: &[u8]) -> SocketResult<u32> {
        let mut out = SocketWriter {
            socket: &self.socket,
            peer: self.state.peer_address(),
        };
        self.flow.send(body, channel, &mut out)
    }

    /// Flow-control engine (MTU tuning, protocol upgrades).
    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }
}

impl Session for DgramServerSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn on_session_timeout(&self) {
        self.events
            .on_session_terminated(self.state.peer_address(), TerminationReason::Timeout);
    }

    fn on_session_close(&self) {
        self.events
            .on_session_terminated(self.state.peer_address(), TerminationReason::Disconnect);
    }
}

// Emits fragments to a fixed peer over the shared socket.
struct SocketWriter<'a> {
    socket: &'a DatagramSocket,
    peer: &'a Address,
}

impl OutgoingEvents for SocketWriter<'_> {
    fn on_fragment_ready(&mut self, fragment: &Fragment, _more: bool) -> SocketResult<()> {
        self.socket.send_to(fragment.wire_bytes(), self.peer).map(|_| ())
    }

    fn on_set_max_fragment_size(&mut self, size: usize) {
        log::info!("[DgramServer] send MTU for {} reduced to {}", self.peer, size);
    }
}

// Delivers completed messages into the server's dispatch and repair frames
// back to the peer.
struct SessionInbox<'a> {
    server: &'a DatagramServer,
    session: &'a Arc<DgramServerSession>,
}

impl IncomingEvents for SessionInbox<'_> {
    fn on_complete_message(
        &mut self,
        msg_id: MessageId,
        channel_id: u8,
        payload: &[u8],
        from: &Address,
    ) {
        self.server
            .dispatch_message(self.session, msg_id, channel_id, payload, from);
    }

    fn on_request_fragment(&mut self, fragment: &Fragment) -> SocketResult<()> {
        self.session
            .socket
            .send_to(fragment.wire_bytes(), self.session.state.peer_address())
            .map(|_| ())
    }
}

/// UDP server: bind once, route datagrams to per-peer sessions.
pub struct DatagramServer {
    socket: Arc<DatagramSocket>,
    config: ServerConfig,
    manager: SessionManager<DgramServerSession>,
    // Lock-free routing index; the manager stays the lifecycle owner
    peers: dashmap::DashMap<Address, Arc<DgramServerSession>>,
    events: Arc<dyn ServerEvents>,
    terminate: AtomicBool,
}

impl DatagramServer {
    /// Bind the service socket on `config.port`.
    pub fn bind(config: ServerConfig, events: Arc<dyn ServerEvents>) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|_| Error::InvalidArg("bind address".into()))?;
        let socket = DatagramSocket::bind(addr)?;
        socket.set_receive_timeout(Some(MSG_FLUSH_TIMEOUT / 2))?;
        log::info!(
            "[DgramServer] '{}' listening on udp port {}",
            config.name,
            config.port
        );
        Ok(Self {
            socket: Arc::new(socket),
            config,
            manager: SessionManager::new(),
            peers: dashmap::DashMap::new(),
            events,
            terminate: AtomicBool::new(false),
        })
    }

    /// The live-session registry (timeout knobs live here).
    pub fn session_manager(&self) -> &SessionManager<DgramServerSession> {
        &self.manager
    }

    /// Request the serve loop to exit; safe from any thread.
    pub fn shutdown(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Serve until [`DatagramServer::shutdown`]. Blocks the calling thread.
    ///
    /// Every selector cycle drains ready datagrams, runs the flush tick on
    /// all sessions, and periodically retires dead sessions.
    pub fn run(&self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut selector = Selector::new();
        selector.add_datagram(&self.socket);
        let mut last_cleanup = Instant::now();

        while !self.terminate.load(Ordering::Acquire) {
            match selector.wait_readable(MSG_FLUSH_TIMEOUT / 2)? {
                SelectOutcome::Ready(_) => {
                    // One datagram per cycle; the selector reports again
                    // immediately while the queue is non-empty
                    if let Ok((len, from)) = self.socket.receive_from(&mut buf) {
                        self.handle_datagram(&buf[..len], &from);
                    }
                }
                SelectOutcome::Timeout => {}
            }

            self.tick_sessions();

            if last_cleanup.elapsed() >= self.config.disconnect_timeout / 4 {
                self.manager
                    .cleanup_timed_out_sessions(self.config.disconnect_timeout);
                // Keep the routing index aligned with the surviving set
                self.peers
                    .retain(|peer, _| self.manager.find_by_peer(peer).is_some());
                last_cleanup = Instant::now();
            }
        }

        self.peers.clear();
        self.manager.terminate_sessions();
        log::info!("[DgramServer] '{}' stopped", self.config.name);
        Ok(())
    }

    fn handle_datagram(&self, datagram: &[u8], from: &Address) {
        let session = match self.peers.get(from) {
            Some(existing) => Arc::clone(&existing),
            None => {
                let session = Arc::new(DgramServerSession::new(
                    from.clone(),
                    Arc::clone(&self.socket),
                    Arc::clone(&self.events),
                ));
                session.flow.set_max_fragment_size(self.config.datagram_size);
                match self.manager.register_session(Arc::clone(&session)) {
                    Ok(()) => {
                        self.peers.insert(from.clone(), Arc::clone(&session));
                        session
                    }
                    Err(_) => return, // raced with another packet; next one routes
                }
            }
        };

        session.state.touch();
        let mut inbox = SessionInbox {
            server: self,
            session: &session,
        };
        let mut writer = SocketWriter {
            socket: &self.socket,
            peer: from,
        };
        if let Err(e) =
            session
                .flow
                .process_fragment(datagram, from, &mut inbox, Some(&mut writer))
        {
            log::debug!("[DgramServer] datagram from {} dropped: {:?}", from, e);
        }
    }

    fn tick_sessions(&self) {
        for session in self.manager.snapshot() {
            let mut inbox = SessionInbox {
                server: self,
                session: &session,
            };
            session.flow.tick_notify(&mut inbox);
        }
    }

    fn dispatch_message(
        &self,
        session: &Arc<DgramServerSession>,
        msg_id: MessageId,
        channel_id: u8,
        payload: &[u8],
        from: &Address,
    ) {
        if channel_id == Channel::Service.id() {
            if self.handle_service_message(session, payload, from) {
                return;
            }
        }
        self.events
            .on_message_received(from, channel_id, msg_id, payload);
    }

    // Returns true when the message was handshake traffic consumed here.
    fn handle_service_message(
        &self,
        session: &Arc<DgramServerSession>,
        payload: &[u8],
        from: &Address,
    ) -> bool {
        let Some((opcode, body)) = split_service(payload) else {
            return true; // empty service message: nothing to deliver
        };
        match ServiceOpcode::try_from(opcode) {
            Ok(ServiceOpcode::Discovery) => {
                log::info!("[DgramServer] discovery request from {}", from);
                let descriptor = self.descriptor();
                let wire = encode_service(ServiceOpcode::Discovery, &descriptor);
                if let Err(e) = session.send(Channel::Service, &wire) {
                    log::warn!("[DgramServer] discovery reply to {} failed: {}", from, e);
                }
                true
            }
            Ok(ServiceOpcode::Hello) => {
                self.handle_hello(session, body, from);
                true
            }
            Ok(ServiceOpcode::TerminateSession) => {
                log::info!("[DgramServer] {} requested termination", from);
                session.terminate();
                true
            }
            _ => false,
        }
    }

    fn handle_hello(&self, session: &Arc<DgramServerSession>, body: &[u8], from: &Address) {
        let Some(request) = HelloRequest::from_json(body) else {
            return;
        };
        let negotiated = negotiate_version(
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_CURRENT,
            request.protocol_min_version,
            request.protocol_version,
        );
        let Some(version) = negotiated else {
            log::warn!(
                "[DgramServer] refusing {}: version range [{}, {}] unsupported",
                from,
                request.protocol_min_version,
                request.protocol_version
            );
            let wire = encode_service(ServiceOpcode::ConnectionRefused, &Refusal {});
            let _ = session.send(Channel::Service, &wire);
            return;
        };

        // The session may not send datagrams larger than the client accepts
        let datagram_size = self
            .config
            .datagram_size
            .min(request.max_datagram_size as usize);
        session.flow.set_max_fragment_size(datagram_size);
        session.flow.upgrade_protocol(version);

        log::info!(
            "[DgramServer] hello from {} (device {:?}, platform {}): version {}, datagram {}",
            from,
            request.device_id,
            request.platform_info,
            version,
            datagram_size
        );

        let mut descriptor = self.descriptor();
        descriptor.datagram_size = datagram_size as u32;
        let wire = encode_service(ServiceOpcode::Hello, &descriptor);
        if let Err(e) = session.send(Channel::Service, &wire) {
            log::warn!("[DgramServer] hello response to {} failed: {}", from, e);
        }
    }

    fn descriptor(&self) -> HelloResponse {
        let transports: Vec<&str> = self.config.transports.iter().map(String::as_str).collect();
        HelloResponse::new(
            &self.config.name,
            self.config.port,
            self.config.datagram_size as u32,
        )
        .with_transports(&transports)
    }
}
