// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! The established client session and its message loop.
//!
//! One thread per connection calls the incoming-message wait in a loop.
//! Terminal socket errors tear the session down and fire
//! `on_terminate(Disconnect)`; silence past the disconnect timeout fires
//! `on_terminate(Timeout)`. `terminate()` from any thread stops the loop
//! at its next bounded wait.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{DEFAULT_DISCONNECT_TIMEOUT, MAX_DATAGRAM_SIZE, MSG_FLUSH_TIMEOUT,
    PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN};
use crate::client::{handshake_reply, resolve, Client};
use crate::flow::channel::{Channel, ServiceOpcode};
use crate::flow::dgram::{FlowControl, IncomingEvents, MessageId, OutgoingEvents};
use crate::flow::fragment::Fragment;
use crate::flow::stream::{StreamFlow, StreamFlowError};
use crate::msg::hello::{negotiate_version, HelloRequest, HelloResponse};
use crate::msg::{encode_service, split_service};
use crate::net::addr::Address;
use crate::net::socket::{DatagramSocket, SocketError, SocketResult, StreamSocket};
use crate::net::url::Url;
use crate::session::{SessionState, TerminationReason};
use crate::{Error, Result};

/// Application callbacks of an established client session.
pub trait ClientEvents: Send + Sync {
    /// A logical message arrived from the server.
    fn on_message_received(&self, channel_id: u8, msg_id: MessageId, body: &[u8]);

    /// The session ended. Fires at most once.
    fn on_terminate(&self, reason: TerminationReason) {
        let _ = reason;
    }
}

enum Transport {
    Udp {
        socket: Arc<DatagramSocket>,
        server: Address,
        flow: Arc<FlowControl>,
    },
    Tcp {
        socket: Arc<StreamSocket>,
        tx: Mutex<StreamFlow>,
    },
}

struct ConnInner {
    transport: Transport,
    state: SessionState,
    events: Arc<dyn ClientEvents>,
    descriptor: HelloResponse,
}

/// A connected session; dropping it terminates the message loop.
pub struct ClientConnection {
    inner: Arc<ConnInner>,
    loop_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection").finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Descriptor the server sent in its handshake response.
    pub fn server_descriptor(&self) -> &HelloResponse {
        &self.inner.descriptor
    }

    /// Address of the server peer.
    pub fn peer_address(&self) -> &Address {
        self.inner.state.peer_address()
    }

    /// True once the message loop stopped (or was asked to).
    pub fn is_terminated(&self) -> bool {
        self.inner.state.is_terminated()
    }

    /// Send a logical message to the server.
    pub fn send(&self, channel: Channel, body: &[u8]) -> Result<()> {
        if self.inner.state.is_terminated() {
            return Err(Error::Socket(SocketError::SocketNotOpen));
        }
        match &self.inner.transport {
            Transport::Udp {
                socket,
                server,
                flow,
            } => {
                let mut writer = LoopWriter { socket, peer: server };
                flow.send(body, channel, &mut writer)?;
                Ok(())
            }
            Transport::Tcp { socket, tx } => {
                let mut tx = tx.lock();
                tx.prepare_message(channel, body);
                socket.send_all(tx.send_bytes())?;
                Ok(())
            }
        }
    }

    /// Stop the message loop; safe from any thread, idempotent.
    pub fn terminate(&self) {
        self.inner.state.terminate();
        if let Transport::Tcp { socket, .. } = &self.inner.transport {
            socket.shutdown();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.terminate();
        if let Some(handle) = self.loop_thread.take() {
            let _ = handle.join();
        }
    }
}

// Emits fragments toward the server on the session socket.
struct LoopWriter<'a> {
    socket: &'a DatagramSocket,
    peer: &'a Address,
}

impl OutgoingEvents for LoopWriter<'_> {
    fn on_fragment_ready(&mut self, fragment: &Fragment, _more: bool) -> SocketResult<()> {
        self.socket.send_to(fragment.wire_bytes(), self.peer).map(|_| ())
    }

    fn on_set_max_fragment_size(&mut self, size: usize) {
        log::info!("[Client] send MTU reduced to {}", size);
    }
}

// Routes delivered messages to the application and repair frames back to
// the server.
struct LoopInbox<'a> {
    inner: &'a ConnInner,
    socket: &'a DatagramSocket,
    server: &'a Address,
}

impl IncomingEvents for LoopInbox<'_> {
    fn on_complete_message(
        &mut self,
        msg_id: MessageId,
        channel_id: u8,
        payload: &[u8],
        _from: &Address,
    ) {
        if channel_id == Channel::Service.id() {
            if is_terminate_request(payload) {
                log::info!("[Client] server requested session termination");
                self.inner.state.terminate();
                return;
            }
            if is_handshake_reply(payload) {
                // A retried HELLO can draw a duplicate response; the
                // handshake already completed, so swallow it
                return;
            }
        }
        self.inner
            .events
            .on_message_received(channel_id, msg_id, payload);
    }

    fn on_request_fragment(&mut self, fragment: &Fragment) -> SocketResult<()> {
        self.socket.send_to(fragment.wire_bytes(), self.server).map(|_| ())
    }
}

fn is_terminate_request(payload: &[u8]) -> bool {
    matches!(
        split_service(payload).map(|(op, _)| ServiceOpcode::try_from(op)),
        Some(Ok(ServiceOpcode::TerminateSession))
    )
}

fn is_handshake_reply(payload: &[u8]) -> bool {
    matches!(
        split_service(payload).map(|(op, _)| ServiceOpcode::try_from(op)),
        Some(Ok(ServiceOpcode::Hello))
            | Some(Ok(ServiceOpcode::Discovery))
            | Some(Ok(ServiceOpcode::ConnectionRefused))
    )
}

// ============================================================================
// UDP message loop
// ============================================================================

pub(crate) fn spawn_udp(
    socket: DatagramSocket,
    server: Address,
    flow: FlowControl,
    descriptor: HelloResponse,
    events: Arc<dyn ClientEvents>,
) -> Result<ClientConnection> {
    // The loop's bounded wait doubles as the tick cadence
    socket.set_receive_timeout(Some(MSG_FLUSH_TIMEOUT / 2))?;

    let inner = Arc::new(ConnInner {
        transport: Transport::Udp {
            socket: Arc::new(socket),
            server: server.clone(),
            flow: Arc::new(flow),
        },
        state: SessionState::new(server),
        events,
        descriptor,
    });

    let loop_inner = Arc::clone(&inner);
    let handle = std::thread::Builder::new()
        .name("slipstream-client".to_string())
        .spawn(move || udp_message_loop(&loop_inner))
        .map_err(|_| Error::Fail)?;

    Ok(ClientConnection {
        inner,
        loop_thread: Some(handle),
    })
}

fn udp_message_loop(inner: &ConnInner) {
    let Transport::Udp {
        socket,
        server,
        flow,
    } = &inner.transport
    else {
        return;
    };

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let reason = loop {
        if inner.state.is_terminated() {
            break None;
        }

        let mut inbox = LoopInbox {
            inner,
            socket,
            server,
        };
        match socket.receive_from(&mut buf) {
            Ok((len, from)) => {
                inner.state.touch();
                let mut writer = LoopWriter { socket, peer: server };
                if let Err(e) =
                    flow.process_fragment(&buf[..len], &from, &mut inbox, Some(&mut writer))
                {
                    log::debug!("[Client] datagram dropped: {:?}", e);
                }
            }
            Err(SocketError::ConnectionTimeout) => {}
            Err(e) => {
                log::error!("[Client] socket failed terminally: {}", e);
                break Some(TerminationReason::Disconnect);
            }
        }

        flow.tick_notify(&mut inbox);

        if inner.state.elapsed_since_last_request() > DEFAULT_DISCONNECT_TIMEOUT {
            log::error!("[Client] server silent past the disconnect timeout");
            break Some(TerminationReason::Timeout);
        }
    };

    inner.state.terminate();
    if let Some(reason) = reason {
        inner.events.on_terminate(reason);
    }
    log::debug!("[Client] message loop exited");
}

// ============================================================================
// TCP connect + message loop
// ============================================================================

pub(crate) fn connect_tcp(
    client: &Client,
    url: &Url,
    events: Arc<dyn ClientEvents>,
) -> Result<ClientConnection> {
    let server = resolve(url)?;
    let target = server.to_socket_addr().ok_or(Error::ServerNotAvailable)?;

    let socket = StreamSocket::connect(target, client.timeout).map_err(|e| match e {
        SocketError::ConnectionRefused => Error::ConnectionRefused,
        other => Error::Socket(other),
    })?;
    socket.set_receive_timeout(Some(Duration::from_millis(250)))?;

    // Handshake over the framed stream
    let request = HelloRequest::new(&client.device_id, client.max_datagram_size)
        .with_codecs(client.codecs.clone());
    let hello = encode_service(ServiceOpcode::Hello, &request);

    let mut tx = StreamFlow::new();
    tx.prepare_message(Channel::Service, &hello);
    socket.send_all(tx.send_bytes())?;

    let mut rx = StreamFlow::new();
    let deadline = std::time::Instant::now() + client.timeout;
    let response = loop {
        if std::time::Instant::now() >= deadline {
            return Err(Error::ConnectionTimeout);
        }
        match rx.read_and_process(&socket) {
            Ok(Some(msg)) => {
                if let Some(response) = handshake_reply(msg.body)? {
                    break response;
                }
            }
            Ok(None) | Err(StreamFlowError::Timeout) => continue,
            Err(StreamFlowError::ConnectionTerminated) => {
                return Err(Error::ServerNotAvailable);
            }
        }
    };

    negotiate_version(
        PROTOCOL_VERSION_MIN,
        PROTOCOL_VERSION_CURRENT,
        response.protocol_min_version,
        response.protocol_version,
    )
    .ok_or(Error::ConnectionInvalidVersion)?;

    log::info!(
        "[Client] connected to '{}' at {} over tcp",
        response.server_name,
        server
    );

    let inner = Arc::new(ConnInner {
        transport: Transport::Tcp {
            socket: Arc::new(socket),
            tx: Mutex::new(tx),
        },
        state: SessionState::new(server),
        events,
        descriptor: response,
    });

    let loop_inner = Arc::clone(&inner);
    let handle = std::thread::Builder::new()
        .name("slipstream-client".to_string())
        .spawn(move || tcp_message_loop(&loop_inner, rx))
        .map_err(|_| Error::Fail)?;

    Ok(ClientConnection {
        inner,
        loop_thread: Some(handle),
    })
}

fn tcp_message_loop(inner: &ConnInner, mut rx: StreamFlow) {
    let Transport::Tcp { socket, .. } = &inner.transport else {
        return;
    };

    let reason = loop {
        if inner.state.is_terminated() {
            break None;
        }
        match rx.read_and_process(socket) {
            Ok(Some(msg)) => {
                inner.state.touch();
                if msg.channel_id == Channel::Service.id() {
                    if is_terminate_request(msg.body) {
                        log::info!("[Client] server requested session termination");
                        break Some(TerminationReason::Disconnect);
                    }
                    if is_handshake_reply(msg.body) {
                        continue;
                    }
                }
                inner
                    .events
                    .on_message_received(msg.channel_id, msg.message_id, msg.body);
            }
            Ok(None) => {}
            Err(StreamFlowError::Timeout) => {
                if inner.state.elapsed_since_last_request() > DEFAULT_DISCONNECT_TIMEOUT {
                    log::error!("[Client] server silent past the disconnect timeout");
                    break Some(TerminationReason::Timeout);
                }
            }
            Err(StreamFlowError::ConnectionTerminated) => {
                log::error!("[Client] connection terminated by the server");
                break Some(TerminationReason::Disconnect);
            }
        }
    };

    inner.state.terminate();
    if let Some(reason) = reason {
        inner.events.on_terminate(reason);
    }
    log::debug!("[Client] message loop exited");
}
