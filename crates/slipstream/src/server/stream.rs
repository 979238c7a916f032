// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! TCP server.
//!
//! The accept loop blocks in a selector on the listening socket; every
//! accepted connection becomes a [`StreamServerSession`]. A single reader
//! thread drains all session sockets through one selector, reading exactly
//! one framed message per ready socket per pass and retiring dead sessions
//! each iteration. The reader thread exits when the session set drains and
//! is restarted by the next accepted connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN};
use crate::flow::channel::{Channel, ServiceOpcode};
use crate::flow::dgram::MessageId;
use crate::flow::stream::{StreamFlow, StreamFlowError};
use crate::msg::hello::{negotiate_version, HelloRequest, HelloResponse, Refusal};
use crate::msg::{encode_service, split_service};
use crate::net::addr::Address;
use crate::net::selector::{SelectOutcome, Selector};
use crate::net::socket::{SocketResult, StreamListener, StreamSocket};
use crate::server::{ServerConfig, ServerEvents};
use crate::session::{Session, SessionManager, SessionState, TerminationReason};
use crate::{Error, Result};

/// One accepted TCP connection.
pub struct StreamServerSession {
    state: SessionState,
    socket: StreamSocket,
    rx: Mutex<StreamFlow>,
    // Also serves as the per-session send mutex: header and body go out as
    // one buffer under this lock, so concurrent senders cannot interleave
    tx: Mutex<StreamFlow>,
    events: Arc<dyn ServerEvents>,
}

impl StreamServerSession {
    fn new(socket: StreamSocket, events: Arc<dyn ServerEvents>) -> Self {
        let peer = socket.peer_address().clone();
        Self {
            state: SessionState::new(peer),
            socket,
            rx: Mutex::new(StreamFlow::new()),
            tx: Mutex::new(StreamFlow::new()),
            events,
        }
    }

    /// Send one framed message to this peer.
    pub fn send(&self, channel: Channel, body: &[u8]) -> SocketResult<MessageId> {
        let mut tx = self.tx.lock();
        let id = tx.prepare_message(channel, body);
        self.socket.send_all(tx.send_bytes())?;
        Ok(id)
    }

    // Read exactly one framed message; dispatch it through the server.
    fn on_data_available(&self, server: &StreamInner) -> std::result::Result<(), StreamFlowError> {
        let mut rx = self.rx.lock();
        loop {
            match rx.read_and_process(&self.socket) {
                Ok(Some(msg)) => {
                    server.dispatch_message(self, msg.message_id, msg.channel_id, msg.body);
                    return Ok(());
                }
                Ok(None) => continue,
                Err(StreamFlowError::Timeout) => return Ok(()), // re-enter selector
                Err(e) => return Err(e),
            }
        }
    }
}

impl Session for StreamServerSession {
    fn state(&self) -> &SessionState {
        &self.state
    }

    fn on_session_timeout(&self) {
        self.socket.shutdown();
        self.events
            .on_session_terminated(self.state.peer_address(), TerminationReason::Timeout);
    }

    fn on_session_close(&self) {
        self.socket.shutdown();
        self.events
            .on_session_terminated(self.state.peer_address(), TerminationReason::Disconnect);
    }

    fn terminate(&self) {
        self.state.terminate();
        self.socket.shutdown();
    }
}

struct StreamInner {
    listener: StreamListener,
    config: ServerConfig,
    manager: SessionManager<StreamServerSession>,
    events: Arc<dyn ServerEvents>,
    terminate: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// TCP server: accept loop plus one reader thread over all sessions.
pub struct StreamServer {
    inner: Arc<StreamInner>,
}

impl StreamServer {
    /// Bind the listening socket on `config.port`.
    pub fn bind(config: ServerConfig, events: Arc<dyn ServerEvents>) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|_| Error::InvalidArg("bind address".into()))?;
        let listener = StreamListener::bind(addr, 16)?;
        log::info!(
            "[StreamServer] '{}' listening on tcp port {}",
            config.name,
            config.port
        );
        Ok(Self {
            inner: Arc::new(StreamInner {
                listener,
                config,
                manager: SessionManager::new(),
                events,
                terminate: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        })
    }

    /// The live-session registry (timeout knobs live here).
    pub fn session_manager(&self) -> &SessionManager<StreamServerSession> {
        &self.inner.manager
    }

    /// Request shutdown and wake the blocked accept selector.
    pub fn shutdown(&self) {
        self.inner.terminate.store(true, Ordering::Release);
        // A throwaway connection breaks the accept wait immediately
        if let Ok(addr) = self.inner.listener.local_addr() {
            if let Some(sa) = addr.to_socket_addr() {
                let wake = std::net::SocketAddr::new("127.0.0.1".parse().expect("static"), sa.port());
                let _ = std::net::TcpStream::connect_timeout(&wake, Duration::from_millis(200));
            }
        }
    }

    /// Accept connections until shutdown. Blocks the calling thread.
    pub fn run(&self) -> Result<()> {
        let inner = &self.inner;
        let mut selector = Selector::new();
        selector.add_listener(&inner.listener);

        while !inner.terminate.load(Ordering::Acquire) {
            match selector.wait_readable(inner.config.disconnect_timeout)? {
                SelectOutcome::Ready(_) => {
                    if inner.terminate.load(Ordering::Acquire) {
                        break;
                    }
                    match inner.listener.accept() {
                        Ok(socket) => self.register_connection(socket),
                        Err(e) => log::error!("[StreamServer] accept failed: {}", e),
                    }
                }
                SelectOutcome::Timeout => {
                    inner
                        .manager
                        .cleanup_timed_out_sessions(inner.config.disconnect_timeout);
                }
            }
        }

        // Shutting the session sockets down wakes the reader's selector;
        // it then sees the terminate flag and exits
        inner.manager.terminate_sessions();
        let handle = inner.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        log::info!("[StreamServer] '{}' stopped", inner.config.name);
        Ok(())
    }

    fn register_connection(&self, socket: StreamSocket) {
        let inner = &self.inner;
        if let Err(e) = socket.set_receive_timeout(Some(inner.config.disconnect_timeout)) {
            log::error!("[StreamServer] socket setup failed: {}", e);
            return;
        }
        let session = Arc::new(StreamServerSession::new(socket, Arc::clone(&inner.events)));
        let peer = session.state.peer_address().clone();
        if inner.manager.register_session(Arc::clone(&session)).is_err() {
            log::warn!("[StreamServer] duplicate connection from {}", peer);
            return;
        }
        log::info!("[StreamServer] session established with {}", peer);
        self.ensure_reader_running();
    }

    fn ensure_reader_running(&self) {
        let mut reader = self.inner.reader.lock();
        let running = reader.as_ref().is_some_and(|h| !h.is_finished());
        if running {
            return;
        }
        if let Some(done) = reader.take() {
            let _ = done.join();
        }
        let inner = Arc::clone(&self.inner);
        *reader = Some(
            std::thread::Builder::new()
                .name("slipstream-reader".to_string())
                .spawn(move || reader_loop(&inner))
                .expect("reader thread spawn"),
        );
    }
}

// Drain ready session sockets until the set empties or the server stops.
fn reader_loop(inner: &StreamInner) {
    log::debug!("[StreamServer] reader thread started");
    loop {
        if inner.terminate.load(Ordering::Acquire) {
            break;
        }
        let sessions = inner.manager.snapshot();
        if sessions.is_empty() {
            // Restarted by the next accepted connection
            log::debug!("[StreamServer] no sessions, reader thread exiting");
            break;
        }

        let mut selector = Selector::new();
        for session in &sessions {
            selector.add_stream(&session.socket);
        }

        // Bounded wait: short enough that shutdown and cleanup stay
        // responsive, long enough not to spin
        let wait = inner
            .config
            .disconnect_timeout
            .min(Duration::from_millis(500));
        match selector.wait_readable(wait) {
            Ok(SelectOutcome::Ready(ready)) => {
                for index in ready {
                    let session = &sessions[index];
                    if session.state.is_terminated() {
                        continue;
                    }
                    match session.on_data_available(inner) {
                        Ok(()) => session.state.touch(),
                        Err(StreamFlowError::ConnectionTerminated) => {
                            log::info!(
                                "[StreamServer] connection to {} terminated",
                                session.state.peer_address()
                            );
                            session.terminate();
                        }
                        Err(StreamFlowError::Timeout) => {}
                    }
                }
            }
            Ok(SelectOutcome::Timeout) => {}
            Err(e) => {
                log::error!("[StreamServer] reader selector failed: {}", e);
                break;
            }
        }

        inner
            .manager
            .cleanup_timed_out_sessions(inner.config.disconnect_timeout);
    }
    log::debug!("[StreamServer] reader thread stopped");
}

impl StreamInner {
    fn dispatch_message(
        &self,
        session: &StreamServerSession,
        msg_id: MessageId,
        channel_id: u8,
        body: &[u8],
    ) {
        if channel_id == Channel::Service.id() && self.handle_service_message(session, body) {
            return;
        }
        self.events
            .on_message_received(session.state.peer_address(), channel_id, msg_id, body);
    }

    // Returns true when the message was handshake traffic consumed here.
    fn handle_service_message(&self, session: &StreamServerSession, payload: &[u8]) -> bool {
        let Some((opcode, body)) = split_service(payload) else {
            return true;
        };
        match ServiceOpcode::try_from(opcode) {
            Ok(ServiceOpcode::Hello) | Ok(ServiceOpcode::Discovery) => {
                self.handle_hello(session, body);
                true
            }
            Ok(ServiceOpcode::TerminateSession) => {
                log::info!(
                    "[StreamServer] {} requested termination",
                    session.state.peer_address()
                );
                session.terminate();
                true
            }
            _ => false,
        }
    }

    fn handle_hello(&self, session: &StreamServerSession, body: &[u8]) {
        let peer = session.state.peer_address();
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
                "[StreamServer] refusing {}: version range [{}, {}] unsupported",
                peer,
                request.protocol_min_version,
                request.protocol_version
            );
            let wire = encode_service(ServiceOpcode::ConnectionRefused, &Refusal {});
            let _ = session.send(Channel::Service, &wire);
            return;
        };

        log::info!(
            "[StreamServer] hello from {} (device {:?}): version {}",
            peer,
            request.device_id,
            version
        );
        let transports: Vec<&str> = self.config.transports.iter().map(String::as_str).collect();
        let descriptor = HelloResponse::new(
            &self.config.name,
            self.config.port,
            self.config.datagram_size as u32,
        )
        .with_transports(&transports);
        let wire = encode_service(ServiceOpcode::Hello, &descriptor);
        if let Err(e) = session.send(Channel::Service, &wire) {
            log::warn!("[StreamServer] hello response to {} failed: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::stream::StreamFlow;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<(u8, Vec<u8>)>>,
    }

    impl ServerEvents for Recorder {
        fn on_message_received(
            &self,
            _peer: &Address,
            channel_id: u8,
            _msg_id: MessageId,
            body: &[u8],
        ) {
            self.messages.lock().push((channel_id, body.to_vec()));
        }
    }

    #[test]
    fn test_stream_server_handshake_and_message() {
        let events = Arc::new(Recorder::default());
        let config = ServerConfig {
            name: "tcp-test".into(),
            port: 42613,
            datagram_size: 1400,
            disconnect_timeout: Duration::from_secs(2),
            transports: vec!["TCP".into()],
        };
        let server = Arc::new(StreamServer::bind(config, events.clone()).expect("bind"));
        let runner = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.run())
        };

        // Plain client: connect, HELLO, read response, send app message
        let client = StreamSocket::connect(
            "127.0.0.1:42613".parse().expect("addr"),
            Duration::from_secs(2),
        )
        .expect("connect");
        client
            .set_receive_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");

        let mut tx = StreamFlow::new();
        let hello = encode_service(
            ServiceOpcode::Hello,
            &HelloRequest::new("tcp-probe", 1400),
        );
        tx.prepare_message(Channel::Service, &hello);
        client.send_all(tx.send_bytes()).expect("send hello");

        let mut rx = StreamFlow::new();
        let response = loop {
            match rx.read_and_process(&client) {
                Ok(Some(msg)) => break msg.body.to_vec(),
                Ok(None) | Err(StreamFlowError::Timeout) => continue,
                Err(e) => panic!("handshake read failed: {:?}", e),
            }
        };
        let (opcode, body) = split_service(&response).expect("service");
        assert_eq!(opcode, ServiceOpcode::Hello as u8);
        let descriptor = HelloResponse::from_json(body).expect("descriptor");
        assert_eq!(descriptor.server_name, "tcp-test");
        assert_eq!(descriptor.transports(), vec!["TCP".to_string()]);

        // Application data reaches the callbacks
        tx.prepare_message(Channel::SensorsIn, b"input-frame");
        client.send_all(tx.send_bytes()).expect("send app");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while events.messages.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        {
            let messages = events.messages.lock();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].0, Channel::SensorsIn.id());
            assert_eq!(messages[0].1, b"input-frame");
        }

        server.shutdown();
        runner.join().expect("runner").expect("run result");
    }
}
