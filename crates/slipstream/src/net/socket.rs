// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Datagram and stream sockets with a unified error enumeration.
//!
//! All OS error codes are translated exactly once, in [`map_io_error`], so
//! the layers above never see a raw `std::io::Error`. Sockets are built
//! through `socket2` (options: broadcast, address reuse, send/receive
//! timeouts) and then converted into their `std::net` forms for I/O.
//!
//! Datagram sockets are deliberately never `connect`ed - every send goes
//! through `send_to`, which keeps broadcast working on every platform.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::net::addr::Address;
use crate::net::nic::NicCache;

/// Unified socket-level error enumeration.
///
/// This is the only error type the flow-control and session layers consume;
/// see `map_io_error` for the translation from OS codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// The peer reset the connection (RST).
    ConnectionReset,
    /// The connection was aborted locally.
    ConnectionAborted,
    /// A blocking operation ran past its configured timeout.
    ConnectionTimeout,
    /// The peer actively refused the connection.
    ConnectionRefused,
    /// The stream was closed in an orderly fashion.
    ConnectionClosed,
    /// Operation on a socket that is not open.
    SocketNotOpen,
    /// Non-blocking operation would block.
    WouldBlock,
    /// Datagram exceeds what the socket can carry.
    MessageTooBig,
    /// ICMP destination unreachable.
    DestinationUnreachable,
    /// Writing to a stream whose read side is gone.
    EndOfPipe,
    /// Anything the mapping does not recognize.
    UnknownError,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SocketError::ConnectionReset => "connection reset",
            SocketError::ConnectionAborted => "connection aborted",
            SocketError::ConnectionTimeout => "connection timeout",
            SocketError::ConnectionRefused => "connection refused",
            SocketError::ConnectionClosed => "connection closed",
            SocketError::SocketNotOpen => "socket not open",
            SocketError::WouldBlock => "operation would block",
            SocketError::MessageTooBig => "message too big",
            SocketError::DestinationUnreachable => "destination unreachable",
            SocketError::EndOfPipe => "end of pipe",
            SocketError::UnknownError => "unknown socket error",
        };
        f.write_str(text)
    }
}

impl std::error::Error for SocketError {}

/// Result alias for socket operations.
pub type SocketResult<T> = std::result::Result<T, SocketError>;

/// Translate an `io::Error` into the unified enumeration.
///
/// The single point where OS error codes are interpreted.
pub fn map_io_error(err: &io::Error) -> SocketError {
    match err.kind() {
        io::ErrorKind::ConnectionReset => SocketError::ConnectionReset,
        io::ErrorKind::ConnectionAborted => SocketError::ConnectionAborted,
        io::ErrorKind::ConnectionRefused => SocketError::ConnectionRefused,
        io::ErrorKind::TimedOut => SocketError::ConnectionTimeout,
        io::ErrorKind::WouldBlock => SocketError::ConnectionTimeout,
        io::ErrorKind::BrokenPipe => SocketError::EndOfPipe,
        io::ErrorKind::NotConnected => SocketError::SocketNotOpen,
        io::ErrorKind::UnexpectedEof => SocketError::ConnectionClosed,
        _ => match err.raw_os_error() {
            Some(libc::EMSGSIZE) => SocketError::MessageTooBig,
            Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => {
                SocketError::DestinationUnreachable
            }
            Some(libc::EBADF) => SocketError::SocketNotOpen,
            _ => SocketError::UnknownError,
        },
    }
}

// Note: a UDP recv timing out surfaces as WouldBlock on unix; both that and
// TimedOut mean "the bounded wait elapsed", so both map to ConnectionTimeout.
// True non-blocking sockets are not used in this crate.

// ============================================================================
// Datagram socket
// ============================================================================

/// UDP socket with address-based send/receive and interface broadcast.
pub struct DatagramSocket {
    inner: UdpSocket,
    nics: NicCache,
}

impl DatagramSocket {
    /// Bind a datagram socket to `addr`, enabling address reuse and the
    /// broadcast option up front.
    pub fn bind(addr: SocketAddr) -> SocketResult<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| map_io_error(&e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| map_io_error(&e))?;
        socket.set_broadcast(true).map_err(|e| map_io_error(&e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| map_io_error(&e))?;
        log::debug!("[DgramSocket] bound to {}", addr);
        Ok(Self {
            inner: socket.into(),
            nics: NicCache::new(),
        })
    }

    /// Bind to `0.0.0.0` with an OS-assigned ephemeral port.
    pub fn bind_any() -> SocketResult<Self> {
        Self::bind("0.0.0.0:0".parse().expect("static addr"))
    }

    /// Locally bound address.
    pub fn local_addr(&self) -> SocketResult<Address> {
        self.inner
            .local_addr()
            .map(Address::from)
            .map_err(|e| map_io_error(&e))
    }

    /// Bounded-wait configuration for `receive_from`.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(|e| map_io_error(&e))
    }

    /// Bounded-wait configuration for sends.
    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner
            .set_write_timeout(timeout)
            .map_err(|e| map_io_error(&e))
    }

    /// Send one datagram to `to`. The OS write is atomic per datagram.
    pub fn send_to(&self, buf: &[u8], to: &Address) -> SocketResult<usize> {
        let addr = to.to_socket_addr().ok_or(SocketError::UnknownError)?;
        match self.inner.send_to(buf, addr) {
            Ok(n) => Ok(n),
            Err(e) => {
                let mapped = map_io_error(&e);
                log::warn!("[DgramSocket] send_to {} failed: {}", to, mapped);
                Err(mapped)
            }
        }
    }

    /// Receive one datagram; returns the byte count and the sender address.
    pub fn receive_from(&self, buf: &mut [u8]) -> SocketResult<(usize, Address)> {
        match self.inner.recv_from(buf) {
            Ok((n, from)) => Ok((n, Address::from(from))),
            Err(e) => Err(map_io_error(&e)),
        }
    }

    /// Send `buf` once per local interface's broadcast address on `port`.
    ///
    /// The interface list comes from the TTL-bounded [`NicCache`]; call
    /// [`DatagramSocket::set_nic_data_expiration`] with zero to disable the
    /// cache in tests.
    pub fn broadcast(&self, buf: &[u8], port: u16) -> SocketResult<usize> {
        let targets = self.nics.broadcast_addresses();
        if targets.is_empty() {
            log::warn!("[DgramSocket] broadcast: no usable interfaces");
        }
        // One unreachable interface must not silence the others; fail only
        // when every send failed
        let mut sent = None;
        let mut last_err = SocketError::DestinationUnreachable;
        for mut target in targets {
            target.set_port(port);
            match self.send_to(buf, &target) {
                Ok(n) => sent = Some(n),
                Err(e) => last_err = e,
            }
        }
        sent.ok_or(last_err)
    }

    /// Override the NIC cache TTL; `Duration::ZERO` disables caching.
    pub fn set_nic_data_expiration(&self, ttl: Duration) {
        self.nics.set_expiration(ttl);
    }
}

// ============================================================================
// Stream socket
// ============================================================================

/// TCP stream with exact-length send/receive helpers.
pub struct StreamSocket {
    inner: TcpStream,
    peer: Address,
}

impl StreamSocket {
    /// Connect to `addr` within `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> SocketResult<Self> {
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| map_io_error(&e))?;
        stream.set_nodelay(true).map_err(|e| map_io_error(&e))?;
        log::debug!("[StreamSocket] connected to {}", addr);
        Ok(Self {
            inner: stream,
            peer: Address::from(addr),
        })
    }

    fn from_accepted(stream: TcpStream, peer: SocketAddr) -> SocketResult<Self> {
        stream.set_nodelay(true).map_err(|e| map_io_error(&e))?;
        Ok(Self {
            inner: stream,
            peer: Address::from(peer),
        })
    }

    /// Peer address captured at connect/accept time.
    pub fn peer_address(&self) -> &Address {
        &self.peer
    }

    /// Bounded-wait configuration for reads.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(|e| map_io_error(&e))
    }

    /// Bounded-wait configuration for writes.
    pub fn set_send_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner
            .set_write_timeout(timeout)
            .map_err(|e| map_io_error(&e))
    }

    /// Write the entire buffer or fail.
    ///
    /// Takes `&self` (the OS serializes per-fd writes); callers that must
    /// not interleave frames wrap sends in their own mutex.
    pub fn send_all(&self, buf: &[u8]) -> SocketResult<()> {
        (&self.inner).write_all(buf).map_err(|e| map_io_error(&e))
    }

    /// Read some bytes; `Ok(0)` means the peer closed the stream.
    pub fn receive(&self, buf: &mut [u8]) -> SocketResult<usize> {
        (&self.inner).read(buf).map_err(|e| map_io_error(&e))
    }

    /// Read exactly `buf.len()` bytes or fail.
    pub fn receive_all(&self, buf: &mut [u8]) -> SocketResult<()> {
        (&self.inner).read_exact(buf).map_err(|e| map_io_error(&e))
    }

    /// Shut both directions down; subsequent reads observe `ConnectionClosed`.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }

    pub(crate) fn raw_fd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.inner.as_raw_fd()
    }
}

// ============================================================================
// Stream listener
// ============================================================================

/// Listening TCP socket producing [`StreamSocket`]s via `accept`.
pub struct StreamListener {
    inner: TcpListener,
}

impl StreamListener {
    /// Bind and listen with the given backlog.
    pub fn bind(addr: SocketAddr, backlog: i32) -> SocketResult<Self> {
        let domain = Domain::for_address(addr);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| map_io_error(&e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| map_io_error(&e))?;
        socket.bind(&addr.into()).map_err(|e| map_io_error(&e))?;
        socket.listen(backlog).map_err(|e| map_io_error(&e))?;
        log::info!("[StreamListener] listening on {}", addr);
        Ok(Self {
            inner: socket.into(),
        })
    }

    /// Locally bound address (useful with port 0).
    pub fn local_addr(&self) -> SocketResult<Address> {
        self.inner
            .local_addr()
            .map(Address::from)
            .map_err(|e| map_io_error(&e))
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> SocketResult<StreamSocket> {
        let (stream, peer) = self.inner.accept().map_err(|e| map_io_error(&e))?;
        log::debug!("[StreamListener] accepted connection from {}", peer);
        StreamSocket::from_accepted(stream, peer)
    }

    pub(crate) fn raw_fd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.inner.as_raw_fd()
    }
}

impl DatagramSocket {
    pub(crate) fn raw_fd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.inner.as_raw_fd()
    }
}

// ============================================================================
// Unix-domain stream socket
// ============================================================================

/// Unix-domain stream socket, for same-host sessions without the IP stack.
#[cfg(unix)]
pub struct UnixStreamSocket {
    inner: std::os::unix::net::UnixStream,
    peer: Address,
}

#[cfg(unix)]
impl UnixStreamSocket {
    /// Connect to the listening socket at `path`.
    pub fn connect(path: &std::path::Path) -> SocketResult<Self> {
        let stream =
            std::os::unix::net::UnixStream::connect(path).map_err(|e| map_io_error(&e))?;
        Ok(Self {
            inner: stream,
            peer: Address::Unix(path.to_path_buf()),
        })
    }

    /// Peer path captured at connect/accept time.
    pub fn peer_address(&self) -> &Address {
        &self.peer
    }

    /// Bounded-wait configuration for reads.
    pub fn set_receive_timeout(&self, timeout: Option<Duration>) -> SocketResult<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(|e| map_io_error(&e))
    }

    /// Write the entire buffer or fail.
    pub fn send_all(&self, buf: &[u8]) -> SocketResult<()> {
        (&self.inner).write_all(buf).map_err(|e| map_io_error(&e))
    }

    /// Read some bytes; `Ok(0)` means the peer closed the stream.
    pub fn receive(&self, buf: &mut [u8]) -> SocketResult<usize> {
        (&self.inner).read(buf).map_err(|e| map_io_error(&e))
    }

    /// Read exactly `buf.len()` bytes or fail.
    pub fn receive_all(&self, buf: &mut [u8]) -> SocketResult<()> {
        (&self.inner).read_exact(buf).map_err(|e| map_io_error(&e))
    }

    /// Shut both directions down.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }
}

/// Listening unix-domain socket. Removes a stale socket file on bind.
#[cfg(unix)]
pub struct UnixStreamListener {
    inner: std::os::unix::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixStreamListener {
    /// Bind and listen at `path`.
    pub fn bind(path: &std::path::Path) -> SocketResult<Self> {
        let _ = std::fs::remove_file(path);
        let listener =
            std::os::unix::net::UnixListener::bind(path).map_err(|e| map_io_error(&e))?;
        log::info!("[UnixListener] listening on {}", path.display());
        Ok(Self {
            inner: listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> SocketResult<UnixStreamSocket> {
        let (stream, _) = self.inner.accept().map_err(|e| map_io_error(&e))?;
        Ok(UnixStreamSocket {
            inner: stream,
            peer: Address::Unix(self.path.clone()),
        })
    }
}

#[cfg(unix)]
impl Drop for UnixStreamListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
