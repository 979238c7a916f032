// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Readiness multiplexing over `poll(2)`.
//!
//! The accept and reader loops wait on many sockets at once with a bounded
//! timeout. Sockets in this crate are blocking with socket-level timeouts,
//! so a positive readiness report guarantees the following read call does
//! not stall.

use std::time::Duration;

use crate::net::socket::{map_io_error, SocketError, SocketResult};

/// Outcome of a selector wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// At least one registered socket is ready; indices into the
    /// registration order.
    Ready(Vec<usize>),
    /// The timeout elapsed with nothing ready.
    Timeout,
}

/// Multiplexes readability waits over a set of registered descriptors.
///
/// Registration order defines the indices reported by
/// [`Selector::wait_readable`].
#[derive(Default)]
pub struct Selector {
    fds: Vec<i32>,
}

impl Selector {
    /// Empty selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw descriptor; returns its index.
    pub(crate) fn add_fd(&mut self, fd: i32) -> usize {
        self.fds.push(fd);
        self.fds.len() - 1
    }

    /// Register a datagram socket for readability.
    pub fn add_datagram(&mut self, socket: &crate::net::socket::DatagramSocket) -> usize {
        self.add_fd(socket.raw_fd())
    }

    /// Register a stream socket for readability.
    pub fn add_stream(&mut self, socket: &crate::net::socket::StreamSocket) -> usize {
        self.add_fd(socket.raw_fd())
    }

    /// Register a listening socket for readability (incoming connections).
    pub fn add_listener(&mut self, listener: &crate::net::socket::StreamListener) -> usize {
        self.add_fd(listener.raw_fd())
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Drop all registrations.
    pub fn clear(&mut self) {
        self.fds.clear();
    }

    /// Wait up to `timeout` for any registered socket to become readable.
    ///
    /// EINTR is retried with the remaining time, so a signal never cuts the
    /// wait short.
    pub fn wait_readable(&self, timeout: Duration) -> SocketResult<SelectOutcome> {
        if self.fds.is_empty() {
            return Err(SocketError::SocketNotOpen);
        }

        let mut pollfds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX);

            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, millis)
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(map_io_error(&err));
            }
            if rc == 0 {
                return Ok(SelectOutcome::Timeout);
            }

            let ready: Vec<usize> = pollfds
                .iter()
                .enumerate()
                .filter(|(_, p)| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
                .map(|(i, _)| i)
                .collect();
            return Ok(SelectOutcome::Ready(ready));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::Address;
    use crate::net::socket::DatagramSocket;

    #[test]
    fn test_selector_timeout_when_silent() {
        let socket = DatagramSocket::bind_any().expect("bind");
        let mut selector = Selector::new();
        selector.add_datagram(&socket);
        let outcome = selector
            .wait_readable(Duration::from_millis(40))
            .expect("wait");
        assert_eq!(outcome, SelectOutcome::Timeout);
    }

    #[test]
    fn test_selector_reports_ready_subset() {
        let quiet = DatagramSocket::bind_any().expect("bind quiet");
        let loud = DatagramSocket::bind_any().expect("bind loud");
        let loud_port = loud
            .local_addr()
            .expect("addr")
            .port()
            .expect("port");

        let tx = DatagramSocket::bind_any().expect("bind tx");
        tx.send_to(b"x", &Address::loopback(loud_port)).expect("send");

        let mut selector = Selector::new();
        selector.add_datagram(&quiet); // index 0
        selector.add_datagram(&loud); // index 1

        let outcome = selector
            .wait_readable(Duration::from_secs(2))
            .expect("wait");
        assert_eq!(outcome, SelectOutcome::Ready(vec![1]));
    }

    #[test]
    fn test_selector_empty_is_an_error() {
        let selector = Selector::new();
        let err = selector
            .wait_readable(Duration::from_millis(5))
            .expect_err("empty set");
        assert_eq!(err, SocketError::SocketNotOpen);
    }
}
