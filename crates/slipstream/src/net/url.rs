// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! `proto://host:port` endpoint parsing.
//!
//! Both the scheme and the port are optional; the caller supplies the
//! defaults (clients default to `udp://…:1235`). IPv6 literals use the
//! usual bracket form: `udp://[::1]:1235`.

use std::fmt;

use crate::{Error, Result};

/// Parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    protocol: String,
    host: String,
    port: u16,
}

impl Url {
    /// Parse `input`, filling in `default_protocol`/`default_port` where the
    /// URL omits them.
    pub fn parse(input: &str, default_protocol: &str, default_port: u16) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidUrl(input.to_string()));
        }

        let (protocol, rest) = match trimmed.find("://") {
            Some(pos) => {
                let scheme = &trimmed[..pos];
                if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(Error::InvalidUrl(input.to_string()));
                }
                (scheme.to_ascii_lowercase(), &trimmed[pos + 3..])
            }
            None => (default_protocol.to_ascii_lowercase(), trimmed),
        };

        let (host, port) = split_host_port(rest, default_port)
            .ok_or_else(|| Error::InvalidUrl(input.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidUrl(input.to_string()));
        }

        Ok(Self {
            protocol,
            host,
            port,
        })
    }

    /// Lower-cased scheme, e.g. `udp` or `tcp`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Host part, without brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port (explicit or defaulted).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Replace the port.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }
}

fn split_host_port(rest: &str, default_port: u16) -> Option<(String, u16)> {
    // Bracketed IPv6 literal
    if let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        let host = &stripped[..close];
        let tail = &stripped[close + 1..];
        if tail.is_empty() {
            return Some((host.to_string(), default_port));
        }
        let port = tail.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }

    match rest.rfind(':') {
        // A second ':' means an unbracketed IPv6 literal; treat the whole
        // thing as the host.
        Some(pos) if rest[..pos].contains(':') => Some((rest.to_string(), default_port)),
        Some(pos) => {
            let port = rest[pos + 1..].parse().ok()?;
            Some((rest[..pos].to_string(), port))
        }
        None => Some((rest.to_string(), default_port)),
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.protocol, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PORT, DEFAULT_PROTOCOL};

    #[test]
    fn test_url_full_form() {
        let url = Url::parse("tcp://10.0.0.5:4455", DEFAULT_PROTOCOL, DEFAULT_PORT)
            .expect("parse");
        assert_eq!(url.protocol(), "tcp");
        assert_eq!(url.host(), "10.0.0.5");
        assert_eq!(url.port(), 4455);
    }

    #[test]
    fn test_url_defaults_applied() {
        let url = Url::parse("streaming-host", DEFAULT_PROTOCOL, DEFAULT_PORT).expect("parse");
        assert_eq!(url.protocol(), "udp");
        assert_eq!(url.host(), "streaming-host");
        assert_eq!(url.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_url_scheme_case_folded() {
        let url = Url::parse("UDP://host:9", DEFAULT_PROTOCOL, DEFAULT_PORT).expect("parse");
        assert_eq!(url.protocol(), "udp");
    }

    #[test]
    fn test_url_ipv6_bracketed() {
        let url = Url::parse("udp://[::1]:7000", DEFAULT_PROTOCOL, DEFAULT_PORT).expect("parse");
        assert_eq!(url.host(), "::1");
        assert_eq!(url.port(), 7000);
        assert_eq!(url.to_string(), "udp://[::1]:7000");
    }

    #[test]
    fn test_url_rejects_garbage() {
        assert!(Url::parse("", DEFAULT_PROTOCOL, DEFAULT_PORT).is_err());
        assert!(Url::parse("://host", DEFAULT_PROTOCOL, DEFAULT_PORT).is_err());
        assert!(Url::parse("udp://host:notaport", DEFAULT_PROTOCOL, DEFAULT_PORT).is_err());
    }

    #[test]
    fn test_url_display_roundtrip() {
        let url = Url::parse("udp://host:1235", DEFAULT_PROTOCOL, DEFAULT_PORT).expect("parse");
        assert_eq!(url.to_string(), "udp://host:1235");
    }
}
