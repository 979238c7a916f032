// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 slipstream contributors

//! Broadcast-interface enumeration with a TTL-bounded cache.
//!
//! Querying the interface table can take tens of milliseconds on slow
//! hosts, so the resulting broadcast-address list is cached and refreshed
//! at most once per [`NIC_CACHE_TTL`](crate::config::NIC_CACHE_TTL).
//! The cache is an explicit object injected into each datagram socket -
//! there is no process-wide singleton to initialize.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::NIC_CACHE_TTL;
use crate::net::addr::Address;

struct CacheState {
    addresses: Vec<Address>,
    refreshed_at: Option<Instant>,
    ttl: Duration,
}

/// Cached list of per-interface IPv4 broadcast addresses.
#[derive(Clone)]
pub struct NicCache {
    state: Arc<Mutex<CacheState>>,
}

impl Default for NicCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NicCache {
    /// Create an empty cache with the default TTL.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                addresses: Vec::new(),
                refreshed_at: None,
                ttl: NIC_CACHE_TTL,
            })),
        }
    }

    /// Override the TTL. `Duration::ZERO` forces a fresh enumeration on
    /// every call, which tests use to observe interface changes immediately.
    pub fn set_expiration(&self, ttl: Duration) {
        let mut state = self.state.lock();
        state.ttl = ttl;
        state.refreshed_at = None;
    }

    /// Current broadcast-address list, refreshing it if the TTL elapsed.
    ///
    /// Each returned address has port 0; callers set the target port.
    pub fn broadcast_addresses(&self) -> Vec<Address> {
        let mut state = self.state.lock();
        let stale = match state.refreshed_at {
            None => true,
            Some(at) => at.elapsed() >= state.ttl,
        };
        if stale {
            state.addresses = enumerate_broadcast_addresses();
            state.refreshed_at = Some(Instant::now());
            log::debug!(
                "[NicCache] refreshed, {} broadcast interface(s)",
                state.addresses.len()
            );
        }
        state.addresses.clone()
    }
}

/// Walk the up interfaces and derive each IPv4 subnet's broadcast address.
///
/// Interfaces with a /32 mask (point-to-point) are skipped - they have no
/// broadcast domain. Loopback is kept: it makes single-host discovery work,
/// which both tests and same-machine client/server setups rely on.
fn enumerate_broadcast_addresses() -> Vec<Address> {
    let mut result = Vec::new();
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list,
        Err(err) => {
            log::warn!("[NicCache] interface enumeration failed: {}", err);
            return result;
        }
    };

    for (name, ip) in interfaces {
        let IpAddr::V4(v4) = ip else { continue };
        if v4.is_unspecified() {
            continue;
        }
        let Some(broadcast) = broadcast_for(v4) else {
            continue;
        };
        log::debug!("[NicCache] interface {} -> broadcast {}", name, broadcast);
        result.push(Address::Ip4(SocketAddrV4::new(broadcast, 0)));
    }

    result.sort();
    result.dedup();
    result
}

/// Best-effort broadcast address for an interface IPv4 address.
///
/// The portable interface listing does not expose netmasks, so this assumes
/// the historical class-based mask for the address; loopback maps to itself
/// (sending to 127.0.0.1 reaches local listeners).
fn broadcast_for(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    if ip.is_loopback() {
        return Some(ip);
    }
    let octets = ip.octets();
    let mask: u32 = match octets[0] {
        0..=127 => 0xFF00_0000,   // class A
        128..=191 => 0xFFFF_0000, // class B
        192..=223 => 0xFFFF_FF00, // class C
        _ => return None,         // multicast/reserved
    };
    let raw = u32::from(ip);
    Some(Ipv4Addr::from(raw | !mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_broadcast_for_class_c() {
        assert_eq!(
            broadcast_for(Ipv4Addr::new(192, 168, 1, 7)),
            Some(Ipv4Addr::new(192, 168, 1, 255))
        );
    }

    #[test]
    fn test_nic_broadcast_for_class_a() {
        assert_eq!(
            broadcast_for(Ipv4Addr::new(10, 1, 2, 3)),
            Some(Ipv4Addr::new(10, 255, 255, 255))
        );
    }

    #[test]
    fn test_nic_loopback_maps_to_itself() {
        assert_eq!(
            broadcast_for(Ipv4Addr::LOCALHOST),
            Some(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn test_nic_multicast_rejected() {
        assert_eq!(broadcast_for(Ipv4Addr::new(224, 0, 0, 1)), None);
    }

    #[test]
    fn test_nic_cache_zero_ttl_refreshes() {
        let cache = NicCache::new();
        cache.set_expiration(Duration::ZERO);
        // Two calls must both enumerate without panicking; the result is
        // host-dependent, so only shape is asserted.
        let first = cache.broadcast_addresses();
        let second = cache.broadcast_addresses();
        assert_eq!(first, second);
    }
}
