//! SSRF and DNS-rebind guard.
//!
//! The fetcher resolves a hostname, classifies every resolved address, and
//! only then dials. The same cache entry is checked again at each redirect
//! hop and retry — a mismatch against the connect-time address invalidates
//! it and, if the new address is private, blocks the request.

use crate::clock::SharedClock;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Loopback,
    LinkLocal,
    PrivateRange,
    Ipv4MappedPrivate,
    DenylistSuffix,
    InternalHostname,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Loopback => "loopback address",
            Self::LinkLocal => "link-local address",
            Self::PrivateRange => "private IP range",
            Self::Ipv4MappedPrivate => "IPv4-mapped private address",
            Self::DenylistSuffix => "denylisted hostname suffix",
            Self::InternalHostname => "well-known internal hostname",
        };
        write!(f, "{s}")
    }
}

const INTERNAL_HOSTNAMES: &[&str] = &["localhost", "metadata.google.internal", "metadata", "instance-data"];

/// Strip a trailing `:port`, lowercase, and check the denylist by suffix with
/// an implied dot boundary (`evil.com` matches `api.evil.com` but not
/// `notevil.com`).
pub fn matches_denylist(host: &str, suffixes: &[String]) -> bool {
    let host = host.split(':').next().unwrap_or(host).to_lowercase();
    suffixes.iter().any(|suffix| {
        let suffix = suffix.to_lowercase();
        host == suffix || host.ends_with(&format!(".{suffix}"))
    })
}

pub fn classify_ip(addr: IpAddr) -> Option<BlockReason> {
    match addr {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

fn classify_v4(v4: Ipv4Addr) -> Option<BlockReason> {
    if v4.is_loopback() {
        return Some(BlockReason::Loopback);
    }
    if v4.is_link_local() {
        return Some(BlockReason::LinkLocal);
    }
    if v4.is_private() || v4.is_broadcast() || v4.is_documentation() {
        return Some(BlockReason::PrivateRange);
    }
    // 100.64.0.0/10 carrier-grade NAT, commonly used for internal cloud metadata hops.
    let octets = v4.octets();
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return Some(BlockReason::PrivateRange);
    }
    None
}

fn classify_v6(v6: Ipv6Addr) -> Option<BlockReason> {
    if v6.is_loopback() {
        return Some(BlockReason::Loopback);
    }
    if let Some(v4) = v6.to_ipv4_mapped() {
        return classify_v4(v4).map(|_| BlockReason::Ipv4MappedPrivate);
    }
    let segments = v6.segments();
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return Some(BlockReason::LinkLocal);
    }
    // fc00::/7 unique local
    if segments[0] & 0xfe00 == 0xfc00 {
        return Some(BlockReason::PrivateRange);
    }
    None
}

/// Check a hostname + resolved address pair against every guard. Either
/// signal blocking (denylist, internal hostname) or address classification
/// (private/loopback/link-local) is sufficient to reject the request.
pub fn check(host: &str, addr: IpAddr, denylist_suffixes: &[String]) -> Result<(), BlockReason> {
    if matches_denylist(host, denylist_suffixes) {
        return Err(BlockReason::DenylistSuffix);
    }
    if INTERNAL_HOSTNAMES.iter().any(|h| host.eq_ignore_ascii_case(h)) {
        return Err(BlockReason::InternalHostname);
    }
    if let Some(reason) = classify_ip(addr) {
        return Err(reason);
    }
    Ok(())
}

#[derive(Clone, Copy)]
struct CacheEntry {
    addr: IpAddr,
    expires_at_millis: u64,
}

/// Caches the resolved address for a host so later redirects/retries can be
/// compared against the address actually dialed (rebind detection).
pub struct ResolvedAddressCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    clock: SharedClock,
}

impl ResolvedAddressCache {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self { entries: DashMap::new(), ttl, clock }
    }

    /// Record the address just dialed. If a different, now-stale entry
    /// existed for this host, it's replaced.
    pub fn record(&self, host: &str, addr: IpAddr) {
        let expires_at_millis = self.clock.now_millis() + self.ttl.as_millis() as u64;
        self.entries.insert(host.to_string(), CacheEntry { addr, expires_at_millis });
    }

    /// Compare `addr` against the cached value for `host`. Returns `Rebind`
    /// if a live cache entry disagrees with the newly observed address.
    pub fn check_rebind(&self, host: &str, addr: IpAddr) -> RebindCheck {
        let now = self.clock.now_millis();
        match self.entries.get(host) {
            Some(entry) if entry.expires_at_millis > now => {
                if entry.addr == addr {
                    RebindCheck::Consistent
                } else {
                    RebindCheck::Mismatch
                }
            }
            _ => RebindCheck::NoCacheEntry,
        }
    }

    pub fn invalidate(&self, host: &str) {
        self.entries.remove(host);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindCheck {
    Consistent,
    Mismatch,
    NoCacheEntry,
}
