//! Hostname/literal resolution with a per-host TTL cache and a one-time
//! IPv6 support probe.
//!
//! Ported from `SockUtil::getDomainIP`/`isIpv4`/`support_ipv6`: a literal
//! address is parsed directly (IPv4 first, then IPv6); a hostname goes
//! through the system resolver and the result is cached for a fixed TTL
//! (default 60s per host) rather than re-resolving on every call. This is
//! deliberately not a general-purpose resolver cache: one entry per host,
//! no negative caching, no eviction policy beyond TTL expiry, per the
//! explicit "no DNS caching policy beyond a single TTL entry per host"
//! Non-goal.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::{Lazy, OnceCell};
use snafu::{ResultExt, Snafu};

use crate::error::{CoreError, ErrorCode};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve host {}: {}", host, source))]
    Lookup {
        host: String,
        source: dns_lookup::LookupError,
    },
    #[snafu(display("host {} did not resolve to any address", host))]
    NoAddress { host: String },
}

impl CoreError for Error {
    fn code(&self) -> ErrorCode {
        ErrorCode::Resolve
    }
}

struct CacheEntry {
    addr: IpAddr,
    resolved_at: Instant,
}

static CACHE: Lazy<Mutex<HashMap<String, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static IPV6_SUPPORTED: OnceCell<bool> = OnceCell::new();

/// Probes IPv6 support exactly once per process by opening (and
/// immediately closing) an `AF_INET6`/`SOCK_DGRAM` socket.
pub fn ipv6_supported() -> bool {
    *IPV6_SUPPORTED.get_or_init(|| {
        use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
        match socket(AddressFamily::Inet6, SockType::Datagram, SockFlag::empty(), None) {
            Ok(fd) => {
                let _ = nix::unistd::close(fd);
                true
            }
            Err(_) => false,
        }
    })
}

/// Resolves `host` to a single address, consulting (and populating) the
/// TTL cache for hostnames. Literal IPv4 addresses are parsed directly;
/// literal IPv6 addresses are parsed directly if IPv6 is supported
/// locally.
pub fn resolve_host(host: &str, ttl: Duration) -> Result<IpAddr, Error> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return Ok(IpAddr::V4(v4));
    }
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        if ipv6_supported() {
            return Ok(IpAddr::V6(v6));
        }
    }

    {
        let cache = CACHE.lock().unwrap();
        if let Some(entry) = cache.get(host) {
            if entry.resolved_at.elapsed() < ttl {
                return Ok(entry.addr);
            }
        }
    }

    let addrs = dns_lookup::lookup_host(host).context(LookupSnafu { host })?;
    let chosen = pick_address(&addrs).context(NoAddressSnafu { host })?;

    CACHE.lock().unwrap().insert(
        host.to_string(),
        CacheEntry {
            addr: chosen,
            resolved_at: Instant::now(),
        },
    );
    Ok(chosen)
}

/// Resolves `host` and pairs it with `port`.
pub fn resolve_socket_addr(host: &str, port: u16, ttl: Duration) -> Result<SocketAddr, Error> {
    resolve_host(host, ttl).map(|ip| SocketAddr::new(ip, port))
}

fn pick_address(addrs: &[IpAddr]) -> Option<IpAddr> {
    if ipv6_supported() {
        addrs.iter().copied().next()
    } else {
        addrs
            .iter()
            .copied()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.iter().copied().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_ipv4_resolves_without_lookup() {
        let addr = resolve_host("127.0.0.1", Duration::from_secs(60)).unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn loopback_pairs_with_port() {
        let addr = resolve_socket_addr("127.0.0.1", 9000, Duration::from_secs(60)).unwrap();
        assert_eq!(addr.port(), 9000);
    }
}
