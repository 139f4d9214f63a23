//! Outbound address policy
//!
//! Upstream URLs are user supplied, so every host the client talks to must
//! resolve to public addresses only. Hostnames are checked when an upstream
//! is saved and again on every connection through [`PublicOnlyResolver`],
//! which hands reqwest exactly the addresses it validated.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::warn;
use url::{Host, Url};

use crate::error::ProxyError;

const BLOCKED_HOST_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal", ".localdomain"];

/// Whether an address is routable on the public internet
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_ipv4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_public_ipv4(v4),
            None => is_public_ipv6(v6),
        },
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 192.0.0.0/24 protocol assignments
        || (a == 192 && b == 0 && c == 0)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || a >= 240)
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8))
}

fn is_blocked_host_name(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost"
        || !host.contains('.')
        || BLOCKED_HOST_SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
}

/// Check a parsed URL without touching DNS.
///
/// Literal IP hosts are checked here because reqwest never passes them to
/// the resolver.
pub fn check_url(url: &Url, allow_local: bool) -> Result<(), ProxyError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ProxyError::InvalidUrl(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ProxyError::InvalidUrl(
            "credentials must not be embedded in the URL".to_string(),
        ));
    }

    let host = url
        .host()
        .ok_or_else(|| ProxyError::InvalidUrl("missing host".to_string()))?;

    if allow_local {
        return Ok(());
    }

    match host {
        Host::Ipv4(ip) if !is_public_ip(IpAddr::V4(ip)) => {
            Err(ProxyError::BlockedAddress(ip.to_string()))
        }
        Host::Ipv6(ip) if !is_public_ip(IpAddr::V6(ip)) => {
            Err(ProxyError::BlockedAddress(ip.to_string()))
        }
        Host::Domain(name) if is_blocked_host_name(name) => {
            Err(ProxyError::BlockedAddress(name.to_string()))
        }
        _ => Ok(()),
    }
}

/// Resolve a host and require every address to be public
pub async fn resolve_public(host: &str, allow_local: bool) -> Result<Vec<SocketAddr>, ProxyError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProxyError::Resolve(format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ProxyError::Resolve(host.to_string()));
    }

    if !allow_local {
        if let Some(blocked) = addrs.iter().find(|addr| !is_public_ip(addr.ip())) {
            warn!(host = %host, address = %blocked.ip(), "Refusing non-public upstream address");
            return Err(ProxyError::BlockedAddress(format!("{} ({})", host, blocked.ip())));
        }
    }

    Ok(addrs)
}

/// Validate an upstream base URL, resolving its host when it is a name.
///
/// Returns the parsed URL on success.
pub async fn validate_upstream_url(url: &str, allow_local: bool) -> Result<Url, ProxyError> {
    let parsed = Url::parse(url).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;
    check_url(&parsed, allow_local)?;

    if let Some(Host::Domain(name)) = parsed.host() {
        resolve_public(name, allow_local).await?;
    }

    Ok(parsed)
}

/// reqwest resolver that only yields validated public addresses
#[derive(Debug, Clone)]
pub struct PublicOnlyResolver {
    allow_local: bool,
}

impl PublicOnlyResolver {
    pub fn new(allow_local: bool) -> Self {
        Self { allow_local }
    }
}

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let allow_local = self.allow_local;
        Box::pin(async move {
            let addrs = resolve_public(name.as_str(), allow_local).await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}
