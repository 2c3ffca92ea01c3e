//! Browser origin screening for WebSocket upgrades.
//!
//! Non-browser peers send no `Origin` header and pass. Loopback peers pass
//! regardless. Everything else must present a parseable origin whose host
//! is local, on the private mesh domain, or on the configured allowlist
//! (literal entries, or `*.example.com` suffix wildcards).

use std::net::IpAddr;
use url::Url;

/// Outcome of an origin check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginDecision {
    Allowed,
    Rejected { reason: &'static str },
}

impl OriginDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OriginDecision::Allowed)
    }
}

/// Hostnames that are always acceptable, whatever the allowlist says.
/// `Url::host_str` strips the brackets from IPv6 hosts, so `::1` is the
/// form this list ever sees.
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Private mesh domain suffix (Tailscale-style). Hosts here are reachable
/// only inside the user's own network.
const MESH_SUFFIX: &str = ".ts.net";

#[derive(Debug, Clone, Default)]
pub struct OriginGuard {
    allowed_origins: Vec<String>,
}

impl OriginGuard {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    /// Screen one upgrade attempt.
    pub fn check(&self, peer: IpAddr, origin: Option<&str>) -> OriginDecision {
        if is_loopback(peer) {
            return OriginDecision::Allowed;
        }
        // Non-browser clients (CLIs, native apps) send no Origin header.
        let Some(origin) = origin else {
            return OriginDecision::Allowed;
        };

        let Ok(url) = Url::parse(origin) else {
            return OriginDecision::Rejected {
                reason: "invalid_origin_format",
            };
        };
        let Some(host) = url.host_str() else {
            return OriginDecision::Rejected {
                reason: "invalid_origin_format",
            };
        };

        if LOCAL_HOSTS.contains(&host) || host.ends_with(MESH_SUFFIX) {
            return OriginDecision::Allowed;
        }

        for entry in &self.allowed_origins {
            if let Some(suffix) = entry.strip_prefix("*.") {
                // `*.example.com` matches `a.example.com`, not `example.com`.
                if host.len() > suffix.len() + 1 && host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                {
                    return OriginDecision::Allowed;
                }
            } else if entry == origin || entry == host {
                return OriginDecision::Allowed;
            }
        }

        tracing::warn!(%peer, origin, "rejecting upgrade from unlisted origin");
        OriginDecision::Rejected {
            reason: "origin_not_allowed",
        }
    }
}

/// Loopback per the gateway's definition: 127.0.0.0/8, `::1`, and
/// IPv4-mapped `::ffff:127.0.0.0/104`.
pub fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
    }
}
