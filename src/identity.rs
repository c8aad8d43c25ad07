//! Client address resolution from request headers.
//!
//! The address is taken, in order of preference, from `X-Real-IP`, the first
//! entry of `X-Forwarded-For` (which must be a valid IP address) or the
//! socket's remote address. `Client-IP`, `X-Forwarded`, `X-Cluster-Client-IP`,
//! `Forwarded-For` and `Forwarded` are then scanned and the last public
//! address found in them wins.
//!
//! # Spoofing
//!
//! Every one of these headers is client-controlled unless a trusted proxy
//! strips or overwrites it. A client that sets, say, `Client-IP` to a fresh
//! public address on each request gets a fresh allowance each time. Deploy
//! behind a proxy that normalizes these headers if the limit matters.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// Headers whose last public address overrides the primary resolution.
const OVERRIDE_HEADERS: [&str; 5] = [
    "Client-IP",
    "X-Forwarded",
    "X-Cluster-Client-IP",
    "Forwarded-For",
    "Forwarded",
];

/// Label used when the address came from the connection itself.
pub const REMOTE_ADDR: &str = "Remote-Addr";

/// A resolved client address and where it was read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientIp {
    /// Header (or [`REMOTE_ADDR`]) the address came from; empty if none matched
    pub header: String,
    /// The address; may be empty
    pub address: String,
}

/// The request data needed to resolve a client address.
///
/// Header names are case-insensitive. Setting a header twice keeps the last
/// value.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    headers: HashMap<String, String>,
    remote_addr: Option<String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.insert(name.as_ref(), value);
        }
        headers
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }
}

/// Resolve the client address for a request.
pub fn resolve_client_ip(request: &RequestHeaders) -> ClientIp {
    let mut resolved = if let Some(real_ip) = request.get("X-Real-IP") {
        ClientIp {
            header: "X-Real-IP".to_string(),
            address: real_ip.trim().to_string(),
        }
    } else if let Some(forwarded_for) = request.get("X-Forwarded-For") {
        let first = forwarded_for.split(',').next().unwrap_or_default().trim();
        ClientIp {
            header: "X-Forwarded-For".to_string(),
            address: first
                .parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
        }
    } else if let Some(remote) = request.remote_addr() {
        ClientIp {
            header: REMOTE_ADDR.to_string(),
            address: remote.trim().to_string(),
        }
    } else {
        ClientIp::default()
    };

    for header in OVERRIDE_HEADERS {
        let Some(value) = request.get(header) else {
            continue;
        };
        for candidate in value.split(',').map(str::trim) {
            if candidate.parse::<IpAddr>().map(is_public).unwrap_or(false) {
                resolved = ClientIp {
                    header: header.to_string(),
                    address: candidate.to_string(),
                };
            }
        }
    }

    resolved
}

/// Whether `ip` lies outside private and reserved ranges.
pub fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_public_v4(ip),
        IpAddr::V6(ip) => is_public_v6(ip),
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [first, second, ..] = ip.octets();
    let reserved = first == 0
        || first == 127
        || first >= 240
        || (first == 169 && second == 254);
    !(ip.is_private() || reserved)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    let mapped = ip.to_ipv4_mapped().is_some();
    !(ip.is_unspecified() || ip.is_loopback() || unique_local || link_local || mapped)
}
