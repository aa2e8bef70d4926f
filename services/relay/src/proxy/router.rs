//! Route definitions.
//!
//! Routes are built once from configuration at startup and never mutated.
//! - L4 routes bind a listen address to a single backend host and port
//! - L7 routes bind a TLS listener port to a certificate and an HTTP origin
//! - Hostnames are normalized to lowercase with the trailing dot trimmed

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::net::lookup_host;
use uproxy_proxy_protocol::Transport;

use crate::error::{RelayError, RelayResult};

/// A layer 4 route: one listener forwarding to one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Address the relay listens on.
    pub listen_addr: SocketAddr,
    /// Backend host name or IP literal.
    pub backend_host: String,
    /// Backend port.
    pub backend_port: u16,
    /// TCP or UDP.
    pub transport: Transport,
}

impl RouteSpec {
    /// Create a route from `listen_addr` to `backend_host:backend_port`.
    pub fn new(
        listen_addr: SocketAddr,
        backend_host: impl Into<String>,
        backend_port: u16,
        transport: Transport,
    ) -> Self {
        Self {
            listen_addr,
            backend_host: backend_host.into(),
            backend_port,
            transport,
        }
    }

    /// `host:port` of the backend, for logging and dialing.
    pub fn backend(&self) -> String {
        join_host_port(&self.backend_host, self.backend_port)
    }

    /// Resolve the backend to a socket address, preferring IPv4.
    pub async fn resolve_backend(&self) -> RelayResult<SocketAddr> {
        let addrs: Vec<SocketAddr> = lookup_host((self.backend_host.as_str(), self.backend_port))
            .await
            .map_err(|source| RelayError::Resolve {
                backend: self.backend(),
                source,
            })?
            .collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| RelayError::NoBackendAddress(self.backend()))
    }
}

/// Scheme used to reach an L7 backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendScheme {
    Http,
    Https,
}

impl BackendScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendScheme::Http => "http",
            BackendScheme::Https => "https",
        }
    }
}

impl fmt::Display for BackendScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(BackendScheme::Http),
            "https" => Ok(BackendScheme::Https),
            other => Err(format!("unsupported backend protocol '{}'", other)),
        }
    }
}

/// A layer 7 route: TLS termination followed by HTTP forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseRouteSpec {
    /// Address of the TLS listener. Routes sharing it share one SNI table.
    pub listen_addr: SocketAddr,
    /// PEM certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
    /// Backend authority (`host` or `host:port`).
    pub backend_host: String,
    /// Backend scheme.
    pub backend_scheme: BackendScheme,
    /// Domain override; defaults to the host part of `backend_host`.
    pub domain: Option<String>,
}

impl ReverseRouteSpec {
    /// Key this route registers under in the SNI table.
    pub fn domain_key(&self) -> String {
        match &self.domain {
            Some(domain) => normalize_hostname(domain),
            None => normalize_hostname(host_without_port(self.backend_host.trim())),
        }
    }
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname
        .trim()
        .to_lowercase()
        .trim_end_matches('.')
        .to_string()
}

/// Strip a trailing `:port` from an authority, unwrapping IPv6 brackets.
pub fn host_without_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match authority.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit())
                && !host.contains(':') =>
        {
            host
        }
        _ => authority,
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
