//! Relay engine.
//!
//! This module provides:
//! - TCP relaying with a PROXY v2 header in front of every backend stream
//! - UDP relaying with synthesized per-client sessions
//! - TLS termination with SNI certificate selection and Host-based HTTP
//!   forwarding
//!
//! ## Architecture
//!
//! ```text
//! Client -> TcpRelay  -> PROXY v2 header + byte pump          -> Backend
//! Client -> UdpRelay  -> session table -> dedicated socket    -> Backend
//! Client -> HttpsRelay -> SNI cert table -> Host lookup -> HTTP -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{RouteSpec, TcpRelay, TcpRelayConfig};
//!
//! let route = RouteSpec::new("0.0.0.0:9000".parse()?, "10.0.0.5", 9100, Transport::Tcp);
//! let relay = Arc::new(TcpRelay::bind(TcpRelayConfig::new(route)).await?);
//! relay.run().await?;
//! ```

/// Emit a per-packet or per-connection event: `info` when verbose logging
/// is enabled, `debug` otherwise.
macro_rules! verbose {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::tracing::info!($($arg)+);
        } else {
            ::tracing::debug!($($arg)+);
        }
    };
}

mod https;
mod reverse;
mod router;
mod sni;
mod tcp;
mod udp;

pub use https::{HttpsRelay, DEFAULT_HANDSHAKE_TIMEOUT};
pub use reverse::{ProxyBody, ReverseProxy};
pub use router::{
    host_without_port, normalize_hostname, BackendScheme, ReverseRouteSpec, RouteSpec,
};
pub use sni::{load_certified_key, CertResolver, CertRouteEntry, CertTable, ForwardTarget};
pub use tcp::{TcpRelay, TcpRelayConfig, TcpRelayStats, DEFAULT_CONNECT_TIMEOUT};
pub use udp::{
    is_handshake_marker, rewrite_port, SessionInfo, UdpRelay, UdpRelayConfig, UdpRelayStats,
    DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT,
};
pub use uproxy_proxy_protocol::Transport;
