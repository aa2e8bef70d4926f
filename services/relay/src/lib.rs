pub mod config;
pub mod error;
pub mod proxy;
pub mod supervisor;

pub use config::{Config, ProxyConfig, ReverseProxyConfig};
pub use error::{RelayError, RelayResult};
pub use proxy::{
    BackendScheme, CertTable, HttpsRelay, ReverseProxy, ReverseRouteSpec, RouteSpec, TcpRelay,
    TcpRelayConfig, Transport, UdpRelay, UdpRelayConfig,
};
pub use supervisor::{RelaySettings, RelaySupervisor};
