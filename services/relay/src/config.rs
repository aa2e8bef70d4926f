//! Relay configuration.
//!
//! Loaded from a JSON file with camelCase keys:
//!
//! ```json
//! {
//!   "debugMode": false,
//!   "proxies": [
//!     { "listenPort": 9000, "serverHost": "10.0.0.5", "serverPort": 9100, "protoTCP": true }
//!   ],
//!   "reverseProxies": [
//!     { "listenPort": 443, "certFile": "/etc/ssl/a.pem", "keyFile": "/etc/ssl/a.key",
//!       "serverHost": "a.example.com:8080", "serverProto": "http" }
//!   ]
//! }
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::proxy::{
    BackendScheme, ReverseRouteSpec, RouteSpec, Transport, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_IDLE_TIMEOUT,
};

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Log every connection and datagram at info level.
    #[serde(default)]
    pub debug_mode: bool,

    /// Layer 4 routes.
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    /// TLS-terminating HTTP routes.
    #[serde(default)]
    pub reverse_proxies: Vec<ReverseProxyConfig>,

    /// TCP backend dial timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// UDP session idle timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_idle_timeout_ms: Option<u64>,
}

/// One TCP or UDP route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub listen_port: u16,

    #[serde(default = "default_listen_ip", alias = "listenIP")]
    pub listen_ip: String,

    pub server_host: String,

    pub server_port: u16,

    #[serde(rename = "protoTCP", alias = "protoTcp", default)]
    pub proto_tcp: bool,
}

/// One HTTPS route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseProxyConfig {
    pub listen_port: u16,

    #[serde(default = "default_listen_ip", alias = "listenIP")]
    pub listen_ip: String,

    pub cert_file: PathBuf,

    pub key_file: PathBuf,

    /// Backend authority, `host` or `host:port`.
    pub server_host: String,

    /// `http` or `https`.
    pub server_proto: String,

    /// Domain served; defaults to the host part of `server_host`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

fn default_listen_ip() -> String {
    Ipv4Addr::UNSPECIFIED.to_string()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as indented JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json =
            serde_json::to_string_pretty(self).context("failed to serialize configuration")?;
        json.push('\n');
        fs::write(path, json)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    /// Check every route, reporting the first violation with its index.
    pub fn validate(&self) -> Result<()> {
        for (index, proxy) in self.proxies.iter().enumerate() {
            proxy
                .validate()
                .with_context(|| format!("invalid entry proxies[{}]", index))?;
        }
        for (index, reverse) in self.reverse_proxies.iter().enumerate() {
            reverse
                .validate()
                .with_context(|| format!("invalid entry reverseProxies[{}]", index))?;
        }
        if self.connect_timeout_ms == Some(0) {
            bail!("connectTimeoutMs must be greater than zero");
        }
        if self.udp_idle_timeout_ms == Some(0) {
            bail!("udpIdleTimeoutMs must be greater than zero");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        self.udp_idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn route_count(&self) -> usize {
        self.proxies.len() + self.reverse_proxies.len()
    }

    /// L4 routes in configuration order.
    pub fn routes(&self) -> Result<Vec<RouteSpec>> {
        self.proxies
            .iter()
            .enumerate()
            .map(|(index, proxy)| {
                proxy
                    .to_route()
                    .with_context(|| format!("invalid entry proxies[{}]", index))
            })
            .collect()
    }

    /// L7 routes in configuration order.
    pub fn reverse_routes(&self) -> Result<Vec<ReverseRouteSpec>> {
        self.reverse_proxies
            .iter()
            .enumerate()
            .map(|(index, reverse)| {
                reverse
                    .to_route()
                    .with_context(|| format!("invalid entry reverseProxies[{}]", index))
            })
            .collect()
    }
}

impl ProxyConfig {
    pub fn transport(&self) -> Transport {
        if self.proto_tcp {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.listen_port != 0, "listenPort must be non-zero");
        ensure!(self.server_port != 0, "serverPort must be non-zero");
        ensure!(
            !self.server_host.trim().is_empty(),
            "serverHost must not be empty"
        );
        parse_listen_ip(&self.listen_ip)?;
        Ok(())
    }

    pub fn to_route(&self) -> Result<RouteSpec> {
        let ip = parse_listen_ip(&self.listen_ip)?;
        Ok(RouteSpec::new(
            SocketAddr::new(ip, self.listen_port),
            self.server_host.trim(),
            self.server_port,
            self.transport(),
        ))
    }
}

impl ReverseProxyConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.listen_port != 0, "listenPort must be non-zero");
        ensure!(
            !self.server_host.trim().is_empty(),
            "serverHost must not be empty"
        );
        ensure!(
            !self.cert_file.as_os_str().is_empty(),
            "certFile must not be empty"
        );
        ensure!(
            !self.key_file.as_os_str().is_empty(),
            "keyFile must not be empty"
        );
        self.scheme()?;
        parse_listen_ip(&self.listen_ip)?;
        if let Some(domain) = &self.domain {
            ensure!(!domain.trim().is_empty(), "domain must not be empty");
        }
        Ok(())
    }

    pub fn scheme(&self) -> Result<BackendScheme> {
        self.server_proto
            .parse::<BackendScheme>()
            .map_err(|e| anyhow::anyhow!("serverProto: {}", e))
    }

    pub fn to_route(&self) -> Result<ReverseRouteSpec> {
        let ip = parse_listen_ip(&self.listen_ip)?;
        Ok(ReverseRouteSpec {
            listen_addr: SocketAddr::new(ip, self.listen_port),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            backend_host: self.server_host.trim().to_string(),
            backend_scheme: self.scheme()?,
            domain: self.domain.clone(),
        })
    }
}

fn parse_listen_ip(raw: &str) -> Result<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    raw.parse()
        .with_context(|| format!("listenIp '{}' is not an IP address", raw))
}
