//! Relay supervisor.
//!
//! Starts one task per configured route and watches them. A route that
//! fails to bind or load its certificates logs the failure and ends its own
//! task; the other routes are unaffected. HTTPS routes sharing a listen
//! address are served by a single listener with a shared SNI table.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::proxy::{
    CertRouteEntry, CertTable, HttpsRelay, ReverseRouteSpec, RouteSpec, TcpRelay, TcpRelayConfig,
    Transport, UdpRelay, UdpRelayConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
};

/// Settings applied to every route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    pub udp_idle_timeout: Duration,
    /// Log every connection and datagram at info level.
    pub verbose: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_idle_timeout: DEFAULT_IDLE_TIMEOUT,
            verbose: false,
        }
    }
}

/// Owns the configured routes and the tasks serving them.
#[derive(Debug, Clone)]
pub struct RelaySupervisor {
    routes: Vec<RouteSpec>,
    reverse_routes: Vec<ReverseRouteSpec>,
    settings: RelaySettings,
}

impl RelaySupervisor {
    pub fn new(
        routes: Vec<RouteSpec>,
        reverse_routes: Vec<ReverseRouteSpec>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            routes,
            reverse_routes,
            settings,
        }
    }

    /// Build a supervisor from a validated configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.routes()?,
            config.reverse_routes()?,
            RelaySettings {
                connect_timeout: config.connect_timeout(),
                udp_idle_timeout: config.udp_idle_timeout(),
                verbose: config.debug_mode,
            },
        ))
    }

    /// Run every route until all of them have stopped.
    ///
    /// Returns `Ok(())` immediately when nothing is configured, otherwise
    /// [`RelayError::AllRoutesStopped`] once the last route task exits.
    pub async fn run(self) -> RelayResult<()> {
        let mut tasks: JoinSet<(String, RelayResult<()>)> = JoinSet::new();

        for route in self.routes {
            let name = format!("{:?} {}", route.transport, route.listen_addr);
            let span = tracing::info_span!(
                "route",
                listen = %route.listen_addr,
                transport = ?route.transport
            );
            let settings = self.settings;
            tasks.spawn(
                async move {
                    let result = run_l4_route(route, settings).await;
                    (name, result)
                }
                .instrument(span),
            );
        }

        for (listen_addr, routes) in group_by_listen_addr(self.reverse_routes) {
            let name = format!("HTTPS {}", listen_addr);
            let span = tracing::info_span!("route", listen = %listen_addr, transport = "https");
            let verbose = self.settings.verbose;
            tasks.spawn(
                async move {
                    let result = run_https_listener(listen_addr, routes, verbose).await;
                    (name, result)
                }
                .instrument(span),
            );
        }

        if tasks.is_empty() {
            warn!("No routes configured");
            return Ok(());
        }

        info!(routes = tasks.len(), "Relay started");

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => warn!(route = %name, "Route stopped"),
                Ok((name, Err(e))) => error!(route = %name, error = %e, "Route failed"),
                Err(e) => error!(error = %e, "Route task panicked"),
            }
            if !tasks.is_empty() {
                info!(remaining = tasks.len(), "Routes still running");
            }
        }

        Err(RelayError::AllRoutesStopped)
    }
}

async fn run_l4_route(route: RouteSpec, settings: RelaySettings) -> RelayResult<()> {
    let listen_addr = route.listen_addr;

    match route.transport {
        Transport::Tcp => {
            let mut config = TcpRelayConfig::new(route);
            config.connect_timeout = settings.connect_timeout;
            config.verbose = settings.verbose;

            let relay = Arc::new(TcpRelay::bind(config).await?);
            relay
                .run()
                .await
                .map_err(|source| RelayError::Listener {
                    addr: listen_addr,
                    source,
                })
        }
        Transport::Udp => {
            let mut config = UdpRelayConfig::new(route);
            config.idle_timeout = settings.udp_idle_timeout;
            config.verbose = settings.verbose;

            let relay = Arc::new(UdpRelay::bind(config).await?);
            relay.run().await;
            Ok(())
        }
    }
}

/// Load every route's certificate into a fresh table and serve it.
async fn run_https_listener(
    listen_addr: SocketAddr,
    routes: Vec<ReverseRouteSpec>,
    verbose: bool,
) -> RelayResult<()> {
    let table = Arc::new(build_cert_table(&routes));
    if table.is_empty() {
        return Err(RelayError::NoUsableRoutes(listen_addr));
    }

    let relay = Arc::new(HttpsRelay::bind(listen_addr, table, verbose).await?);
    relay.run().await.map_err(|source| RelayError::Listener {
        addr: listen_addr,
        source,
    })
}

/// Register each route, skipping the ones whose certificate fails to load.
fn build_cert_table(routes: &[ReverseRouteSpec]) -> CertTable {
    let table = CertTable::new();

    for route in routes {
        let entry = match CertRouteEntry::load(route) {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    domain = %route.domain_key(),
                    error = %e,
                    "Failed to load certificate, skipping route"
                );
                continue;
            }
        };

        if table.lookup(&entry.domain).is_some() {
            warn!(domain = %entry.domain, "Duplicate domain on listener, replacing");
        }
        table.register(entry);
    }

    table
}

fn group_by_listen_addr(
    routes: Vec<ReverseRouteSpec>,
) -> BTreeMap<SocketAddr, Vec<ReverseRouteSpec>> {
    let mut groups: BTreeMap<SocketAddr, Vec<ReverseRouteSpec>> = BTreeMap::new();
    for route in routes {
        groups.entry(route.listen_addr).or_default().push(route);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::BackendScheme;
    use std::path::PathBuf;

    fn reverse(listen: &str, host: &str, cert: PathBuf, key: PathBuf) -> ReverseRouteSpec {
        ReverseRouteSpec {
            listen_addr: listen.parse().unwrap(),
            cert_file: cert,
            key_file: key,
            backend_host: host.to_string(),
            backend_scheme: BackendScheme::Http,
            domain: None,
        }
    }

    #[test]
    fn test_group_by_listen_addr() {
        let routes = vec![
            reverse("0.0.0.0:443", "a.test", "a.pem".into(), "a.key".into()),
            reverse("0.0.0.0:8443", "b.test", "b.pem".into(), "b.key".into()),
            reverse("0.0.0.0:443", "c.test", "c.pem".into(), "c.key".into()),
        ];

        let groups = group_by_listen_addr(routes);
        assert_eq!(groups.len(), 2);

        let shared = &groups[&"0.0.0.0:443".parse().unwrap()];
        let hosts: Vec<&str> = shared.iter().map(|r| r.backend_host.as_str()).collect();
        assert_eq!(hosts, vec!["a.test", "c.test"]);
    }

    #[test]
    fn test_cert_table_skips_unloadable_routes() {
        let generated = rcgen::generate_simple_self_signed(vec!["a.test".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("a.pem");
        let key = dir.path().join("a.key");
        std::fs::write(&cert, generated.cert.pem()).unwrap();
        std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();

        let routes = vec![
            reverse("0.0.0.0:443", "a.test:8080", cert, key),
            reverse(
                "0.0.0.0:443",
                "b.test:8080",
                dir.path().join("missing.pem"),
                dir.path().join("missing.key"),
            ),
        ];

        let table = build_cert_table(&routes);
        assert_eq!(table.domains(), vec!["a.test"]);
    }

    #[tokio::test]
    async fn test_https_listener_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let listen: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let routes = vec![reverse(
            "127.0.0.1:0",
            "a.test",
            dir.path().join("missing.pem"),
            dir.path().join("missing.key"),
        )];

        match run_https_listener(listen, routes, false).await {
            Err(RelayError::NoUsableRoutes(addr)) => assert_eq!(addr, listen),
            other => panic!("Expected no usable routes, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_routes_returns_immediately() {
        let supervisor = RelaySupervisor::new(Vec::new(), Vec::new(), RelaySettings::default());
        assert!(supervisor.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_all_routes_failing_stops_supervisor() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let supervisor = RelaySupervisor::new(
            vec![RouteSpec::new(addr, "127.0.0.1", 9, Transport::Tcp)],
            Vec::new(),
            RelaySettings::default(),
        );

        assert!(matches!(
            supervisor.run().await,
            Err(RelayError::AllRoutesStopped)
        ));
    }
}
