//! TCP relay.
//!
//! Accepts client connections, dials the route's backend, writes a PROXY v2
//! header as the very first bytes on the backend stream, then pumps bytes in
//! both directions until either side closes.
//!
//! - One task per accepted connection
//! - Accept errors are logged and the loop keeps going
//! - Dial failures close the client, no retries
//! - The first direction to hit EOF or an error closes both sockets

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use uproxy_proxy_protocol::{ProxyProtocolV2, Transport};

use super::router::RouteSpec;
use crate::error::{RelayError, RelayResult};

/// Default timeout for dialing a backend.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept so persistent errors don't spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const COPY_BUFFER_SIZE: usize = 8192;

/// Configuration for a TCP relay.
#[derive(Debug, Clone)]
pub struct TcpRelayConfig {
    /// Route served by this relay.
    pub route: RouteSpec,
    /// Timeout for dialing the backend.
    pub connect_timeout: Duration,
    /// Log every connection at info level.
    pub verbose: bool,
}

impl TcpRelayConfig {
    /// Create a config with the default connect timeout.
    pub fn new(route: RouteSpec) -> Self {
        Self {
            route,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            verbose: false,
        }
    }
}

/// Statistics for a TCP relay.
#[derive(Debug, Default)]
pub struct TcpRelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being relayed.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Backend dial failures.
    pub backend_failed: AtomicU64,
    /// Bytes relayed to the backend, excluding PROXY headers.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed back to clients.
    pub bytes_from_backend: AtomicU64,
}

/// A TCP listener relaying to a single backend.
pub struct TcpRelay {
    config: TcpRelayConfig,
    listener: TcpListener,
    stats: Arc<TcpRelayStats>,
}

impl TcpRelay {
    /// Bind the route's listen address.
    pub async fn bind(config: TcpRelayConfig) -> RelayResult<Self> {
        let addr = config.route.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;

        info!(
            bind_addr = %listener.local_addr().unwrap_or(addr),
            backend = %config.route.backend(),
            "TCP relay bound"
        );

        Ok(Self {
            config,
            listener,
            stats: Arc::new(TcpRelayStats::default()),
        })
    }

    /// Get the local address this relay is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get relay statistics.
    pub fn stats(&self) -> Arc<TcpRelayStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop. Only returns if the local address is unavailable.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "TCP relay listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let relay = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = relay.handle_connection(stream, peer_addr).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept TCP connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single connection. Both sockets are closed when this returns.
    async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<()> {
        let route = &self.config.route;
        let backend_name = route.backend();

        let dial = TcpStream::connect((route.backend_host.as_str(), route.backend_port));
        let mut backend = match timeout(self.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                error!(backend = %backend_name, error = %e, "Failed to connect to TCP backend");
                return Ok(());
            }
            Err(_) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    backend = %backend_name,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "Timed out connecting to TCP backend"
                );
                return Ok(());
            }
        };
        let backend_addr = backend.peer_addr()?;

        verbose!(
            self.config.verbose,
            client = %peer_addr,
            backend = %backend_addr,
            "New TCP connection"
        );

        let header = ProxyProtocolV2::new(Transport::Tcp, peer_addr, backend_addr)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if let Err(e) = backend.write_all(&header.encode()).await {
            error!(error = %e, "Failed to send PROXY protocol header");
            return Err(e);
        }

        let (bytes_to_backend, bytes_from_backend) =
            proxy_until_closed(&mut client, &mut backend).await;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);

        debug!(
            bytes_to_backend = bytes_to_backend,
            bytes_from_backend = bytes_from_backend,
            "Connection closed"
        );

        Ok(())
    }
}

/// Pump bytes both ways until one direction finishes.
///
/// Returns (bytes_to_backend, bytes_from_backend).
async fn proxy_until_closed(client: &mut TcpStream, backend: &mut TcpStream) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let mut to_backend = 0u64;
    let mut from_backend = 0u64;

    let (direction, result) = tokio::select! {
        r = pump(&mut client_read, &mut backend_write, &mut to_backend) => {
            ("client -> backend", r)
        }
        r = pump(&mut backend_read, &mut client_write, &mut from_backend) => {
            ("backend -> client", r)
        }
    };

    if let Err(e) = result {
        warn!(direction = direction, error = %e, "Relay error");
    }

    (to_backend, from_backend)
}

/// Copy from `reader` to `writer` until EOF, counting bytes into `total`.
async fn pump<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
