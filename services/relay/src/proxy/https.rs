//! HTTPS listener: TLS termination plus Host-routed forwarding.
//!
//! One relay serves every reverse route sharing a listen address. The
//! certificate is picked by SNI from the listener's [`CertTable`]; the
//! decrypted HTTP/1.1 requests are handed to [`ReverseProxy`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn, Instrument};

use super::reverse::ReverseProxy;
use super::sni::{CertResolver, CertTable};
use crate::error::{RelayError, RelayResult};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Default limit for a client to complete the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS-terminating HTTP reverse proxy bound to one listen address.
pub struct HttpsRelay {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    proxy: ReverseProxy,
    table: Arc<CertTable>,
    handshake_timeout: Duration,
    verbose: bool,
}

impl HttpsRelay {
    /// Bind `listen_addr` and serve the domains in `table`.
    pub async fn bind(
        listen_addr: SocketAddr,
        table: Arc<CertTable>,
        verbose: bool,
    ) -> RelayResult<Self> {
        let tls_config = server_config(Arc::clone(&table))?;
        let client = ReverseProxy::default_client()?;

        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: listen_addr,
                source,
            })?;

        info!(
            bind_addr = %listener.local_addr().unwrap_or(listen_addr),
            domains = ?table.domains(),
            "HTTPS relay bound"
        );

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            proxy: ReverseProxy::new(Arc::clone(&table), client, verbose),
            table,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            verbose,
        })
    }

    /// Override the TLS handshake timeout.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Domains served by this listener.
    pub fn table(&self) -> Arc<CertTable> {
        Arc::clone(&self.table)
    }

    /// Run the accept loop. Only returns if the local address is unavailable.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "HTTPS relay listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let relay = Arc::clone(&self);
                    tokio::spawn(
                        async move { relay.serve_connection(stream, peer_addr).await }
                            .instrument(tracing::info_span!("https_connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept HTTPS connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn serve_connection(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        let tls = match timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                warn!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.handshake_timeout.as_millis() as u64,
                    "TLS handshake timed out"
                );
                return;
            }
        };

        verbose!(
            self.verbose,
            client = %peer_addr,
            sni = tls.get_ref().1.server_name().unwrap_or(""),
            "TLS session established"
        );

        let proxy = self.proxy.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { Ok::<_, std::convert::Infallible>(proxy.handle(req, peer_addr).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await
        {
            debug!(error = %e, "HTTP connection error");
        }
    }
}

/// TLS 1.2+ server config resolving certificates from `table`.
fn server_config(table: Arc<CertTable>) -> RelayResult<ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertResolver::new(table)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
