//! UDP relay with synthesized per-client sessions.
//!
//! UDP has no connection state, so the relay keeps a session per client
//! source port:
//!
//! ```text
//! absent -> active(header pending) -> active(header sent) -> evicted
//! ```
//!
//! - One shared listening socket receives every inbound datagram
//! - Datagrams whose source IP is the backend IP are treated as backend
//!   traffic, everything else as client traffic; a client sharing the
//!   backend's IP is therefore misclassified
//! - Each session owns a dedicated, connected, ephemeral-port socket towards
//!   the backend and a reader task draining it
//! - Sessions idle for longer than the idle timeout are evicted lazily, when
//!   the next datagram touches them; a session that never sees another
//!   datagram is never reaped
//! - A read error on the dedicated socket evicts the session immediately
//!
//! Client datagrams are handled on the listener task while holding the
//! session table lock, which keeps datagrams of one session in order.

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{error, info, warn, Instrument};
use uproxy_proxy_protocol::{ProxyProtocolV2, Transport};

use super::router::RouteSpec;
use crate::error::{RelayError, RelayResult};

/// Sessions idle for longer than this are evicted when next touched.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive buffer size; longer datagrams are truncated.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Configuration for a UDP relay.
#[derive(Debug, Clone)]
pub struct UdpRelayConfig {
    /// Route served by this relay.
    pub route: RouteSpec,
    /// Idle timeout for sessions.
    pub idle_timeout: Duration,
    /// Receive buffer size for both the listener and session sockets.
    pub buffer_size: usize,
    /// Log every datagram at info level.
    pub verbose: bool,
}

impl UdpRelayConfig {
    /// Create a config with default idle timeout and buffer size.
    pub fn new(route: RouteSpec) -> Self {
        Self {
            route,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            verbose: false,
        }
    }
}

/// Statistics for a UDP relay.
#[derive(Debug, Default)]
pub struct UdpRelayStats {
    /// Sessions opened.
    pub sessions_created: AtomicU64,
    /// Sessions evicted (idle, backend error, or send failure).
    pub sessions_evicted: AtomicU64,
    /// Datagrams forwarded to the backend.
    pub packets_to_backend: AtomicU64,
    /// Datagrams forwarded to clients.
    pub packets_to_client: AtomicU64,
    /// Datagrams dropped (no session, stale session, send failure).
    pub packets_dropped: AtomicU64,
}

/// Read-only view of a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Client address the session answers to.
    pub client_addr: SocketAddr,
    /// Local port of the backend-facing socket.
    pub local_port: u16,
    /// Whether the PROXY header went out on this session.
    pub header_sent: bool,
}

/// Per-client state.
struct UdpSession {
    /// Distinguishes a session from a later one on the same client port.
    id: u64,
    client_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    local_port: u16,
    header_sent: bool,
    last_active: Instant,
    reader: AbortHandle,
}

impl UdpSession {
    fn is_expired_at(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_active) > timeout
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            client_addr: self.client_addr,
            local_port: self.local_port,
            header_sent: self.header_sent,
        }
    }

    /// Stop the reader. The socket closes once the last handle drops.
    fn close(self) {
        self.reader.abort();
    }
}

/// A UDP listener relaying to a single backend.
pub struct UdpRelay {
    config: UdpRelayConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    backend_addr: SocketAddr,
    /// Sessions keyed by client source port.
    sessions: Mutex<HashMap<u16, UdpSession>>,
    next_session_id: AtomicU64,
    stats: Arc<UdpRelayStats>,
}

impl UdpRelay {
    /// Resolve the backend and bind the route's listen address.
    pub async fn bind(config: UdpRelayConfig) -> RelayResult<Self> {
        let backend_addr = config.route.resolve_backend().await?;

        let addr = config.route.listen_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;

        info!(
            bind_addr = %local_addr,
            backend = %backend_addr,
            "UDP relay bound"
        );

        Ok(Self {
            config,
            socket: Arc::new(socket),
            local_addr,
            backend_addr,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            stats: Arc::new(UdpRelayStats::default()),
        })
    }

    /// Get the local address this relay is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolved backend address.
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// Get relay statistics.
    pub fn stats(&self) -> Arc<UdpRelayStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of live sessions.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .await
            .values()
            .map(UdpSession::info)
            .collect()
    }

    /// Run the receive loop on the shared socket. Never returns.
    pub async fn run(self: Arc<Self>) {
        info!(bind_addr = %self.local_addr, "UDP relay listening");

        let mut buf = vec![0u8; self.config.buffer_size];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "UDP receive error");
                    continue;
                }
            };

            if n == 0 {
                continue;
            }

            if src.ip().to_canonical() == self.backend_addr.ip().to_canonical() {
                self.handle_backend_datagram(&buf[..n], src).await;
            } else {
                self.handle_client_datagram(&buf[..n], src).await;
            }
        }
    }

    /// Forward a client datagram through the client's session.
    async fn handle_client_datagram(self: &Arc<Self>, data: &[u8], client: SocketAddr) {
        let marker = data[0];
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        verbose!(
            self.config.verbose,
            client = %client,
            packet_type = %format!("0x{:02x}", marker),
            "Packet received from client"
        );

        let stale = sessions
            .get(&client.port())
            .is_some_and(|s| s.is_expired_at(now, self.config.idle_timeout));
        if stale {
            if let Some(session) = sessions.remove(&client.port()) {
                warn!(client = %session.client_addr, "UDP session timed out, evicting");
                self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
                session.close();
            }
        }

        let session = match sessions.entry(client.port()) {
            Entry::Occupied(entry) => {
                let session = entry.into_mut();
                session.last_active = now;
                session
            }
            Entry::Vacant(entry) => match self.open_session(client).await {
                Ok(session) => {
                    info!(
                        client = %client,
                        local_port = session.local_port,
                        "New UDP client"
                    );
                    self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
                    entry.insert(session)
                }
                Err(e) => {
                    error!(
                        client = %client,
                        error = %e,
                        "Failed to open backend socket for client"
                    );
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
        };

        let send_result = if !session.header_sent && is_handshake_marker(marker) {
            let header = match ProxyProtocolV2::new(Transport::Udp, client, self.backend_addr) {
                Ok(header) => header,
                Err(e) => {
                    warn!(
                        client = %client,
                        error = %e,
                        "Cannot build PROXY header, dropping datagram"
                    );
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            info!(client = %client, "Sending PROXY header with handshake datagram");
            session.header_sent = true;
            session.socket.send(&header.prepend_to(data)).await
        } else {
            session.socket.send(data).await
        };

        match send_result {
            Ok(_) => {
                self.stats.packets_to_backend.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(client = %client, error = %e, "Failed to forward datagram to backend");
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(session) = sessions.remove(&client.port()) {
                    self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
                    session.close();
                }
            }
        }
    }

    /// Bind a dedicated backend-facing socket and start its reader.
    async fn open_session(self: &Arc<Self>, client: SocketAddr) -> io::Result<UdpSession> {
        let bind_addr: SocketAddr = if self.backend_addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.backend_addr).await?;
        let local_port = socket.local_addr()?.port();
        let socket = Arc::new(socket);

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let reader = tokio::spawn(
            Arc::clone(self)
                .run_backend_reader(id, client, Arc::clone(&socket))
                .instrument(tracing::info_span!(
                    "udp_session",
                    client = %client,
                    local_port = local_port
                )),
        );

        Ok(UdpSession {
            id,
            client_addr: client,
            socket,
            local_port,
            header_sent: false,
            last_active: Instant::now(),
            reader: reader.abort_handle(),
        })
    }

    /// Drain a session's backend socket towards its client.
    async fn run_backend_reader(
        self: Arc<Self>,
        session_id: u64,
        client: SocketAddr,
        socket: Arc<UdpSocket>,
    ) {
        let mut buf = vec![0u8; self.config.buffer_size];
        loop {
            let n = match socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Backend socket closed or errored, evicting session");
                    self.evict(client.port(), session_id).await;
                    return;
                }
            };

            verbose!(
                self.config.verbose,
                backend = %self.backend_addr,
                packet_type = %buf[..n]
                    .first()
                    .map(|b| format!("0x{:02x}", b))
                    .unwrap_or_default(),
                "Packet received from backend"
            );

            if !self
                .forward_to_client(client.port(), session_id, &buf[..n])
                .await
            {
                return;
            }
        }
    }

    /// Route a backend datagram that arrived on the shared socket.
    ///
    /// The owner is the session whose dedicated socket is bound to the
    /// datagram's source port.
    async fn handle_backend_datagram(&self, data: &[u8], src: SocketAddr) {
        verbose!(
            self.config.verbose,
            backend = %src,
            packet_type = %format!("0x{:02x}", data[0]),
            "Packet received from backend on listener"
        );

        let owner = self
            .sessions
            .lock()
            .await
            .iter()
            .find(|(_, session)| session.local_port == src.port())
            .map(|(client_port, session)| (*client_port, session.id));

        match owner {
            Some((client_port, session_id)) => {
                self.forward_to_client(client_port, session_id, data).await;
            }
            None => {
                warn!(port = src.port(), "No UDP session for backend response port");
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Send a backend datagram to the session's client.
    ///
    /// Returns false when the session is gone or was evicted as stale, in
    /// which case the datagram is dropped.
    async fn forward_to_client(&self, client_port: u16, session_id: u64, data: &[u8]) -> bool {
        let client_addr = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get(&client_port).filter(|s| s.id == session_id) else {
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            };

            if session.is_expired_at(Instant::now(), self.config.idle_timeout) {
                warn!(client = %session.client_addr, "UDP session timed out, closing socket");
                if let Some(session) = sessions.remove(&client_port) {
                    session.close();
                }
                self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            session.client_addr
        };

        let payload = rewrite_port(data, self.backend_addr.port(), self.local_addr.port());
        match self.socket.send_to(&payload, client_addr).await {
            Ok(_) => {
                self.stats.packets_to_client.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(client = %client_addr, error = %e, "Failed to send response to client");
                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        true
    }

    /// Remove a session if it is still the one identified by `session_id`.
    async fn evict(&self, client_port: u16, session_id: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(&client_port)
            .is_some_and(|s| s.id == session_id)
        {
            if let Some(session) = sessions.remove(&client_port) {
                self.stats.sessions_evicted.fetch_add(1, Ordering::Relaxed);
                session.close();
            }
        }
    }
}

/// Whether a leading byte marks a datagram that carries the PROXY header.
///
/// The byte is rendered as two lowercase hex digits and matched against
/// `"01"` and `"05"`, the handshake packet types of the relayed protocol.
pub fn is_handshake_marker(byte: u8) -> bool {
    let hex = format!("{:02x}", byte);
    hex.contains("01") || hex.contains("05")
}

/// Replace every 5-digit occurrence of `backend_port` in a payload with
/// `listen_port`. Payloads are returned untouched when the ports match.
pub fn rewrite_port(payload: &[u8], backend_port: u16, listen_port: u16) -> Cow<'_, [u8]> {
    let old = format!("{:05}", backend_port);
    let new = format!("{:05}", listen_port);
    if old == new {
        return Cow::Borrowed(payload);
    }
    replace_all(payload, old.as_bytes(), new.as_bytes())
}

fn replace_all<'a>(haystack: &'a [u8], needle: &[u8], replacement: &[u8]) -> Cow<'a, [u8]> {
    let mut out: Option<Vec<u8>> = None;
    let mut copied = 0;
    let mut pos = 0;

    while pos + needle.len() <= haystack.len() {
        if &haystack[pos..pos + needle.len()] == needle {
            let buf = out.get_or_insert_with(|| Vec::with_capacity(haystack.len()));
            buf.extend_from_slice(&haystack[copied..pos]);
            buf.extend_from_slice(replacement);
            pos += needle.len();
            copied = pos;
        } else {
            pos += 1;
        }
    }

    match out {
        Some(mut buf) => {
            buf.extend_from_slice(&haystack[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(haystack),
    }
}
