//! Route-level errors.
//!
//! Anything in here ends the task of the route that raised it; the other
//! routes keep running. Per-connection and per-packet failures never surface
//! as a `RelayError`, they are logged where they happen.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that take down a single route.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The backend host name could not be resolved.
    #[error("failed to resolve backend {backend}: {source}")]
    Resolve {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// A bound listener could no longer serve.
    #[error("listener {addr} stopped: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but returned no usable address.
    #[error("no address found for backend {0}")]
    NoBackendAddress(String),

    /// A certificate or key file is unreadable, empty, or mismatched.
    #[error("certificate {path}: {message}")]
    Certificate { path: PathBuf, message: String },

    /// No route on an HTTPS listener could be registered.
    #[error("no usable HTTPS routes for {0}")]
    NoUsableRoutes(SocketAddr),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// HTTP client construction error.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Every route task has exited.
    #[error("all route tasks have stopped")]
    AllRoutesStopped,
}

/// Result alias for route-level operations.
pub type RelayResult<T> = Result<T, RelayError>;
