//! SNI certificate table for TLS termination.
//!
//! Every HTTPS listener owns one table mapping a lower-cased domain to the
//! certificate presented for it and the origin requests are forwarded to.
//! The table is filled before the listener serves and only read afterwards:
//! - The TLS resolver looks up the ClientHello server name
//! - The HTTP layer looks up the request `Host`
//!
//! There is no default certificate; an unknown server name fails the
//! handshake.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{error, info, warn};

use super::router::{normalize_hostname, BackendScheme, ReverseRouteSpec};
use crate::error::{RelayError, RelayResult};

/// Origin a domain's requests are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub scheme: BackendScheme,
    /// Authority as configured (`host` or `host:port`).
    pub host: String,
}

impl ForwardTarget {
    /// `scheme://host`.
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Absolute URL for a request path (with query).
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.origin(), path_and_query)
    }
}

/// One registered domain.
#[derive(Clone)]
pub struct CertRouteEntry {
    pub domain: String,
    pub certified_key: Arc<CertifiedKey>,
    pub target: ForwardTarget,
}

impl fmt::Debug for CertRouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertRouteEntry")
            .field("domain", &self.domain)
            .field("certificates", &self.certified_key.cert.len())
            .field("target", &self.target)
            .finish()
    }
}

impl CertRouteEntry {
    /// Load the route's certificate and build its entry.
    pub fn load(route: &ReverseRouteSpec) -> RelayResult<Self> {
        let certified_key = load_certified_key(&route.cert_file, &route.key_file)?;
        Ok(Self {
            domain: route.domain_key(),
            certified_key: Arc::new(certified_key),
            target: ForwardTarget {
                scheme: route.backend_scheme,
                host: route.backend_host.trim().to_string(),
            },
        })
    }
}

/// Domain table shared by the TLS resolver and the request handler.
///
/// Reads load an immutable snapshot and never block; registration swaps in
/// a new snapshot.
pub struct CertTable {
    snapshot: ArcSwap<HashMap<String, Arc<CertRouteEntry>>>,
}

impl CertTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Register (or replace) an entry under its domain.
    pub fn register(&self, entry: CertRouteEntry) {
        let entry = Arc::new(entry);
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(entry.domain.clone(), Arc::clone(&entry));
            next
        });

        info!(
            domain = %entry.domain,
            target = %entry.target.origin(),
            "Registered domain"
        );
    }

    /// Look up a domain (case-insensitive, trailing dot ignored).
    pub fn lookup(&self, domain: &str) -> Option<Arc<CertRouteEntry>> {
        let key = normalize_hostname(domain);
        self.snapshot.load().get(&key).cloned()
    }

    /// Registered domains, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.snapshot.load().keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for CertTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CertTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertTable")
            .field("domains", &self.domains())
            .finish()
    }
}

/// Certificate selection by SNI for rustls.
#[derive(Debug)]
pub struct CertResolver {
    table: Arc<CertTable>,
}

impl CertResolver {
    pub fn new(table: Arc<CertTable>) -> Self {
        Self { table }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            warn!("TLS ClientHello without SNI, no certificate offered");
            return None;
        };

        match self.table.lookup(server_name) {
            Some(entry) => Some(Arc::clone(&entry.certified_key)),
            None => {
                error!(sni = %server_name, "No certificate found for SNI");
                None
            }
        }
    }
}

/// Load a PEM certificate chain and private key, checking that they match.
pub fn load_certified_key(cert_file: &Path, key_file: &Path) -> RelayResult<CertifiedKey> {
    let cert_error = |message: String| RelayError::Certificate {
        path: cert_file.to_path_buf(),
        message,
    };
    let key_error = |message: String| RelayError::Certificate {
        path: key_file.to_path_buf(),
        message,
    };

    let cert_pem = fs::read(cert_file).map_err(|e| cert_error(e.to_string()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| cert_error(format!("invalid PEM: {e}")))?;
    if certs.is_empty() {
        return Err(cert_error("no certificates found".to_string()));
    }

    let key_pem = fs::read(key_file).map_err(|e| key_error(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| key_error(format!("invalid PEM: {e}")))?
        .ok_or_else(|| key_error("no private key found".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| key_error(format!("unsupported private key: {e}")))?;

    let certified_key = CertifiedKey::new(certs, signing_key);
    certified_key
        .keys_match()
        .map_err(|e| key_error(format!("private key does not match certificate: {e}")))?;

    Ok(certified_key)
}
