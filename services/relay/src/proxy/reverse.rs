//! HTTP forwarding behind TLS termination.
//!
//! Requests are routed by their `Host` header, independently of the SNI
//! name the TLS session negotiated. For a matched host the request is sent
//! to the registered origin with:
//! - scheme and authority replaced by the backend's
//! - method, path, query and body preserved
//! - `Host` set to the backend host
//! - `X-Real-IP` set to the peer IP and the peer IP appended to
//!   `X-Forwarded-For`
//!
//! Unknown hosts get `404 Unknown host`; backend failures get
//! `502 Bad Gateway`. The backend response is streamed back.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyDataStream, BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error, warn};

use super::router::{host_without_port, normalize_hostname};
use super::sni::CertTable;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body produced by the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that only apply to a single transport hop.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Host-routed HTTP forwarder.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    table: Arc<CertTable>,
    client: reqwest::Client,
    verbose: bool,
}

impl ReverseProxy {
    pub fn new(table: Arc<CertTable>, client: reqwest::Client, verbose: bool) -> Self {
        Self {
            table,
            client,
            verbose,
        }
    }

    /// Client suitable for forwarding: redirects are handed back to the
    /// caller untouched and system proxy settings are ignored.
    pub fn default_client() -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
    }

    /// Handle one request from `peer`.
    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let Some(host) = request_host(&parts.headers, &parts.uri) else {
            warn!(peer = %peer, "Request without Host");
            return text_response(StatusCode::NOT_FOUND, "Unknown host");
        };

        let Some(entry) = self.table.lookup(&host) else {
            debug!(peer = %peer, host = %host, "Unknown host");
            return text_response(StatusCode::NOT_FOUND, "Unknown host");
        };

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = entry.target.url_for(path_and_query);

        verbose!(
            self.verbose,
            peer = %peer,
            method = %parts.method,
            host = %host,
            upstream = %url,
            "Forwarding request"
        );

        let headers = match forwarded_headers(&parts.headers, peer.ip(), &entry.target.host) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(host = %entry.target.host, error = %e, "Invalid backend host header");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let mut upstream = self
            .client
            .request(parts.method, url.as_str())
            .headers(headers);
        if !body.is_end_stream() {
            upstream = upstream.body(reqwest::Body::wrap_stream(BodyDataStream::new(body)));
        }

        match upstream.send().await {
            Ok(response) => stream_response(response),
            Err(e) => {
                error!(upstream = %url, error = %e, "Backend request failed");
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

/// Lower-cased request host without port, from `Host` or the URI authority.
pub(crate) fn request_host(headers: &HeaderMap, uri: &hyper::Uri) -> Option<String> {
    let authority = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))?;

    let host = normalize_hostname(host_without_port(authority.trim()));
    (!host.is_empty()).then_some(host)
}

/// Build the header set sent to the backend.
pub(crate) fn forwarded_headers(
    incoming: &HeaderMap,
    peer_ip: IpAddr,
    backend_host: &str,
) -> Result<HeaderMap, header::InvalidHeaderValue> {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);

    headers.insert(header::HOST, HeaderValue::from_str(backend_host)?);

    let peer = peer_ip.to_canonical().to_string();
    let prior: Vec<&str> = incoming
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    let forwarded_for = if prior.is_empty() {
        peer.clone()
    } else {
        format!("{}, {}", prior.join(", "), peer)
    };

    headers.insert(X_REAL_IP, HeaderValue::from_str(&peer)?);
    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);

    Ok(headers)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn stream_response(upstream: reqwest::Response) -> Response<ProxyBody> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as BoxError);

    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(format!("{}\n", message)))
        .map_err(|never| match never {})
        .boxed_unsync();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
