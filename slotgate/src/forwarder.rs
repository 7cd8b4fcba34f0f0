//! Forwarding of admitted requests to the backend.
//!
//! The forwarder is stateless and never retries: one inbound request produces
//! exactly one backend request, and the backend's status, headers and body are
//! handed back unchanged (minus hop-by-hop headers).

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::Response;
use reqwest::Url;

/// Upper bound on buffered request bodies.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that only describe the hop between two peers and must not be
/// relayed by a proxy.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to read request body: {0}")]
    ReadRequestBody(String),
    #[error("backend unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("backend request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("failed to read backend response: {0}")]
    ReadResponseBody(#[source] reqwest::Error),
}

impl ForwardError {
    fn from_send(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ForwardError::Unreachable(e)
        } else {
            ForwardError::Transport(e)
        }
    }

    /// Status returned to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ForwardError::ReadRequestBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Delivers one admitted request to the backend.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: Request) -> Result<Response, ForwardError>;
}

/// `Forwarder` that relays requests over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: reqwest::Client,
    backend: Url,
}

impl ProxyForwarder {
    pub fn new(backend: Url) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { client, backend })
    }
}

#[async_trait::async_trait]
impl Forwarder for ProxyForwarder {
    async fn forward(&self, request: Request) -> Result<Response, ForwardError> {
        let (parts, body) = request.into_parts();
        let url = backend_url(&self.backend, &parts.uri);

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
            .await
            .map_err(|e| ForwardError::ReadRequestBody(e.to_string()))?;

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // Recomputed by reqwest from the buffered body.
        headers.remove(header::CONTENT_LENGTH);
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            append_forwarded_for(&mut headers, *peer);
        }

        tracing::trace!(%url, method = %parts.method, "Sending request to backend");

        let backend_response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(ForwardError::from_send)?;

        let status = backend_response.status();
        let mut headers = backend_response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = backend_response
            .bytes()
            .await
            .map_err(ForwardError::ReadResponseBody)?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Target URL for a request: backend path joined with the request path,
/// queries of both concatenated.
fn backend_url(backend: &Url, uri: &Uri) -> Url {
    let mut url = backend.clone();
    url.set_path(&join_paths(backend.path(), uri.path()));

    let query: Vec<&str> = [backend.query(), uri.query()]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect();
    if query.is_empty() {
        url.set_query(None);
    } else {
        url.set_query(Some(&query.join("&")));
    }
    url
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in `Connection` are hop-by-hop too.
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let client_ip = peer.ip().to_string();
    let value = match headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
