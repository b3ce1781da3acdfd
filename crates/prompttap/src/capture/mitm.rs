//! TLS-terminating proxy for cloud AI endpoints
//!
//! Clients reach the proxy through their HTTP proxy setting:
//! - `CONNECT` to an intercept host: TLS is terminated with a minted leaf and
//!   both directions are teed into the pipeline
//! - `CONNECT` to any other host: transparent tunnel, nothing captured
//! - absolute-form plain HTTP: forwarded with the HTTP client, response body
//!   streamed through as it arrives
//!
//! Interception failures never refuse the client; they degrade to a tunnel.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::authority::{CertificateAuthority, INTERCEPT_ALPN};
use super::relay::{relay_with_tap, tunnel};
use super::{
    ConnectionIds, ConnectionOpener, ConnectionTap, Direction, Endpoint, TransportPath, host_in,
};
use crate::config::ProxyConfig;
use crate::error::{Result, TapError};
use crate::pipeline::counters::PipelineCounters;

/// Hop-by-hop headers that are not forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "upgrade",
];

/// Upper bound on a buffered plain-HTTP request body
const MAX_FORWARD_BODY: usize = 32 * 1024 * 1024;

/// What to do with a `CONNECT` target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelDecision {
    /// Terminate TLS and capture
    Intercept,
    /// Tunnel, but note the host in the debug log
    LogOnly,
    /// Tunnel silently
    Passthrough,
}

/// The MITM proxy listener
pub struct MitmProxy {
    config: ProxyConfig,
    authority: Arc<CertificateAuthority>,
    opener: Arc<dyn ConnectionOpener>,
    ids: ConnectionIds,
    upstream_tls: TlsConnector,
    client: reqwest::Client,
    counters: Arc<PipelineCounters>,
}

impl MitmProxy {
    pub fn new(
        config: ProxyConfig,
        authority: Arc<CertificateAuthority>,
        opener: Arc<dyn ConnectionOpener>,
        counters: Arc<PipelineCounters>,
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let upstream_tls = upstream_client_config(roots)?;

        // Never route our own upstream traffic through a system proxy. Only the
        // connect is bounded; long-running exchanges stream for as long as they last.
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(config.upstream_timeout_secs.max(1)))
            .build()
            .map_err(|e| TapError::General(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            authority,
            opener,
            ids: ConnectionIds::new(TransportPath::Mitm),
            upstream_tls: TlsConnector::from(Arc::new(upstream_tls)),
            client,
            counters,
        })
    }

    /// Replace the trust anchors used for upstream TLS
    pub fn with_upstream_roots(mut self, roots: RootCertStore) -> Result<Self> {
        self.upstream_tls = TlsConnector::from(Arc::new(upstream_client_config(roots)?));
        Ok(self)
    }

    pub fn decide(&self, host: &str) -> TunnelDecision {
        if host_in(host, &self.config.intercept_hosts) {
            TunnelDecision::Intercept
        } else if host_in(host, &self.config.log_only_hosts) {
            TunnelDecision::LogOnly
        } else {
            TunnelDecision::Passthrough
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| TapError::Config(format!("Invalid proxy listen address: {e}")))?;

        TcpListener::bind(addr)
            .await
            .map_err(|e| TapError::Bind(format!("Failed to bind proxy to {addr}: {e}")))
    }

    /// Accept clients until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("MITM proxy listening on {addr}");
        }
        tracing::info!(
            "Intercepting {} host patterns",
            self.config.intercept_hosts.len()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("Proxy accept failed: {e}");
                            continue;
                        }
                    };
                    let proxy = self.clone();
                    tokio::spawn(async move { proxy.serve_client(stream, peer).await });
                }
            }
        }

        tracing::info!("MITM proxy stopped accepting connections");
        Ok(())
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let proxy = self.clone();
        let service = hyper::service::service_fn(move |req| {
            let proxy = proxy.clone();
            async move { proxy.route(req).await }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            tracing::debug!(%peer, "Proxy client connection ended: {e}");
        }
    }

    async fn route(self: Arc<Self>, req: Request<Incoming>) -> std::result::Result<Response<Body>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }
        Ok(self.forward_plain(req).await)
    }

    fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<Body> {
        let endpoint = match req
            .uri()
            .authority()
            .and_then(|a| Endpoint::from_authority(a.as_str(), 443))
        {
            Some(endpoint) => endpoint,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_authority",
                    "CONNECT requires host:port",
                );
            }
        };

        let decision = self.decide(&endpoint.host);
        if decision == TunnelDecision::LogOnly {
            tracing::debug!(host = %endpoint.host, "Tunnelling log-only host");
        }

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    self.handle_tunnel(TokioIo::new(upgraded), endpoint, decision)
                        .await
                }
                Err(e) => tracing::debug!("CONNECT upgrade failed: {e}"),
            }
        });

        Response::new(Body::empty())
    }

    async fn handle_tunnel<C>(&self, client: C, endpoint: Endpoint, decision: TunnelDecision)
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if decision != TunnelDecision::Intercept {
            self.passthrough(client, &endpoint).await;
            return;
        }

        // Upstream first: until the client handshake starts, falling back to
        // a raw tunnel is still possible.
        let server_config = match self.authority.server_config(&endpoint.host) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(host = %endpoint.host, "Leaf issuance failed, tunnelling: {e}");
                self.counters.transport_fault();
                self.passthrough(client, &endpoint).await;
                return;
            }
        };

        let upstream = match self.connect_upstream_tls(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(host = %endpoint.host, "Upstream TLS failed, tunnelling: {e}");
                self.counters.transport_fault();
                self.passthrough(client, &endpoint).await;
                return;
            }
        };

        let client_tls = match TlsAcceptor::from(server_config).accept(client).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(host = %endpoint.host, "Client rejected intercepted TLS: {e}");
                self.counters.transport_fault();
                return;
            }
        };

        let connection = self.ids.next();
        tracing::debug!(%connection, host = %endpoint.host, "Intercepting TLS session");
        let tap = self.opener.open(connection, endpoint);
        let stats = relay_with_tap(client_tls, upstream, tap).await;
        tracing::debug!(
            %connection,
            sent = stats.client_to_upstream,
            received = stats.upstream_to_client,
            "Intercepted session closed"
        );
    }

    async fn passthrough<C>(&self, client: C, endpoint: &Endpoint)
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        match self.connect_upstream(endpoint).await {
            Ok(upstream) => {
                tunnel(client, upstream).await;
            }
            Err(e) => {
                tracing::debug!(%endpoint, "Tunnel connect failed: {e}");
                self.counters.transport_fault();
            }
        }
    }

    async fn connect_upstream(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        let timeout = Duration::from_secs(self.config.upstream_timeout_secs.max(1));
        match tokio::time::timeout(
            timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TapError::Io(e)),
            Err(_) => Err(TapError::General(format!("Connect to {endpoint} timed out"))),
        }
    }

    async fn connect_upstream_tls(&self, endpoint: &Endpoint) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| TapError::Tls(format!("Invalid server name {}: {e}", endpoint.host)))?;
        let tcp = self.connect_upstream(endpoint).await?;

        let timeout = Duration::from_secs(self.config.upstream_timeout_secs.max(1));
        match tokio::time::timeout(timeout, self.upstream_tls.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TapError::Tls(format!("Handshake with {endpoint} failed: {e}"))),
            Err(_) => Err(TapError::Tls(format!("Handshake with {endpoint} timed out"))),
        }
    }

    /// Forward an absolute-form plain HTTP request, teeing it when the host is intercepted
    async fn forward_plain(&self, req: Request<Incoming>) -> Response<Body> {
        let target = match Url::parse(&req.uri().to_string()) {
            Ok(url) if url.host_str().is_some() => url,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_url",
                    "Proxy requests must use an absolute URL",
                );
            }
        };
        let host = target.host_str().unwrap_or_default().to_string();
        let endpoint = Endpoint::new(host, target.port_or_known_default().unwrap_or(80));

        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(Body::new(body), MAX_FORWARD_BODY).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_body",
                    &format!("Failed to read request body: {e}"),
                );
            }
        };

        let forwarded_headers = strip_hop_by_hop(&parts.headers);

        let response = match self
            .client
            .request(parts.method.clone(), target.clone())
            .headers(forwarded_headers.clone())
            .body(body.clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.counters.transport_fault();
                let message = if e.is_timeout() {
                    format!("Request timed out: {e}")
                } else if e.is_connect() {
                    format!("Failed to connect to upstream: {e}")
                } else {
                    format!("Request failed: {e}")
                };
                return error_response(StatusCode::BAD_GATEWAY, "upstream_error", &message);
            }
        };

        let status = response.status();
        let response_headers = strip_hop_by_hop(response.headers());
        let upstream_body = Box::pin(response.bytes_stream());

        let response_body = if self.decide(&endpoint.host) == TunnelDecision::Intercept {
            let path_and_query = match target.query() {
                Some(q) => format!("{}?{q}", target.path()),
                None => target.path().to_string(),
            };
            let request_line = format!("{} {path_and_query} HTTP/1.1", parts.method);
            let status_line = format!(
                "HTTP/1.1 {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            );

            let tap = self.opener.open(self.ids.next(), endpoint.clone());
            tap.record(
                Direction::Request,
                serialize_message(&request_line, Some(&endpoint.to_string()), &forwarded_headers, &body),
            )
            .await;
            tap.record(
                Direction::Response,
                serialize_head(&status_line, None, &response_headers, None).freeze(),
            )
            .await;
            Body::from_stream(tee_body(upstream_body, tap))
        } else {
            Body::from_stream(upstream_body)
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in response_headers.iter() {
            builder = builder.header(name, value);
        }
        builder.body(response_body).unwrap_or_else(|e| {
            error_response(
                StatusCode::BAD_GATEWAY,
                "invalid_response",
                &format!("Failed to build response: {e}"),
            )
        })
    }
}

/// Pass body chunks through unchanged while copying each into the tap; the
/// tap is closed when the body ends or fails
fn tee_body<S>(body: S, tap: ConnectionTap) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    futures::stream::unfold(Some((body, tap)), |state| async move {
        let (mut body, tap) = state?;
        match body.next().await {
            Some(Ok(chunk)) => {
                tap.record(Direction::Response, chunk.clone()).await;
                Some((Ok(chunk), Some((body, tap))))
            }
            Some(Err(e)) => {
                tracing::debug!(connection = %tap.connection(), "Upstream body failed: {e}");
                tap.close().await;
                Some((Err(e), None))
            }
            None => {
                tap.close().await;
                None
            }
        }
    })
}

fn upstream_client_config(roots: RootCertStore) -> Result<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TapError::Tls(format!("Unsupported protocol versions: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = INTERCEPT_ALPN.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

/// Re-frame a message head as HTTP/1.1. With `body_len` the content-length
/// header is replaced; without it the upstream framing headers are kept.
fn serialize_head(start_line: &str, host: Option<&str>, headers: &HeaderMap, body_len: Option<usize>) -> BytesMut {
    let mut out = BytesMut::with_capacity(start_line.len() + 256);
    out.extend_from_slice(start_line.as_bytes());
    out.extend_from_slice(b"\r\n");
    if let Some(host) = host {
        out.extend_from_slice(format!("host: {host}\r\n").as_bytes());
    }
    for (name, value) in headers.iter() {
        if body_len.is_some() && name.as_str() == "content-length" {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(len) = body_len {
        out.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Re-frame a fully buffered message with an explicit length
fn serialize_message(start_line: &str, host: Option<&str>, headers: &HeaderMap, body: &Bytes) -> Bytes {
    let mut out = serialize_head(start_line, host, headers, Some(body.len()));
    out.extend_from_slice(body);
    out.freeze()
}

/// Create a JSON error response
fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingOpener, generate_test_ca};

    fn proxy_with(config: ProxyConfig) -> MitmProxy {
        let ca = generate_test_ca();
        let authority = Arc::new(CertificateAuthority::from_pem(&ca.cert_pem, &ca.key_pem, 4).unwrap());
        MitmProxy::new(
            config,
            authority,
            Arc::new(RecordingOpener::new()),
            Arc::new(PipelineCounters::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_decide_by_host_lists() {
        let proxy = proxy_with(ProxyConfig {
            intercept_hosts: vec!["api.openai.com".to_string(), "*.windsurf.ai".to_string()],
            log_only_hosts: vec!["codeium.com".to_string()],
            ..ProxyConfig::default()
        });

        assert_eq!(proxy.decide("api.openai.com"), TunnelDecision::Intercept);
        assert_eq!(proxy.decide("server.windsurf.ai"), TunnelDecision::Intercept);
        assert_eq!(proxy.decide("codeium.com"), TunnelDecision::LogOnly);
        assert_eq!(proxy.decide("example.org"), TunnelDecision::Passthrough);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let stripped = strip_hop_by_hop(&headers);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("content-type"));
    }

    #[test]
    fn test_serialize_message_sets_length() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("content-length", HeaderValue::from_static("999"));

        let bytes = serialize_message(
            "POST /v1/chat HTTP/1.1",
            Some("api.openai.com:80"),
            &headers,
            &Bytes::from_static(b"{}"),
        );
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("POST /v1/chat HTTP/1.1\r\nhost: api.openai.com:80\r\n"));
        assert!(text.contains("content-length: 2\r\n\r\n{}"));
        assert!(!text.contains("999"));
    }

    #[test]
    fn test_serialize_head_keeps_upstream_length() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        let streamed = serialize_head("HTTP/1.1 200 OK", None, &headers, None);
        assert_eq!(
            &streamed[..],
            b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n"
        );

        headers.insert("content-length", HeaderValue::from_static("42"));
        let framed = serialize_head("HTTP/1.1 200 OK", None, &headers, None);
        assert!(framed.ends_with(b"content-length: 42\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_tee_body_copies_chunks_and_closes_tap() {
        use crate::capture::TapMessage;

        let opener = RecordingOpener::new();
        let tap = opener.open(
            ConnectionIds::new(TransportPath::Mitm).next(),
            Endpoint::new("api.openai.com", 80),
        );
        let chunks: Vec<reqwest::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ];
        let passed: Vec<Bytes> = tee_body(futures::stream::iter(chunks), tap)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        assert_eq!(passed.len(), 2);

        let (_, _, mut rx) = opener.take().pop().unwrap();
        let mut captured = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                TapMessage::Captured(event) => captured.push(event.payload),
                TapMessage::Closed { .. } => break,
            }
        }
        assert_eq!(captured, passed);
    }

    #[test]
    fn test_error_response_is_json() {
        let response = error_response(StatusCode::BAD_GATEWAY, "upstream_error", "boom");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
