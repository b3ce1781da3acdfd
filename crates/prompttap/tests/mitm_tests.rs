//! End-to-end capture through the MITM proxy, over plain HTTP and TLS tunnels

mod common;

use rustls::RootCertStore;
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use prompttap::capture::{CertificateAuthority, LoopbackSniffer, MitmProxy, TransportPath};
use prompttap::config::{Config, LoopbackConfig};
use prompttap::pipeline::Pipeline;
use prompttap::testing::{MemorySink, TestCa, generate_test_ca};

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Here's the \"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"refactored...\"}}]}\n\n",
    "data: [DONE]\n\n",
);

/// Config whose proxy intercepts `hosts`; the pipeline and the proxy share it
fn intercepting(hosts: &[&str]) -> Config {
    let mut config = Config::default();
    config.proxy.listen_addr = "127.0.0.1:0".to_string();
    config.proxy.upstream_timeout_secs = 1;
    config.proxy.intercept_hosts = hosts.iter().map(|h| h.to_string()).collect();
    config
}

struct RunningProxy {
    url: String,
    ca: TestCa,
    shutdown: CancellationToken,
}

async fn start_proxy(
    pipeline: &Arc<Pipeline>,
    config: &Config,
    upstream_roots: Option<RootCertStore>,
) -> RunningProxy {
    let ca = generate_test_ca();
    let authority = Arc::new(CertificateAuthority::from_pem(&ca.cert_pem, &ca.key_pem, 8).unwrap());

    let mut proxy = MitmProxy::new(
        config.proxy.clone(),
        authority,
        pipeline.clone(),
        pipeline.counters().clone(),
    )
    .unwrap();
    if let Some(roots) = upstream_roots {
        proxy = proxy.with_upstream_roots(roots).unwrap();
    }

    let proxy = Arc::new(proxy);
    let listener = proxy.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(proxy.serve(listener, shutdown.clone()));

    RunningProxy {
        url: format!("http://{addr}"),
        ca,
        shutdown,
    }
}

fn client(proxy: &RunningProxy, trusted: &TestCa) -> reqwest::Client {
    reqwest::Client::builder()
        .use_rustls_tls()
        .proxy(reqwest::Proxy::all(&proxy.url).unwrap())
        .add_root_certificate(reqwest::Certificate::from_pem(trusted.cert_pem.as_bytes()).unwrap())
        .build()
        .unwrap()
}

fn chat_request() -> serde_json::Value {
    json!({
        "model": "gpt-4o",
        "stream": true,
        "messages": [{"role": "user", "content": "Refactor this function"}]
    })
}

async fn wait_for_records(sink: &MemorySink, expected: usize) {
    for _ in 0..250 {
        if sink.len().await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// HTTPS server for `localhost` that answers every request with `response`
struct TlsUpstream {
    port: u16,
    ca: TestCa,
    task: JoinHandle<()>,
}

impl TlsUpstream {
    async fn start(response: &'static [u8]) -> Self {
        let ca = generate_test_ca();
        let authority = CertificateAuthority::from_pem(&ca.cert_pem, &ca.key_pem, 2).unwrap();
        let acceptor = TlsAcceptor::from(authority.server_config("localhost").unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    read_request(&mut tls).await;
                    let _ = tls.write_all(response).await;
                    let _ = tls.shutdown().await;
                });
            }
        });

        Self { port, ca, task }
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.cert_der.clone()).unwrap();
        roots
    }

    fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{path}", self.port)
    }
}

impl Drop for TlsUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Read one request with a content-length body
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return buf;
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return buf,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn sse_response() -> &'static [u8] {
    let raw = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{SSE_BODY}"
    );
    Box::leak(raw.into_bytes().into_boxed_slice())
}

#[tokio::test]
async fn test_intercepted_tls_session_becomes_one_record() {
    let upstream = TlsUpstream::start(sse_response()).await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = intercepting(&["localhost"]);
    let pipeline = common::memory_pipeline(config.clone(), sink.clone(), dir.path());
    let proxy = start_proxy(&pipeline, &config, Some(upstream.roots())).await;

    // The client trusts only the proxy's CA, so a completed request proves
    // the tunnel was terminated with a minted leaf.
    let client = client(&proxy, &proxy.ca);
    let response = client
        .post(upstream.url("/v1/chat/completions"))
        .json(&chat_request())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), SSE_BODY);
    drop(client);

    wait_for_records(&sink, 1).await;
    proxy.shutdown.cancel();
    pipeline.shutdown(Duration::from_secs(5)).await;

    let records = sink.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.prompt, "Refactor this function");
    assert_eq!(record.response.as_deref(), Some("Here's the refactored..."));
    assert_eq!(record.prompt_length, 22);
    assert_eq!(record.word_count, 3);
    assert_eq!(record.model, "gpt-4o");
    assert_eq!(record.capture_path, TransportPath::Mitm);
    assert!(!record.pending_reconciliation);

    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.connections_opened, 1);
    assert_eq!(counters.events_extracted, 1);
    assert_eq!(counters.persisted_primary, 1);
    assert_eq!(counters.total_faults(), 0);
}

#[tokio::test]
async fn test_failed_upstream_handshake_falls_back_to_tunnel() {
    let upstream = TlsUpstream::start(sse_response()).await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = intercepting(&["localhost"]);
    let pipeline = common::memory_pipeline(config.clone(), sink.clone(), dir.path());
    // Public roots only: the proxy cannot verify the upstream certificate
    let proxy = start_proxy(&pipeline, &config, None).await;

    // Through the raw tunnel the client talks TLS to the upstream itself
    let response = client(&proxy, &upstream.ca)
        .post(upstream.url("/v1/chat/completions"))
        .json(&chat_request())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), SSE_BODY);

    proxy.shutdown.cancel();
    pipeline.shutdown(Duration::from_secs(5)).await;

    assert!(sink.is_empty().await);
    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.connections_opened, 0);
    assert!(counters.transport_faults >= 1);
}

#[tokio::test]
async fn test_plain_http_stream_becomes_one_record() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(SSE_BODY, "text/event-stream")
                // Longer than the connect timeout; the exchange itself is unbounded
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = intercepting(&["127.0.0.1"]);
    let pipeline = common::memory_pipeline(config.clone(), sink.clone(), dir.path());
    let proxy = start_proxy(&pipeline, &config, None).await;

    let response = client(&proxy, &proxy.ca)
        .post(format!("{}/v1/chat/completions", upstream.uri()))
        .json(&chat_request())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), SSE_BODY);

    wait_for_records(&sink, 1).await;
    proxy.shutdown.cancel();
    pipeline.shutdown(Duration::from_secs(5)).await;

    let records = sink.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt, "Refactor this function");
    assert_eq!(records[0].response.as_deref(), Some("Here's the refactored..."));
    assert_eq!(records[0].model, "gpt-4o");

    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.persisted_primary, 1);
    assert_eq!(counters.total_faults(), 0);
}

#[tokio::test]
async fn test_non_intercepted_host_is_forwarded_but_not_recorded() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = intercepting(&["api.openai.com"]);
    let pipeline = common::memory_pipeline(config.clone(), sink.clone(), dir.path());
    let proxy = start_proxy(&pipeline, &config, None).await;

    let response = client(&proxy, &proxy.ca)
        .post(format!("{}/v1/chat/completions", upstream.uri()))
        .json(&json!({"messages": [{"role": "user", "content": "not for us"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    proxy.shutdown.cancel();
    pipeline.shutdown(Duration::from_secs(5)).await;

    assert!(sink.is_empty().await);
    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.connections_opened, 0);
    assert_eq!(counters.total_faults(), 0);
}

#[tokio::test]
async fn test_get_to_intercepted_host_is_discarded_while_post_is_kept() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = intercepting(&["127.0.0.1"]);
    let pipeline = common::memory_pipeline(config.clone(), sink.clone(), dir.path());
    let proxy = start_proxy(&pipeline, &config, None).await;
    let client = client(&proxy, &proxy.ca);

    let models = client
        .get(format!("{}/v1/models", upstream.uri()))
        .send()
        .await
        .unwrap();
    assert_eq!(models.status(), 200);
    let chat = client
        .post(format!("{}/v1/chat/completions", upstream.uri()))
        .json(&chat_request())
        .send()
        .await
        .unwrap();
    assert_eq!(chat.text().await.unwrap(), SSE_BODY);

    wait_for_records(&sink, 1).await;
    proxy.shutdown.cancel();
    pipeline.shutdown(Duration::from_secs(5)).await;

    // Both exchanges were classified for the intercepted host; only the GET
    // was dropped for carrying no body.
    let records = sink.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].prompt, "Refactor this function");
    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.connections_opened, 2);
    assert_eq!(counters.events_extracted, 1);
    assert_eq!(counters.discarded, 1);
    assert_eq!(counters.total_faults(), 0);
}

#[tokio::test]
async fn test_same_prompt_on_both_paths_is_recorded_once() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&upstream)
        .await;

    let dir = TempDir::new().unwrap();
    let sink = Arc::new(MemorySink::new());
    let config = intercepting(&["127.0.0.1"]);
    let pipeline = common::memory_pipeline(config.clone(), sink.clone(), dir.path());
    let proxy = start_proxy(&pipeline, &config, None).await;

    let body = common::cascade_body("abc-123", "MODEL_X", "Explain this  module");

    // Cloud side: the cascade envelope on a path that is not a configured method
    let response = client(&proxy, &proxy.ca)
        .post(format!(
            "{}/exa.api_server_pb.ApiServerService/GetChatMessage",
            upstream.uri()
        ))
        .header("content-type", "application/json")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    wait_for_records(&sink, 1).await;

    // Loopback side: the same message on the language-server channel
    let request = common::json_request(common::CASCADE_PATH, &body);
    let ok = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
    let mut stream = common::pcap_header();
    stream.extend(common::loopback_exchange(52010, 42100, &request, ok));
    let sniffer = LoopbackSniffer::new(
        LoopbackConfig::default(),
        vec![8080],
        pipeline.clone(),
        pipeline.counters().clone(),
    );
    sniffer
        .run(Cursor::new(stream), CancellationToken::new())
        .await
        .unwrap();

    proxy.shutdown.cancel();
    pipeline.shutdown(Duration::from_secs(5)).await;

    let records = sink.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cascade_id, "abc-123");
    assert_eq!(records[0].capture_path, TransportPath::Mitm);

    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.events_extracted, 2);
    assert_eq!(counters.duplicates_suppressed, 1);
    assert_eq!(counters.persisted_primary, 1);
}
