//! Transport interception
//!
//! Two capture paths feed the same pipeline:
//! - [`mitm::MitmProxy`] terminates TLS for known AI endpoints and relays bytes
//! - [`loopback::LoopbackSniffer`] passively reads the IDE's loopback RPC traffic
//!
//! Both turn raw byte chunks into [`CapturedEvent`]s through a [`ConnectionTap`].

pub mod authority;
pub mod loopback;
pub mod mitm;
pub mod pcap;
pub mod relay;

pub use authority::CertificateAuthority;
pub use loopback::LoopbackSniffer;
pub use mitm::MitmProxy;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

use crate::pipeline::counters::PipelineCounters;

/// Which interception mechanism produced a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPath {
    Mitm,
    Loopback,
}

impl TransportPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportPath::Mitm => "mitm",
            TransportPath::Loopback => "loopback",
        }
    }
}

impl fmt::Display for TransportPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-to-server or server-to-client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

/// Unique connection identifier within one transport path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub path: TransportPath,
    pub id: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.path, self.id)
    }
}

/// Hands out connection ids for one transport path
#[derive(Debug)]
pub struct ConnectionIds {
    path: TransportPath,
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new(path: TransportPath) -> Self {
        Self {
            path,
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId {
            path: self.path,
            id: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Remote host and port of a captured connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host[:port]` authority, including bracketed IPv6 literals
    pub fn from_authority(authority: &str, default_port: u16) -> Option<Self> {
        let authority = authority.trim();
        if authority.is_empty() {
            return None;
        }

        if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                Some(Self::new(host, port.parse().ok()?))
            }
            Some(_) => None,
            None => Some(Self::new(authority, default_port)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Capture time, monotonic for ordering and wall-clock for records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTimestamp {
    pub monotonic: Instant,
    pub wall: DateTime<Utc>,
}

impl CaptureTimestamp {
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// One chunk of bytes observed on a connection. Immutable once created.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub path: TransportPath,
    pub connection: ConnectionId,
    pub endpoint: Endpoint,
    pub direction: Direction,
    /// Strictly increasing per connection, starting at 0
    pub sequence: u64,
    pub payload: Bytes,
    pub captured_at: CaptureTimestamp,
}

/// What flows on a per-connection queue
#[derive(Debug, Clone)]
pub enum TapMessage {
    Captured(CapturedEvent),
    Closed {
        connection: ConnectionId,
        at: CaptureTimestamp,
    },
}

/// Opens the downstream side of a new connection.
///
/// The pipeline implements this by spawning a worker per connection.
pub trait ConnectionOpener: Send + Sync {
    fn open(&self, connection: ConnectionId, endpoint: Endpoint) -> ConnectionTap;
}

struct TapState {
    next_sequence: u64,
    detached: bool,
}

struct TapInner {
    connection: ConnectionId,
    endpoint: Endpoint,
    sender: mpsc::Sender<TapMessage>,
    enqueue_timeout: Duration,
    counters: Arc<PipelineCounters>,
    state: Mutex<TapState>,
}

/// Producer handle for one connection's event queue.
///
/// Sequence assignment and enqueueing happen under one lock, so queue order
/// always matches sequence order even when both directions record concurrently.
/// If the queue stays full past the enqueue timeout the tap detaches: capture
/// stops for this connection and relaying carries on.
#[derive(Clone)]
pub struct ConnectionTap {
    inner: Arc<TapInner>,
}

impl ConnectionTap {
    pub fn new(
        connection: ConnectionId,
        endpoint: Endpoint,
        sender: mpsc::Sender<TapMessage>,
        enqueue_timeout: Duration,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            inner: Arc::new(TapInner {
                connection,
                endpoint,
                sender,
                enqueue_timeout,
                counters,
                state: Mutex::new(TapState {
                    next_sequence: 0,
                    detached: false,
                }),
            }),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.inner.connection
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub async fn is_detached(&self) -> bool {
        self.inner.state.lock().await.detached
    }

    /// Record a chunk. Empty chunks are ignored.
    pub async fn record(&self, direction: Direction, payload: Bytes) {
        if payload.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock().await;
        if state.detached {
            return;
        }

        let event = CapturedEvent {
            path: self.inner.connection.path,
            connection: self.inner.connection,
            endpoint: self.inner.endpoint.clone(),
            direction,
            sequence: state.next_sequence,
            payload,
            captured_at: CaptureTimestamp::now(),
        };

        match self
            .inner
            .sender
            .send_timeout(TapMessage::Captured(event), self.inner.enqueue_timeout)
            .await
        {
            Ok(()) => {
                state.next_sequence += 1;
                self.inner.counters.event_captured();
            }
            Err(e) => {
                state.detached = true;
                self.inner.counters.capture_detached();
                self.inner.counters.framing_fault();
                tracing::warn!(
                    connection = %self.inner.connection,
                    "Capture detached, event queue unavailable: {e}"
                );
            }
        }
    }

    /// Signal end of connection. Safe to call more than once.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.detached {
            return;
        }
        state.detached = true;

        let message = TapMessage::Closed {
            connection: self.inner.connection,
            at: CaptureTimestamp::now(),
        };
        if let Err(e) = self
            .inner
            .sender
            .send_timeout(message, self.inner.enqueue_timeout)
            .await
        {
            tracing::debug!(connection = %self.inner.connection, "Close not delivered: {e}");
        }
    }
}

impl fmt::Debug for ConnectionTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTap")
            .field("connection", &self.inner.connection)
            .field("endpoint", &self.inner.endpoint)
            .finish()
    }
}

/// Host matching used for intercept and log-only lists.
///
/// Supports exact names and `*.suffix` wildcards; `*.example.com` also
/// matches `example.com` itself.
pub fn host_matches_pattern(host: &str, pattern: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.trim().to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if host == suffix {
            return true;
        }
        return host
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('.'));
    }

    host == pattern
}

/// True when `host` matches any pattern in `patterns`
pub fn host_in(host: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| host_matches_pattern(host, p))
}
