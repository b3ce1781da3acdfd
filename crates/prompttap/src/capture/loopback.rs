//! Passive capture of the IDE's loopback RPC channel
//!
//! Runs the system capture tool on the loopback interface, reads its pcap
//! output and rebuilds per-connection byte streams. Nothing is injected or
//! altered; the sniffer only observes.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::pcap::{PcapReader, TcpSegment, decode_segment};
use super::{ConnectionIds, ConnectionOpener, ConnectionTap, Direction, Endpoint, TransportPath};
use crate::config::LoopbackConfig;
use crate::error::{Result, TapError};
use crate::pipeline::counters::PipelineCounters;

const REQUEST_METHODS: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"PATCH ", b"DELETE ", b"HEAD ", b"OPTIONS ",
];

/// Loopback sniffer
pub struct LoopbackSniffer {
    config: LoopbackConfig,
    excluded_ports: Vec<u16>,
    opener: Arc<dyn ConnectionOpener>,
    counters: Arc<PipelineCounters>,
}

impl LoopbackSniffer {
    /// `extra_excluded` lists ports of our own listeners
    pub fn new(
        config: LoopbackConfig,
        extra_excluded: Vec<u16>,
        opener: Arc<dyn ConnectionOpener>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        let mut excluded_ports = config.excluded_ports.clone();
        excluded_ports.extend(extra_excluded);
        excluded_ports.sort_unstable();
        excluded_ports.dedup();

        Self {
            config,
            excluded_ports,
            opener,
            counters,
        }
    }

    /// BPF expression restricting capture to the RPC port range
    pub fn capture_filter(&self) -> String {
        let mut filter = format!(
            "tcp and portrange {}-{}",
            self.config.port_range_start, self.config.port_range_end
        );
        for port in &self.excluded_ports {
            filter.push_str(&format!(" and not port {port}"));
        }
        filter
    }

    pub fn capture_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.config.interface.clone(),
            "-w".to_string(),
            "-".to_string(),
            "-U".to_string(),
            "-s".to_string(),
            "0".to_string(),
            "-n".to_string(),
            self.capture_filter(),
        ]
    }

    /// Spawn the capture tool and make sure it survives startup
    pub async fn start(&self) -> Result<(Child, ChildStdout)> {
        let command = &self.config.capture_command;
        let mut child = Command::new(command)
            .args(self.capture_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TapError::Capture(format!("Failed to start {command}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TapError::Capture(format!("{command} has no stdout")))?;

        let settle = Duration::from_millis(self.config.startup_check_ms);
        match tokio::time::timeout(settle, child.wait()).await {
            Ok(Ok(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(TapError::Capture(format!(
                    "{command} exited during startup ({status}): {}",
                    stderr.trim()
                )));
            }
            Ok(Err(e)) => {
                return Err(TapError::Capture(format!("Failed to check on {command}: {e}")));
            }
            Err(_) => {}
        }

        if let Some(stderr) = child.stderr.take() {
            let command = command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(tool = %command, "{line}");
                }
            });
        }

        tracing::info!(
            interface = %self.config.interface,
            filter = %self.capture_filter(),
            "Loopback capture started"
        );
        Ok((child, stdout))
    }

    /// Consume a pcap stream until it ends or `shutdown` fires
    pub async fn run<R>(&self, reader: R, shutdown: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut pcap = PcapReader::open(reader)
            .await
            .map_err(|e| TapError::Capture(format!("Invalid capture stream: {e}")))?;
        let link_type = pcap.link_type();

        // Reads are not cancel-safe, so they run on their own task.
        let (tx, mut rx) = mpsc::channel(1024);
        let counters = self.counters.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match pcap.next_record().await {
                    Ok(Some(record)) => {
                        if tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        counters.transport_fault();
                        tracing::warn!("Capture stream failed: {e}");
                        break;
                    }
                }
            }
        });

        let mut table = StreamTable::new(
            self.opener.clone(),
            &self.excluded_ports,
            Duration::from_secs(self.config.stream_idle_secs.max(1)),
        );
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.stream_idle_secs.clamp(1, 30),
        ));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => table.sweep(Instant::now()).await,
                record = rx.recv() => match record {
                    Some(record) => {
                        if let Some(segment) = decode_segment(link_type, &record.data) {
                            table.ingest(segment, Instant::now()).await;
                        }
                    }
                    None => {
                        tracing::info!("Loopback capture stream ended");
                        break;
                    }
                },
            }
        }

        reader_task.abort();
        table.close_all().await;
        Ok(())
    }
}

/// Unordered pair of socket addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey(SocketAddr, SocketAddr);

impl FlowKey {
    fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a <= b { FlowKey(a, b) } else { FlowKey(b, a) }
    }
}

struct TrackedStream {
    tap: ConnectionTap,
    client: SocketAddr,
    next_seq: [Option<u32>; 2],
    fin: [bool; 2],
    last_seen: Instant,
}

fn direction_index(direction: Direction) -> usize {
    match direction {
        Direction::Request => 0,
        Direction::Response => 1,
    }
}

/// Four-tuple demultiplexer, owned by the sniffer task
struct StreamTable {
    opener: Arc<dyn ConnectionOpener>,
    ids: ConnectionIds,
    excluded_ports: Vec<u16>,
    idle: Duration,
    streams: HashMap<FlowKey, TrackedStream>,
}

impl StreamTable {
    fn new(opener: Arc<dyn ConnectionOpener>, excluded_ports: &[u16], idle: Duration) -> Self {
        Self {
            opener,
            ids: ConnectionIds::new(TransportPath::Loopback),
            excluded_ports: excluded_ports.to_vec(),
            idle,
            streams: HashMap::new(),
        }
    }

    async fn ingest(&mut self, segment: TcpSegment, now: Instant) {
        if self.excluded_ports.contains(&segment.src.port())
            || self.excluded_ports.contains(&segment.dst.port())
        {
            return;
        }

        let key = FlowKey::new(segment.src, segment.dst);
        if !self.streams.contains_key(&key) {
            let opening = segment.syn && !segment.ack;
            if segment.payload.is_empty() && !opening {
                return;
            }
            let client = infer_client(&segment);
            let server = if client == segment.src {
                segment.dst
            } else {
                segment.src
            };
            let endpoint = Endpoint::new(server.ip().to_string(), server.port());
            let tap = self.opener.open(self.ids.next(), endpoint);
            tracing::debug!(connection = %tap.connection(), %client, %server, "Tracking loopback stream");
            self.streams.insert(
                key,
                TrackedStream {
                    tap,
                    client,
                    next_seq: [None, None],
                    fin: [false, false],
                    last_seen: now,
                },
            );
        }

        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        stream.last_seen = now;

        let direction = if segment.src == stream.client {
            Direction::Request
        } else {
            Direction::Response
        };
        let index = direction_index(direction);

        if segment.syn {
            stream.next_seq[index] = Some(segment.sequence.wrapping_add(1));
        }

        if let Some(payload) = trim_retransmission(&mut stream.next_seq[index], segment.sequence, segment.payload) {
            stream.tap.record(direction, payload).await;
        }

        if segment.rst {
            self.close(&key).await;
            return;
        }
        if segment.fin {
            stream.fin[index] = true;
            if stream.fin.iter().all(|f| *f) {
                self.close(&key).await;
            }
        }
    }

    async fn close(&mut self, key: &FlowKey) {
        if let Some(stream) = self.streams.remove(key) {
            stream.tap.close().await;
        }
    }

    async fn sweep(&mut self, now: Instant) {
        let expired: Vec<FlowKey> = self
            .streams
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= self.idle)
            .map(|(k, _)| *k)
            .collect();

        for key in expired {
            self.close(&key).await;
        }
    }

    async fn close_all(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.tap.close().await;
        }
    }
}

/// Decide which side opened the connection
fn infer_client(segment: &TcpSegment) -> SocketAddr {
    if segment.syn && !segment.ack {
        return segment.src;
    }
    if REQUEST_METHODS.iter().any(|m| segment.payload.starts_with(m)) {
        return segment.src;
    }
    if segment.payload.starts_with(b"HTTP/1.") {
        return segment.dst;
    }
    // Ephemeral client ports are usually the higher of the two.
    if segment.src.port() > segment.dst.port() {
        segment.src
    } else {
        segment.dst
    }
}

/// Drop bytes already delivered in this direction; returns the new bytes, if any
fn trim_retransmission(next_seq: &mut Option<u32>, sequence: u32, payload: Bytes) -> Option<Bytes> {
    if payload.is_empty() {
        return None;
    }
    let end = sequence.wrapping_add(payload.len() as u32);

    let Some(expected) = *next_seq else {
        *next_seq = Some(end);
        return Some(payload);
    };

    if (end.wrapping_sub(expected) as i32) <= 0 {
        return None;
    }

    let overlap = expected.wrapping_sub(sequence) as i32;
    *next_seq = Some(end);
    if overlap > 0 {
        Some(payload.slice(overlap as usize..))
    } else {
        Some(payload)
    }
}
