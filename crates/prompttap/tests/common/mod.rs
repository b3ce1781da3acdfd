//! Shared fixtures for the integration tests
#![allow(dead_code)]

use etherparse::PacketBuilder;
use std::path::Path;
use std::sync::Arc;

use prompttap::config::Config;
use prompttap::pipeline::{Pipeline, PipelineCounters};
use prompttap::storage::{JsonlSink, PersistenceAdapter, RecordSink};
use prompttap::testing::MemorySink;

pub const CASCADE_PATH: &str = "/exa.language_server_pb.LanguageServerService/SendUserCascadeMessage";

/// Pipeline writing to `primary`, with a JSONL fallback under `fallback_dir`
pub fn pipeline_with(
    mut config: Config,
    primary: Option<Arc<dyn RecordSink>>,
    fallback_dir: &Path,
) -> Arc<Pipeline> {
    config.storage.fallback_dir = fallback_dir.to_path_buf();
    let adapter = Arc::new(PersistenceAdapter::new(
        primary,
        Arc::new(JsonlSink::new(fallback_dir)),
        &config.storage,
    ));
    Pipeline::start(Arc::new(config), adapter, Arc::new(PipelineCounters::new()))
}

pub fn memory_pipeline(config: Config, sink: Arc<MemorySink>, fallback_dir: &Path) -> Arc<Pipeline> {
    pipeline_with(config, Some(sink as Arc<dyn RecordSink>), fallback_dir)
}

/// Complete HTTP/1.1 request with a JSON body
pub fn json_request(path: &str, body: &str) -> Vec<u8> {
    format!(
        "POST {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn cascade_body(cascade_id: &str, model: &str, text: &str) -> String {
    serde_json::json!({
        "cascadeId": cascade_id,
        "items": [{"text": text}],
        "metadata": {"ideName": "windsurf", "ideVersion": "1.9.0"},
        "cascadeConfig": {
            "plannerConfig": {"requestedModelUid": model},
            "brainConfig": {"enabled": false}
        }
    })
    .to_string()
}

/// Classic little-endian pcap global header
pub fn pcap_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(24);
    header.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    header.extend_from_slice(&2u16.to_le_bytes());
    header.extend_from_slice(&4u16.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes());
    header.extend_from_slice(&65535u32.to_le_bytes());
    // DLT_NULL
    header.extend_from_slice(&0u32.to_le_bytes());
    header
}

/// Loopback TCP segment wrapped in a pcap record
pub fn pcap_segment(src_port: u16, dst_port: u16, seq: u32, flags: &str, payload: &[u8]) -> Vec<u8> {
    let mut builder = PacketBuilder::ipv4([127, 0, 0, 1], [127, 0, 0, 1], 64)
        .tcp(src_port, dst_port, seq, 65535);
    if flags.contains('S') {
        builder = builder.syn();
    }
    if flags.contains('A') {
        builder = builder.ack(1);
    }
    if flags.contains('F') {
        builder = builder.fin();
    }

    let mut frame = 2u32.to_le_bytes().to_vec();
    builder.write(&mut frame, payload).unwrap();

    let mut record = Vec::with_capacity(16 + frame.len());
    record.extend_from_slice(&0u32.to_le_bytes());
    record.extend_from_slice(&0u32.to_le_bytes());
    record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    record.extend_from_slice(&(frame.len() as u32).to_le_bytes());
    record.extend_from_slice(&frame);
    record
}

/// One complete loopback exchange: handshake, request, response, close
pub fn loopback_exchange(client_port: u16, server_port: u16, request: &[u8], response: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(pcap_segment(client_port, server_port, 1000, "S", b""));
    out.extend(pcap_segment(server_port, client_port, 5000, "SA", b""));
    out.extend(pcap_segment(client_port, server_port, 1001, "A", request));
    if !response.is_empty() {
        out.extend(pcap_segment(server_port, client_port, 5001, "A", response));
    }
    out.extend(pcap_segment(client_port, server_port, 1001 + request.len() as u32, "FA", b""));
    out.extend(pcap_segment(
        server_port,
        client_port,
        5001 + response.len() as u32,
        "FA",
        b"",
    ));
    out
}
