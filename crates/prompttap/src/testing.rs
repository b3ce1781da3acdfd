//! Test utilities for prompttap - fixtures, fakes and in-memory sinks
//!
//! Shared by unit tests and the integration tests under `tests/`, none of
//! which need a network, a database or elevated privileges.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::pki_types::CertificateDer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::capture::{
    ConnectionId, ConnectionIds, ConnectionOpener, ConnectionTap, Endpoint, TapMessage,
    TransportPath,
};
use crate::error::{Result, TapError};
use crate::extract::{DecodedRequest, ExtractedEvent, MetadataTree, Source};
use crate::pipeline::PipelineCounters;
use crate::storage::{Page, PromptRecord, RecordFilter, RecordSink, RecordStats, WriteStatus};

const RECORDING_QUEUE: usize = 1024;

/// Connection opener that hands every queue back to the test
pub struct RecordingOpener {
    connections: Mutex<Vec<(ConnectionId, Endpoint, mpsc::Receiver<TapMessage>)>>,
    counters: Arc<PipelineCounters>,
}

impl RecordingOpener {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            counters: Arc::new(PipelineCounters::new()),
        }
    }

    /// Connections opened so far, in open order
    pub fn take(&self) -> Vec<(ConnectionId, Endpoint, mpsc::Receiver<TapMessage>)> {
        match self.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut *connections),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn counters(&self) -> &PipelineCounters {
        &self.counters
    }
}

impl Default for RecordingOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionOpener for RecordingOpener {
    fn open(&self, connection: ConnectionId, endpoint: Endpoint) -> ConnectionTap {
        let (tx, rx) = mpsc::channel(RECORDING_QUEUE);
        if let Ok(mut connections) = self.connections.lock() {
            connections.push((connection, endpoint.clone(), rx));
        }
        ConnectionTap::new(
            connection,
            endpoint,
            tx,
            Duration::from_millis(250),
            self.counters.clone(),
        )
    }
}

/// Throwaway CA in PEM and DER form
pub struct TestCa {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
}

pub fn generate_test_ca() -> TestCa {
    let key = KeyPair::generate().expect("Failed to generate test CA key");
    let mut params =
        CertificateParams::new(Vec::<String>::new()).expect("Failed to build test CA params");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
        .distinguished_name
        .push(DnType::CommonName, "prompttap test CA");
    let cert = params
        .self_signed(&key)
        .expect("Failed to self-sign test CA");

    TestCa {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der: cert.der().clone(),
    }
}

/// Extracted event for `text` captured at `timestamp`
pub fn event_at(text: &str, cascade_id: Option<&str>, timestamp: DateTime<Utc>) -> ExtractedEvent {
    let mut metadata = MetadataTree::new();
    metadata.insert("provider", "test");

    ExtractedEvent::new(
        DecodedRequest {
            prompt: text.to_string(),
            model: None,
            cascade_id: cascade_id.map(str::to_string),
            planner_mode: None,
            brain_enabled: false,
            ide_name: None,
            ide_version: None,
            extension_version: None,
            source: Source::Unknown,
            metadata,
        },
        None,
        TransportPath::Mitm,
        ConnectionIds::new(TransportPath::Mitm).next(),
        timestamp,
        30,
    )
}

/// Record for `text` captured at `timestamp`, owned by user `tester`
pub fn record_at(text: &str, timestamp: DateTime<Utc>) -> PromptRecord {
    PromptRecord::from_event(&event_at(text, None, timestamp), "tester")
}

/// In-memory sink with the same idempotency as the real ones
pub struct MemorySink {
    records: tokio::sync::Mutex<Vec<PromptRecord>>,
    available: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            records: tokio::sync::Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable every call fails like an unreachable server
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Records in write order
    pub async fn records(&self) -> Vec<PromptRecord> {
        self.records.lock().await.clone()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TapError::Storage("memory sink unavailable".to_string()))
        }
    }

    async fn matching(&self, filter: &RecordFilter) -> Vec<PromptRecord> {
        let mut matched: Vec<_> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, record: &PromptRecord) -> Result<WriteStatus> {
        self.check()?;
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.fingerprint == record.fingerprint) {
            return Ok(WriteStatus::AlreadyPresent);
        }
        records.push(record.clone());
        Ok(WriteStatus::Inserted)
    }

    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<PromptRecord>> {
        self.check()?;
        Ok(self
            .matching(filter)
            .await
            .into_iter()
            .skip(page.skip)
            .take(page.limit)
            .collect())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        self.check()?;
        Ok(self.matching(filter).await.len() as u64)
    }

    async fn stats(&self, filter: &RecordFilter) -> Result<RecordStats> {
        self.check()?;
        Ok(RecordStats::from_records(&self.matching(filter).await))
    }
}

/// Sink whose every call fails
pub struct UnavailableSink;

#[async_trait]
impl RecordSink for UnavailableSink {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn write(&self, _record: &PromptRecord) -> Result<WriteStatus> {
        Err(TapError::Storage("connection refused".to_string()))
    }

    async fn list(&self, _filter: &RecordFilter, _page: Page) -> Result<Vec<PromptRecord>> {
        Err(TapError::Storage("connection refused".to_string()))
    }

    async fn count(&self, _filter: &RecordFilter) -> Result<u64> {
        Err(TapError::Storage("connection refused".to_string()))
    }

    async fn stats(&self, _filter: &RecordFilter) -> Result<RecordStats> {
        Err(TapError::Storage("connection refused".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn memory_sink_is_idempotent() {
        let sink = MemorySink::new();
        let record = record_at("hello", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(sink.write(&record).await.unwrap(), WriteStatus::Inserted);
        assert_eq!(sink.write(&record).await.unwrap(), WriteStatus::AlreadyPresent);
        assert_eq!(sink.len().await, 1);
    }

    #[test]
    fn test_ca_is_a_ca() {
        let ca = generate_test_ca();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }
}
