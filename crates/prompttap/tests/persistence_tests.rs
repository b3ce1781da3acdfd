//! Primary/fallback persistence as seen from the pipeline

mod common;

use chrono::{TimeZone, Utc};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use prompttap::capture::LoopbackSniffer;
use prompttap::config::{Config, LoopbackConfig};
use prompttap::pipeline::Pipeline;
use prompttap::storage::{
    JsonlSink, Page, Persisted, PersistenceAdapter, RecordFilter, RecordSink, WriteStatus,
};
use prompttap::testing::{MemorySink, UnavailableSink, record_at};

async fn capture_prompts(pipeline: &Arc<Pipeline>, prompts: &[(&str, &str)]) {
    let mut stream = common::pcap_header();
    for (index, (cascade, text)) in prompts.iter().enumerate() {
        let request = common::json_request(
            common::CASCADE_PATH,
            &common::cascade_body(cascade, "MODEL_X", text),
        );
        stream.extend(common::loopback_exchange(
            53000 + index as u16,
            42100,
            &request,
            b"",
        ));
    }

    let sniffer = LoopbackSniffer::new(
        LoopbackConfig::default(),
        Vec::new(),
        pipeline.clone(),
        pipeline.counters().clone(),
    );
    sniffer
        .run(Cursor::new(stream), CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_primary_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let pipeline = common::pipeline_with(Config::default(), Some(Arc::new(UnavailableSink)), dir.path());

    capture_prompts(&pipeline, &[("c-1", "first prompt"), ("c-2", "second prompt")]).await;
    pipeline.shutdown(Duration::from_secs(5)).await;

    let counters = pipeline.counters().snapshot();
    assert_eq!(counters.persisted_fallback, 2);
    assert_eq!(counters.write_failures, 0);
    assert!(pipeline.adapter().is_degraded());

    let fallback = JsonlSink::new(dir.path());
    let records = fallback.list(&RecordFilter::new(), Page::default()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.pending_reconciliation));

    let mut prompts: Vec<_> = records.iter().map(|r| r.prompt.as_str()).collect();
    prompts.sort_unstable();
    assert_eq!(prompts, vec!["first prompt", "second prompt"]);
}

#[tokio::test]
async fn test_primary_recovers_after_retry_interval() {
    let dir = TempDir::new().unwrap();
    let primary = Arc::new(MemorySink::new());
    let mut config = Config::default();
    config.storage.retry_primary_secs = 0;

    let adapter = PersistenceAdapter::new(
        Some(primary.clone() as Arc<dyn RecordSink>),
        Arc::new(JsonlSink::new(dir.path())),
        &config.storage,
    );
    let ts = Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap();

    primary.set_available(false);
    let outcome = adapter.persist(record_at("while down", ts)).await.unwrap();
    assert_eq!(outcome, Persisted::Fallback(WriteStatus::Inserted));
    assert!(adapter.is_degraded());

    primary.set_available(true);
    let outcome = adapter.persist(record_at("back up", ts)).await.unwrap();
    assert_eq!(outcome, Persisted::Primary(WriteStatus::Inserted));
    assert!(!adapter.is_degraded());
    assert!(adapter.primary_connected());

    assert_eq!(primary.len().await, 1);
}

#[tokio::test]
async fn test_repeated_writes_are_idempotent_on_both_sinks() {
    let dir = TempDir::new().unwrap();
    let ts = Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap();
    let record = record_at("same prompt", ts);

    let primary = MemorySink::new();
    assert_eq!(primary.write(&record).await.unwrap(), WriteStatus::Inserted);
    assert_eq!(primary.write(&record).await.unwrap(), WriteStatus::AlreadyPresent);

    let fallback = JsonlSink::new(dir.path());
    assert_eq!(fallback.write(&record).await.unwrap(), WriteStatus::Inserted);
    assert_eq!(fallback.write(&record).await.unwrap(), WriteStatus::AlreadyPresent);

    // A fresh handle rebuilds its index from disk
    let reopened = JsonlSink::new(dir.path());
    assert_eq!(reopened.write(&record).await.unwrap(), WriteStatus::AlreadyPresent);
    assert_eq!(reopened.count(&RecordFilter::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_fallback_records_are_queryable() {
    let dir = TempDir::new().unwrap();
    let sink = JsonlSink::new(dir.path());

    for (hour, text) in [(9, "refactor the parser"), (10, "write tests"), (11, "refactor storage")] {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, hour, 0, 0).unwrap();
        sink.write(&record_at(text, ts)).await.unwrap();
    }

    let filter = RecordFilter::new().containing("REFACTOR");
    let records = sink.list(&filter, Page::default()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].prompt, "refactor storage");

    let since = RecordFilter::new().since(Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap());
    assert_eq!(sink.count(&since).await.unwrap(), 2);

    let stats = sink.stats(&RecordFilter::new()).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.unique_users, 1);
    assert_eq!(stats.hourly[9], 1);
    assert_eq!(stats.total_words, 7);
}
