//! Primary/fallback failover
//!
//! Writes go to the primary sink while it is healthy. A failed or slow
//! primary write lands in the fallback sink marked for reconciliation and
//! raises the degraded flag; the primary is retried after a back-off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{PromptRecord, RecordSink, WriteStatus};
use crate::config::StorageConfig;
use crate::error::{Result, TapError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Primary(WriteStatus),
    Fallback(WriteStatus),
}

pub struct PersistenceAdapter {
    primary: Option<Arc<dyn RecordSink>>,
    fallback: Arc<dyn RecordSink>,
    write_timeout: Duration,
    retry_after: Duration,
    degraded: AtomicBool,
    primary_connected: AtomicBool,
    last_failure: Mutex<Option<Instant>>,
}

impl PersistenceAdapter {
    pub fn new(
        primary: Option<Arc<dyn RecordSink>>,
        fallback: Arc<dyn RecordSink>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            retry_after: Duration::from_secs(config.retry_primary_secs),
            degraded: AtomicBool::new(false),
            primary_connected: AtomicBool::new(false),
            last_failure: Mutex::new(None),
        }
    }

    /// Primary configured but unreachable at startup
    pub async fn start_degraded(&self, reason: &str) {
        tracing::warn!(reason, "Primary store unavailable, starting in degraded mode");
        self.mark_failed().await;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn primary_connected(&self) -> bool {
        self.primary_connected.load(Ordering::Relaxed)
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    async fn mark_failed(&self) {
        *self.last_failure.lock().await = Some(Instant::now());
        self.degraded.store(true, Ordering::Relaxed);
        self.primary_connected.store(false, Ordering::Relaxed);
    }

    async fn primary_due(&self) -> bool {
        match *self.last_failure.lock().await {
            Some(at) => at.elapsed() >= self.retry_after,
            None => true,
        }
    }

    /// Persist one record. Fails only when both sinks fail.
    pub async fn persist(&self, record: PromptRecord) -> Result<Persisted> {
        let mut primary_error = None;

        if let Some(primary) = &self.primary {
            if self.primary_due().await {
                match tokio::time::timeout(self.write_timeout, primary.write(&record)).await {
                    Ok(Ok(status)) => {
                        if self.degraded.swap(false, Ordering::Relaxed) {
                            tracing::info!(sink = primary.name(), "Primary store recovered");
                        }
                        self.primary_connected.store(true, Ordering::Relaxed);
                        *self.last_failure.lock().await = None;
                        return Ok(Persisted::Primary(status));
                    }
                    Ok(Err(e)) => primary_error = Some(e.to_string()),
                    Err(_) => {
                        primary_error = Some(format!(
                            "write timed out after {}s",
                            self.write_timeout.as_secs()
                        ))
                    }
                }
            }
        }

        if let Some(ref error) = primary_error {
            tracing::warn!(
                fingerprint = %record.fingerprint,
                error = %error,
                "Primary write failed, using fallback"
            );
            self.mark_failed().await;
        }

        let mut record = record;
        record.pending_reconciliation = true;

        match self.fallback.write(&record).await {
            Ok(status) => Ok(Persisted::Fallback(status)),
            Err(e) => {
                tracing::error!(
                    fingerprint = %record.fingerprint,
                    primary_error = primary_error.as_deref().unwrap_or("skipped"),
                    fallback_error = %e,
                    "Record could not be persisted"
                );
                Err(TapError::Storage(format!(
                    "all sinks failed for {}: {e}",
                    record.fingerprint
                )))
            }
        }
    }
}
