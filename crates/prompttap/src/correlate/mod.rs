//! Correlation and deduplication
//!
//! Fresh events are appended to their conversation thread and handed to the
//! persistence queue while the thread's lock is held, so events of one
//! cascade reach the queue in completion order.

pub mod dedup;

pub use dedup::{DedupWindow, Observation};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

use crate::capture::ConnectionId;
use crate::config::DedupConfig;
use crate::error::{Result, TapError};
use crate::extract::{ExtractedEvent, Source};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThreadKey {
    Cascade(String),
    /// Events with no cascade id are grouped per source and connection
    Synthetic {
        source: Source,
        connection: ConnectionId,
    },
}

impl ThreadKey {
    pub fn for_event(event: &ExtractedEvent) -> Self {
        match &event.cascade_id {
            Some(id) if !id.is_empty() => ThreadKey::Cascade(id.clone()),
            _ => ThreadKey::Synthetic {
                source: event.source,
                connection: event.connection,
            },
        }
    }
}

/// Ordered, append-only events of one conversation
#[derive(Debug, Clone)]
pub struct ConversationThread {
    pub key: ThreadKey,
    pub created_at: DateTime<Utc>,
    pub events: Vec<ExtractedEvent>,
}

impl ConversationThread {
    fn new(key: ThreadKey) -> Self {
        Self {
            key,
            created_at: Utc::now(),
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    Queued,
    Duplicate,
}

pub struct Correlator {
    dedup: DedupWindow,
    threads: DashMap<ThreadKey, Arc<Mutex<ConversationThread>>>,
    persist: mpsc::Sender<ExtractedEvent>,
}

impl Correlator {
    pub fn new(config: &DedupConfig, persist: mpsc::Sender<ExtractedEvent>) -> Self {
        Self {
            dedup: DedupWindow::new(Duration::from_secs(config.window_secs)),
            threads: DashMap::new(),
            persist,
        }
    }

    pub fn dedup(&self) -> &DedupWindow {
        &self.dedup
    }

    /// Suppress duplicates, thread and enqueue everything else
    pub async fn accept(&self, event: ExtractedEvent, now: Instant) -> Result<Correlation> {
        if self.dedup.observe(&event, now) == Observation::Duplicate {
            tracing::debug!(
                fingerprint = %event.fingerprint,
                path = %event.path,
                "Duplicate event suppressed"
            );
            return Ok(Correlation::Duplicate);
        }

        let key = ThreadKey::for_event(&event);
        let thread = self
            .threads
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationThread::new(key))))
            .clone();

        let mut thread = thread.lock().await;
        thread.events.push(event.clone());
        self.persist
            .send(event)
            .await
            .map_err(|_| TapError::General("persistence queue closed".to_string()))?;

        Ok(Correlation::Queued)
    }

    /// Snapshot of one thread
    pub async fn thread(&self, key: &ThreadKey) -> Option<ConversationThread> {
        let thread = self.threads.get(key)?.clone();
        let snapshot = thread.lock().await.clone();
        Some(snapshot)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Drop the synthetic threads of a closed connection; cascade threads stay
    pub fn release_connection(&self, connection: ConnectionId) -> usize {
        Source::ALL
            .into_iter()
            .filter(|&source| {
                self.threads
                    .remove(&ThreadKey::Synthetic { source, connection })
                    .is_some()
            })
            .count()
    }

    /// Forget dedup entries older than the window
    pub fn sweep(&self, now: Instant) -> usize {
        self.dedup.sweep(now)
    }
}
