//! Record persistence
//!
//! Sinks share one trait so the adapter can fail over between the document
//! store and the append-only JSONL fallback without callers noticing.

pub mod adapter;
pub mod filter;
pub mod jsonl;
pub mod mongo;
pub mod record;

pub use adapter::{Persisted, PersistenceAdapter};
pub use filter::RecordFilter;
pub use jsonl::JsonlSink;
pub use mongo::MongoSink;
pub use record::PromptRecord;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::Result;

pub const DEFAULT_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Inserted,
    /// A record with the same fingerprint already exists
    AlreadyPresent,
}

/// Pagination window, newest records first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub skip: usize,
}

impl Page {
    pub fn new(limit: usize, skip: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_LIMIT),
            skip,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_LIMIT, 0)
    }
}

/// Aggregate view over the records matching a filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordStats {
    pub total: u64,
    pub unique_users: u64,
    pub unique_models: u64,
    pub unique_cascades: u64,
    /// Record count per model, most used first
    pub per_model: Vec<ModelCount>,
    /// Record count per UTC hour of day
    pub hourly: Vec<u64>,
    pub avg_prompt_length: f64,
    pub avg_word_count: f64,
    pub total_words: u64,
    pub brain_enabled: u64,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCount {
    pub model: String,
    pub count: u64,
}

impl RecordStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a PromptRecord>) -> Self {
        let mut stats = RecordStats {
            hourly: vec![0; 24],
            ..Default::default()
        };
        let mut users = HashSet::new();
        let mut cascades = HashSet::new();
        let mut models: BTreeMap<String, u64> = BTreeMap::new();
        let mut total_length = 0u64;

        for record in records {
            stats.total += 1;
            users.insert(record.user.clone());
            if !record.cascade_id.is_empty() {
                cascades.insert(record.cascade_id.clone());
            }
            *models.entry(record.model.clone()).or_default() += 1;
            if let Some(bucket) = stats.hourly.get_mut(record.hour_of_day as usize) {
                *bucket += 1;
            }
            total_length += record.prompt_length;
            stats.total_words += record.word_count;
            if record.brain_enabled {
                stats.brain_enabled += 1;
            }
            stats.first_timestamp = Some(
                stats
                    .first_timestamp
                    .map_or(record.timestamp, |t| t.min(record.timestamp)),
            );
            stats.last_timestamp = Some(
                stats
                    .last_timestamp
                    .map_or(record.timestamp, |t| t.max(record.timestamp)),
            );
        }

        if stats.total > 0 {
            stats.avg_prompt_length = round1(total_length as f64 / stats.total as f64);
            stats.avg_word_count = round1(stats.total_words as f64 / stats.total as f64);
        }
        stats.unique_users = users.len() as u64;
        stats.unique_models = models.keys().filter(|m| !m.is_empty()).count() as u64;
        stats.unique_cascades = cascades.len() as u64;
        stats.per_model = sorted_model_counts(models);
        stats
    }
}

pub(crate) fn sorted_model_counts(models: impl IntoIterator<Item = (String, u64)>) -> Vec<ModelCount> {
    let mut counts: Vec<ModelCount> = models
        .into_iter()
        .map(|(model, count)| ModelCount { model, count })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.model.cmp(&b.model)));
    counts
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// A destination for prompt records
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Idempotent on the record's fingerprint
    async fn write(&self, record: &PromptRecord) -> Result<WriteStatus>;

    /// Matching records, newest first
    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<PromptRecord>>;

    async fn count(&self, filter: &RecordFilter) -> Result<u64>;

    async fn stats(&self, filter: &RecordFilter) -> Result<RecordStats>;
}
