//! MongoDB sink
//!
//! Writes are upserts keyed by fingerprint with `$setOnInsert`, so replays
//! and races between capture paths never produce a second document.

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{
    Page, PromptRecord, RecordFilter, RecordSink, RecordStats, WriteStatus, round1,
    sorted_model_counts,
};
use crate::capture::TransportPath;
use crate::config::StorageConfig;
use crate::error::{Result, TapError};
use crate::extract::MetadataTree;

const DUPLICATE_KEY: i32 = 11000;

/// Document shape; identical to [`PromptRecord`] except that the timestamp
/// is a native BSON date so it can be sorted, ranged and bucketed
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoPromptRecord {
    id: String,
    fingerprint: String,
    prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    user: String,
    source: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    planner_mode: String,
    #[serde(default)]
    brain_enabled: bool,
    #[serde(default)]
    cascade_id: String,
    #[serde(default)]
    ide_name: String,
    #[serde(default)]
    ide_version: String,
    #[serde(default)]
    extension_version: String,
    prompt_length: i64,
    word_count: i64,
    hour_of_day: i32,
    day_of_week: String,
    date: String,
    capture_path: TransportPath,
    #[serde(default)]
    metadata: MetadataTree,
    #[serde(default)]
    pending_reconciliation: bool,
}

impl From<&PromptRecord> for MongoPromptRecord {
    fn from(r: &PromptRecord) -> Self {
        Self {
            id: r.id.to_string(),
            fingerprint: r.fingerprint.clone(),
            prompt: r.prompt.clone(),
            response: r.response.clone(),
            user: r.user.clone(),
            source: r.source.clone(),
            timestamp: r.timestamp,
            model: r.model.clone(),
            planner_mode: r.planner_mode.clone(),
            brain_enabled: r.brain_enabled,
            cascade_id: r.cascade_id.clone(),
            ide_name: r.ide_name.clone(),
            ide_version: r.ide_version.clone(),
            extension_version: r.extension_version.clone(),
            prompt_length: r.prompt_length as i64,
            word_count: r.word_count as i64,
            hour_of_day: r.hour_of_day as i32,
            day_of_week: r.day_of_week.clone(),
            date: r.date.clone(),
            capture_path: r.capture_path,
            metadata: r.metadata.clone(),
            pending_reconciliation: r.pending_reconciliation,
        }
    }
}

impl From<MongoPromptRecord> for PromptRecord {
    fn from(m: MongoPromptRecord) -> Self {
        Self {
            id: Uuid::parse_str(&m.id).unwrap_or_else(|_| Uuid::nil()),
            fingerprint: m.fingerprint,
            prompt: m.prompt,
            response: m.response,
            user: m.user,
            source: m.source,
            timestamp: m.timestamp,
            model: m.model,
            planner_mode: m.planner_mode,
            brain_enabled: m.brain_enabled,
            cascade_id: m.cascade_id,
            ide_name: m.ide_name,
            ide_version: m.ide_version,
            extension_version: m.extension_version,
            prompt_length: m.prompt_length.max(0) as u64,
            word_count: m.word_count.max(0) as u64,
            hour_of_day: m.hour_of_day.clamp(0, 23) as u32,
            day_of_week: m.day_of_week,
            date: m.date,
            capture_path: m.capture_path,
            metadata: m.metadata,
            pending_reconciliation: m.pending_reconciliation,
        }
    }
}

pub struct MongoSink {
    collection: Collection<MongoPromptRecord>,
    indexes: OnceCell<()>,
}

impl MongoSink {
    /// Build the client without touching the network
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.mongo_uri)
            .await
            .map_err(|e| TapError::Storage(format!("invalid mongo uri: {e}")))?;
        options.server_selection_timeout = Some(Duration::from_secs(config.server_selection_timeout_secs));
        options.connect_timeout = Some(Duration::from_secs(config.server_selection_timeout_secs));
        options.app_name = Some("prompttap".to_string());

        let client = Client::with_options(options).map_err(storage_error)?;
        let collection = client
            .database(&config.database)
            .collection(&config.collection);

        Ok(Self {
            collection,
            indexes: OnceCell::new(),
        })
    }

    /// Ping the server and create indexes
    pub async fn init(&self) -> Result<()> {
        self.collection
            .client()
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(storage_error)?;
        self.ensure_indexes().await
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.indexes
            .get_or_try_init(|| async {
                let mut models = vec![
                    IndexModel::builder()
                        .keys(doc! { "fingerprint": 1 })
                        .options(IndexOptions::builder().unique(true).build())
                        .build(),
                    IndexModel::builder().keys(doc! { "timestamp": -1 }).build(),
                ];
                for field in ["user", "model", "cascade_id", "planner_mode", "source"] {
                    let mut keys = Document::new();
                    keys.insert(field, 1);
                    models.push(IndexModel::builder().keys(keys).build());
                }
                self.collection.create_indexes(models).await.map_err(storage_error)?;
                tracing::info!(
                    collection = %self.collection.name(),
                    "Mongo indexes ensured"
                );
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<Document>> {
        self.collection
            .aggregate(pipeline)
            .await
            .map_err(storage_error)?
            .try_collect()
            .await
            .map_err(storage_error)
    }
}

fn storage_error(e: mongodb::error::Error) -> TapError {
    TapError::Storage(format!("mongo: {e}"))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

fn as_u64(value: Option<&Bson>) -> u64 {
    match value {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) => n.max(0.0) as u64,
        _ => 0,
    }
}

fn as_f64(value: Option<&Bson>) -> f64 {
    match value {
        Some(Bson::Int32(n)) => *n as f64,
        Some(Bson::Int64(n)) => *n as f64,
        Some(Bson::Double(n)) => *n,
        _ => 0.0,
    }
}

fn as_datetime(value: Option<&Bson>) -> Option<DateTime<Utc>> {
    match value {
        Some(Bson::DateTime(dt)) => Some(dt.to_chrono()),
        _ => None,
    }
}

#[async_trait]
impl RecordSink for MongoSink {
    fn name(&self) -> &'static str {
        "mongo"
    }

    async fn write(&self, record: &PromptRecord) -> Result<WriteStatus> {
        self.ensure_indexes().await?;

        let document = bson::to_document(&MongoPromptRecord::from(record))
            .map_err(|e| TapError::Serialization(e.to_string()))?;

        let result = self
            .collection
            .update_one(
                doc! { "fingerprint": &record.fingerprint },
                doc! { "$setOnInsert": document },
            )
            .upsert(true)
            .await;

        match result {
            Ok(outcome) if outcome.upserted_id.is_some() => Ok(WriteStatus::Inserted),
            Ok(_) => Ok(WriteStatus::AlreadyPresent),
            Err(e) if is_duplicate_key(&e) => Ok(WriteStatus::AlreadyPresent),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<PromptRecord>> {
        let records: Vec<MongoPromptRecord> = self
            .collection
            .find(filter.to_mongo_filter())
            .sort(doc! { "timestamp": -1 })
            .skip(page.skip as u64)
            .limit(page.limit as i64)
            .await
            .map_err(storage_error)?
            .try_collect()
            .await
            .map_err(storage_error)?;

        Ok(records.into_iter().map(PromptRecord::from).collect())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        self.collection
            .count_documents(filter.to_mongo_filter())
            .await
            .map_err(storage_error)
    }

    async fn stats(&self, filter: &RecordFilter) -> Result<RecordStats> {
        let matched = doc! { "$match": filter.to_mongo_filter() };

        let totals = self
            .aggregate(vec![
                matched.clone(),
                doc! { "$group": {
                    "_id": Bson::Null,
                    "total": { "$sum": 1 },
                    "users": { "$addToSet": "$user" },
                    "models": { "$addToSet": "$model" },
                    "cascades": { "$addToSet": "$cascade_id" },
                    "avg_prompt_length": { "$avg": "$prompt_length" },
                    "avg_word_count": { "$avg": "$word_count" },
                    "total_words": { "$sum": "$word_count" },
                    "brain_enabled": { "$sum": { "$cond": ["$brain_enabled", 1, 0] } },
                    "first": { "$min": "$timestamp" },
                    "last": { "$max": "$timestamp" },
                }},
                doc! { "$project": {
                    "total": 1,
                    "avg_prompt_length": 1,
                    "avg_word_count": 1,
                    "total_words": 1,
                    "brain_enabled": 1,
                    "first": 1,
                    "last": 1,
                    "unique_users": { "$size": "$users" },
                    "unique_models": { "$size": { "$setDifference": ["$models", ["", Bson::Null]] } },
                    "unique_cascades": { "$size": { "$setDifference": ["$cascades", ["", Bson::Null]] } },
                }},
            ])
            .await?;

        let mut stats = RecordStats {
            hourly: vec![0; 24],
            ..Default::default()
        };
        let Some(totals) = totals.first() else {
            return Ok(stats);
        };
        stats.total = as_u64(totals.get("total"));
        stats.unique_users = as_u64(totals.get("unique_users"));
        stats.unique_models = as_u64(totals.get("unique_models"));
        stats.unique_cascades = as_u64(totals.get("unique_cascades"));
        stats.avg_prompt_length = round1(as_f64(totals.get("avg_prompt_length")));
        stats.avg_word_count = round1(as_f64(totals.get("avg_word_count")));
        stats.total_words = as_u64(totals.get("total_words"));
        stats.brain_enabled = as_u64(totals.get("brain_enabled"));
        stats.first_timestamp = as_datetime(totals.get("first"));
        stats.last_timestamp = as_datetime(totals.get("last"));

        let per_model = self
            .aggregate(vec![
                matched.clone(),
                doc! { "$group": { "_id": "$model", "count": { "$sum": 1 } } },
            ])
            .await?;
        stats.per_model = sorted_model_counts(per_model.iter().map(|d| {
            (
                d.get_str("_id").unwrap_or_default().to_string(),
                as_u64(d.get("count")),
            )
        }));

        let hourly = self
            .aggregate(vec![
                matched,
                doc! { "$group": { "_id": "$hour_of_day", "count": { "$sum": 1 } } },
            ])
            .await?;
        for bucket in hourly {
            let hour = as_u64(bucket.get("_id")) as usize;
            if let Some(slot) = stats.hourly.get_mut(hour) {
                *slot = as_u64(bucket.get("count"));
            }
        }

        Ok(stats)
    }
}
