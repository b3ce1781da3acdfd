//! Persisted prompt record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::TransportPath;
use crate::extract::{ExtractedEvent, MetadataTree};

/// One captured prompt as stored by every sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: Uuid,
    /// Idempotency key
    pub fingerprint: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub user: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub planner_mode: String,
    #[serde(default)]
    pub brain_enabled: bool,
    #[serde(default)]
    pub cascade_id: String,
    #[serde(default)]
    pub ide_name: String,
    #[serde(default)]
    pub ide_version: String,
    #[serde(default)]
    pub extension_version: String,
    pub prompt_length: u64,
    pub word_count: u64,
    pub hour_of_day: u32,
    pub day_of_week: String,
    pub date: String,
    pub capture_path: TransportPath,
    #[serde(default)]
    pub metadata: MetadataTree,
    /// Set only on records written to the fallback sink
    #[serde(default)]
    pub pending_reconciliation: bool,
}

impl PromptRecord {
    pub fn from_event(event: &ExtractedEvent, user: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint: event.fingerprint.to_string(),
            prompt: event.prompt.clone().unwrap_or_default(),
            response: event.response.clone(),
            user: user.to_string(),
            source: event.source.as_str().to_string(),
            timestamp: event.timestamp,
            model: event.model.clone().unwrap_or_default(),
            planner_mode: event.planner_mode.clone().unwrap_or_default(),
            brain_enabled: event.brain_enabled,
            cascade_id: event.cascade_id.clone().unwrap_or_default(),
            ide_name: event.ide_name.clone().unwrap_or_default(),
            ide_version: event.ide_version.clone().unwrap_or_default(),
            extension_version: event.extension_version.clone().unwrap_or_default(),
            prompt_length: event.derived.prompt_length as u64,
            word_count: event.derived.word_count as u64,
            hour_of_day: event.derived.hour_of_day,
            day_of_week: event.derived.day_of_week.clone(),
            date: event.derived.date.clone(),
            capture_path: event.path,
            metadata: event.metadata.clone(),
            pending_reconciliation: false,
        }
    }

    /// `prompts_YYYY-MM-DD.jsonl` file of the record's UTC day
    pub fn day_file_name(&self) -> String {
        format!("prompts_{}.jsonl", self.timestamp.format("%Y-%m-%d"))
    }
}
