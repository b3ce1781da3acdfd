//! Filter types for record queries
//!
//! Filters narrow list, count and stats queries by user, model, source,
//! cascade, prompt text and time.

use bson::{Document, doc};
use chrono::{DateTime, Utc};

use super::record::PromptRecord;

/// Filter criteria for record queries.
///
/// All fields are optional - when `None`, that filter is not applied.
/// Multiple filters are combined with AND logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub user: Option<String>,
    pub model: Option<String>,
    pub source: Option<String>,
    pub cascade_id: Option<String>,
    /// Case-insensitive substring of the prompt
    pub contains: Option<String>,
    /// Inclusive lower bound on the timestamp
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the timestamp
    pub until: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_cascade_id(mut self, cascade_id: impl Into<String>) -> Self {
        self.cascade_id = Some(cascade_id.into());
        self
    }

    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.contains = Some(text.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Check if this filter is empty (no conditions set)
    pub fn is_empty(&self) -> bool {
        self.user.is_none()
            && self.model.is_none()
            && self.source.is_none()
            && self.cascade_id.is_none()
            && self.contains.is_none()
            && self.since.is_none()
            && self.until.is_none()
    }

    /// In-memory evaluation, used by the JSONL and test sinks
    pub fn matches(&self, record: &PromptRecord) -> bool {
        let eq = |wanted: &Option<String>, actual: &str| wanted.as_deref().is_none_or(|w| w == actual);

        eq(&self.user, &record.user)
            && eq(&self.model, &record.model)
            && eq(&self.source, &record.source)
            && eq(&self.cascade_id, &record.cascade_id)
            && self.contains.as_deref().is_none_or(|needle| {
                record.prompt.to_lowercase().contains(&needle.to_lowercase())
            })
            && self.since.is_none_or(|since| record.timestamp >= since)
            && self.until.is_none_or(|until| record.timestamp < until)
    }

    /// Query document for the Mongo sink
    pub fn to_mongo_filter(&self) -> Document {
        let mut filter = Document::new();

        for (field, value) in [
            ("user", &self.user),
            ("model", &self.model),
            ("source", &self.source),
            ("cascade_id", &self.cascade_id),
        ] {
            if let Some(value) = value {
                filter.insert(field, value.as_str());
            }
        }

        if let Some(ref text) = self.contains {
            filter.insert("prompt", doc! { "$regex": escape_regex(text), "$options": "i" });
        }

        let mut range = Document::new();
        if let Some(since) = self.since {
            range.insert("$gte", bson::DateTime::from_chrono(since));
        }
        if let Some(until) = self.until {
            range.insert("$lt", bson::DateTime::from_chrono(until));
        }
        if !range.is_empty() {
            filter.insert("timestamp", range);
        }

        filter
    }
}

fn escape_regex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
