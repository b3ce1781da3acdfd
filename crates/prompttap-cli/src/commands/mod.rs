pub mod count;
pub mod list;
pub mod stats;

pub use count::CountCommand;
pub use list::ListCommand;
pub use stats::StatsCommand;

use chrono::{DateTime, Utc};
use clap::Args;
use std::sync::Arc;

use prompttap::config::Config;
use prompttap::storage::{JsonlSink, MongoSink, RecordFilter, RecordSink};

use crate::error::CliResult;
use crate::output::parse_time;

/// Record filters shared by every read command
#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    #[clap(long, help = "Only records captured for this user")]
    pub user: Option<String>,

    #[clap(long, help = "Only records for this model")]
    pub model: Option<String>,

    #[clap(long, help = "Only records from this source (windsurf, cursor, ...)")]
    pub source: Option<String>,

    #[clap(long, help = "Only records in this cascade")]
    pub cascade: Option<String>,

    #[clap(long, help = "Prompt contains this text (case-insensitive)")]
    pub contains: Option<String>,

    #[clap(long, value_parser = parse_time, help = "Captured at or after (YYYY-MM-DD or RFC 3339)")]
    pub since: Option<DateTime<Utc>>,

    #[clap(long, value_parser = parse_time, help = "Captured before (YYYY-MM-DD or RFC 3339)")]
    pub until: Option<DateTime<Utc>>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> RecordFilter {
        let mut filter = RecordFilter::new();
        if let Some(ref user) = self.user {
            filter = filter.with_user(user.clone());
        }
        if let Some(ref model) = self.model {
            filter = filter.with_model(model.clone());
        }
        if let Some(ref source) = self.source {
            filter = filter.with_source(source.clone());
        }
        if let Some(ref cascade) = self.cascade {
            filter = filter.with_cascade_id(cascade.clone());
        }
        if let Some(ref text) = self.contains {
            filter = filter.containing(text.clone());
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(until) = self.until {
            filter = filter.until(until);
        }
        filter
    }
}

/// The primary store when reachable, otherwise the fallback files
pub async fn open_sink(config: &Config, fallback_only: bool) -> CliResult<Arc<dyn RecordSink>> {
    let fallback = Arc::new(JsonlSink::new(config.storage.fallback_dir.clone()));
    if fallback_only || !config.storage.mongo_enabled {
        return Ok(fallback);
    }

    let primary = MongoSink::new(&config.storage).await?;
    match primary.init().await {
        Ok(()) => Ok(Arc::new(primary)),
        Err(e) => {
            tracing::warn!(
                "Primary store unavailable ({e}), reading {}",
                config.storage.fallback_dir.display()
            );
            Ok(fallback)
        }
    }
}
