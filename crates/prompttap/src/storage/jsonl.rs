//! Append-only JSONL fallback sink
//!
//! One `prompts_YYYY-MM-DD.jsonl` file per UTC day. A per-day fingerprint
//! index, loaded the first time a day is written, keeps writes idempotent.
//! Only the most recently written days stay indexed; an evicted day is
//! reloaded from its file if a late record arrives for it.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Page, PromptRecord, RecordFilter, RecordSink, RecordStats, WriteStatus};
use crate::error::{Result, TapError};

const FILE_PREFIX: &str = "prompts_";
const FILE_SUFFIX: &str = ".jsonl";
/// Day indexes kept in memory: today and the day before
const INDEXED_DAYS: NonZeroUsize = NonZeroUsize::MIN.saturating_add(1);

pub struct JsonlSink {
    dir: PathBuf,
    /// Fingerprints per day file name
    index: Mutex<LruCache<String, HashSet<String>>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: Mutex::new(LruCache::new(INDEXED_DAYS)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Day files whose fingerprints are currently held in memory
    pub async fn indexed_days(&self) -> usize {
        self.index.lock().await.len()
    }

    /// Day files, newest first
    async fn day_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
                files.push(entry.path());
            }
        }
        files.sort();
        files.reverse();
        Ok(files)
    }

    async fn read_file(path: &Path) -> Result<Vec<PromptRecord>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PromptRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed fallback line"
                    );
                }
            }
        }
        Ok(records)
    }

    /// Every record matching the filter, newest first
    async fn scan(&self, filter: &RecordFilter) -> Result<Vec<PromptRecord>> {
        let mut matched = Vec::new();
        for path in self.day_files().await? {
            matched.extend(
                Self::read_file(&path)
                    .await?
                    .into_iter()
                    .filter(|r| filter.matches(r)),
            );
        }
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched)
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn write(&self, record: &PromptRecord) -> Result<WriteStatus> {
        let file_name = record.day_file_name();
        let path = self.dir.join(&file_name);

        let mut index = self.index.lock().await;
        if !index.contains(&file_name) {
            let seen = Self::read_file(&path)
                .await?
                .into_iter()
                .map(|r| r.fingerprint)
                .collect();
            index.put(file_name.clone(), seen);
        }
        let seen = index
            .get_mut(&file_name)
            .ok_or_else(|| TapError::Storage(format!("index missing for {file_name}")))?;

        if seen.contains(&record.fingerprint) {
            return Ok(WriteStatus::AlreadyPresent);
        }

        fs::create_dir_all(&self.dir).await.map_err(|e| {
            TapError::Storage(format!("cannot create {}: {e}", self.dir.display()))
        })?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| TapError::Storage(format!("cannot open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TapError::Storage(format!("cannot append to {}: {e}", path.display())))?;
        file.flush().await?;

        seen.insert(record.fingerprint.clone());
        Ok(WriteStatus::Inserted)
    }

    async fn list(&self, filter: &RecordFilter, page: Page) -> Result<Vec<PromptRecord>> {
        Ok(self
            .scan(filter)
            .await?
            .into_iter()
            .skip(page.skip)
            .take(page.limit)
            .collect())
    }

    async fn count(&self, filter: &RecordFilter) -> Result<u64> {
        Ok(self.scan(filter).await?.len() as u64)
    }

    async fn stats(&self, filter: &RecordFilter) -> Result<RecordStats> {
        Ok(RecordStats::from_records(&self.scan(filter).await?))
    }
}
