//! Sliding-window duplicate suppression
//!
//! Entries are keyed by the bucket-independent content digest and remember
//! the time bucket they were first seen in. Two events match when their
//! buckets are equal or adjacent, so equal fingerprints always collapse and a
//! prompt that straddles a bucket edge does too. The lookup and the insert
//! happen under one map entry guard.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::extract::{ContentDigest, ExtractedEvent};

/// Observations between opportunistic sweeps
const SWEEP_EVERY: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Fresh,
    Duplicate,
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    first: Instant,
    bucket: i64,
}

pub struct DedupWindow {
    seen: DashMap<ContentDigest, Seen>,
    window: Duration,
    observed: AtomicU64,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            window,
            observed: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an event; `Duplicate` when the same content was seen within
    /// the window in the same or a neighbouring time bucket
    pub fn observe(&self, event: &ExtractedEvent, now: Instant) -> Observation {
        if self.observed.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }

        let key = &event.fingerprint_key;
        let current = Seen {
            first: now,
            bucket: key.bucket(),
        };

        match self.seen.entry(key.content_digest()) {
            Entry::Occupied(mut entry) => {
                let seen = *entry.get();
                if self.within(seen.first, now) && seen.bucket.abs_diff(current.bucket) <= 1 {
                    Observation::Duplicate
                } else {
                    entry.insert(current);
                    Observation::Fresh
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(current);
                Observation::Fresh
            }
        }
    }

    fn within(&self, first_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(first_seen) < self.window
    }

    /// Drop entries older than the window; returns how many were removed
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, seen| self.within(seen.first, now));
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
