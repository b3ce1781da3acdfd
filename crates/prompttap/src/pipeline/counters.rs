//! Process-wide counters surfaced through the status endpoint

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every stage.
///
/// Faults are absorbed where they happen and only show up here and in the logs.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    connections_opened: AtomicU64,
    events_captured: AtomicU64,
    capture_detached: AtomicU64,
    messages_reassembled: AtomicU64,
    events_extracted: AtomicU64,
    discarded: AtomicU64,
    duplicates_suppressed: AtomicU64,
    framing_faults: AtomicU64,
    decode_faults: AtomicU64,
    transport_faults: AtomicU64,
    persisted_primary: AtomicU64,
    persisted_fallback: AtomicU64,
    already_present: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub connections_opened: u64,
    pub events_captured: u64,
    pub capture_detached: u64,
    pub messages_reassembled: u64,
    pub events_extracted: u64,
    pub discarded: u64,
    pub duplicates_suppressed: u64,
    pub framing_faults: u64,
    pub decode_faults: u64,
    pub transport_faults: u64,
    pub persisted_primary: u64,
    pub persisted_fallback: u64,
    pub already_present: u64,
    pub write_failures: u64,
}

impl CounterSnapshot {
    /// Sum of every fault class
    pub fn total_faults(&self) -> u64 {
        self.framing_faults + self.decode_faults + self.transport_faults + self.write_failures
    }
}

macro_rules! counter_incr {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    counter_incr! {
        connection_opened => connections_opened,
        event_captured => events_captured,
        capture_detached => capture_detached,
        message_reassembled => messages_reassembled,
        event_extracted => events_extracted,
        discarded => discarded,
        duplicate_suppressed => duplicates_suppressed,
        framing_fault => framing_faults,
        decode_fault => decode_faults,
        transport_fault => transport_faults,
        persisted_primary => persisted_primary,
        persisted_fallback => persisted_fallback,
        already_present => already_present,
        write_failure => write_failures,
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            events_captured: self.events_captured.load(Ordering::Relaxed),
            capture_detached: self.capture_detached.load(Ordering::Relaxed),
            messages_reassembled: self.messages_reassembled.load(Ordering::Relaxed),
            events_extracted: self.events_extracted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            framing_faults: self.framing_faults.load(Ordering::Relaxed),
            decode_faults: self.decode_faults.load(Ordering::Relaxed),
            transport_faults: self.transport_faults.load(Ordering::Relaxed),
            persisted_primary: self.persisted_primary.load(Ordering::Relaxed),
            persisted_fallback: self.persisted_fallback.load(Ordering::Relaxed),
            already_present: self.already_present.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
