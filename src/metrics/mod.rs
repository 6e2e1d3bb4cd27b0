//! Observability context shared by the caches and the reconciler
//!
//! A single [`Metrics`] value is constructed at startup and handed to every
//! component that reports something. Counters are plain atomics so that any
//! task can update them without coordination; per-source counters live in a
//! `DashMap` keyed by source name.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Shared handle to the observability context
pub type SharedMetrics = Arc<Metrics>;

/// Most recent termination durations kept for the snapshot
pub const TERMINATION_HISTORY: usize = 256;

/// Fetch outcome counters for one source cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounters {
    pub successes: u64,
    pub failures: u64,
    pub changes: u64,
}

/// Counters for the whole drainer
#[derive(Default)]
pub struct Metrics {
    sources: DashMap<String, SourceCounters>,

    messages_received: AtomicU64,
    messages_ignored: AtomicU64,
    messages_malformed: AtomicU64,

    lifecycle_completions: AtomicU64,
    message_deletions: AtomicU64,

    passes: AtomicU64,
    pass_errors: AtomicU64,
    retriggers: AtomicU64,

    terminations: AtomicU64,
    termination_durations: Mutex<VecDeque<Duration>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle
    pub fn shared() -> SharedMetrics {
        Arc::new(Self::new())
    }

    pub fn record_fetch_success(&self, source: &str, changed: bool) {
        let mut counters = self.sources.entry(source.to_string()).or_default();
        counters.successes += 1;
        if changed {
            counters.changes += 1;
        }
    }

    pub fn record_fetch_failure(&self, source: &str) {
        self.sources
            .entry(source.to_string())
            .or_default()
            .failures += 1;
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_ignored(&self) {
        self.messages_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_malformed(&self) {
        self.messages_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.lifecycle_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletion(&self) {
        self.message_deletions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_error(&self) {
        self.pass_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retrigger(&self) {
        self.retriggers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long AWS took from triggering the hook to terminating the
    /// instance.
    /// Only the last [`TERMINATION_HISTORY`] durations are kept.
    pub fn record_termination_duration(&self, duration: Duration) {
        self.terminations.fetch_add(1, Ordering::Relaxed);
        let mut durations = self
            .termination_durations
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if durations.len() == TERMINATION_HISTORY {
            durations.pop_front();
        }
        durations.push_back(duration);
    }

    pub fn source(&self, source: &str) -> SourceCounters {
        self.sources
            .get(source)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut sources: Vec<(String, SourceCounters)> = self
            .sources
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        sources.sort_by(|a, b| a.0.cmp(&b.0));

        MetricsSnapshot {
            sources,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_ignored: self.messages_ignored.load(Ordering::Relaxed),
            messages_malformed: self.messages_malformed.load(Ordering::Relaxed),
            lifecycle_completions: self.lifecycle_completions.load(Ordering::Relaxed),
            message_deletions: self.message_deletions.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            pass_errors: self.pass_errors.load(Ordering::Relaxed),
            retriggers: self.retriggers.load(Ordering::Relaxed),
            terminations: self.terminations.load(Ordering::Relaxed),
            termination_durations_secs: self
                .termination_durations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|d| d.as_secs())
                .collect(),
        }
    }
}

/// Serializable copy of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sources: Vec<(String, SourceCounters)>,
    pub messages_received: u64,
    pub messages_ignored: u64,
    pub messages_malformed: u64,
    pub lifecycle_completions: u64,
    pub message_deletions: u64,
    pub passes: u64,
    pub pass_errors: u64,
    pub retriggers: u64,
    /// Terminations observed since startup
    pub terminations: u64,
    /// Oldest first, at most [`TERMINATION_HISTORY`] entries
    pub termination_durations_secs: Vec<u64>,
}
