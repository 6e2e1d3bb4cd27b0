//! Poll, diff and signal
//!
//! Every read-only source (EC2, Spot, nodes, pods) is a [`Source`]: it only
//! knows how to fetch its records and how to key them. [`SourceCache`] does
//! the rest once for all of them: it keeps the last snapshot, replaces it
//! wholesale on every refresh, emits a signal when the contents changed and
//! tracks failure streaks for [`SourceCache::healthy`].
//!
//! The lifecycle-hook cache in [`asg`] is different because its entries carry
//! mutable flags, so it has its own type.

pub mod asg;
pub mod ec2;
pub mod spot;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aws::AwsError;
use crate::metrics::SharedMetrics;
use crate::signal::{Emitter, Sink};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("AWS request failed: {0}")]
    Aws(#[from] AwsError),

    #[error("failed to decode message {message_id}: {reason}")]
    Decode { message_id: String, reason: String },
}

/// A read-only external system that can be listed
#[async_trait]
pub trait Source: Send + Sync + 'static {
    type Record: Clone + PartialEq + Send + Sync + 'static;

    /// Name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Cache key of a record; records with an empty key are dropped
    fn key(&self, record: &Self::Record) -> String;

    async fn fetch(&self) -> Result<Vec<Self::Record>, CacheError>;
}

/// Read side of a cache as seen by the reconciler
pub trait Snapshot<T>: Send + Sync {
    /// Current records, sorted by cache key
    fn list(&self) -> Vec<T>;

    fn healthy(&self) -> bool;

    fn emitter(&self) -> Emitter;
}

/// What changed between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl Diff {
    pub fn between<T: PartialEq>(old: &BTreeMap<String, T>, new: &BTreeMap<String, T>) -> Diff {
        let mut diff = Diff::default();
        for (key, record) in new {
            match old.get(key) {
                None => diff.added.push(key.clone()),
                Some(previous) if previous != record => diff.changed.push(key.clone()),
                Some(_) => {}
            }
        }
        diff.removed = old
            .keys()
            .filter(|k| !new.contains_key(*k))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

pub struct SourceCache<S: Source> {
    source: S,
    snapshot: RwLock<Arc<BTreeMap<String, S::Record>>>,
    failures: AtomicU32,
    emitter: Emitter,
    metrics: SharedMetrics,
}

impl<S: Source> SourceCache<S> {
    pub fn new(source: S, metrics: SharedMetrics) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            failures: AtomicU32::new(0),
            emitter: Emitter::new(),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.source.name()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn current(&self) -> Arc<BTreeMap<String, S::Record>> {
        Arc::clone(&*self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Fetch once, swap in the new snapshot and emit if anything changed
    pub async fn refresh(&self) -> Result<Diff, CacheError> {
        let records = match self.source.fetch().await {
            Ok(records) => records,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_fetch_failure(self.name());
                return Err(e);
            }
        };

        let mut next = BTreeMap::new();
        for record in records {
            let key = self.source.key(&record);
            if key.is_empty() {
                continue;
            }
            next.insert(key, record);
        }

        let diff = Diff::between(&self.current(), &next);
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);

        let recovered = self.failures.swap(0, Ordering::Relaxed);
        if recovered > 0 {
            info!(source = self.name(), failures = recovered, "source recovered");
        }
        self.metrics.record_fetch_success(self.name(), !diff.is_empty());

        if !diff.is_empty() {
            debug!(
                source = self.name(),
                added = diff.added.len(),
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                "snapshot changed"
            );
            self.emitter.emit();
        }
        Ok(diff)
    }

    /// Consecutive failed refreshes
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    async fn refresh_logged(&self) {
        if let Err(e) = self.refresh().await {
            warn!(
                source = self.name(),
                failures = self.failures(),
                error = %e,
                "refresh failed"
            );
        }
    }

    /// Refresh every `interval` until cancelled. A failed refresh is retried
    /// after `backoff` instead.
    pub async fn run_polling(
        self: Arc<Self>,
        interval: Duration,
        backoff: Duration,
        cancel: CancellationToken,
    ) {
        info!(source = self.name(), interval = ?interval, "starting poller");
        loop {
            self.refresh_logged().await;
            let delay = if self.healthy() { interval } else { backoff };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!(source = self.name(), "poller stopped");
    }

    /// Refresh whenever `sink` wakes, at least every `max_wait`, until
    /// cancelled. Used for push-based sources.
    pub async fn run_on_signal(
        self: Arc<Self>,
        sink: Sink,
        max_wait: Duration,
        backoff: Duration,
        cancel: CancellationToken,
    ) {
        info!(source = self.name(), "starting watch refresher");
        while !cancel.is_cancelled() {
            self.refresh_logged().await;
            let wait = if self.healthy() { max_wait } else { backoff };
            sink.wait(wait, &cancel).await;
        }
        info!(source = self.name(), "watch refresher stopped");
    }
}

impl<S: Source> Snapshot<S::Record> for SourceCache<S> {
    fn list(&self) -> Vec<S::Record> {
        self.current().values().cloned().collect()
    }

    fn healthy(&self) -> bool {
        self.failures() == 0
    }

    fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }
}

/// A source serving whatever was last handed to [`MemorySource::set`]
pub struct MemorySource<T> {
    name: &'static str,
    key: fn(&T) -> String,
    records: Mutex<Vec<T>>,
    failure: Mutex<Option<AwsError>>,
}

impl<T> MemorySource<T> {
    pub fn new(name: &'static str, key: fn(&T) -> String) -> Self {
        Self {
            name,
            key,
            records: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn set(&self, records: Vec<T>) {
        *self.records.lock().unwrap_or_else(|e| e.into_inner()) = records;
    }

    pub fn set_failure(&self, failure: Option<AwsError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = failure;
    }
}

#[async_trait]
impl<T> Source for MemorySource<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    type Record = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn key(&self, record: &T) -> String {
        (self.key)(record)
    }

    async fn fetch(&self) -> Result<Vec<T>, CacheError> {
        if let Some(err) = self.failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(err.into());
        }
        Ok(self.records.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
