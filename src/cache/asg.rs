//! Lifecycle-hook cache fed by the ASG notification queue
//!
//! Unlike the other sources, entries here are mutated in place: `complete`
//! and `delete` flip flags that must survive later polls. Entries are kept
//! after deletion and only dropped once the deletion grace window has passed,
//! so a message that is still in flight on the queue is not taken for a new
//! termination.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CacheError, Snapshot};
use crate::aws::{AutoScalingApi, AwsError, CompleteLifecycleAction, QueueApi, QueueMessage};
use crate::metrics::SharedMetrics;
use crate::model::AsgRecord;
use crate::signal::Emitter;

pub const TEST_NOTIFICATION: &str = "autoscaling:TEST_NOTIFICATION";

/// Delay before the next receive when a poll brought nothing new
const IDLE_DELAY: Duration = Duration::from_secs(1);

/// Body of a lifecycle-hook notification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LifecycleMessage {
    pub lifecycle_hook_name: String,
    pub account_id: String,
    pub request_id: String,
    pub lifecycle_transition: String,
    pub auto_scaling_group_name: String,
    pub service: String,
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "EC2InstanceId")]
    pub ec2_instance_id: String,
    pub lifecycle_action_token: String,
    pub event: String,
}

#[derive(Debug, Clone)]
struct Entry {
    message: LifecycleMessage,
    receipt_handle: String,
    completed: bool,
    deleted_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn record(&self) -> AsgRecord {
        AsgRecord {
            id: self.message.ec2_instance_id.clone(),
            hook_name: self.message.lifecycle_hook_name.clone(),
            group_name: self.message.auto_scaling_group_name.clone(),
            transition: self.message.lifecycle_transition.clone(),
            triggered_at: self.message.time,
            completed: self.completed,
            deleted: self.deleted_at.is_some(),
        }
    }
}

pub struct LifecycleCache {
    queue: Arc<dyn QueueApi>,
    autoscaling: Arc<dyn AutoScalingApi>,
    entries: DashMap<String, Entry>,
    deletion_grace: Duration,
    failures: AtomicU32,
    emitter: Emitter,
    metrics: SharedMetrics,
}

impl LifecycleCache {
    pub fn new(
        queue: Arc<dyn QueueApi>,
        autoscaling: Arc<dyn AutoScalingApi>,
        deletion_grace: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            queue,
            autoscaling,
            entries: DashMap::new(),
            deletion_grace,
            failures: AtomicU32::new(0),
            emitter: Emitter::new(),
            metrics,
        }
    }

    /// Ingest one queue message. Returns whether a new entry was cached.
    pub async fn handle_message(&self, message: &QueueMessage) -> Result<bool, CacheError> {
        self.metrics.record_message_received();

        let decoded: LifecycleMessage = match serde_json::from_str(&message.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.metrics.record_message_malformed();
                return Err(CacheError::Decode {
                    message_id: message.message_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        if decoded.event == TEST_NOTIFICATION {
            debug!(message_id = %message.message_id, "dropping test notification");
            self.queue.delete(&message.receipt_handle).await?;
            self.metrics.record_message_ignored();
            return Ok(false);
        }

        if decoded.ec2_instance_id.is_empty() {
            self.metrics.record_message_malformed();
            return Err(CacheError::Decode {
                message_id: message.message_id.clone(),
                reason: "missing EC2InstanceId".to_string(),
            });
        }

        let id = decoded.ec2_instance_id.clone();
        if self.entries.contains_key(&id) {
            // at-least-once delivery
            self.metrics.record_message_ignored();
            return Ok(false);
        }

        let entry = Entry {
            message: decoded,
            receipt_handle: message.receipt_handle.clone(),
            completed: false,
            deleted_at: None,
        };
        info!(
            instance_id = %id,
            asg_name = %entry.message.auto_scaling_group_name,
            asg_hook = %entry.message.lifecycle_hook_name,
            asg_transition = %entry.message.lifecycle_transition,
            asg_triggered_at = ?entry.message.time,
            "cached lifecycle message"
        );
        self.entries.insert(id, entry);
        Ok(true)
    }

    /// Receive one batch. Every message is handled; the first failure is
    /// returned after the batch. Returns the number of new entries.
    ///
    /// A failed receive counts towards the failure streak. A received batch
    /// ends it and is recorded as a successful fetch, even when single
    /// messages in it could not be handled.
    pub async fn poll_once(&self) -> Result<usize, CacheError> {
        let messages = match self.queue.receive().await {
            Ok(messages) => messages,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_fetch_failure("asg");
                return Err(e.into());
            }
        };

        let mut added = 0;
        let mut first_error = None;
        for message in &messages {
            match self.handle_message(message).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e @ CacheError::Decode { .. }) => {
                    error!(message_id = %message.message_id, error = %e, "malformed lifecycle message left on the queue");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(message_id = %message.message_id, error = %e, "failed to handle lifecycle message");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.failures.store(0, Ordering::Relaxed);
        self.metrics.record_fetch_success("asg", added > 0);
        if added > 0 {
            self.emitter.emit();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(added),
        }
    }

    /// Complete the lifecycle hook of `instance_id` with `CONTINUE`.
    ///
    /// Unknown and already completed instances are a no-op, as is the
    /// "no active lifecycle action" validation error.
    pub async fn complete(&self, instance_id: &str) -> Result<(), AwsError> {
        let action = match self.entries.get(instance_id) {
            None => return Ok(()),
            Some(entry) if entry.completed => return Ok(()),
            Some(entry) => CompleteLifecycleAction {
                instance_id: instance_id.to_string(),
                group_name: entry.message.auto_scaling_group_name.clone(),
                hook_name: entry.message.lifecycle_hook_name.clone(),
            },
        };

        match self.autoscaling.complete_lifecycle_action(&action).await {
            Ok(()) => {}
            Err(e) if e.is_no_active_lifecycle_action() => {
                info!(instance_id, error = %e, "lifecycle action already gone");
            }
            Err(e) => return Err(e),
        }

        if let Some(mut entry) = self.entries.get_mut(instance_id) {
            entry.completed = true;
        }
        self.metrics.record_completion();
        info!(instance_id, "completed lifecycle action");
        Ok(())
    }

    /// Remove the queue message of `instance_id`. Unknown and already
    /// deleted instances are a no-op.
    pub async fn delete(&self, instance_id: &str) -> Result<(), AwsError> {
        let receipt_handle = match self.entries.get(instance_id) {
            None => return Ok(()),
            Some(entry) if entry.deleted_at.is_some() => return Ok(()),
            Some(entry) => entry.receipt_handle.clone(),
        };

        self.queue.delete(&receipt_handle).await?;

        if let Some(mut entry) = self.entries.get_mut(instance_id) {
            entry.deleted_at = Some(Utc::now());
        }
        self.metrics.record_deletion();
        info!(instance_id, "deleted lifecycle message");
        Ok(())
    }

    /// Drop entries deleted longer than the grace window before `now`
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.deletion_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.deleted_at {
            Some(deleted_at) => now - deleted_at <= grace,
            None => true,
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "purged deleted lifecycle entries");
            self.emitter.emit();
        }
        removed
    }

    /// Receive and ingest messages until cancelled
    pub async fn run(self: Arc<Self>, backoff: Duration, cancel: CancellationToken) {
        info!("starting lifecycle queue consumer");
        loop {
            let result = tokio::select! {
                result = self.poll_once() => result,
                _ = cancel.cancelled() => break,
            };

            let delay = match result {
                Ok(added) if added > 0 => Duration::ZERO,
                Ok(_) | Err(CacheError::Decode { .. }) => IDLE_DELAY,
                Err(e) => {
                    warn!(
                        failures = self.failures.load(Ordering::Relaxed),
                        error = %e,
                        "lifecycle queue request failed"
                    );
                    backoff
                }
            };

            self.collect_garbage(Utc::now());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        info!("lifecycle queue consumer stopped");
    }
}

impl Snapshot<AsgRecord> for LifecycleCache {
    fn list(&self) -> Vec<AsgRecord> {
        let mut records: Vec<AsgRecord> = self.entries.iter().map(|e| e.record()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn healthy(&self) -> bool {
        self.failures.load(Ordering::Relaxed) == 0
    }

    fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::memory::{MemoryAutoScaling, MemoryQueue};
    use crate::aws::NO_ACTIVE_LIFECYCLE_ACTION;
    use crate::metrics::Metrics;

    fn body(instance_id: &str) -> String {
        serde_json::json!({
            "LifecycleHookName": "drain",
            "AccountId": "123456789012",
            "RequestId": "req-1",
            "LifecycleTransition": "autoscaling:EC2_INSTANCE_TERMINATING",
            "AutoScalingGroupName": "workers",
            "Service": "AWS Auto Scaling",
            "Time": "2024-03-01T12:00:00.123Z",
            "EC2InstanceId": instance_id,
            "LifecycleActionToken": "token-1"
        })
        .to_string()
    }

    struct Fixture {
        queue: Arc<MemoryQueue>,
        autoscaling: Arc<MemoryAutoScaling>,
        metrics: SharedMetrics,
        cache: LifecycleCache,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(MemoryQueue::new());
        let autoscaling = Arc::new(MemoryAutoScaling::new());
        let metrics = Metrics::shared();
        let cache = LifecycleCache::new(
            queue.clone(),
            autoscaling.clone(),
            Duration::from_secs(300),
            Arc::clone(&metrics),
        );
        Fixture {
            queue,
            autoscaling,
            metrics,
            cache,
        }
    }

    #[test]
    fn test_decode_message() {
        let message: LifecycleMessage = serde_json::from_str(&body("i-1")).unwrap();
        assert_eq!(message.ec2_instance_id, "i-1");
        assert_eq!(message.auto_scaling_group_name, "workers");
        assert_eq!(message.lifecycle_hook_name, "drain");
        assert!(message.time.is_some());
        assert_eq!(message.event, "");
    }

    #[tokio::test]
    async fn test_poll_caches_new_messages() {
        let f = fixture();
        f.queue.push_body(body("i-2"));
        f.queue.push_body(body("i-1"));

        assert_eq!(f.cache.poll_once().await.unwrap(), 2);
        let records = f.cache.list();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "i-1");
        assert_eq!(records[0].group_name, "workers");
        assert!(!records[0].completed);
        assert!(!records[0].deleted);
    }

    #[tokio::test]
    async fn test_duplicates_are_ignored() {
        let f = fixture();
        let first = f.queue.push_body(body("i-1"));
        f.cache.poll_once().await.unwrap();
        f.cache.complete("i-1").await.unwrap();

        // redelivery of the same message, plus a second copy
        f.queue.push_body(body("i-1"));
        assert_eq!(f.cache.poll_once().await.unwrap(), 0);

        let records = f.cache.list();
        assert_eq!(records.len(), 1);
        assert!(records[0].completed);

        // the original receipt handle is still the one that gets deleted
        f.cache.delete("i-1").await.unwrap();
        assert_eq!(f.queue.deleted(), vec![first]);
        assert_eq!(f.metrics.snapshot().messages_ignored, 2);
    }

    #[tokio::test]
    async fn test_test_notification_is_deleted() {
        let f = fixture();
        let handle = f.queue.push_body(
            serde_json::json!({
                "Event": TEST_NOTIFICATION,
                "AutoScalingGroupName": "workers",
                "Time": "2024-03-01T12:00:00Z"
            })
            .to_string(),
        );

        assert_eq!(f.cache.poll_once().await.unwrap(), 0);
        assert!(f.cache.list().is_empty());
        assert_eq!(f.queue.deleted(), vec![handle]);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_an_error() {
        let f = fixture();
        f.queue.push_body("not json");
        f.queue.push_body(body("i-1"));

        let err = f.cache.poll_once().await.unwrap_err();
        assert!(matches!(err, CacheError::Decode { .. }));
        // the rest of the batch is still ingested
        assert_eq!(f.cache.list().len(), 1);
        assert_eq!(f.metrics.snapshot().messages_malformed, 1);
        assert!(f.cache.healthy());

        let counters = f.metrics.source("asg");
        assert_eq!(counters.successes, 1);
        assert_eq!(counters.changes, 1);
    }

    #[tokio::test]
    async fn test_receive_failure_marks_unhealthy() {
        let f = fixture();
        f.queue.set_failure(Some(AwsError::Transport("timeout".to_string())));

        assert!(matches!(f.cache.poll_once().await, Err(CacheError::Aws(_))));
        assert!(!f.cache.healthy());
        assert_eq!(f.metrics.source("asg").failures, 1);

        f.queue.set_failure(None);
        f.queue.push_body(body("i-1"));
        assert_eq!(f.cache.poll_once().await.unwrap(), 1);
        assert!(f.cache.healthy());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let f = fixture();
        f.queue.push_body(body("i-1"));
        f.cache.poll_once().await.unwrap();

        f.cache.complete("i-1").await.unwrap();
        f.cache.complete("i-1").await.unwrap();
        assert_eq!(f.autoscaling.complete_calls.load(Ordering::SeqCst), 1);

        let completed = f.autoscaling.completed();
        assert_eq!(completed[0].group_name, "workers");
        assert_eq!(completed[0].hook_name, "drain");
        assert!(f.cache.list()[0].completed);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture();
        f.queue.push_body(body("i-1"));
        f.cache.poll_once().await.unwrap();

        f.cache.delete("i-1").await.unwrap();
        f.cache.delete("i-1").await.unwrap();
        assert_eq!(f.queue.delete_calls.load(Ordering::SeqCst), 1);
        assert!(f.cache.list()[0].deleted);
    }

    #[tokio::test]
    async fn test_unknown_instance_is_noop() {
        let f = fixture();
        f.cache.complete("i-404").await.unwrap();
        f.cache.delete("i-404").await.unwrap();
        assert_eq!(f.autoscaling.complete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.queue.delete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_active_lifecycle_action_counts_as_success() {
        let f = fixture();
        f.queue.push_body(body("i-1"));
        f.cache.poll_once().await.unwrap();

        f.autoscaling.fail_next(AwsError::api(
            "ValidationError",
            "No active Lifecycle Action found with instance ID i-1",
        ));
        assert!(NO_ACTIVE_LIFECYCLE_ACTION.starts_with("ValidationError"));
        f.cache.complete("i-1").await.unwrap();
        assert!(f.cache.list()[0].completed);
    }

    #[tokio::test]
    async fn test_other_errors_surface() {
        let f = fixture();
        f.queue.push_body(body("i-1"));
        f.cache.poll_once().await.unwrap();

        f.autoscaling.fail_next(AwsError::api("Throttling", "Rate exceeded"));
        assert!(f.cache.complete("i-1").await.is_err());
        assert!(!f.cache.list()[0].completed);

        f.cache.complete("i-1").await.unwrap();
        assert!(f.cache.list()[0].completed);
    }

    #[tokio::test]
    async fn test_garbage_collection_after_grace() {
        let f = fixture();
        f.queue.push_body(body("i-1"));
        f.queue.push_body(body("i-2"));
        f.cache.poll_once().await.unwrap();
        f.cache.delete("i-1").await.unwrap();

        let now = Utc::now();
        assert_eq!(f.cache.collect_garbage(now), 0);
        assert_eq!(f.cache.collect_garbage(now + chrono::Duration::minutes(6)), 1);

        let ids: Vec<_> = f.cache.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["i-2"]);
    }
}
