//! The reconciliation loop
//!
//! One pass pulls every cache snapshot, combines them, and then:
//!
//! 1. completes the lifecycle hook of every waiting instance,
//! 2. records EC2 state transitions,
//! 3. deletes the queue message of instances that are terminated and old
//!    enough.
//!
//! Passes are driven by a [`Sink`] fed by every cache and by the loop's own
//! trigger, with `max_wait` as a safety-net poll.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aws::AwsError;
use crate::cache::asg::LifecycleCache;
use crate::cache::Snapshot;
use crate::metrics::SharedMetrics;
use crate::model::{
    combine, ec2_state, Ec2Record, Instance, LogFields, NodeRecord, PodRecord, SourceLists,
    SpotRecord,
};
use crate::query::instance::{
    by_launch_time, by_triggered_at, has_ec2_data, has_ec2_state, has_lifecycle_message,
    is_waiting, pending_lifecycle_completion, wants_shutdown,
};
use crate::query::pod::{pod_can_decrement, pod_immune_to_eviction, select_by_instance};
use crate::query::query;
use crate::signal::{Emitter, Sink};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Queue messages younger than this are never deleted
    pub min_delete_age: Duration,
    /// Longest wait between passes without any signal
    pub max_wait: Duration,
    /// Pause after a failed pass
    pub error_cooldown: Duration,
    /// Poll interval while waiting for the first EC2 snapshot
    pub warmup_poll: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            min_delete_age: Duration::from_secs(30 * 60),
            max_wait: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(5),
            warmup_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Complete,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Complete => write!(f, "complete lifecycle action"),
            Action::Delete => write!(f, "delete lifecycle message"),
        }
    }
}

#[derive(Error, Debug)]
#[error("failed to {action} for {instance_id}: {error}")]
pub struct ReconcileError {
    pub instance_id: String,
    pub action: Action,
    pub error: AwsError,
    /// The instance as the failing pass saw it
    pub context: LogFields,
}

impl ReconcileError {
    fn new(instance: &Instance, action: Action, error: AwsError) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            action,
            error,
            context: instance.log_fields(),
        }
    }

    fn field(&self, key: &str) -> &str {
        self.context.get(key).unwrap_or_default()
    }
}

/// Every cache the loop reads
#[derive(Clone)]
pub struct Sources {
    pub asg: Arc<LifecycleCache>,
    pub ec2: Arc<dyn Snapshot<Ec2Record>>,
    pub spot: Arc<dyn Snapshot<SpotRecord>>,
    pub nodes: Arc<dyn Snapshot<NodeRecord>>,
    pub pods: Arc<dyn Snapshot<PodRecord>>,
}

impl Sources {
    fn lists(&self) -> SourceLists {
        SourceLists {
            asg: self.asg.list(),
            ec2: self.ec2.list(),
            spot: self.spot.list(),
            nodes: self.nodes.list(),
            pods: self.pods.list(),
        }
    }

    fn emitters(&self) -> Vec<Emitter> {
        vec![
            self.asg.emitter(),
            self.ec2.emitter(),
            self.spot.emitter(),
            self.nodes.emitter(),
            self.pods.emitter(),
        ]
    }

    fn unhealthy(&self) -> Vec<&'static str> {
        [
            ("asg", self.asg.healthy()),
            ("ec2", self.ec2.healthy()),
            ("spot", self.spot.healthy()),
            ("nodes", self.nodes.healthy()),
            ("pods", self.pods.healthy()),
        ]
        .into_iter()
        .filter(|(_, healthy)| !healthy)
        .map(|(name, _)| name)
        .collect()
    }
}

/// What one pass saw and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub instances: usize,
    pub waiting: usize,
    pub pending_completion: usize,
    /// Pods on shutting-down instances that cannot be evicted right now
    pub pods_blocking: usize,
    pub completed: Vec<String>,
    pub deleted: Vec<String>,
    /// Deletions postponed because the message is too young
    pub deferred: Vec<String>,
    pub unhealthy: Vec<&'static str>,
}

/// Source of the current time for message ages
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Reconciler {
    config: ReconcilerConfig,
    clock: Clock,
    sources: Sources,
    sink: Sink,
    trigger: Emitter,
    /// Last observed EC2 state per instance
    states: HashMap<String, String>,
    /// Instances with a deferred re-trigger already scheduled
    deferred: HashSet<String>,
    metrics: SharedMetrics,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, sources: Sources, metrics: SharedMetrics) -> Self {
        let sink = Sink::new();
        let trigger = Emitter::new();
        sink.subscribe(&trigger);
        for emitter in sources.emitters() {
            sink.subscribe(&emitter);
        }

        Self {
            config,
            clock: Arc::new(Utc::now),
            sources,
            sink,
            trigger,
            states: HashMap::new(),
            deferred: HashSet::new(),
            metrics,
        }
    }

    /// Replace the wall clock used to age lifecycle messages
    pub fn set_clock(&mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
        self.clock = Arc::new(clock);
    }

    /// Emitter that wakes this loop
    pub fn trigger(&self) -> Emitter {
        self.trigger.clone()
    }

    /// Wait until EC2 produced a non-empty snapshot. Returns false if
    /// cancelled first.
    pub async fn warm_up(&self, cancel: &CancellationToken) -> bool {
        while self.sources.ec2.list().is_empty() {
            debug!("waiting for the first EC2 snapshot");
            tokio::select! {
                _ = tokio::time::sleep(self.config.warmup_poll) => {}
                _ = cancel.cancelled() => return false,
            }
        }
        true
    }

    /// Run one pass. The first failing action aborts the rest of the pass.
    pub async fn reconcile_once(&mut self) -> Result<PassReport, ReconcileError> {
        self.metrics.record_pass();

        let combined = combine(self.sources.lists());
        let instances = combined
            .instances
            .sort(by_launch_time())
            .sort(by_triggered_at().descending());

        let mut report = PassReport {
            instances: instances.len(),
            waiting: instances.select(&is_waiting()).len(),
            pending_completion: instances.select(&pending_lifecycle_completion()).len(),
            pods_blocking: combined
                .pods
                .select(&select_by_instance(wants_shutdown()))
                .filter(&pod_immune_to_eviction())
                .filter(&pod_can_decrement())
                .len(),
            unhealthy: self.sources.unhealthy(),
            ..Default::default()
        };

        for instance in instances.select(&is_waiting()) {
            info!(
                instance_id = %instance.instance_id,
                node_name = %instance.node_name(),
                ec2_state = %instance.ec2.state,
                ec2_type = %instance.ec2.instance_type,
                asg_name = %instance.asg.group_name,
                asg_triggered_at = ?instance.asg.triggered_at,
                pods = instance.pods.len(),
                "completing lifecycle action"
            );
            self.sources
                .asg
                .complete(&instance.instance_id)
                .await
                .map_err(|error| ReconcileError::new(&instance, Action::Complete, error))?;
            report.completed.push(instance.instance_id.clone());
            self.trigger.emit();
        }

        self.observe_transitions(instances.as_slice());

        let deletable = query()
            .select(has_ec2_data())
            .select(has_lifecycle_message())
            .select(has_ec2_state(&[ec2_state::TERMINATED]));

        for instance in instances.select(&deletable) {
            let id = instance.instance_id.clone();
            let age = instance
                .asg
                .triggered_at
                .and_then(|t| ((self.clock)() - t).to_std().ok())
                .unwrap_or(Duration::ZERO);

            if age < self.config.min_delete_age {
                let remaining = self.config.min_delete_age - age;
                warn!(
                    instance_id = %id,
                    age = ?age,
                    retry_in = ?remaining,
                    "lifecycle message is younger than the minimum delete age, not deleting yet"
                );
                self.metrics.record_retrigger();
                if self.deferred.insert(id.clone()) {
                    self.trigger.emit_after(remaining);
                }
                report.deferred.push(id);
                continue;
            }

            self.sources
                .asg
                .delete(&id)
                .await
                .map_err(|error| ReconcileError::new(&instance, Action::Delete, error))?;
            self.deferred.remove(&id);
            report.deleted.push(id);
        }

        Ok(report)
    }

    fn observe_transitions(&mut self, instances: &[Instance]) {
        let present: HashSet<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        self.states.retain(|id, _| present.contains(id.as_str()));
        self.deferred.retain(|id| present.contains(id.as_str()));

        for instance in instances.iter().filter(|i| has_ec2_data().matches(i)) {
            let state = instance.ec2.state.clone();
            let previous = self.states.insert(instance.instance_id.clone(), state.clone());
            let Some(previous) = previous else {
                continue;
            };
            if previous == state {
                continue;
            }

            info!(
                instance_id = %instance.instance_id,
                from = %previous,
                to = %state,
                "instance changed state"
            );

            if state == ec2_state::TERMINATED {
                let duration = match (instance.asg.triggered_at, instance.ec2.termination_time) {
                    (Some(triggered), Some(terminated)) => (terminated - triggered).to_std().ok(),
                    _ => None,
                };
                if let Some(duration) = duration {
                    info!(
                        instance_id = %instance.instance_id,
                        duration = ?duration,
                        "instance terminated after lifecycle trigger"
                    );
                    self.metrics.record_termination_duration(duration);
                }
            }
        }
    }

    fn log_report(&self, report: &PassReport) {
        info!(
            instances = report.instances,
            waiting = report.waiting,
            pending_completion = report.pending_completion,
            pods_blocking = report.pods_blocking,
            completed = report.completed.len(),
            deleted = report.deleted.len(),
            deferred = report.deferred.len(),
            "reconciliation pass finished"
        );
        if !report.unhealthy.is_empty() {
            warn!(sources = ?report.unhealthy, "reconciled with unhealthy sources");
        }
    }

    /// Wait for the caches to warm up, then reconcile on every signal until
    /// cancelled. An action in flight is finished before the loop exits.
    pub async fn run(mut self, cancel: CancellationToken) {
        if !self.warm_up(&cancel).await {
            return;
        }
        info!("reconciler started");

        while !cancel.is_cancelled() {
            match self.reconcile_once().await {
                Ok(report) => self.log_report(&report),
                Err(e) => {
                    error!(
                        instance_id = %e.instance_id,
                        action = %e.action,
                        error = %e.error,
                        node_name = e.field("node_name"),
                        ec2_state = e.field("ec2_state"),
                        ec2_type = e.field("ec2_type"),
                        asg_name = e.field("asg_name"),
                        asg_hook = e.field("asg_hook"),
                        asg_triggered_at = e.field("asg_triggered_at"),
                        asg_completed = e.field("asg_completed"),
                        pods = e.field("pods"),
                        "reconciliation pass failed"
                    );
                    self.metrics.record_pass_error();
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_cooldown) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
            self.sink.wait(self.config.max_wait, &cancel).await;
        }
        info!("reconciler stopped");
    }
}
