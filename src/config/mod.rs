//! Runtime configuration of the drainer

use std::time::Duration;

use thiserror::Error;

use crate::reconciler::ReconcilerConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no queue URL given (use --queue-url or NODE_DRAINER_QUEUE_URL)")]
    MissingQueueUrl,

    #[error("invalid queue URL {0:?}: expected an https:// SQS queue URL")]
    InvalidQueueUrl(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Everything the drainer needs to start, after flags and environment have
/// been merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainerConfig {
    pub queue_url: String,
    pub ec2_poll_interval: Duration,
    pub spot_poll_interval: Duration,
    /// Lifecycle messages younger than this are never deleted
    pub min_delete_age: Duration,
    /// How long deleted lifecycle entries are remembered
    pub deletion_grace: Duration,
    /// Longest wait between reconciliation passes
    pub max_wait: Duration,
    pub error_cooldown: Duration,
    /// Retry delay of a cache whose last fetch failed
    pub fetch_backoff: Duration,
    /// Scope of the pod and workload watches; cluster-wide if unset
    pub namespace: Option<String>,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            ec2_poll_interval: Duration::from_secs(10),
            spot_poll_interval: Duration::from_secs(10),
            min_delete_age: Duration::from_secs(30 * 60),
            deletion_grace: Duration::from_secs(5 * 60),
            max_wait: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(5),
            fetch_backoff: Duration::from_secs(5),
            namespace: None,
        }
    }
}

impl DrainerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_url.is_empty() {
            return Err(ConfigError::MissingQueueUrl);
        }
        if !self.queue_url.starts_with("https://") {
            return Err(ConfigError::InvalidQueueUrl(self.queue_url.clone()));
        }

        let positive = [
            ("ec2 poll interval", self.ec2_poll_interval),
            ("spot poll interval", self.spot_poll_interval),
            ("max wait", self.max_wait),
            ("fetch backoff", self.fetch_backoff),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            min_delete_age: self.min_delete_age,
            max_wait: self.max_wait,
            error_cooldown: self.error_cooldown,
            ..Default::default()
        }
    }
}
