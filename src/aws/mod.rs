//! AWS boundary: EC2 descriptions, the lifecycle-hook queue and hook completion
//!
//! Each remote service sits behind a small trait so the caches and the
//! reconciler can be driven by [`memory`] in tests and by [`sdk`] in
//! production.

pub mod memory;
pub mod sdk;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the validation error returned when a hook was already completed
/// or has expired
pub const NO_ACTIVE_LIFECYCLE_ACTION: &str =
    "ValidationError: No active Lifecycle Action found with instance";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AwsError {
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl AwsError {
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        AwsError::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The hook is no longer pending, so completing it again is a no-op
    pub fn is_no_active_lifecycle_action(&self) -> bool {
        self.to_string().starts_with(NO_ACTIVE_LIFECYCLE_ACTION)
    }
}

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// The fields of an EC2 instance the drainer consumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub private_dns_name: String,
    pub state: String,
    pub instance_type: String,
    /// Value of the `Name` tag
    pub name: String,
    pub availability_zone: String,
    /// `spot` for spot instances, empty for on-demand
    pub instance_lifecycle: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub state_transition_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRequestDescription {
    pub instance_id: String,
    pub request_id: String,
    pub create_time: Option<DateTime<Utc>>,
    pub state: String,
    pub status_code: String,
    pub status_update_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteLifecycleAction {
    pub instance_id: String,
    pub group_name: String,
    pub hook_name: String,
}

// ============================================================================
// SBIO: Traits for abstraction (allows in-memory doubles in tests)
// ============================================================================

#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// All instances, across every page
    async fn describe_instances(&self) -> Result<Vec<InstanceDescription>, AwsError>;

    /// All spot instance requests, across every page
    async fn describe_spot_requests(&self) -> Result<Vec<SpotRequestDescription>, AwsError>;
}

#[async_trait]
pub trait QueueApi: Send + Sync {
    /// One long-poll receive of up to ten messages
    async fn receive(&self) -> Result<Vec<QueueMessage>, AwsError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), AwsError>;
}

#[async_trait]
pub trait AutoScalingApi: Send + Sync {
    /// Complete the hook with result `CONTINUE`
    async fn complete_lifecycle_action(
        &self,
        action: &CompleteLifecycleAction,
    ) -> Result<(), AwsError>;
}
