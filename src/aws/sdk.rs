//! Production implementations of the AWS seams on top of the official SDK

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    AutoScalingApi, AwsError, CompleteLifecycleAction, Ec2Api, InstanceDescription, QueueApi,
    QueueMessage, SpotRequestDescription,
};

const MAX_MESSAGES: i32 = 10;
const WAIT_TIME_SECS: i32 = 10;
const VISIBILITY_TIMEOUT_SECS: i32 = 20;

/// Map any SDK error to `code: message` for service errors, or a transport
/// error carrying the full error chain otherwise
fn sdk_error<E, R>(err: SdkError<E, R>) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug + 'static,
{
    match &err {
        SdkError::ServiceError(service) => {
            let inner = service.err();
            AwsError::api(
                inner.code().unwrap_or("Unknown"),
                inner.message().unwrap_or_default(),
            )
        }
        _ => AwsError::Transport(DisplayErrorContext(&err).to_string()),
    }
}

fn to_utc(dt: &aws_sdk_ec2::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

/// Shared SDK configuration loaded from the default provider chain
pub async fn load_config() -> aws_config::SdkConfig {
    aws_config::load_defaults(BehaviorVersion::latest()).await
}

#[derive(Clone)]
pub struct SdkEc2 {
    client: aws_sdk_ec2::Client,
}

impl SdkEc2 {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ec2::Client::new(config),
        }
    }
}

fn describe_instance(instance: &aws_sdk_ec2::types::Instance) -> InstanceDescription {
    let name = instance
        .tags()
        .iter()
        .find(|t| t.key() == Some("Name"))
        .and_then(|t| t.value())
        .unwrap_or_default();

    InstanceDescription {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        private_dns_name: instance.private_dns_name().unwrap_or_default().to_string(),
        state: instance
            .state()
            .and_then(|s| s.name())
            .map(|n| n.as_str().to_string())
            .unwrap_or_default(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        name: name.to_string(),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .unwrap_or_default()
            .to_string(),
        instance_lifecycle: instance
            .instance_lifecycle()
            .map(|l| l.as_str().to_string())
            .unwrap_or_default(),
        launch_time: instance.launch_time().and_then(to_utc),
        state_transition_reason: instance
            .state_transition_reason()
            .unwrap_or_default()
            .to_string(),
    }
}

#[async_trait]
impl Ec2Api for SdkEc2 {
    async fn describe_instances(&self) -> Result<Vec<InstanceDescription>, AwsError> {
        let mut out = Vec::new();
        let mut pages = self.client.describe_instances().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk_error)?;
            for reservation in page.reservations() {
                out.extend(reservation.instances().iter().map(describe_instance));
            }
        }
        debug!(count = out.len(), "described instances");
        Ok(out)
    }

    async fn describe_spot_requests(&self) -> Result<Vec<SpotRequestDescription>, AwsError> {
        let mut out = Vec::new();
        let mut pages = self
            .client
            .describe_spot_instance_requests()
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(sdk_error)?;
            for request in page.spot_instance_requests() {
                out.push(SpotRequestDescription {
                    instance_id: request.instance_id().unwrap_or_default().to_string(),
                    request_id: request
                        .spot_instance_request_id()
                        .unwrap_or_default()
                        .to_string(),
                    create_time: request.create_time().and_then(to_utc),
                    state: request
                        .state()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    status_code: request
                        .status()
                        .and_then(|s| s.code())
                        .unwrap_or_default()
                        .to_string(),
                    status_update_time: request
                        .status()
                        .and_then(|s| s.update_time())
                        .and_then(to_utc),
                });
            }
        }
        debug!(count = out.len(), "described spot requests");
        Ok(out)
    }
}

#[derive(Clone)]
pub struct SdkQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SdkQueue {
    pub fn new(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(config),
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl QueueApi for SdkQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>, AwsError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(MAX_MESSAGES)
            .wait_time_seconds(WAIT_TIME_SECS)
            .visibility_timeout(VISIBILITY_TIMEOUT_SECS)
            .send()
            .await
            .map_err(sdk_error)?;

        Ok(output
            .messages()
            .iter()
            .map(|m| QueueMessage {
                message_id: m.message_id().unwrap_or_default().to_string(),
                receipt_handle: m.receipt_handle().unwrap_or_default().to_string(),
                body: m.body().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), AwsError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SdkAutoScaling {
    client: aws_sdk_autoscaling::Client,
}

impl SdkAutoScaling {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_autoscaling::Client::new(config),
        }
    }
}

#[async_trait]
impl AutoScalingApi for SdkAutoScaling {
    async fn complete_lifecycle_action(
        &self,
        action: &CompleteLifecycleAction,
    ) -> Result<(), AwsError> {
        self.client
            .complete_lifecycle_action()
            .instance_id(&action.instance_id)
            .auto_scaling_group_name(&action.group_name)
            .lifecycle_hook_name(&action.hook_name)
            .lifecycle_action_result("CONTINUE")
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}
