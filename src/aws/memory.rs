//! In-memory implementations of the AWS seams with call counters
//!
//! They hold fixed, mutable data instead of scripting per-call expectations,
//! so tests describe the world and assert on the resulting calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    AutoScalingApi, AwsError, CompleteLifecycleAction, Ec2Api, InstanceDescription, QueueApi,
    QueueMessage, SpotRequestDescription,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub struct MemoryEc2 {
    instances: Mutex<Vec<InstanceDescription>>,
    spot_requests: Mutex<Vec<SpotRequestDescription>>,
    failure: Mutex<Option<AwsError>>,
    pub describe_instances_calls: AtomicUsize,
    pub describe_spot_calls: AtomicUsize,
}

impl MemoryEc2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_instances(&self, instances: Vec<InstanceDescription>) {
        *lock(&self.instances) = instances;
    }

    pub fn set_spot_requests(&self, requests: Vec<SpotRequestDescription>) {
        *lock(&self.spot_requests) = requests;
    }

    /// Make every describe call fail until cleared with `None`
    pub fn set_failure(&self, failure: Option<AwsError>) {
        *lock(&self.failure) = failure;
    }

    /// Change the state of one instance in place
    pub fn set_state(&self, instance_id: &str, state: &str) {
        for instance in lock(&self.instances).iter_mut() {
            if instance.instance_id == instance_id {
                instance.state = state.to_string();
            }
        }
    }

    fn check(&self) -> Result<(), AwsError> {
        match lock(&self.failure).clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Ec2Api for MemoryEc2 {
    async fn describe_instances(&self) -> Result<Vec<InstanceDescription>, AwsError> {
        self.describe_instances_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(lock(&self.instances).clone())
    }

    async fn describe_spot_requests(&self) -> Result<Vec<SpotRequestDescription>, AwsError> {
        self.describe_spot_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(lock(&self.spot_requests).clone())
    }
}

/// A queue without visibility timeouts: received messages stay until deleted
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<VecDeque<QueueMessage>>,
    delivered: Mutex<usize>,
    deleted: Mutex<Vec<String>>,
    failure: Mutex<Option<AwsError>>,
    sequence: AtomicUsize,
    pub receive_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a body with generated message id and receipt handle
    pub fn push_body(&self, body: impl Into<String>) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        let receipt_handle = format!("receipt-{}", n);
        lock(&self.messages).push_back(QueueMessage {
            message_id: format!("msg-{}", n),
            receipt_handle: receipt_handle.clone(),
            body: body.into(),
        });
        receipt_handle
    }

    /// Make every receive fail until cleared with `None`
    pub fn set_failure(&self, failure: Option<AwsError>) {
        *lock(&self.failure) = failure;
    }

    /// Receipt handles removed so far, in call order
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    /// Messages still on the queue
    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages handed out by `receive`, redeliveries included
    pub fn delivered(&self) -> usize {
        *lock(&self.delivered)
    }
}

#[async_trait]
impl QueueApi for MemoryQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>, AwsError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.failure).clone() {
            return Err(err);
        }
        let batch: Vec<QueueMessage> = lock(&self.messages).iter().take(10).cloned().collect();
        *lock(&self.delivered) += batch.len();
        Ok(batch)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), AwsError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut messages = lock(&self.messages);
        let before = messages.len();
        messages.retain(|m| m.receipt_handle != receipt_handle);
        if messages.len() == before {
            return Err(AwsError::api(
                "ReceiptHandleIsInvalid",
                format!("unknown receipt handle {}", receipt_handle),
            ));
        }
        lock(&self.deleted).push(receipt_handle.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAutoScaling {
    completed: Mutex<Vec<CompleteLifecycleAction>>,
    next_error: Mutex<Option<AwsError>>,
    pub complete_calls: AtomicUsize,
}

impl MemoryAutoScaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next completion call with `err`
    pub fn fail_next(&self, err: AwsError) {
        *lock(&self.next_error) = Some(err);
    }

    /// Successful completions, in call order
    pub fn completed(&self) -> Vec<CompleteLifecycleAction> {
        lock(&self.completed).clone()
    }
}

#[async_trait]
impl AutoScalingApi for MemoryAutoScaling {
    async fn complete_lifecycle_action(
        &self,
        action: &CompleteLifecycleAction,
    ) -> Result<(), AwsError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.next_error).take() {
            return Err(err);
        }
        lock(&self.completed).push(action.clone());
        Ok(())
    }
}
