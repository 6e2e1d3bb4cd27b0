//! Per-source records and the composite views built from them
//!
//! Every source cache produces one record type. A record whose key field is
//! empty is the "unknown to this source" value, which is what the composite
//! [`Instance`] carries when a source has not reported the instance (yet).
//! Presence must be tested through the selectors in [`crate::query`], never
//! by reaching into sub-records.

pub mod combine;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eviction::Verdict;

pub use combine::{combine, Combined, SourceLists};

/// EC2 instance lifecycle states
pub mod ec2_state {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const STOPPING: &str = "stopping";
    pub const STOPPED: &str = "stopped";
    pub const SHUTTING_DOWN: &str = "shutting-down";
    pub const TERMINATED: &str = "terminated";

    /// All states in their lifecycle order
    pub const ORDER: [&str; 6] = [PENDING, RUNNING, STOPPING, STOPPED, SHUTTING_DOWN, TERMINATED];
}

/// Ordered key/value pairs describing an entity in log lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFields(Vec<(&'static str, String)>);

impl LogFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, skipping empty values
    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.0.push((key, value));
        }
        self
    }

    pub fn extend(mut self, other: LogFields) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, String)> {
        self.0.iter()
    }
}

impl fmt::Display for LogFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

fn format_time(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_default()
}

/// Lifecycle hook state for one instance, as seen through the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsgRecord {
    /// EC2 instance id; empty if no lifecycle message exists
    pub id: String,
    pub hook_name: String,
    pub group_name: String,
    pub transition: String,
    pub triggered_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub deleted: bool,
}

impl AsgRecord {
    pub fn log_fields(&self) -> LogFields {
        LogFields::new()
            .with("asg_name", &self.group_name)
            .with("asg_hook", &self.hook_name)
            .with("asg_triggered_at", format_time(&self.triggered_at))
            .with("asg_completed", self.completed)
            .with("asg_deleted", self.deleted)
    }
}

/// Instance metadata from the EC2 API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ec2Record {
    /// Empty if EC2 has not reported this instance
    pub instance_id: String,
    /// Private DNS name, which doubles as the Kubernetes node name
    pub node_name: String,
    pub state: String,
    pub instance_name: String,
    pub instance_type: String,
    pub availability_zone: String,
    /// `spot` or `on-demand`
    pub instance_lifecycle: String,
    pub launch_time: Option<DateTime<Utc>>,
    /// Parsed from the state transition reason; display only
    pub termination_time: Option<DateTime<Utc>>,
}

impl Ec2Record {
    pub fn log_fields(&self) -> LogFields {
        LogFields::new()
            .with("ec2_name", &self.instance_name)
            .with("ec2_state", &self.state)
            .with("ec2_type", &self.instance_type)
            .with("ec2_zone", &self.availability_zone)
            .with("ec2_lifecycle", &self.instance_lifecycle)
            .with("ec2_launch_time", format_time(&self.launch_time))
            .with("ec2_termination_time", format_time(&self.termination_time))
    }
}

/// Spot request state for spot instances
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRecord {
    pub instance_id: String,
    pub request_id: String,
    pub create_time: Option<DateTime<Utc>>,
    pub state: String,
    pub status_code: String,
    pub status_update_time: Option<DateTime<Utc>>,
}

impl SpotRecord {
    pub fn log_fields(&self) -> LogFields {
        LogFields::new()
            .with("spot_request_id", &self.request_id)
            .with("spot_state", &self.state)
            .with("spot_status_code", &self.status_code)
    }
}

/// A node taint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: String,
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.key, self.value, self.effect)
    }
}

/// Kubernetes node state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Instance id taken from the node's provider id
    pub instance_id: String,
    pub node_name: String,
    pub unschedulable: bool,
    pub taints: Vec<Taint>,
}

impl NodeRecord {
    pub fn log_fields(&self) -> LogFields {
        let taints: Vec<String> = self.taints.iter().map(|t| t.to_string()).collect();
        LogFields::new()
            .with("node_name", &self.node_name)
            .with("node_unschedulable", self.unschedulable)
            .with("node_taints", taints.join(","))
    }
}

/// Kubernetes pod state including its eviction-readiness verdicts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    /// All pod conditions are true
    pub ready: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// The pod has a deletion timestamp
    pub terminating: bool,

    pub app_name: String,
    pub app_instance: String,
    pub app_version: String,

    pub owner_kind: String,
    pub owner_name: String,
    pub owner_ready: Verdict,
    pub pdb_ready: Verdict,
}

impl PodRecord {
    /// `namespace/name`, the cache key for pods
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn log_fields(&self) -> LogFields {
        LogFields::new()
            .with("pod_name", &self.name)
            .with("pod_namespace", &self.namespace)
            .with("pod_node", &self.node_name)
            .with("pod_ready", self.ready)
            .with("pod_app", &self.app_name)
            .with("pod_owner", format!("{}/{}", self.owner_kind, self.owner_name))
            .with("pod_owner_ready", &self.owner_ready.short)
            .with("pod_pdb_ready", &self.pdb_ready.short)
    }
}

/// Everything known about one EC2 instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub asg: AsgRecord,
    pub ec2: Ec2Record,
    pub spot: SpotRecord,
    pub node: NodeRecord,
    /// Pods scheduled on this instance; their embedded instance carries no pods
    pub pods: Vec<Pod>,
}

impl Instance {
    /// Kubernetes node name from the node watch, falling back to EC2
    pub fn node_name(&self) -> &str {
        if !self.node.node_name.is_empty() {
            &self.node.node_name
        } else {
            &self.ec2.node_name
        }
    }

    pub fn log_fields(&self) -> LogFields {
        LogFields::new()
            .with("instance_id", &self.instance_id)
            .with("node_name", self.node_name())
            .extend(self.ec2.log_fields())
            .extend(self.asg.log_fields())
            .extend(self.spot.log_fields())
            .with("pods", self.pods.len())
    }
}

/// A pod together with the instance it runs on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub instance: Instance,
    pub pod: PodRecord,
}

impl Pod {
    pub fn log_fields(&self) -> LogFields {
        self.pod
            .log_fields()
            .with("instance_id", &self.instance.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_fields_skip_empty() {
        let instance = Instance {
            instance_id: "i-1".to_string(),
            ec2: Ec2Record {
                instance_id: "i-1".to_string(),
                state: ec2_state::RUNNING.to_string(),
                node_name: "ip-10-0-0-1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let fields = instance.log_fields();
        assert_eq!(fields.get("instance_id"), Some("i-1"));
        assert_eq!(fields.get("ec2_state"), Some("running"));
        assert_eq!(fields.get("node_name"), Some("ip-10-0-0-1"));
        assert_eq!(fields.get("ec2_type"), None);
        assert_eq!(fields.get("asg_completed"), Some("false"));
    }

    #[test]
    fn test_log_fields_display() {
        let fields = LogFields::new().with("a", "1").with("b", "").with("c", 3);
        assert_eq!(fields.to_string(), "a=1 c=3");
    }

    #[test]
    fn test_node_name_prefers_node_record() {
        let mut instance = Instance::default();
        instance.ec2.node_name = "ec2-name".to_string();
        assert_eq!(instance.node_name(), "ec2-name");

        instance.node.node_name = "node-name".to_string();
        assert_eq!(instance.node_name(), "node-name");
    }

    #[test]
    fn test_pod_key() {
        let pod = PodRecord {
            name: "web-1".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        assert_eq!(pod.key(), "default/web-1");
    }
}
