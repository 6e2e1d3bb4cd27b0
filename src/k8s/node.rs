use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::Store;

use crate::cache::{CacheError, Source};
use crate::model::{NodeRecord, Taint};

/// EC2 instance id from a provider id such as `aws:///us-east-1a/i-0abc`
pub fn instance_id_from_provider_id(provider_id: &str) -> &str {
    provider_id.rsplit('/').next().unwrap_or_default()
}

pub fn node_record(node: &Node) -> NodeRecord {
    let spec = node.spec.clone().unwrap_or_default();
    NodeRecord {
        instance_id: instance_id_from_provider_id(spec.provider_id.as_deref().unwrap_or_default())
            .to_string(),
        node_name: node.metadata.name.clone().unwrap_or_default(),
        unschedulable: spec.unschedulable.unwrap_or(false),
        taints: spec
            .taints
            .unwrap_or_default()
            .into_iter()
            .map(|t| Taint {
                key: t.key,
                value: t.value.unwrap_or_default(),
                effect: t.effect,
            })
            .collect(),
    }
}

pub struct NodeSource {
    store: Store<Node>,
}

impl NodeSource {
    pub fn new(store: Store<Node>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Source for NodeSource {
    type Record = NodeRecord;

    fn name(&self) -> &'static str {
        "nodes"
    }

    // nodes without a provider id are not EC2 instances
    fn key(&self, record: &NodeRecord) -> String {
        record.instance_id.clone()
    }

    async fn fetch(&self) -> Result<Vec<NodeRecord>, CacheError> {
        Ok(self.store.state().iter().map(|n| node_record(n)).collect())
    }
}
