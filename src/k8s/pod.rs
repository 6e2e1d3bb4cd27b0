use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::Store;

use crate::cache::{CacheError, Source};
use crate::eviction::{owner_verdict, pdb_verdict, WorkloadIndex};
use crate::model::PodRecord;

const APP_NAME: &str = "app.kubernetes.io/name";
const APP_INSTANCE: &str = "app.kubernetes.io/instance";
const APP_VERSION: &str = "app.kubernetes.io/version";

/// A pod is ready when it reports conditions and all of them are true
pub fn pod_ready(pod: &Pod) -> bool {
    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or_default();
    !conditions.is_empty() && conditions.iter().all(|c| c.status == "True")
}

pub fn pod_record(pod: &Pod, index: &dyn WorkloadIndex) -> PodRecord {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let label = |key: &str| labels.get(key).cloned().unwrap_or_default();

    let budgets = index.disruption_budgets(&namespace);
    let (owner, owner_ready) = owner_verdict(pod, index);

    PodRecord {
        name: pod.metadata.name.clone().unwrap_or_default(),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        ready: pod_ready(pod),
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
        terminating: pod.metadata.deletion_timestamp.is_some(),
        app_name: label(APP_NAME),
        app_instance: label(APP_INSTANCE),
        app_version: label(APP_VERSION),
        owner_kind: owner.kind,
        owner_name: owner.name,
        owner_ready,
        pdb_ready: pdb_verdict(pod, &budgets),
        namespace,
    }
}

/// Pods with their eviction verdicts, recomputed on every refresh
pub struct PodSource {
    store: Store<Pod>,
    index: Arc<dyn WorkloadIndex>,
}

impl PodSource {
    pub fn new(store: Store<Pod>, index: Arc<dyn WorkloadIndex>) -> Self {
        Self { store, index }
    }
}

#[async_trait]
impl Source for PodSource {
    type Record = PodRecord;

    fn name(&self) -> &'static str {
        "pods"
    }

    fn key(&self, record: &PodRecord) -> String {
        record.key()
    }

    async fn fetch(&self) -> Result<Vec<PodRecord>, CacheError> {
        Ok(self
            .store
            .state()
            .iter()
            .map(|p| pod_record(p, self.index.as_ref()))
            .collect())
    }
}
