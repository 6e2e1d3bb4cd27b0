//! Kubernetes watch sources
//!
//! Every object kind the drainer reads is mirrored by a reflector. Watch
//! events only wake the owning cache through an [`Emitter`]; the cache then
//! lists the reflector store like any polled source, so nodes and pods go
//! through the same diff-and-signal path as EC2.

pub mod node;
pub mod pod;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::eviction::WorkloadIndex;
use crate::signal::Emitter;

pub use node::NodeSource;
pub use pod::PodSource;

/// Mirror `api` into a store, emitting on every touched object, until
/// cancelled
fn spawn_reflector<K>(api: Api<K>, emitter: Emitter, cancel: CancellationToken) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let (reader, writer) = reflector::store();
    let kind = K::kind(&K::DynamicType::default()).to_string();

    let stream = reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .touched_objects()
        .for_each(move |res| {
            match res {
                Ok(obj) => {
                    debug!(
                        kind = %kind,
                        name = obj.meta().name.as_deref().unwrap_or("unknown"),
                        "reflector updated"
                    );
                    emitter.emit();
                }
                Err(e) => warn!(kind = %kind, error = %e, "watch error"),
            }
            futures::future::ready(())
        });

    tokio::spawn(async move {
        tokio::select! {
            _ = stream => {}
            _ = cancel.cancelled() => {}
        }
    });
    reader
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Read access to the workload objects behind the eviction verdicts
#[derive(Clone)]
pub struct WorkloadStores {
    pub budgets: Store<PodDisruptionBudget>,
    pub replica_sets: Store<ReplicaSet>,
    pub deployments: Store<Deployment>,
    pub stateful_sets: Store<StatefulSet>,
}

impl WorkloadIndex for WorkloadStores {
    fn disruption_budgets(&self, namespace: &str) -> Vec<Arc<PodDisruptionBudget>> {
        self.budgets
            .state()
            .into_iter()
            .filter(|pdb| pdb.metadata.namespace.as_deref() == Some(namespace))
            .collect()
    }

    fn replica_set(&self, namespace: &str, name: &str) -> Option<Arc<ReplicaSet>> {
        self.replica_sets
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.deployments.get(&ObjectRef::new(name).within(namespace))
    }

    fn stateful_set(&self, namespace: &str, name: &str) -> Option<Arc<StatefulSet>> {
        self.stateful_sets
            .get(&ObjectRef::new(name).within(namespace))
    }
}

/// Running reflectors and the emitters they wake
pub struct Watches {
    pub nodes: Store<Node>,
    pub pods: Store<Pod>,
    pub workloads: WorkloadStores,
    /// Fires on node events
    pub node_events: Emitter,
    /// Fires on pod, PDB and controller events
    pub pod_events: Emitter,
}

impl Watches {
    /// Start all reflectors. Pods and workloads are watched in `namespace`,
    /// or cluster-wide without one.
    pub fn start(client: Client, namespace: Option<&str>, cancel: &CancellationToken) -> Self {
        info!(
            namespace = namespace.unwrap_or("<all>"),
            "starting kubernetes watches"
        );
        let node_events = Emitter::new();
        let pod_events = Emitter::new();

        let nodes = spawn_reflector(
            Api::<Node>::all(client.clone()),
            node_events.clone(),
            cancel.clone(),
        );
        let pods = spawn_reflector(
            api::<Pod>(&client, namespace),
            pod_events.clone(),
            cancel.clone(),
        );
        let workloads = WorkloadStores {
            budgets: spawn_reflector(api(&client, namespace), pod_events.clone(), cancel.clone()),
            replica_sets: spawn_reflector(
                api(&client, namespace),
                pod_events.clone(),
                cancel.clone(),
            ),
            deployments: spawn_reflector(
                api(&client, namespace),
                pod_events.clone(),
                cancel.clone(),
            ),
            stateful_sets: spawn_reflector(
                api(&client, namespace),
                pod_events.clone(),
                cancel.clone(),
            ),
        };

        Self {
            nodes,
            pods,
            workloads,
            node_events,
            pod_events,
        }
    }
}
