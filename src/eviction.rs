//! Eviction readiness of pods
//!
//! Two independent verdicts are computed per pod:
//!
//! - **PDB verdict**: would removing the pod violate a PodDisruptionBudget?
//! - **Owner verdict**: is the pod's controller healthy enough to lose a replica?
//!
//! Verdicts are advisory. They feed the pod selectors in [`crate::query::pod`]
//! and nothing here mutates cluster state.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::Metadata;
use serde::{Deserialize, Serialize};

/// Owner kinds whose pods are never evicted by a drain
pub const IMMUNE_OWNER_KINDS: [&str; 2] = ["DaemonSet", "Node"];

/// Owner kinds that are not fungible replicas; losing the pod never hurts
/// replica health
const UNCOUNTED_OWNER_KINDS: [&str; 4] = ["", "Node", "DaemonSet", "Job"];

/// Whether a pod may be taken away right now, with the reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub can_decrement: bool,
    /// Short machine-friendly reason code
    pub short: String,
    /// Human-readable explanation
    pub description: String,
}

impl Verdict {
    pub fn can_decrement(short: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            can_decrement: true,
            short: short.into(),
            description: description.into(),
        }
    }

    pub fn cannot_decrement(short: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            can_decrement: false,
            short: short.into(),
            description: description.into(),
        }
    }
}

/// Read access to the objects the verdicts depend on
pub trait WorkloadIndex: Send + Sync {
    fn disruption_budgets(&self, namespace: &str) -> Vec<Arc<PodDisruptionBudget>>;
    fn replica_set(&self, namespace: &str, name: &str) -> Option<Arc<ReplicaSet>>;
    fn deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>>;
    fn stateful_set(&self, namespace: &str, name: &str) -> Option<Arc<StatefulSet>>;
}

/// The controller a pod ultimately belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owner {
    pub kind: String,
    pub name: String,
}

/// Whether `selector` matches `labels`, following Kubernetes semantics: an
/// empty selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        if !match_labels.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return false;
        }
    }

    let Some(expressions) = &selector.match_expressions else {
        return true;
    };

    expressions.iter().all(|req| {
        let values = req.values.as_deref().unwrap_or_default();
        match req.operator.as_str() {
            "In" => labels.get(&req.key).is_some_and(|v| values.contains(v)),
            "NotIn" => labels.get(&req.key).map_or(true, |v| !values.contains(v)),
            "Exists" => labels.contains_key(&req.key),
            "DoesNotExist" => !labels.contains_key(&req.key),
            // unknown operators never match
            _ => false,
        }
    })
}

fn pod_labels(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.labels.clone().unwrap_or_default()
}

/// PDB verdict for `pod`
pub fn pdb_verdict(pod: &Pod, budgets: &[Arc<PodDisruptionBudget>]) -> Verdict {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let labels = pod_labels(pod);

    let matching: Vec<&Arc<PodDisruptionBudget>> = budgets
        .iter()
        .filter(|pdb| pdb.metadata.namespace.as_deref().unwrap_or_default() == namespace)
        .filter(|pdb| {
            // a PDB without a selector selects nothing
            pdb.spec
                .as_ref()
                .and_then(|s| s.selector.as_ref())
                .is_some_and(|s| selector_matches(s, &labels))
        })
        .collect();

    if matching.is_empty() {
        return Verdict::can_decrement("NoPDB", "pod is not covered by any PodDisruptionBudget");
    }

    for pdb in &matching {
        let allowed = pdb
            .status
            .as_ref()
            .map(|s| s.disruptions_allowed)
            .unwrap_or(0);
        if allowed <= 0 {
            return Verdict::cannot_decrement(
                "NoDisruptionsAllowed",
                format!(
                    "PodDisruptionBudget {} allows no disruptions",
                    pdb.metadata.name.as_deref().unwrap_or_default()
                ),
            );
        }
    }

    Verdict::can_decrement(
        "DisruptionsAllowed",
        format!("{} PodDisruptionBudget(s) allow a disruption", matching.len()),
    )
}

fn controller_ref(refs: Option<&Vec<OwnerReference>>) -> Option<&OwnerReference> {
    let refs = refs?;
    refs.iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
}

/// Resolve the top-level controller of `pod`, walking ReplicaSet → Deployment
pub fn resolve_owner(pod: &Pod, index: &dyn WorkloadIndex) -> Owner {
    let Some(owner) = controller_ref(pod.metadata.owner_references.as_ref()) else {
        return Owner::default();
    };

    let resolved = Owner {
        kind: owner.kind.clone(),
        name: owner.name.clone(),
    };
    if owner.kind != "ReplicaSet" {
        return resolved;
    }

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    index
        .replica_set(namespace, &owner.name)
        .and_then(|rs| {
            controller_ref(rs.metadata.owner_references.as_ref())
                .filter(|r| r.kind == "Deployment")
                .map(|r| Owner {
                    kind: r.kind.clone(),
                    name: r.name.clone(),
                })
        })
        .unwrap_or(resolved)
}

/// Desired and available replica counts of a controller
fn replica_health(
    owner: &Owner,
    namespace: &str,
    index: &dyn WorkloadIndex,
) -> Option<(i32, i32)> {
    match owner.kind.as_str() {
        "Deployment" => index.deployment(namespace, &owner.name).map(|d| {
            (
                d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
                d.status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0),
            )
        }),
        "ReplicaSet" => index.replica_set(namespace, &owner.name).map(|rs| {
            (
                rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
                rs.status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0),
            )
        }),
        "StatefulSet" => index.stateful_set(namespace, &owner.name).map(|ss| {
            (
                ss.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
                ss.status
                    .as_ref()
                    .and_then(|s| s.ready_replicas)
                    .unwrap_or(0),
            )
        }),
        _ => None,
    }
}

/// Owner verdict for `pod` together with the resolved owner
pub fn owner_verdict(pod: &Pod, index: &dyn WorkloadIndex) -> (Owner, Verdict) {
    let owner = resolve_owner(pod, index);

    if pod.metadata.deletion_timestamp.is_some() {
        return (
            owner,
            Verdict::can_decrement("Terminating", "pod is already terminating"),
        );
    }

    if UNCOUNTED_OWNER_KINDS.contains(&owner.kind.as_str()) {
        let description = if owner.kind.is_empty() {
            "pod has no controller".to_string()
        } else {
            format!("{} pods are not replicated", owner.kind)
        };
        return (owner, Verdict::can_decrement("Unreplicated", description));
    }

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let verdict = match replica_health(&owner, namespace, index) {
        None if matches!(
            owner.kind.as_str(),
            "Deployment" | "ReplicaSet" | "StatefulSet"
        ) =>
        {
            Verdict::cannot_decrement(
                "OwnerNotFound",
                format!("{} {} is not known yet", owner.kind, owner.name),
            )
        }
        None => Verdict::can_decrement(
            "UnknownOwnerKind",
            format!("owner kind {} is not checked", owner.kind),
        ),
        Some((desired, _)) if desired <= 1 => Verdict::can_decrement(
            "Singleton",
            format!("{} {} wants {} replica(s)", owner.kind, owner.name, desired),
        ),
        Some((desired, available)) if available < desired => Verdict::cannot_decrement(
            "Unready",
            format!(
                "{} {} has {}/{} replicas available",
                owner.kind, owner.name, available, desired
            ),
        ),
        Some((desired, available)) => Verdict::can_decrement(
            "Healthy",
            format!(
                "{} {} has {}/{} replicas available",
                owner.kind, owner.name, available, desired
            ),
        ),
    };

    (owner, verdict)
}

/// Fixed set of workload objects, for tests and one-off evaluation
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkloads {
    pub budgets: Vec<Arc<PodDisruptionBudget>>,
    pub replica_sets: Vec<Arc<ReplicaSet>>,
    pub deployments: Vec<Arc<Deployment>>,
    pub stateful_sets: Vec<Arc<StatefulSet>>,
}

fn find<K: Metadata<Ty = ObjectMeta>>(items: &[Arc<K>], namespace: &str, name: &str) -> Option<Arc<K>> {
    items
        .iter()
        .find(|item| {
            let meta = item.metadata();
            meta.namespace.as_deref() == Some(namespace) && meta.name.as_deref() == Some(name)
        })
        .cloned()
}

impl WorkloadIndex for MemoryWorkloads {
    fn disruption_budgets(&self, namespace: &str) -> Vec<Arc<PodDisruptionBudget>> {
        self.budgets
            .iter()
            .filter(|pdb| pdb.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect()
    }

    fn replica_set(&self, namespace: &str, name: &str) -> Option<Arc<ReplicaSet>> {
        find(&self.replica_sets, namespace, name)
    }

    fn deployment(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        find(&self.deployments, namespace, name)
    }

    fn stateful_set(&self, namespace: &str, name: &str) -> Option<Arc<StatefulSet>> {
        find(&self.stateful_sets, namespace, name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        DeploymentSpec, DeploymentStatus, ReplicaSetSpec, ReplicaSetStatus, StatefulSetSpec,
        StatefulSetStatus,
    };
    use k8s_openapi::api::policy::v1::{PodDisruptionBudgetSpec, PodDisruptionBudgetStatus};

    pub fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn owned_by(mut meta: ObjectMeta, kind: &str, name: &str) -> ObjectMeta {
        meta.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("uid-{}", name),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
        meta
    }

    pub fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: meta(name, labels),
            ..Default::default()
        }
    }

    pub fn pdb(name: &str, app: &str, allowed: i32) -> Arc<PodDisruptionBudget> {
        Arc::new(PodDisruptionBudget {
            metadata: meta(name, &[]),
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                    match_expressions: None,
                }),
                ..Default::default()
            }),
            status: Some(PodDisruptionBudgetStatus {
                disruptions_allowed: allowed,
                ..Default::default()
            }),
        })
    }

    pub fn deployment(name: &str, desired: Option<i32>, available: i32) -> Arc<Deployment> {
        Arc::new(Deployment {
            metadata: meta(name, &[]),
            spec: Some(DeploymentSpec {
                replicas: desired,
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: Some(available),
                ..Default::default()
            }),
        })
    }

    pub fn replica_set(name: &str, deployment: Option<&str>, desired: i32, available: i32) -> Arc<ReplicaSet> {
        let metadata = match deployment {
            Some(d) => owned_by(meta(name, &[]), "Deployment", d),
            None => meta(name, &[]),
        };
        Arc::new(ReplicaSet {
            metadata,
            spec: Some(ReplicaSetSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(ReplicaSetStatus {
                available_replicas: Some(available),
                replicas: desired,
                ..Default::default()
            }),
        })
    }

    pub fn stateful_set(name: &str, desired: i32, ready: i32) -> Arc<StatefulSet> {
        Arc::new(StatefulSet {
            metadata: meta(name, &[]),
            spec: Some(StatefulSetSpec {
                replicas: Some(desired),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                ready_replicas: Some(ready),
                replicas: desired,
                ..Default::default()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelectorRequirement, Time};

    #[test]
    fn test_pdb_with_no_disruptions_blocks() {
        let p = pod("web-1", &[("app", "web")]);
        let verdict = pdb_verdict(&p, &[pdb("web", "web", 0)]);
        assert!(!verdict.can_decrement);
        assert_eq!(verdict.short, "NoDisruptionsAllowed");
    }

    #[test]
    fn test_no_pdb_never_blocks() {
        let p = pod("web-1", &[("app", "web")]);
        let verdict = pdb_verdict(&p, &[pdb("other", "other", 0)]);
        assert!(verdict.can_decrement);
        assert_eq!(verdict.short, "NoPDB");

        assert!(pdb_verdict(&p, &[]).can_decrement);
    }

    #[test]
    fn test_all_matching_pdbs_must_allow() {
        let p = pod("web-1", &[("app", "web")]);
        let verdict = pdb_verdict(&p, &[pdb("a", "web", 1), pdb("b", "web", 2)]);
        assert!(verdict.can_decrement);
        assert_eq!(verdict.short, "DisruptionsAllowed");

        let verdict = pdb_verdict(&p, &[pdb("a", "web", 1), pdb("b", "web", 0)]);
        assert!(!verdict.can_decrement);
    }

    #[test]
    fn test_pdb_in_other_namespace_ignored() {
        let mut p = pod("web-1", &[("app", "web")]);
        p.metadata.namespace = Some("prod".to_string());
        assert_eq!(pdb_verdict(&p, &[pdb("web", "web", 0)]).short, "NoPDB");
    }

    #[test]
    fn test_selector_expressions() {
        let labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]);
        let req = |key: &str, op: &str, values: &[&str]| LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
        };
        let sel = |reqs: Vec<LabelSelectorRequirement>| LabelSelector {
            match_labels: None,
            match_expressions: Some(reqs),
        };

        assert!(selector_matches(&LabelSelector::default(), &labels));
        assert!(selector_matches(&sel(vec![req("app", "In", &["web", "api"])]), &labels));
        assert!(!selector_matches(&sel(vec![req("app", "NotIn", &["web"])]), &labels));
        assert!(selector_matches(&sel(vec![req("zone", "NotIn", &["a"])]), &labels));
        assert!(selector_matches(&sel(vec![req("tier", "Exists", &[])]), &labels));
        assert!(!selector_matches(&sel(vec![req("tier", "DoesNotExist", &[])]), &labels));
        assert!(!selector_matches(&sel(vec![req("tier", "Gt", &["1"])]), &labels));
    }

    #[test]
    fn test_resolve_owner_walks_to_deployment() {
        let index = MemoryWorkloads {
            replica_sets: vec![replica_set("web-abc", Some("web"), 3, 3)],
            ..Default::default()
        };
        let mut p = pod("web-abc-1", &[]);
        p.metadata = owned_by(p.metadata, "ReplicaSet", "web-abc");

        assert_eq!(
            resolve_owner(&p, &index),
            Owner {
                kind: "Deployment".to_string(),
                name: "web".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_owner_bare_replica_set() {
        let index = MemoryWorkloads {
            replica_sets: vec![replica_set("batch", None, 2, 2)],
            ..Default::default()
        };
        let mut p = pod("batch-1", &[]);
        p.metadata = owned_by(p.metadata, "ReplicaSet", "batch");
        assert_eq!(resolve_owner(&p, &index).kind, "ReplicaSet");

        let (_, verdict) = owner_verdict(&p, &index);
        assert_eq!(verdict.short, "Healthy");
    }

    #[test]
    fn test_uncounted_owner_kinds() {
        let index = MemoryWorkloads::default();
        for kind in ["DaemonSet", "Job", "Node"] {
            let mut p = pod("x", &[]);
            p.metadata = owned_by(p.metadata, kind, "owner");
            let (owner, verdict) = owner_verdict(&p, &index);
            assert_eq!(owner.kind, kind);
            assert!(verdict.can_decrement, "{}", kind);
        }

        let (owner, verdict) = owner_verdict(&pod("bare", &[]), &index);
        assert_eq!(owner, Owner::default());
        assert!(verdict.can_decrement);
    }

    #[test]
    fn test_deployment_health() {
        let cases = [
            (None, 0, true, "Singleton"),
            (Some(1), 0, true, "Singleton"),
            (Some(3), 2, false, "Unready"),
            (Some(3), 3, true, "Healthy"),
        ];
        for (desired, available, can, short) in cases {
            let index = MemoryWorkloads {
                deployments: vec![deployment("web", desired, available)],
                ..Default::default()
            };
            let mut p = pod("web-1", &[]);
            p.metadata = owned_by(p.metadata, "Deployment", "web");
            let (_, verdict) = owner_verdict(&p, &index);
            assert_eq!(verdict.can_decrement, can, "{:?}", desired);
            assert_eq!(verdict.short, short);
        }
    }

    #[test]
    fn test_stateful_set_uses_ready_replicas() {
        let index = MemoryWorkloads {
            stateful_sets: vec![stateful_set("db", 3, 2)],
            ..Default::default()
        };
        let mut p = pod("db-0", &[]);
        p.metadata = owned_by(p.metadata, "StatefulSet", "db");
        let (_, verdict) = owner_verdict(&p, &index);
        assert!(!verdict.can_decrement);
        assert_eq!(verdict.short, "Unready");
    }

    #[test]
    fn test_missing_owner_blocks() {
        let mut p = pod("web-1", &[]);
        p.metadata = owned_by(p.metadata, "Deployment", "web");
        let (_, verdict) = owner_verdict(&p, &MemoryWorkloads::default());
        assert!(!verdict.can_decrement);
        assert_eq!(verdict.short, "OwnerNotFound");
    }

    #[test]
    fn test_terminating_pod_is_free() {
        let index = MemoryWorkloads {
            deployments: vec![deployment("web", Some(3), 1)],
            ..Default::default()
        };
        let mut p = pod("web-1", &[]);
        p.metadata = owned_by(p.metadata, "Deployment", "web");
        p.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let (_, verdict) = owner_verdict(&p, &index);
        assert!(verdict.can_decrement);
        assert_eq!(verdict.short, "Terminating");
    }
}
