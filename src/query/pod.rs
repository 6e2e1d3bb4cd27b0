//! Selectors and comparators over composite pods

use super::{By, Selector};
use crate::eviction::IMMUNE_OWNER_KINDS;
use crate::model::{Instance, Pod};

pub type PodSelector = Selector<Pod>;

/// An ordered list of pods
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pods(Vec<Pod>);

impl From<Vec<Pod>> for Pods {
    fn from(pods: Vec<Pod>) -> Self {
        Self(pods)
    }
}

impl IntoIterator for Pods {
    type Item = Pod;
    type IntoIter = std::vec::IntoIter<Pod>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Pods {
    pub fn select(&self, selector: &PodSelector) -> Pods {
        Pods(
            self.0
                .iter()
                .filter(|p| selector.matches(p))
                .cloned()
                .collect(),
        )
    }

    pub fn filter(&self, selector: &PodSelector) -> Pods {
        Pods(
            self.0
                .iter()
                .filter(|p| !selector.matches(p))
                .cloned()
                .collect(),
        )
    }

    pub fn sort(mut self, by: By<Pod>) -> Pods {
        by.sort(&mut self.0);
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pod> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Pod] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Lift an instance selector onto the pod's instance
pub fn select_by_instance(selector: Selector<Instance>) -> PodSelector {
    Selector::new(move |p: &Pod| selector.matches(&p.instance))
}

pub fn pod_is_ready() -> PodSelector {
    Selector::new(|p: &Pod| p.pod.ready)
}

/// Neither the owning controller nor a PDB objects to losing this pod now
pub fn pod_can_decrement() -> PodSelector {
    Selector::new(|p: &Pod| p.pod.owner_ready.can_decrement && p.pod.pdb_ready.can_decrement)
}

/// Pods that never need an eviction: node-bound or already terminating
pub fn pod_immune_to_eviction() -> PodSelector {
    Selector::new(|p: &Pod| {
        p.pod.terminating || IMMUNE_OWNER_KINDS.contains(&p.pod.owner_kind.as_str())
    })
}

pub fn by_pod_name() -> By<Pod> {
    By::key(|p: &Pod| (p.pod.namespace.clone(), p.pod.name.clone()))
}

pub fn by_pod_created_at() -> By<Pod> {
    By::key(|p: &Pod| p.pod.created_at)
}
