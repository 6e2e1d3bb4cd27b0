//! Selectors and comparators over composite instances

use std::collections::HashSet;

use super::{query, By, Selector};
use crate::model::{ec2_state, Instance, Pod};

pub type InstanceSelector = Selector<Instance>;

/// An ordered list of instances
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instances(Vec<Instance>);

impl From<Vec<Instance>> for Instances {
    fn from(instances: Vec<Instance>) -> Self {
        Self(instances)
    }
}

impl IntoIterator for Instances {
    type Item = Instance;
    type IntoIter = std::vec::IntoIter<Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Instances {
    pub fn select(&self, selector: &InstanceSelector) -> Instances {
        Instances(
            self.0
                .iter()
                .filter(|i| selector.matches(i))
                .cloned()
                .collect(),
        )
    }

    pub fn filter(&self, selector: &InstanceSelector) -> Instances {
        Instances(
            self.0
                .iter()
                .filter(|i| !selector.matches(i))
                .cloned()
                .collect(),
        )
    }

    /// Stable sort by `by`; chain calls from least to most significant key
    pub fn sort(mut self, by: By<Instance>) -> Instances {
        by.sort(&mut self.0);
        self
    }

    pub fn get(&self, instance_id: &str) -> Option<&Instance> {
        self.0.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.iter().map(|i| i.instance_id.clone()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instance> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Instance] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn has_asg_data() -> InstanceSelector {
    Selector::new(|i: &Instance| !i.asg.id.is_empty())
}

pub fn has_ec2_data() -> InstanceSelector {
    Selector::new(|i: &Instance| !i.ec2.instance_id.is_empty())
}

pub fn has_spot_data() -> InstanceSelector {
    Selector::new(|i: &Instance| !i.spot.request_id.is_empty())
}

pub fn has_node_data() -> InstanceSelector {
    Selector::new(|i: &Instance| !i.node.node_name.is_empty())
}

/// EC2 state is one of `states`
pub fn has_ec2_state(states: &[&str]) -> InstanceSelector {
    let states: HashSet<String> = states.iter().map(|s| s.to_string()).collect();
    Selector::new(move |i: &Instance| states.contains(&i.ec2.state))
}

pub fn lifecycle_completed() -> InstanceSelector {
    Selector::new(|i: &Instance| i.asg.completed)
}

pub fn lifecycle_deleted() -> InstanceSelector {
    Selector::new(|i: &Instance| i.asg.deleted)
}

/// AWS announced the shutdown and the hook has not been completed yet
pub fn wants_shutdown() -> InstanceSelector {
    query()
        .select(has_asg_data())
        .select(has_ec2_data())
        .select(has_ec2_state(&[ec2_state::RUNNING]))
        .filter(lifecycle_completed())
}

/// Instances the reconciler completes the lifecycle hook for
pub fn is_waiting() -> InstanceSelector {
    query()
        .select(has_asg_data())
        .select(has_ec2_state(&[ec2_state::RUNNING]))
        .filter(lifecycle_completed())
}

/// The queue message for this instance has not been removed yet
pub fn has_lifecycle_message() -> InstanceSelector {
    query().select(has_asg_data()).filter(lifecycle_deleted())
}

/// Wants shutdown and nothing left on it would need an eviction
pub fn pending_lifecycle_completion() -> InstanceSelector {
    wants_shutdown().select(filter_by_all_pods(super::pod::pod_immune_to_eviction()))
}

/// Every pod on the instance matches `selector`; vacuously true without pods
pub fn filter_by_all_pods(selector: Selector<Pod>) -> InstanceSelector {
    Selector::new(move |i: &Instance| i.pods.iter().all(|p| selector.matches(p)))
}

/// At least one pod on the instance matches `selector`
pub fn filter_by_any_pod(selector: Selector<Pod>) -> InstanceSelector {
    Selector::new(move |i: &Instance| i.pods.iter().any(|p| selector.matches(p)))
}

pub fn by_instance_id() -> By<Instance> {
    By::key(|i: &Instance| i.instance_id.clone())
}

pub fn by_launch_time() -> By<Instance> {
    By::key(|i: &Instance| i.ec2.launch_time)
}

pub fn by_triggered_at() -> By<Instance> {
    By::key(|i: &Instance| i.asg.triggered_at)
}

/// Position of an EC2 state in the lifecycle order, -1 for unknown states
pub fn ec2_state_index(state: &str) -> i32 {
    ec2_state::ORDER
        .iter()
        .position(|s| *s == state)
        .map(|p| p as i32)
        .unwrap_or(-1)
}

pub fn by_ec2_state() -> By<Instance> {
    By::key(|i: &Instance| ec2_state_index(&i.ec2.state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::Verdict;
    use crate::model::{AsgRecord, Ec2Record, PodRecord};
    use chrono::{Duration, Utc};

    fn instance(id: &str, state: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            ec2: Ec2Record {
                instance_id: id.to_string(),
                state: state.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_asg(mut i: Instance, completed: bool, deleted: bool) -> Instance {
        i.asg = AsgRecord {
            id: i.instance_id.clone(),
            completed,
            deleted,
            ..Default::default()
        };
        i
    }

    #[test]
    fn test_wants_shutdown_truth_table() {
        let states = ["", ec2_state::RUNNING, ec2_state::TERMINATED];
        for has_asg in [false, true] {
            for has_ec2 in [false, true] {
                for state in states {
                    for completed in [false, true] {
                        let mut i = Instance {
                            instance_id: "i-1".to_string(),
                            ..Default::default()
                        };
                        if has_asg {
                            i.asg.id = "i-1".to_string();
                            i.asg.completed = completed;
                        }
                        if has_ec2 {
                            i.ec2.instance_id = "i-1".to_string();
                        }
                        i.ec2.state = state.to_string();

                        let expected = !i.asg.id.is_empty()
                            && !i.ec2.instance_id.is_empty()
                            && i.ec2.state == "running"
                            && !i.asg.completed;
                        assert_eq!(wants_shutdown().matches(&i), expected, "{:?}", i);
                    }
                }
            }
        }
    }

    #[test]
    fn test_has_spot_and_node_data() {
        for has_spot in [false, true] {
            for has_node in [false, true] {
                let mut i = instance("i-1", ec2_state::RUNNING);
                if has_spot {
                    i.spot.instance_id = "i-1".to_string();
                    i.spot.request_id = "sir-1".to_string();
                }
                if has_node {
                    i.node.instance_id = "i-1".to_string();
                    i.node.node_name = "ip-10-0-0-1".to_string();
                }
                assert_eq!(has_spot_data().matches(&i), has_spot, "{:?}", i);
                assert_eq!(has_node_data().matches(&i), has_node, "{:?}", i);
            }
        }

        // a spot record without a request id carries no spot data
        let mut i = instance("i-1", ec2_state::RUNNING);
        i.spot.instance_id = "i-1".to_string();
        assert!(!has_spot_data().matches(&i));
    }

    #[test]
    fn test_has_lifecycle_message() {
        let running = instance("i-1", ec2_state::RUNNING);
        assert!(!has_lifecycle_message().matches(&running));
        assert!(has_lifecycle_message().matches(&with_asg(running.clone(), true, false)));
        assert!(!has_lifecycle_message().matches(&with_asg(running, true, true)));
    }

    #[test]
    fn test_filter_by_all_pods() {
        let mut i = with_asg(instance("i-1", ec2_state::RUNNING), false, false);
        let ready = Selector::new(|p: &Pod| p.pod.ready);

        // no pods: vacuously true
        assert!(filter_by_all_pods(ready.clone()).matches(&i));

        i.pods = vec![
            Pod {
                pod: PodRecord {
                    ready: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            Pod::default(),
        ];
        assert!(!filter_by_all_pods(ready.clone()).matches(&i));
        assert!(filter_by_any_pod(ready).matches(&i));
    }

    #[test]
    fn test_pending_lifecycle_completion() {
        let mut i = with_asg(instance("i-1", ec2_state::RUNNING), false, false);
        assert!(pending_lifecycle_completion().matches(&i));

        i.pods = vec![Pod {
            pod: PodRecord {
                owner_kind: "ReplicaSet".to_string(),
                owner_ready: Verdict::can_decrement("Healthy", "ok"),
                pdb_ready: Verdict::can_decrement("NoPDB", "ok"),
                ..Default::default()
            },
            ..Default::default()
        }];
        assert!(!pending_lifecycle_completion().matches(&i));

        i.pods[0].pod.owner_kind = "DaemonSet".to_string();
        assert!(pending_lifecycle_completion().matches(&i));
    }

    #[test]
    fn test_state_order_groups_and_is_stable() {
        // equal counts of each state, shuffled; the id suffix records input order
        let shuffled = [
            "terminated", "pending", "stopped", "running", "shutting-down", "stopping",
            "running", "terminated", "stopping", "pending", "shutting-down", "stopped",
            "stopped", "shutting-down", "pending", "terminated", "running", "stopping",
        ];
        let instances: Vec<Instance> = shuffled
            .iter()
            .enumerate()
            .map(|(n, state)| instance(&format!("{}-{:02}", state, n), state))
            .collect();

        let sorted = Instances::from(instances).sort(by_ec2_state());
        let states: Vec<_> = sorted.iter().map(|i| i.ec2.state.as_str()).collect();
        let mut expected = Vec::new();
        for state in ec2_state::ORDER {
            expected.extend([state; 3]);
        }
        assert_eq!(states, expected);

        for group in sorted.as_slice().chunks(3) {
            let ids: Vec<_> = group.iter().map(|i| i.instance_id.clone()).collect();
            let mut in_input_order = ids.clone();
            in_input_order.sort();
            assert_eq!(ids, in_input_order);
        }
    }

    #[test]
    fn test_unknown_state_sorts_first() {
        assert_eq!(ec2_state_index("exploded"), -1);
        let sorted = Instances::from(vec![
            instance("i-1", ec2_state::PENDING),
            instance("i-2", "exploded"),
        ])
        .sort(by_ec2_state());
        assert_eq!(sorted.ids(), vec!["i-2", "i-1"]);
    }

    #[test]
    fn test_launch_then_triggered_descending() {
        let now = Utc::now();
        let mk = |id: &str, launched_min: i64, triggered_min: i64| {
            let mut i = with_asg(instance(id, ec2_state::RUNNING), false, false);
            i.ec2.launch_time = Some(now - Duration::minutes(launched_min));
            i.asg.triggered_at = Some(now - Duration::minutes(triggered_min));
            i
        };

        let sorted = Instances::from(vec![
            mk("old-trigger", 100, 30),
            mk("young-b", 50, 5),
            mk("young-a", 90, 5),
        ])
        .sort(by_launch_time())
        .sort(by_triggered_at().descending());

        assert_eq!(sorted.ids(), vec!["young-a", "young-b", "old-trigger"]);
    }

    #[test]
    fn test_select_and_filter_collections() {
        let instances = Instances::from(vec![
            with_asg(instance("i-1", ec2_state::RUNNING), false, false),
            instance("i-2", ec2_state::RUNNING),
        ]);
        assert_eq!(instances.select(&has_asg_data()).ids(), vec!["i-1"]);
        assert_eq!(instances.filter(&has_asg_data()).ids(), vec!["i-2"]);
        assert!(instances.get("i-2").is_some());
    }
}
