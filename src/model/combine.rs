//! Join the per-source snapshots into composite instances and pods
//!
//! Instances are keyed by EC2 instance id, the only key every AWS source and
//! the node provider id share. Pods only know their node name, so they are
//! attached through a node-name index built from the node watch and EC2.

use std::collections::{BTreeMap, HashMap};

use super::{AsgRecord, Ec2Record, Instance, NodeRecord, Pod, PodRecord, SpotRecord};
use crate::query::{Instances, Pods};

/// Snapshots from every source cache, in any order
#[derive(Debug, Clone, Default)]
pub struct SourceLists {
    pub asg: Vec<AsgRecord>,
    pub ec2: Vec<Ec2Record>,
    pub spot: Vec<SpotRecord>,
    pub nodes: Vec<NodeRecord>,
    pub pods: Vec<PodRecord>,
}

/// Result of [`combine`]
#[derive(Debug, Clone, Default)]
pub struct Combined {
    /// Sorted by instance id
    pub instances: Instances,
    /// Sorted by namespace and name
    pub pods: Pods,
}

/// Build the composite view. Each source writes its own sub-record, so the
/// result does not depend on the order of any input list.
pub fn combine(lists: SourceLists) -> Combined {
    let mut instances: BTreeMap<String, Instance> = BTreeMap::new();

    fn entry<'a>(map: &'a mut BTreeMap<String, Instance>, id: &str) -> &'a mut Instance {
        map.entry(id.to_string()).or_insert_with(|| Instance {
            instance_id: id.to_string(),
            ..Default::default()
        })
    }

    for asg in lists.asg.into_iter().filter(|r| !r.id.is_empty()) {
        let id = asg.id.clone();
        entry(&mut instances, &id).asg = asg;
    }
    for ec2 in lists.ec2.into_iter().filter(|r| !r.instance_id.is_empty()) {
        let id = ec2.instance_id.clone();
        entry(&mut instances, &id).ec2 = ec2;
    }
    for spot in lists.spot.into_iter().filter(|r| !r.instance_id.is_empty()) {
        let id = spot.instance_id.clone();
        entry(&mut instances, &id).spot = spot;
    }
    for node in lists.nodes.into_iter().filter(|r| !r.instance_id.is_empty()) {
        let id = node.instance_id.clone();
        entry(&mut instances, &id).node = node;
    }

    // node name -> instance id; the node watch wins over EC2 if both know it
    let mut by_node_name: HashMap<String, String> = HashMap::new();
    for instance in instances.values() {
        if !instance.ec2.node_name.is_empty() {
            by_node_name.insert(instance.ec2.node_name.clone(), instance.instance_id.clone());
        }
    }
    for instance in instances.values() {
        if !instance.node.node_name.is_empty() {
            by_node_name.insert(instance.node.node_name.clone(), instance.instance_id.clone());
        }
    }

    let mut pod_records = lists.pods;
    pod_records.sort_by_key(|p| p.key());

    let mut pods = Vec::with_capacity(pod_records.len());
    let mut pods_by_instance: HashMap<String, Vec<Pod>> = HashMap::new();
    for record in pod_records {
        let instance = by_node_name
            .get(&record.node_name)
            .and_then(|id| instances.get(id))
            .cloned()
            .unwrap_or_default();
        let pod = Pod {
            instance,
            pod: record,
        };
        if !pod.instance.instance_id.is_empty() {
            pods_by_instance
                .entry(pod.instance.instance_id.clone())
                .or_default()
                .push(pod.clone());
        }
        pods.push(pod);
    }

    for (id, instance_pods) in pods_by_instance {
        if let Some(instance) = instances.get_mut(&id) {
            instance.pods = instance_pods;
        }
    }

    Combined {
        instances: Instances::from(instances.into_values().collect::<Vec<_>>()),
        pods: Pods::from(pods),
    }
}
