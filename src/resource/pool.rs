//! Slot inventory and all-or-nothing allocation
//!
//! The pool owns every slot of every node and the bookkeeping of which grant
//! holds which units. It is a plain synchronous structure; concurrent access
//! goes through [`super::ResourceArbiter`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, trace};

use super::snapshot::{AdditionalProperties, PoolSnapshot, SlotSpec};
use crate::error::{ConfigurationError, ResourceError};
use crate::models::{demand_totals, NodeAffinity, ResourceDemand};

/// What a caller asks the pool for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub demands: Vec<ResourceDemand>,
    pub affinity: NodeAffinity,
    /// Node count a `Match` grant must span; `None` lets the first grant of a
    /// sibling group pick it
    pub span: Option<usize>,
}

impl AllocationRequest {
    pub fn new(demands: Vec<ResourceDemand>, affinity: NodeAffinity) -> Self {
        Self {
            demands,
            affinity,
            span: None,
        }
    }

    pub fn with_span(mut self, span: usize) -> Self {
        self.span = Some(span);
        self
    }
}

impl fmt::Display for AllocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let demands: Vec<String> = self.demands.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}] affinity={}", demands.join(", "), self.affinity)?;
        if let Some(span) = self.span {
            write!(f, " span={span}")?;
        }
        Ok(())
    }
}

/// Units of one instance handed out by a grant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantItem {
    pub node: usize,
    pub rtype: String,
    pub instance: String,
    pub slots: u32,
}

/// Concrete slots reserved for one caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub id: u64,
    pub items: Vec<GrantItem>,
}

impl ResourceGrant {
    pub fn nodes(&self) -> BTreeSet<usize> {
        self.items.iter().map(|i| i.node).collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    pub fn slots(&self, rtype: &str) -> u32 {
        self.items
            .iter()
            .filter(|i| i.rtype == rtype)
            .map(|i| i.slots)
            .sum()
    }

    /// Instance ids of a type, in grant order
    pub fn instances(&self, rtype: &str) -> Vec<String> {
        self.items
            .iter()
            .filter(|i| i.rtype == rtype)
            .map(|i| i.instance.clone())
            .collect()
    }

    pub fn types(&self) -> BTreeSet<String> {
        self.items.iter().map(|i| i.rtype.clone()).collect()
    }
}

impl fmt::Display for ResourceGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grant#{} on nodes {:?}", self.id, self.nodes())
    }
}

#[derive(Clone, Debug)]
struct Instance {
    id: String,
    capacity: u32,
    used: u32,
}

impl Instance {
    fn free(&self) -> u32 {
        self.capacity.saturating_sub(self.used)
    }
}

#[derive(Clone, Debug, Default)]
struct Node {
    instances: BTreeMap<String, Vec<Instance>>,
}

impl Node {
    fn free(&self, rtype: &str) -> u32 {
        self.instances
            .get(rtype)
            .map(|v| v.iter().map(Instance::free).sum())
            .unwrap_or(0)
    }

    fn capacity(&self, rtype: &str) -> u32 {
        self.instances
            .get(rtype)
            .map(|v| v.iter().map(|i| i.capacity).sum())
            .unwrap_or(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum View {
    Free,
    Capacity,
}

/// Per-node unit counts chosen for a request
type Placement = Vec<(usize, String, u32)>;

/// Typed slot inventory per node
#[derive(Debug, Default)]
pub struct ResourcePool {
    nodes: Vec<Node>,
    types: BTreeSet<String>,
    grants: HashMap<u64, ResourceGrant>,
    next_grant: u64,
    configured: bool,
}

impl ResourcePool {
    /// Create an unconfigured pool
    pub fn new() -> Self {
        Self {
            next_grant: 1,
            ..Default::default()
        }
    }

    pub fn from_snapshot(snapshot: &PoolSnapshot) -> Result<Self, ConfigurationError> {
        let mut pool = Self::new();
        pool.apply(snapshot)?;
        Ok(pool)
    }

    /// Configure `nodes` identical nodes. Configuring twice is an error.
    pub fn configure(
        &mut self,
        nodes: usize,
        per_node: &BTreeMap<String, u32>,
    ) -> Result<(), ConfigurationError> {
        self.apply(&PoolSnapshot::uniform(nodes, per_node))
    }

    /// Configure from a snapshot. Configuring twice is an error.
    pub fn apply(&mut self, snapshot: &PoolSnapshot) -> Result<(), ConfigurationError> {
        if self.configured {
            return Err(ConfigurationError::AlreadyConfigured);
        }

        let node_count = snapshot.nodes();
        if node_count == 0 {
            return Err(ConfigurationError::InvalidSnapshot(
                "pool must have at least one node".to_string(),
            ));
        }

        let mut nodes = vec![Node::default(); node_count];
        for (rtype, specs) in &snapshot.resources {
            if specs.len() % node_count != 0 {
                return Err(ConfigurationError::InvalidSnapshot(format!(
                    "{} {rtype} entries cannot be split evenly over {node_count} nodes",
                    specs.len()
                )));
            }

            let mut seen = HashSet::new();
            if let Some(dup) = specs.iter().find(|s| !seen.insert(s.id.as_str())) {
                return Err(ConfigurationError::InvalidSnapshot(format!(
                    "duplicate {rtype} id {}",
                    dup.id
                )));
            }

            let per_node = specs.len() / node_count;
            for (index, node) in nodes.iter_mut().enumerate() {
                let instances = specs
                    .iter()
                    .skip(index * per_node)
                    .take(per_node)
                    .map(|s| Instance {
                        id: s.id.clone(),
                        capacity: s.slots,
                        used: 0,
                    })
                    .collect();
                node.instances.insert(rtype.clone(), instances);
            }
        }

        self.nodes = nodes;
        self.types = snapshot.resources.keys().cloned().collect();
        self.configured = true;

        debug!(
            nodes = node_count,
            types = ?self.types,
            "Resource pool configured"
        );
        Ok(())
    }

    /// Capacity description of the pool, independent of current usage
    pub fn snapshot(&self) -> PoolSnapshot {
        let resources = self
            .types
            .iter()
            .map(|rtype| {
                let specs = self
                    .nodes
                    .iter()
                    .flat_map(|n| n.instances.get(rtype).into_iter().flatten())
                    .map(|i| SlotSpec::new(i.id.clone(), i.capacity))
                    .collect();
                (rtype.clone(), specs)
            })
            .collect();

        PoolSnapshot {
            resources,
            additional_properties: AdditionalProperties {
                nodes: self.nodes.len(),
            },
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn types(&self) -> impl Iterator<Item = &String> {
        self.types.iter()
    }

    /// Total declared slots of a type, `None` if the type is not declared
    pub fn capacity(&self, rtype: &str) -> Option<u32> {
        self.types
            .contains(rtype)
            .then(|| self.nodes.iter().map(|n| n.capacity(rtype)).sum())
    }

    pub fn node_capacity(&self, node: usize, rtype: &str) -> u32 {
        self.nodes.get(node).map(|n| n.capacity(rtype)).unwrap_or(0)
    }

    /// Slots of a type currently held by grants
    pub fn held(&self, rtype: &str) -> u32 {
        self.capacity(rtype).unwrap_or(0) - self.free(rtype)
    }

    pub fn free(&self, rtype: &str) -> u32 {
        self.nodes.iter().map(|n| n.free(rtype)).sum()
    }

    pub fn outstanding_grants(&self) -> usize {
        self.grants.len()
    }

    /// Smallest per-node capacity of each type
    pub fn node_shape(&self) -> BTreeMap<String, u32> {
        self.types
            .iter()
            .map(|t| {
                let min = self.nodes.iter().map(|n| n.capacity(t)).min().unwrap_or(0);
                (t.clone(), min)
            })
            .collect()
    }

    /// Reject demands for types the pool never declared
    pub fn validate(&self, demands: &[ResourceDemand]) -> Result<(), ConfigurationError> {
        if !self.configured {
            return Err(ConfigurationError::NotConfigured);
        }
        match demands.iter().find(|d| !self.types.contains(&d.rtype)) {
            Some(d) => Err(ConfigurationError::UnknownResourceType(d.rtype.clone())),
            None => Ok(()),
        }
    }

    /// Whether the whole pool, summed over nodes, has enough declared capacity
    pub fn satisfiable(&self, demands: &[ResourceDemand]) -> Result<bool, ConfigurationError> {
        self.validate(demands)?;
        Ok(demand_totals(demands)
            .iter()
            .all(|(rtype, n)| self.capacity(rtype).unwrap_or(0) >= *n))
    }

    /// Fail unless the request could be granted with every slot free
    pub fn check_fits(&self, request: &AllocationRequest) -> Result<(), ResourceError> {
        self.validate(&request.demands)?;
        if self.plan(request, View::Capacity).is_none() {
            return Err(ResourceError::Unsatisfiable(format!(
                "{request} exceeds pool capacity"
            )));
        }
        Ok(())
    }

    /// Reserve every requested slot or none of them.
    ///
    /// `Ok(None)` means the request fits the pool but not the slots free now.
    pub fn try_allocate(
        &mut self,
        request: &AllocationRequest,
    ) -> Result<Option<ResourceGrant>, ResourceError> {
        self.check_fits(request)?;
        let Some(placement) = self.plan(request, View::Free) else {
            trace!(%request, "Not enough free slots");
            return Ok(None);
        };
        let grant = self.commit(placement);
        debug!(grant = grant.id, %request, nodes = ?grant.nodes(), "Allocated");
        Ok(Some(grant))
    }

    /// Return a grant's slots to the free set
    pub fn release(&mut self, grant_id: u64) -> Result<(), ResourceError> {
        let grant = self
            .grants
            .remove(&grant_id)
            .ok_or(ResourceError::UnknownGrant(grant_id))?;

        for item in &grant.items {
            let instance = self
                .nodes
                .get_mut(item.node)
                .and_then(|n| n.instances.get_mut(&item.rtype))
                .and_then(|v| v.iter_mut().find(|i| i.id == item.instance));
            if let Some(instance) = instance {
                instance.used = instance.used.saturating_sub(item.slots);
            }
        }

        debug!(grant = grant_id, "Released");
        Ok(())
    }

    fn available(&self, node: usize, rtype: &str, view: View) -> u32 {
        match view {
            View::Free => self.nodes[node].free(rtype),
            View::Capacity => self.nodes[node].capacity(rtype),
        }
    }

    fn plan(&self, request: &AllocationRequest, view: View) -> Option<Placement> {
        let totals: Vec<(String, u32)> = demand_totals(&request.demands)
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .collect();
        if totals.is_empty() {
            return Some(Vec::new());
        }

        match (request.affinity, request.span) {
            (NodeAffinity::Same, _) => (0..self.nodes.len())
                .find(|&n| {
                    totals
                        .iter()
                        .all(|(t, need)| self.available(n, t, view) >= *need)
                })
                .map(|n| totals.iter().map(|(t, need)| (n, t.clone(), *need)).collect()),
            (NodeAffinity::Match, Some(span)) => self.plan_span(&totals, span, view),
            _ => self.plan_spread(&totals, view),
        }
    }

    /// First-fit over nodes in index order
    fn plan_spread(&self, totals: &[(String, u32)], view: View) -> Option<Placement> {
        let mut placement = Vec::new();
        for (rtype, need) in totals {
            let mut remaining = *need;
            for node in 0..self.nodes.len() {
                if remaining == 0 {
                    break;
                }
                let take = self.available(node, rtype, view).min(remaining);
                if take > 0 {
                    placement.push((node, rtype.clone(), take));
                    remaining -= take;
                }
            }
            if remaining > 0 {
                return None;
            }
        }
        Some(placement)
    }

    /// Spread evenly over exactly `span` nodes, every node getting at least one unit
    fn plan_span(&self, totals: &[(String, u32)], span: usize, view: View) -> Option<Placement> {
        let units: u32 = totals.iter().map(|(_, n)| n).sum();
        if span == 0 || span > self.nodes.len() || (units as usize) < span {
            return None;
        }

        let share = |need: u32| need.div_ceil(span as u32);
        let mut candidates: Vec<usize> = (0..self.nodes.len())
            .filter(|&n| {
                totals
                    .iter()
                    .all(|(t, need)| self.available(n, t, view) >= share(*need))
            })
            .collect();
        if candidates.len() < span {
            return None;
        }
        candidates.sort_by_key(|&n| {
            let free: u32 = totals.iter().map(|(t, _)| self.available(n, t, view)).sum();
            (std::cmp::Reverse(free), n)
        });
        let chosen = &candidates[..span];

        let mut placement = Vec::new();
        let mut offset = 0;
        for (rtype, need) in totals {
            let base = need / span as u32;
            let extra = (need % span as u32) as usize;
            let mut counts = vec![base; span];
            for i in 0..extra {
                counts[(offset + i) % span] += 1;
            }
            offset = (offset + extra) % span;

            for (slot, &node) in chosen.iter().enumerate() {
                if counts[slot] > 0 {
                    placement.push((node, rtype.clone(), counts[slot]));
                }
            }
        }
        Some(placement)
    }

    fn commit(&mut self, placement: Placement) -> ResourceGrant {
        let mut items = Vec::new();
        for (node, rtype, count) in placement {
            let mut remaining = count;
            if let Some(instances) = self.nodes[node].instances.get_mut(&rtype) {
                for instance in instances.iter_mut() {
                    if remaining == 0 {
                        break;
                    }
                    let take = instance.free().min(remaining);
                    if take > 0 {
                        instance.used += take;
                        remaining -= take;
                        items.push(GrantItem {
                            node,
                            rtype: rtype.clone(),
                            instance: instance.id.clone(),
                            slots: take,
                        });
                    }
                }
            }
        }

        let grant = ResourceGrant {
            id: self.next_grant,
            items,
        };
        self.next_grant += 1;
        self.grants.insert(grant.id, grant.clone());
        grant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(nodes: usize, cpus: u32, gpus: u32) -> ResourcePool {
        let mut pool = ResourcePool::new();
        let per_node = BTreeMap::from([("cpus".to_string(), cpus), ("gpus".to_string(), gpus)]);
        pool.configure(nodes, &per_node).unwrap();
        pool
    }

    fn request(cpus: u32, gpus: u32, affinity: NodeAffinity) -> AllocationRequest {
        AllocationRequest::new(
            vec![ResourceDemand::cpus(cpus), ResourceDemand::gpus(gpus)],
            affinity,
        )
    }

    #[test]
    fn test_configure_twice_is_fatal() {
        let mut p = pool(1, 2, 0);
        let per_node = BTreeMap::from([("cpus".to_string(), 2)]);
        assert_eq!(
            p.configure(1, &per_node),
            Err(ConfigurationError::AlreadyConfigured)
        );
        assert_eq!(p.capacity("cpus"), Some(2));
    }

    #[test]
    fn test_rejects_uneven_snapshot() {
        let mut snapshot = PoolSnapshot::uniform(1, &BTreeMap::from([("cpus".to_string(), 3)]));
        snapshot.additional_properties.nodes = 2;
        assert!(matches!(
            ResourcePool::from_snapshot(&snapshot),
            Err(ConfigurationError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_satisfiable_sums_over_pool() {
        let p = pool(4, 2, 1);
        assert_eq!(p.satisfiable(&[ResourceDemand::cpus(8)]), Ok(true));
        assert_eq!(p.satisfiable(&[ResourceDemand::cpus(9)]), Ok(false));
        assert_eq!(
            p.satisfiable(&[ResourceDemand::cpus(3), ResourceDemand::cpus(3)]),
            Ok(true)
        );
        assert_eq!(
            p.satisfiable(&[ResourceDemand::new("fpga", 1)]),
            Err(ConfigurationError::UnknownResourceType("fpga".into()))
        );
    }

    #[test]
    fn test_all_or_nothing() {
        let mut p = pool(2, 4, 1);
        let held = p
            .try_allocate(&request(0, 1, NodeAffinity::Any))
            .unwrap()
            .unwrap();
        assert_eq!(held.slots("gpus"), 1);

        // gpus can only be partially satisfied; cpus must not be taken either
        let result = p.try_allocate(&request(3, 2, NodeAffinity::Any)).unwrap();
        assert!(result.is_none());
        assert_eq!(p.held("cpus"), 0);
        assert_eq!(p.held("gpus"), 1);
    }

    #[test]
    fn test_same_node_affinity() {
        let mut p = pool(2, 4, 0);
        let first = p
            .try_allocate(&request(3, 0, NodeAffinity::Same))
            .unwrap()
            .unwrap();
        assert_eq!(first.nodes(), BTreeSet::from([0]));

        let second = p
            .try_allocate(&request(2, 0, NodeAffinity::Same))
            .unwrap()
            .unwrap();
        assert_eq!(second.nodes(), BTreeSet::from([1]));

        // Spread would fit (1 + 2 free) but no single node has 3
        assert!(p
            .try_allocate(&request(3, 0, NodeAffinity::Same))
            .unwrap()
            .is_none());

        // Never fits on one node, even with everything free
        assert!(matches!(
            p.try_allocate(&request(5, 0, NodeAffinity::Same)),
            Err(ResourceError::Unsatisfiable(_))
        ));
    }

    #[test]
    fn test_match_span() {
        let mut p = pool(3, 4, 2);
        let grant = p
            .try_allocate(&request(4, 1, NodeAffinity::Match).with_span(2))
            .unwrap()
            .unwrap();
        assert_eq!(grant.node_count(), 2);
        assert_eq!(grant.slots("cpus"), 4);
        assert_eq!(grant.slots("gpus"), 1);

        let spread = p
            .try_allocate(&request(1, 1, NodeAffinity::Match).with_span(2))
            .unwrap()
            .unwrap();
        assert_eq!(spread.node_count(), 2);

        assert!(matches!(
            p.try_allocate(&request(1, 0, NodeAffinity::Match).with_span(2)),
            Err(ResourceError::Unsatisfiable(_))
        ));
    }

    #[test]
    fn test_release_once() {
        let mut p = pool(1, 4, 0);
        let grant = p
            .try_allocate(&request(4, 0, NodeAffinity::Any))
            .unwrap()
            .unwrap();
        assert_eq!(p.free("cpus"), 0);
        assert!(p
            .try_allocate(&request(1, 0, NodeAffinity::Any))
            .unwrap()
            .is_none());

        p.release(grant.id).unwrap();
        assert_eq!(p.free("cpus"), 4);
        assert_eq!(p.release(grant.id), Err(ResourceError::UnknownGrant(grant.id)));
        assert_eq!(p.outstanding_grants(), 0);
    }

    #[test]
    fn test_unknown_type_is_configuration_error() {
        let mut p = pool(1, 4, 0);
        let req = AllocationRequest::new(vec![ResourceDemand::new("fpga", 1)], NodeAffinity::Any);
        assert_eq!(
            p.try_allocate(&req),
            Err(ResourceError::Configuration(
                ConfigurationError::UnknownResourceType("fpga".into())
            ))
        );
    }

    #[test]
    fn test_snapshot_round_trip() {
        let p = pool(3, 4, 2);
        let snapshot = p.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let reloaded =
            ResourcePool::from_snapshot(&serde_json::from_str::<PoolSnapshot>(&json).unwrap())
                .unwrap();

        assert_eq!(reloaded.snapshot(), snapshot);
        assert_eq!(reloaded.node_count(), 3);
        for rtype in ["cpus", "gpus"] {
            assert_eq!(reloaded.capacity(rtype), p.capacity(rtype));
            for node in 0..3 {
                assert_eq!(
                    reloaded.node_capacity(node, rtype),
                    p.node_capacity(node, rtype)
                );
            }
        }
    }

    #[test]
    fn test_node_shape() {
        let p = pool(2, 8, 1);
        assert_eq!(p.node_shape().get("cpus"), Some(&8));
        assert_eq!(p.node_shape().get("gpus"), Some(&1));
    }
}
