//! Partition strategies
//!
//! Every strategy preserves the case set: each input case lands in exactly one
//! batch. A case that depends on another case of the same set is never placed
//! ahead of it: it either shares the dependency's batch, after it, or goes to a
//! later batch.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::debug;

use super::batch::{assemble, has_inset_dependency, link, stable_order, Batch};
use super::packing::{pack_to_height, PackingStrategy};
use crate::error::PartitionError;
use crate::models::{demand_totals, CaseId, NodeAffinity, TestCase};
use crate::resource::PoolSnapshot;

/// Whether `match` affinity needs equal node counts or only a bound
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Exact,
    UpperBound,
}

impl MatchMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "exact" => Some(MatchMode::Exact),
            "upper" | "upper_bound" | "upper-bound" => Some(MatchMode::UpperBound),
            _ => None,
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Exact => write!(f, "exact"),
            MatchMode::UpperBound => write!(f, "upper"),
        }
    }
}

/// Slots of each type on a single node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeShape {
    per_node: BTreeMap<String, u32>,
}

impl NodeShape {
    pub fn new(per_node: BTreeMap<String, u32>) -> Self {
        Self { per_node }
    }

    pub fn from_snapshot(snapshot: &PoolSnapshot) -> Self {
        let nodes = snapshot.nodes().max(1) as u32;
        let per_node = snapshot
            .resources
            .keys()
            .map(|t| (t.clone(), snapshot.capacity(t).unwrap_or(0) / nodes))
            .collect();
        Self { per_node }
    }

    /// Fewest nodes that can hold `requirement`; `usize::MAX` if no node has the type
    pub fn nodes_needed(&self, requirement: &BTreeMap<String, u32>) -> usize {
        requirement
            .iter()
            .filter(|(_, slots)| **slots > 0)
            .map(|(rtype, slots)| match self.per_node.get(rtype) {
                Some(&cap) if cap > 0 => slots.div_ceil(cap) as usize,
                _ => usize::MAX,
            })
            .max()
            .unwrap_or(0)
            .max(1)
    }
}

/// Split `cases` into exactly `n` batches balanced by estimated duration.
///
/// Longest-processing-time first: cases in decreasing duration, ties in
/// insertion order, each to the batch with the smallest load (then fewest
/// members, then lowest index). If `n` is at least the number of cases every
/// case gets its own batch. Cases depending on other cases of the set are
/// placed afterwards, in the latest batch holding one of their dependencies.
pub fn partition_n(cases: &[TestCase], n: usize) -> Result<Vec<Batch>, PartitionError> {
    if n == 0 {
        return Err(PartitionError::InvalidCount);
    }
    if n >= cases.len() {
        return Ok(one_per_batch(cases));
    }

    let ids: HashMap<&CaseId, usize> = cases.iter().enumerate().map(|(i, c)| (&c.id, i)).collect();
    let order = stable_order(cases);
    let (dependent, mut independent): (Vec<usize>, Vec<usize>) = order
        .into_iter()
        .partition(|&i| has_inset_dependency(&cases[i], &ids));
    independent.sort_by_key(|&i| i);
    independent.sort_by(|&a, &b| {
        cases[b]
            .estimated_duration
            .total_cmp(&cases[a].estimated_duration)
    });

    let bins = n.min(independent.len());
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); bins];
    let mut loads = vec![0.0f64; bins];
    for idx in independent {
        let target = (0..bins)
            .min_by(|&a, &b| {
                loads[a]
                    .total_cmp(&loads[b])
                    .then(groups[a].len().cmp(&groups[b].len()))
                    .then(a.cmp(&b))
            })
            .unwrap_or(0);
        loads[target] += cases[idx].estimated_duration;
        groups[target].push(idx);
    }

    let mut home: HashMap<usize, usize> = HashMap::new();
    for (g, group) in groups.iter().enumerate() {
        for &idx in group {
            home.insert(idx, g);
        }
    }
    for idx in dependent {
        // fewer independent cases than batches: open the missing batches with dependents
        let target = if groups.len() < n {
            groups.push(Vec::new());
            groups.len() - 1
        } else {
            cases[idx]
                .dependencies
                .iter()
                .filter_map(|d| ids.get(d))
                .filter_map(|d| home.get(d))
                .copied()
                .max()
                .unwrap_or(groups.len() - 1)
        };
        groups[target].push(idx);
        home.insert(idx, target);
    }

    let batches = assemble(cases, groups, NodeAffinity::Any);
    debug!(cases = cases.len(), batches = batches.len(), "Partitioned by count");
    Ok(batches)
}

/// One batch per case, dependencies first
pub fn one_per_batch(cases: &[TestCase]) -> Vec<Batch> {
    let mut batches: Vec<Batch> = stable_order(cases)
        .into_iter()
        .enumerate()
        .map(|(id, idx)| Batch::single(id, &cases[idx]))
        .collect();
    link(&mut batches, cases);
    batches
}

/// Accumulate cases into batches whose total duration stays within `limit`.
///
/// Cases are taken in insertion order, moved only as far as needed to follow
/// their in-set dependencies. A case longer than `limit` gets a batch of its
/// own. With `same` affinity a batch must fit on one node; with `match` every
/// member must span the same number of nodes as the batch (or, with
/// [`MatchMode::UpperBound`], no more than it).
pub fn partition_t(
    cases: &[TestCase],
    limit: f64,
    affinity: NodeAffinity,
    shape: &NodeShape,
    mode: MatchMode,
) -> Result<Vec<Batch>, PartitionError> {
    if limit.is_nan() || limit <= 0.0 {
        return Err(PartitionError::InvalidDuration(limit));
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut load = 0.0;

    for idx in stable_order(cases) {
        let case = &cases[idx];
        if case.estimated_duration > limit {
            if !current.is_empty() {
                groups.push(std::mem::take(&mut current));
                load = 0.0;
            }
            groups.push(vec![idx]);
            continue;
        }

        let fits = load + case.estimated_duration <= limit
            && affinity_allows(cases, &current, case, affinity, shape, mode);
        if !current.is_empty() && !fits {
            groups.push(std::mem::take(&mut current));
            load = 0.0;
        }
        current.push(idx);
        load += case.estimated_duration;
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let batches = assemble(cases, groups, affinity);
    debug!(
        cases = cases.len(),
        batches = batches.len(),
        limit,
        %affinity,
        "Partitioned by duration"
    );
    Ok(batches)
}

fn affinity_allows(
    cases: &[TestCase],
    members: &[usize],
    candidate: &TestCase,
    affinity: NodeAffinity,
    shape: &NodeShape,
    mode: MatchMode,
) -> bool {
    if members.is_empty() {
        return true;
    }
    let batch_nodes = members
        .iter()
        .map(|&i| shape.nodes_needed(&demand_totals(&cases[i].resources)))
        .max()
        .unwrap_or(1);
    let case_nodes = shape.nodes_needed(&demand_totals(&candidate.resources));

    match affinity {
        NodeAffinity::Any => true,
        NodeAffinity::Same => batch_nodes.max(case_nodes) == 1,
        NodeAffinity::Match => match mode {
            MatchMode::Exact => case_nodes == batch_nodes,
            MatchMode::UpperBound => case_nodes <= batch_nodes,
        },
    }
}

/// Partition non-composite cases with `partition`, then put every composite
/// case, and anything that depends on one, in a single trailing batch.
pub fn partition_x<F>(cases: &[TestCase], partition: F) -> Result<Vec<Batch>, PartitionError>
where
    F: FnOnce(&[TestCase]) -> Result<Vec<Batch>, PartitionError>,
{
    let mut trailing: HashSet<&CaseId> = HashSet::new();
    for idx in stable_order(cases) {
        let case = &cases[idx];
        if case.composite || case.dependencies.iter().any(|d| trailing.contains(d)) {
            trailing.insert(&case.id);
        }
    }

    let base: Vec<TestCase> = cases
        .iter()
        .filter(|c| !trailing.contains(&c.id))
        .cloned()
        .collect();
    let mut batches = if base.is_empty() {
        Vec::new()
    } else {
        partition(&base)?
    };

    if !trailing.is_empty() {
        let mut last = Batch::new(batches.len(), NodeAffinity::Any);
        for idx in stable_order(cases) {
            if trailing.contains(&cases[idx].id) {
                last.push(&cases[idx]);
            }
        }
        batches.push(last);
    }

    link(&mut batches, cases);
    Ok(batches)
}

/// How to group cases into batches
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum Strategy {
    /// Every case is its own unit
    #[default]
    Single,
    Count {
        count: usize,
    },
    Duration {
        limit: f64,
        #[serde(default)]
        affinity: NodeAffinity,
        #[serde(default)]
        match_mode: MatchMode,
    },
    Pack {
        width: u32,
        height: f64,
        #[serde(default)]
        packing: PackingStrategy,
    },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Single => write!(f, "one case per batch"),
            Strategy::Count { count } => write!(f, "{count} batches"),
            Strategy::Duration {
                limit, affinity, ..
            } => write!(f, "batches of at most {limit}s ({affinity})"),
            Strategy::Pack {
                width,
                height,
                packing,
            } => write!(f, "{width}x{height} bins ({packing})"),
        }
    }
}

/// Strategy plus the settings every strategy shares
#[derive(Clone, Debug, Default)]
pub struct Partitioner {
    pub strategy: Strategy,
    pub exempt_composite: bool,
    pub shape: NodeShape,
}

impl Partitioner {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_exempt_composite(mut self, exempt: bool) -> Self {
        self.exempt_composite = exempt;
        self
    }

    pub fn with_shape(mut self, shape: NodeShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn is_batching(&self) -> bool {
        self.strategy != Strategy::Single || self.exempt_composite
    }

    /// Reject invalid strategy parameters before any case is seen
    pub fn validate(&self) -> Result<(), PartitionError> {
        self.apply(&[]).map(|_| ())
    }

    pub fn partition(&self, cases: &[TestCase]) -> Result<Vec<Batch>, PartitionError> {
        if self.exempt_composite {
            partition_x(cases, |base| self.apply(base))
        } else {
            self.apply(cases)
        }
    }

    fn apply(&self, cases: &[TestCase]) -> Result<Vec<Batch>, PartitionError> {
        match &self.strategy {
            Strategy::Single => Ok(one_per_batch(cases)),
            Strategy::Count { count } => partition_n(cases, *count),
            Strategy::Duration {
                limit,
                affinity,
                match_mode,
            } => partition_t(cases, *limit, *affinity, &self.shape, *match_mode),
            Strategy::Pack {
                width,
                height,
                packing,
            } => pack_to_height(cases, *width, *height, *packing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchId;
    use crate::models::ResourceDemand;
    use std::collections::BTreeSet;

    fn timed(id: &str, seconds: f64) -> TestCase {
        TestCase::new(id).with_duration(seconds)
    }

    fn members(batches: &[Batch]) -> Vec<CaseId> {
        batches.iter().flat_map(|b| b.members.clone()).collect()
    }

    fn assert_set_preserved(cases: &[TestCase], batches: &[Batch]) {
        let all = members(batches);
        let unique: BTreeSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), unique.len(), "a case was duplicated");
        let expected: BTreeSet<_> = cases.iter().map(|c| c.id.clone()).collect();
        assert_eq!(unique, expected);
    }

    fn batch_of(batches: &[Batch], id: &str) -> usize {
        batches
            .iter()
            .position(|b| b.contains(&CaseId::new(id)))
            .unwrap()
    }

    /// 5 sweeps of 4 parameterized cases, each with a composite analysis case
    fn sweep() -> Vec<TestCase> {
        let mut cases = Vec::new();
        for family in ["alpha", "beta", "gamma", "delta", "omega"] {
            let mut analyze = TestCase::new(family).composite().with_duration(1.0);
            for np in [1, 2, 4, 8] {
                let id = format!("{family}.np={np}");
                cases.push(
                    TestCase::new(id.as_str())
                        .with_family(family)
                        .with_resource(ResourceDemand::cpus(np))
                        .with_duration(np as f64),
                );
                analyze = analyze.with_dependency(id.as_str());
            }
            cases.push(analyze);
        }
        cases
    }

    #[test]
    fn test_partition_n_balances_longest_first() {
        let cases = vec![
            timed("a", 5.0),
            timed("b", 4.0),
            timed("c", 3.0),
            timed("d", 3.0),
            timed("e", 2.0),
            timed("f", 1.0),
        ];
        let batches = partition_n(&cases, 3).unwrap();

        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| !b.is_empty()));
        assert_set_preserved(&cases, &batches);
        // loads 5,4,3 after the first round; d, e, f fill the lightest batch each time
        assert_eq!(batches[0].members, vec![CaseId::new("a"), CaseId::new("f")]);
        assert_eq!(batches[1].members, vec![CaseId::new("b"), CaseId::new("e")]);
        assert_eq!(batches[2].members, vec![CaseId::new("c"), CaseId::new("d")]);
        for b in &batches {
            assert!((b.duration - 6.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_partition_n_ties_keep_insertion_order() {
        let cases = vec![timed("a", 0.0), timed("b", 0.0), timed("c", 0.0), timed("d", 0.0)];
        let batches = partition_n(&cases, 2).unwrap();
        assert_eq!(batches[0].members, vec![CaseId::new("a"), CaseId::new("c")]);
        assert_eq!(batches[1].members, vec![CaseId::new("b"), CaseId::new("d")]);
    }

    #[test]
    fn test_partition_n_edges() {
        let cases = vec![timed("a", 1.0), timed("b", 1.0)];
        assert_eq!(partition_n(&cases, 0), Err(PartitionError::InvalidCount));

        let batches = partition_n(&cases, 10).unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 1));

        assert!(partition_n(&[], 3).unwrap().is_empty());
    }

    #[test]
    fn test_partition_n_with_few_independent_cases() {
        let cases = vec![
            timed("base", 1.0),
            timed("x", 1.0).with_dependency("base"),
            timed("y", 1.0).with_dependency("base"),
        ];
        let batches = partition_n(&cases, 3).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].depends_on, vec![BatchId(0)]);
        assert_eq!(batches[2].depends_on, vec![BatchId(0)]);

        let batches = partition_n(&cases, 2).unwrap();
        assert_eq!(batches.len(), 2);
        assert_set_preserved(&cases, &batches);
    }

    #[test]
    fn test_partition_n_keeps_member_affinity() {
        let cases: Vec<TestCase> = (0..4)
            .map(|i| {
                timed(&format!("t{i}"), 1.0)
                    .with_resource(ResourceDemand::cpus(2))
                    .with_affinity(if i == 3 { NodeAffinity::Any } else { NodeAffinity::Same })
            })
            .collect();
        let batches = partition_n(&cases, 2).unwrap();

        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.affinity, NodeAffinity::Same, "{batch}");
        }
    }

    #[test]
    fn test_partition_t_respects_limit() {
        let cases = vec![
            timed("a", 3.0),
            timed("b", 4.0),
            timed("c", 12.0),
            timed("d", 2.0),
            timed("e", 6.0),
            timed("f", 1.0),
        ];
        let batches =
            partition_t(&cases, 7.0, NodeAffinity::Any, &NodeShape::default(), MatchMode::Exact)
                .unwrap();

        assert_set_preserved(&cases, &batches);
        for b in &batches {
            assert!(b.duration <= 7.0 || b.len() == 1, "{b} exceeds the limit");
        }
        let c = batch_of(&batches, "c");
        assert_eq!(batches[c].len(), 1);
        assert_eq!(batch_of(&batches, "a"), batch_of(&batches, "b"));
        assert_eq!(batches.len(), 4);
    }

    #[test]
    fn test_partition_t_invalid_limit() {
        let shape = NodeShape::default();
        assert_eq!(
            partition_t(&[], 0.0, NodeAffinity::Any, &shape, MatchMode::Exact),
            Err(PartitionError::InvalidDuration(0.0))
        );
    }

    #[test]
    fn test_partition_t_same_node() {
        let shape = NodeShape::new(BTreeMap::from([("cpus".to_string(), 4)]));
        let cases = vec![
            timed("small", 1.0).with_resource(ResourceDemand::cpus(2)),
            timed("wide", 1.0).with_resource(ResourceDemand::cpus(6)),
            timed("tail", 1.0).with_resource(ResourceDemand::cpus(1)),
            timed("more", 1.0).with_resource(ResourceDemand::cpus(4)),
        ];
        let batches = partition_t(&cases, 100.0, NodeAffinity::Same, &shape, MatchMode::Exact)
            .unwrap();
        // wide needs two nodes, so it can only run alone
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].members, vec![CaseId::new("small")]);
        assert_eq!(batches[1].members, vec![CaseId::new("wide")]);
        assert_eq!(
            batches[2].members,
            vec![CaseId::new("tail"), CaseId::new("more")]
        );
        assert_eq!(batches[2].affinity, NodeAffinity::Same);
    }

    #[test]
    fn test_partition_t_match_modes() {
        let shape = NodeShape::new(BTreeMap::from([("cpus".to_string(), 4)]));
        let cases = vec![
            timed("two-a", 1.0).with_resource(ResourceDemand::cpus(8)),
            timed("one", 1.0).with_resource(ResourceDemand::cpus(2)),
            timed("two-b", 1.0).with_resource(ResourceDemand::cpus(5)),
        ];

        let exact = partition_t(&cases, 100.0, NodeAffinity::Match, &shape, MatchMode::Exact)
            .unwrap();
        assert_eq!(exact.len(), 3);

        let upper =
            partition_t(&cases, 100.0, NodeAffinity::Match, &shape, MatchMode::UpperBound)
                .unwrap();
        assert_eq!(upper.len(), 1);
    }

    #[test]
    fn test_composite_never_precedes_siblings() {
        let cases = sweep();
        let strategies = [
            Strategy::Count { count: 3 },
            Strategy::Duration {
                limit: 6.0,
                affinity: NodeAffinity::Any,
                match_mode: MatchMode::Exact,
            },
            Strategy::Pack {
                width: 8,
                height: 8.0,
                packing: PackingStrategy::BestFit,
            },
        ];

        for strategy in strategies {
            let batches = Partitioner::new(strategy.clone()).partition(&cases).unwrap();
            assert_set_preserved(&cases, &batches);
            for case in cases.iter().filter(|c| c.composite) {
                let home = batch_of(&batches, case.id.as_str());
                for dep in &case.dependencies {
                    let dep_home = batch_of(&batches, dep.as_str());
                    assert!(dep_home <= home, "{strategy}: {} ahead of {dep}", case.id);
                    if dep_home == home {
                        let order = &batches[home].members;
                        let pos = |id: &CaseId| order.iter().position(|m| m == id).unwrap();
                        assert!(pos(dep) < pos(&case.id));
                    }
                }
            }
        }
    }

    #[test]
    fn test_partition_x_trails_composites() {
        let cases = sweep();
        let batches = Partitioner::new(Strategy::Count { count: 4 })
            .with_exempt_composite(true)
            .partition(&cases)
            .unwrap();

        assert_eq!(batches.len(), 5);
        let last = batches.last().unwrap();
        assert_eq!(last.len(), 5);
        assert!(last.members.iter().all(|m| !m.as_str().contains('.')));
        assert_eq!(
            last.depends_on,
            vec![BatchId(0), BatchId(1), BatchId(2), BatchId(3)]
        );
        assert_set_preserved(&cases, &batches);
    }

    #[test]
    fn test_sweep_end_to_end() {
        let cases = sweep();
        assert_eq!(cases.len(), 25);

        let batches = partition_n(&cases, 5).unwrap();
        assert_eq!(batches.len(), 5);
        assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 25);
        assert_set_preserved(&cases, &batches);

        let batches = partition_n(&cases, usize::MAX).unwrap();
        assert_eq!(batches.len(), 25);
        assert!(batches.iter().all(|b| b.len() == 1));
        for (i, b) in batches.iter().enumerate() {
            assert!(b.depends_on.iter().all(|d| d.0 < i));
        }
    }

    #[test]
    fn test_nodes_needed() {
        let shape = NodeShape::new(BTreeMap::from([
            ("cpus".to_string(), 4),
            ("gpus".to_string(), 1),
        ]));
        let need = |c: u32, g: u32| {
            shape.nodes_needed(&BTreeMap::from([
                ("cpus".to_string(), c),
                ("gpus".to_string(), g),
            ]))
        };
        assert_eq!(need(0, 0), 1);
        assert_eq!(need(4, 1), 1);
        assert_eq!(need(5, 0), 2);
        assert_eq!(need(1, 3), 3);
        assert_eq!(
            shape.nodes_needed(&BTreeMap::from([("fpga".to_string(), 1)])),
            usize::MAX
        );
    }

    #[test]
    fn test_shape_from_snapshot() {
        let snapshot = PoolSnapshot::uniform(3, &BTreeMap::from([("cpus".to_string(), 8)]));
        let shape = NodeShape::from_snapshot(&snapshot);
        assert_eq!(
            shape.nodes_needed(&BTreeMap::from([("cpus".to_string(), 9)])),
            2
        );
    }

    #[test]
    fn test_partitioner_validate() {
        assert!(Partitioner::default().validate().is_ok());
        assert!(Partitioner::new(Strategy::Count { count: 0 }).validate().is_err());
        assert!(Partitioner::new(Strategy::Pack {
            width: 4,
            height: 0.0,
            packing: PackingStrategy::FirstFit,
        })
        .validate()
        .is_err());
    }
}
