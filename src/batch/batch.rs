//! Batch model
//!
//! A batch is submitted as one unit. Its members run one after another inside a
//! single allocation, so the allocation must cover the largest member.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::models::{demand_totals, CaseId, NodeAffinity, ResourceDemand, TestCase};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub usize);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{:03}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,

    /// Members in execution order
    pub members: Vec<CaseId>,

    /// Per-type maximum over the members
    pub resources: Vec<ResourceDemand>,

    /// Sum of member estimated durations
    pub duration: f64,

    pub affinity: NodeAffinity,

    /// Batches holding cases that members of this batch depend on
    pub depends_on: Vec<BatchId>,
}

impl Batch {
    pub fn new(id: usize, affinity: NodeAffinity) -> Self {
        Self {
            id: BatchId(id),
            members: Vec::new(),
            resources: Vec::new(),
            duration: 0.0,
            affinity,
            depends_on: Vec::new(),
        }
    }

    /// A batch of exactly one case, keeping the case's own affinity
    pub fn single(id: usize, case: &TestCase) -> Self {
        let mut batch = Self::new(id, case.affinity);
        batch.push(case);
        batch
    }

    pub fn push(&mut self, case: &TestCase) {
        let mut totals = self.requirement();
        for (rtype, slots) in demand_totals(&case.resources) {
            let entry = totals.entry(rtype).or_insert(0);
            *entry = (*entry).max(slots);
        }
        self.resources = totals
            .into_iter()
            .map(|(rtype, slots)| ResourceDemand::new(rtype, slots))
            .collect();
        self.duration += case.estimated_duration;
        self.members.push(case.id.clone());
    }

    pub fn requirement(&self) -> BTreeMap<String, u32> {
        demand_totals(&self.resources)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &CaseId) -> bool {
        self.members.contains(id)
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} cases, {:.1}s)",
            self.id,
            self.members.len(),
            self.duration
        )
    }
}

/// Build batches from index groups over `cases` and link them.
///
/// A batch takes the strictest of `floor` and its members' own affinities.
pub(crate) fn assemble(
    cases: &[TestCase],
    groups: Vec<Vec<usize>>,
    floor: NodeAffinity,
) -> Vec<Batch> {
    let mut batches: Vec<Batch> = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .enumerate()
        .map(|(id, group)| {
            let affinity = group
                .iter()
                .fold(floor, |a, &idx| a.strictest(cases[idx].affinity));
            let mut batch = Batch::new(id, affinity);
            for idx in group {
                batch.push(&cases[idx]);
            }
            batch
        })
        .collect();
    link(&mut batches, cases);
    batches
}

/// Recompute `depends_on` from case edges that cross batches
pub(crate) fn link(batches: &mut [Batch], cases: &[TestCase]) {
    let home: HashMap<CaseId, BatchId> = batches
        .iter()
        .flat_map(|b| b.members.iter().map(move |m| (m.clone(), b.id)))
        .collect();
    let by_id: HashMap<&CaseId, &TestCase> = cases.iter().map(|c| (&c.id, c)).collect();

    for batch in batches.iter_mut() {
        let mut deps: Vec<BatchId> = batch
            .members
            .iter()
            .filter_map(|m| by_id.get(m))
            .flat_map(|c| c.dependencies.iter())
            .filter_map(|d| home.get(d).copied())
            .filter(|b| *b != batch.id)
            .collect();
        deps.sort();
        deps.dedup();
        batch.depends_on = deps;
    }
}

/// Indices in insertion order, except that a case never precedes an in-set dependency
pub(crate) fn stable_order(cases: &[TestCase]) -> Vec<usize> {
    let position: HashMap<&CaseId, usize> =
        cases.iter().enumerate().map(|(i, c)| (&c.id, i)).collect();

    let mut waiting_on: Vec<usize> = cases
        .iter()
        .map(|c| {
            c.dependencies
                .iter()
                .filter(|d| position.contains_key(d))
                .count()
        })
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); cases.len()];
    for (idx, case) in cases.iter().enumerate() {
        for dep in &case.dependencies {
            if let Some(&d) = position.get(dep) {
                dependents[d].push(idx);
            }
        }
    }

    let mut ready: std::collections::BTreeSet<usize> =
        (0..cases.len()).filter(|&i| waiting_on[i] == 0).collect();
    let mut order = Vec::with_capacity(cases.len());
    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for &next in &dependents[idx] {
            waiting_on[next] -= 1;
            if waiting_on[next] == 0 {
                ready.insert(next);
            }
        }
    }

    // a cycle can only come from an unlocked set; keep the rest in insertion order
    if order.len() < cases.len() {
        let placed: std::collections::HashSet<usize> = order.iter().copied().collect();
        order.extend((0..cases.len()).filter(|i| !placed.contains(i)));
    }
    order
}

/// Whether the case depends on another member of `cases`
pub(crate) fn has_inset_dependency(case: &TestCase, ids: &HashMap<&CaseId, usize>) -> bool {
    case.dependencies.iter().any(|d| ids.contains_key(d))
}
