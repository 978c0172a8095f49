//! Dependency graph of test cases
//!
//! Structure is mutable until [`DependencyGraph::lock`]; after that only case
//! statuses change, and only through [`DependencyGraph::set_status`].

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use crate::error::GraphBuildError;
use crate::models::{CaseId, StatusName, StatusRecord, TestCase};

/// Cases whose status changed because a dependency failed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Propagation {
    pub not_run: Vec<CaseId>,
    pub cancelled: Vec<CaseId>,
}

impl Propagation {
    pub fn is_empty(&self) -> bool {
        self.not_run.is_empty() && self.cancelled.is_empty()
    }

    pub fn merge(&mut self, other: Propagation) {
        self.not_run.extend(other.not_run);
        self.cancelled.extend(other.cancelled);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    cases: Vec<TestCase>,
    index: HashMap<CaseId, usize>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
    locked: bool,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and lock a graph in one step
    pub fn from_cases(cases: impl IntoIterator<Item = TestCase>) -> Result<Self, GraphBuildError> {
        let mut graph = Self::new();
        for case in cases {
            graph.add_case(case)?;
        }
        graph.lock()?;
        Ok(graph)
    }

    pub fn add_case(&mut self, case: TestCase) -> Result<(), GraphBuildError> {
        if self.locked {
            return Err(GraphBuildError::Locked);
        }
        if self.index.contains_key(&case.id) {
            return Err(GraphBuildError::DuplicateCase(case.id));
        }
        self.index.insert(case.id.clone(), self.cases.len());
        self.cases.push(case);
        Ok(())
    }

    /// Record that `case` depends on `depends_on`. The target is checked at lock time.
    pub fn add_edge(&mut self, case: &CaseId, depends_on: impl Into<CaseId>) -> Result<(), GraphBuildError> {
        if self.locked {
            return Err(GraphBuildError::Locked);
        }
        let idx = self.position(case)?;
        let dep = depends_on.into();
        let deps = &mut self.cases[idx].dependencies;
        if !deps.contains(&dep) {
            deps.push(dep);
        }
        Ok(())
    }

    /// Exclude a case before locking
    pub fn mask(&mut self, id: &CaseId, reason: impl Into<String>) -> Result<(), GraphBuildError> {
        if self.locked {
            return Err(GraphBuildError::Locked);
        }
        let idx = self.position(id)?;
        self.cases[idx]
            .status
            .set(StatusName::Masked, Some(reason.into()), None);
        Ok(())
    }

    /// Mask every case matching `predicate`; returns how many were masked
    pub fn mask_where(
        &mut self,
        predicate: impl Fn(&TestCase) -> bool,
        reason: &str,
    ) -> Result<usize, GraphBuildError> {
        let ids: Vec<CaseId> = self
            .cases
            .iter()
            .filter(|c| !c.is_masked() && predicate(c))
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            self.mask(id, reason)?;
        }
        Ok(ids.len())
    }

    /// Validate and freeze the structure.
    ///
    /// Nothing is modified unless every check passes.
    pub fn lock(&mut self) -> Result<(), GraphBuildError> {
        if self.locked {
            return Err(GraphBuildError::Locked);
        }

        for case in &self.cases {
            if let Some(missing) = case.dependencies.iter().find(|d| !self.index.contains_key(*d)) {
                return Err(GraphBuildError::DanglingDependency {
                    case: case.id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        let order = self.topological_order_checked()?;

        let mut dependents = vec![Vec::new(); self.cases.len()];
        for (idx, case) in self.cases.iter().enumerate() {
            for dep in &case.dependencies {
                dependents[self.index[dep]].push(idx);
            }
        }

        for &idx in &order {
            let case = &self.cases[idx];
            if case.is_masked() {
                continue;
            }
            let masked_dep = case
                .dependencies
                .iter()
                .find(|d| self.cases[self.index[*d]].is_masked())
                .cloned();
            let all_success = case
                .dependencies
                .iter()
                .all(|d| self.cases[self.index[d]].status_name().is_success());

            let case = &mut self.cases[idx];
            if let Some(dep) = masked_dep {
                case.status.set(
                    StatusName::Masked,
                    Some(format!("dependency {dep} is masked")),
                    None,
                );
            } else if case.status_name().is_queued() {
                let name = if all_success {
                    StatusName::Ready
                } else {
                    StatusName::Pending
                };
                case.status.set(name, None, None);
            }
        }

        self.dependents = dependents;
        self.order = order;
        self.locked = true;

        info!(
            cases = self.cases.len(),
            masked = self.cases.iter().filter(|c| c.is_masked()).count(),
            "Dependency graph locked"
        );
        Ok(())
    }

    /// Depth-first order with dependencies before dependents; fails on a cycle
    fn topological_order_checked(&self) -> Result<Vec<usize>, GraphBuildError> {
        let mut marks = vec![Mark::Unvisited; self.cases.len()];
        let mut path = Vec::new();
        let mut order = Vec::with_capacity(self.cases.len());

        for start in 0..self.cases.len() {
            if marks[start] == Mark::Unvisited {
                self.visit(start, &mut marks, &mut path, &mut order)?;
            }
        }
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), GraphBuildError> {
        marks[idx] = Mark::InProgress;
        path.push(idx);

        for dep in &self.cases[idx].dependencies {
            let next = self.index[dep];
            match marks[next] {
                Mark::Done => {}
                Mark::Unvisited => self.visit(next, marks, path, order)?,
                Mark::InProgress => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle: Vec<CaseId> =
                        path[start..].iter().map(|&p| self.cases[p].id.clone()).collect();
                    cycle.push(self.cases[next].id.clone());
                    return Err(GraphBuildError::Cycle(cycle));
                }
            }
        }

        path.pop();
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn contains(&self, id: &CaseId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &CaseId) -> Option<&TestCase> {
        self.index.get(id).map(|&i| &self.cases[i])
    }

    /// Cases in insertion order
    pub fn cases(&self) -> impl Iterator<Item = &TestCase> {
        self.cases.iter()
    }

    pub fn status(&self, id: &CaseId) -> Option<StatusName> {
        self.get(id).map(|c| c.status_name())
    }

    /// Case ids with dependencies before dependents
    pub fn topological_order(&self) -> Result<Vec<CaseId>, GraphBuildError> {
        if !self.locked {
            return Err(GraphBuildError::NotLocked);
        }
        Ok(self.order.iter().map(|&i| self.cases[i].id.clone()).collect())
    }

    pub fn dependents_of(&self, id: &CaseId) -> Result<Vec<CaseId>, GraphBuildError> {
        if !self.locked {
            return Err(GraphBuildError::NotLocked);
        }
        let idx = self.position(id)?;
        Ok(self.dependents[idx]
            .iter()
            .map(|&i| self.cases[i].id.clone())
            .collect())
    }

    /// Queued, non-masked cases whose every dependency succeeded, in insertion order
    pub fn ready_set(&self) -> Vec<CaseId> {
        if !self.locked {
            return Vec::new();
        }
        self.cases
            .iter()
            .filter(|c| c.status_name().is_queued())
            .filter(|c| {
                c.dependencies
                    .iter()
                    .all(|d| self.cases[self.index[d]].status_name().is_success())
            })
            .map(|c| c.id.clone())
            .collect()
    }

    /// Cases still waiting to run
    pub fn queued(&self) -> Vec<CaseId> {
        self.cases
            .iter()
            .filter(|c| c.status_name().is_queued())
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn running(&self) -> Vec<CaseId> {
        self.cases
            .iter()
            .filter(|c| c.status_name() == StatusName::Running)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Overwrite a case status.
    ///
    /// A failure status propagates to dependents; success promotes dependents
    /// whose dependencies have now all succeeded to `Ready`.
    pub fn set_status(
        &mut self,
        id: &CaseId,
        name: StatusName,
        message: Option<String>,
        code: Option<i32>,
    ) -> Result<Propagation, GraphBuildError> {
        if !self.locked {
            return Err(GraphBuildError::NotLocked);
        }
        let idx = self.position(id)?;
        self.cases[idx].status.set(name, message, code);
        debug!(case = %id, status = %name, "Status set");

        if name.is_failure() {
            return self.propagate_failure(id);
        }
        if name.is_success() {
            for dependent in self.dependents[idx].clone() {
                let ready = self.cases[dependent].status_name() == StatusName::Pending
                    && self.cases[dependent]
                        .dependencies
                        .iter()
                        .all(|d| self.cases[self.index[d]].status_name().is_success());
                if ready {
                    self.cases[dependent].status.set(StatusName::Ready, None, None);
                }
            }
        }
        Ok(Propagation::default())
    }

    /// Mark every transitive dependent of `id` that can no longer run.
    ///
    /// Queued dependents become `NotRun`, running ones `Cancelled`. Dependents
    /// already in a terminal state are left alone, which makes repeated calls
    /// no-ops.
    pub fn propagate_failure(&mut self, id: &CaseId) -> Result<Propagation, GraphBuildError> {
        if !self.locked {
            return Err(GraphBuildError::NotLocked);
        }
        let origin = self.position(id)?;
        let origin_status = self.cases[origin].status_name();

        let mut result = Propagation::default();
        let mut visited = HashSet::from([origin]);
        let mut queue: VecDeque<usize> = self.dependents[origin].iter().copied().collect();

        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            let message = format!("dependency {id} {origin_status}");
            let case = &mut self.cases[idx];
            match case.status_name() {
                StatusName::Pending | StatusName::Ready => {
                    case.status.set(StatusName::NotRun, Some(message), None);
                    result.not_run.push(case.id.clone());
                }
                StatusName::Running => {
                    case.status.set(StatusName::Cancelled, Some(message), None);
                    result.cancelled.push(case.id.clone());
                }
                _ => continue,
            }
            queue.extend(self.dependents[idx].iter().copied());
        }

        if !result.is_empty() {
            debug!(
                case = %id,
                not_run = result.not_run.len(),
                cancelled = result.cancelled.len(),
                "Propagated failure"
            );
        }
        Ok(result)
    }

    /// Every case `from` transitively depends on, excluding `from` itself
    pub fn reachable(&self, from: &CaseId) -> Result<BTreeSet<CaseId>, GraphBuildError> {
        let start = self.position(from)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for dep in &self.cases[idx].dependencies {
                if let Some(&next) = self.index.get(dep) {
                    if seen.insert(dep.clone()) {
                        stack.push(next);
                    }
                }
            }
        }
        seen.remove(from);
        Ok(seen)
    }

    /// The given ids plus everything they depend on
    pub fn closure<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a CaseId>,
    ) -> Result<BTreeSet<CaseId>, GraphBuildError> {
        let mut result = BTreeSet::new();
        for id in ids {
            result.extend(self.reachable(id)?);
            result.insert(id.clone());
        }
        Ok(result)
    }

    /// Move every case still queued to `NotRun`
    pub fn abandon_queued(&mut self, reason: &str) -> Vec<CaseId> {
        let mut abandoned = Vec::new();
        for case in self.cases.iter_mut().filter(|c| c.status_name().is_queued()) {
            case.status
                .set(StatusName::NotRun, Some(reason.to_string()), None);
            abandoned.push(case.id.clone());
        }
        abandoned
    }

    pub fn record(&self, id: &CaseId) -> Option<StatusRecord> {
        self.get(id).map(StatusRecord::from_case)
    }

    pub fn records(&self) -> Vec<StatusRecord> {
        self.cases.iter().map(StatusRecord::from_case).collect()
    }

    fn position(&self, id: &CaseId) -> Result<usize, GraphBuildError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphBuildError::UnknownCase(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> CaseId {
        CaseId::new(s)
    }

    /// C depends on B depends on A
    fn chain() -> DependencyGraph {
        DependencyGraph::from_cases([
            TestCase::new("a"),
            TestCase::new("b").with_dependency("a"),
            TestCase::new("c").with_dependency("b"),
        ])
        .unwrap()
    }

    #[test]
    fn test_lock_sets_initial_status() {
        let graph = chain();
        assert_eq!(graph.status(&id("a")), Some(StatusName::Ready));
        assert_eq!(graph.status(&id("b")), Some(StatusName::Pending));
        assert_eq!(graph.ready_set(), vec![id("a")]);
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![id("a"), id("b"), id("c")]
        );
    }

    #[test]
    fn test_cycle_fails_without_mutation() {
        let mut graph = DependencyGraph::new();
        graph.add_case(TestCase::new("x")).unwrap();
        graph.add_case(TestCase::new("a").with_dependency("c")).unwrap();
        graph.add_case(TestCase::new("b").with_dependency("a")).unwrap();
        graph.add_case(TestCase::new("c").with_dependency("b")).unwrap();
        let before: Vec<_> = graph.records();

        match graph.lock() {
            Err(GraphBuildError::Cycle(cycle)) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(!graph.is_locked());
        assert_eq!(graph.records(), before);
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_case(TestCase::new("a")).unwrap();
        graph.add_edge(&id("a"), "a").unwrap();
        assert!(matches!(graph.lock(), Err(GraphBuildError::Cycle(_))));
    }

    #[test]
    fn test_dangling_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_case(TestCase::new("a")).unwrap();
        graph.add_edge(&id("a"), "ghost").unwrap();
        assert_eq!(
            graph.lock(),
            Err(GraphBuildError::DanglingDependency {
                case: id("a"),
                missing: id("ghost")
            })
        );
    }

    #[test]
    fn test_locked_structure_is_frozen() {
        let mut graph = chain();
        assert_eq!(
            graph.add_case(TestCase::new("d")),
            Err(GraphBuildError::Locked)
        );
        assert_eq!(graph.add_edge(&id("a"), "c"), Err(GraphBuildError::Locked));
        assert_eq!(graph.mask(&id("a"), "late"), Err(GraphBuildError::Locked));
    }

    #[test]
    fn test_failure_marks_queued_dependents_not_run() {
        let mut graph = chain();
        let propagation = graph
            .set_status(&id("a"), StatusName::Fail, None, Some(1))
            .unwrap();

        assert_eq!(propagation.not_run, vec![id("b"), id("c")]);
        assert!(propagation.cancelled.is_empty());
        assert_eq!(graph.status(&id("b")), Some(StatusName::NotRun));
        assert_eq!(graph.status(&id("c")), Some(StatusName::NotRun));
        assert!(graph.ready_set().is_empty());
    }

    #[test]
    fn test_failure_cancels_running_dependent() {
        let mut graph = chain();
        graph
            .set_status(&id("a"), StatusName::Running, None, None)
            .unwrap();
        // permissive: an external re-run may start b early
        graph
            .set_status(&id("b"), StatusName::Running, None, None)
            .unwrap();

        let propagation = graph
            .set_status(&id("a"), StatusName::Fail, None, Some(1))
            .unwrap();
        assert_eq!(propagation.cancelled, vec![id("b")]);
        assert_eq!(propagation.not_run, vec![id("c")]);
        assert_eq!(graph.status(&id("b")), Some(StatusName::Cancelled));
        assert_eq!(graph.status(&id("c")), Some(StatusName::NotRun));
    }

    #[test]
    fn test_propagation_is_idempotent() {
        let mut graph = chain();
        graph
            .set_status(&id("a"), StatusName::Diff, None, Some(64))
            .unwrap();
        let stamp = graph.get(&id("c")).unwrap().status.entered_at(StatusName::NotRun);

        let again = graph.propagate_failure(&id("a")).unwrap();
        assert!(again.is_empty());
        assert_eq!(
            graph.get(&id("c")).unwrap().status.entered_at(StatusName::NotRun),
            stamp
        );
    }

    #[test]
    fn test_success_promotes_dependents() {
        let mut graph = DependencyGraph::from_cases([
            TestCase::new("a"),
            TestCase::new("b"),
            TestCase::new("join").with_dependency("a").with_dependency("b"),
        ])
        .unwrap();

        graph
            .set_status(&id("a"), StatusName::Success, None, Some(0))
            .unwrap();
        assert_eq!(graph.status(&id("join")), Some(StatusName::Pending));
        assert_eq!(graph.ready_set(), vec![id("b")]);

        graph
            .set_status(&id("b"), StatusName::Success, None, Some(0))
            .unwrap();
        assert_eq!(graph.status(&id("join")), Some(StatusName::Ready));
        assert_eq!(graph.ready_set(), vec![id("join")]);
    }

    #[test]
    fn test_masked_dependency_masks_dependents() {
        let mut graph = DependencyGraph::new();
        graph.add_case(TestCase::new("a")).unwrap();
        graph.add_case(TestCase::new("b").with_dependency("a")).unwrap();
        graph.add_case(TestCase::new("c").with_dependency("b")).unwrap();
        graph.add_case(TestCase::new("d")).unwrap();
        graph.mask(&id("a"), "filtered").unwrap();
        graph.lock().unwrap();

        assert_eq!(graph.status(&id("b")), Some(StatusName::Masked));
        assert_eq!(graph.status(&id("c")), Some(StatusName::Masked));
        assert_eq!(graph.ready_set(), vec![id("d")]);
        assert_eq!(
            graph.get(&id("c")).unwrap().status.message.as_deref(),
            Some("dependency b is masked")
        );
    }

    #[test]
    fn test_reachable_and_closure() {
        let mut graph = DependencyGraph::new();
        graph.add_case(TestCase::new("a")).unwrap();
        graph.add_case(TestCase::new("b").with_dependency("a")).unwrap();
        graph.add_case(TestCase::new("c").with_dependency("b")).unwrap();
        graph.add_case(TestCase::new("d").with_dependency("a")).unwrap();

        assert_eq!(
            graph.reachable(&id("c")).unwrap(),
            BTreeSet::from([id("a"), id("b")])
        );
        assert!(graph.reachable(&id("a")).unwrap().is_empty());
        assert_eq!(
            graph.closure([&id("c"), &id("d")]).unwrap(),
            BTreeSet::from([id("a"), id("b"), id("c"), id("d")])
        );
        assert_eq!(
            graph.reachable(&id("zz")),
            Err(GraphBuildError::UnknownCase(id("zz")))
        );
    }

    #[test]
    fn test_abandon_queued() {
        let mut graph = chain();
        graph
            .set_status(&id("a"), StatusName::Running, None, None)
            .unwrap();
        let abandoned = graph.abandon_queued("session cancelled");
        assert_eq!(abandoned, vec![id("b"), id("c")]);
        assert_eq!(graph.status(&id("a")), Some(StatusName::Running));
    }
}
