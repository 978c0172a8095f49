//! Session driver
//!
//! Pulls ready cases from the dependency graph, groups them into units of
//! work, allocates resources for each unit and hands it to a case runner or a
//! scheduler adapter. Statuses are written back through the graph so failures
//! reach dependents as soon as they happen.

use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::runner::{
    expire, BatchScript, CaseRunner, JobOutcome, RunContext, SchedulerAdapter,
    INTERRUPTED_EXIT_CODE,
};
use crate::batch::{Batch, BatchId, Partitioner};
use crate::error::{DriverError, ResourceError};
use crate::graph::DependencyGraph;
use crate::models::{
    CaseId, NodeAffinity, SessionState, SessionSummary, StatusName, StatusRecord, TestCase,
    RUNNER_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE,
};
use crate::resource::{AllocationRequest, ResourceGrant, ResourceProvider};
use crate::results::{generate_session_id, StatusStore};

const STOPPED: &str = "stopped by session cancellation";

/// Knobs of one session
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Units dispatched at the same time
    pub workers: usize,
    pub fail_fast: bool,
    pub session_timeout: Option<Duration>,
    /// Applied to cases that do not carry their own timeout
    pub case_timeout: Option<Duration>,
    pub work_dir: PathBuf,
    pub partitioner: Partitioner,
    /// How often a submitted batch job is polled
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            fail_fast: false,
            session_timeout: None,
            case_timeout: None,
            work_dir: PathBuf::from("batchtest-work"),
            partitioner: Partitioner::default(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl DriverConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_case_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.case_timeout = timeout;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// A batch plus snapshots of its member cases
struct Unit {
    batch: Batch,
    cases: Vec<TestCase>,
}

impl Unit {
    fn members(&self) -> Vec<CaseId> {
        self.batch.members.clone()
    }

    /// Sibling key for `match` affinity
    fn family(&self) -> &str {
        self.cases.first().map(|c| c.family.as_str()).unwrap_or("")
    }
}

struct UnitReport {
    members: Vec<CaseId>,
    succeeded: bool,
}

/// State shared by the driver loop and every unit task.
///
/// Every read-modify-write of case status happens under the graph lock; the
/// store is written after the lock is dropped.
struct Shared {
    graph: Arc<Mutex<DependencyGraph>>,
    tokens: Mutex<HashMap<CaseId, CancellationToken>>,
    spans: Mutex<HashMap<String, usize>>,
    store: Option<Arc<dyn StatusStore>>,
}

impl Shared {
    async fn status(&self, id: &CaseId) -> Option<StatusName> {
        self.graph.lock().await.status(id)
    }

    async fn set_status(
        &self,
        id: &CaseId,
        name: StatusName,
        message: Option<String>,
        code: Option<i32>,
    ) {
        let (cancelled, records) = {
            let mut graph = self.graph.lock().await;
            let propagation = match graph.set_status(id, name, message, code) {
                Ok(propagation) => propagation,
                Err(e) => {
                    warn!(case = %id, error = %e, "Failed to set status");
                    return;
                }
            };

            let mut touched = vec![id.clone()];
            if name.is_success() {
                touched.extend(graph.dependents_of(id).unwrap_or_default());
            }
            touched.extend(propagation.not_run.iter().cloned());
            touched.extend(propagation.cancelled.iter().cloned());
            let records: Vec<StatusRecord> =
                touched.iter().filter_map(|t| graph.record(t)).collect();
            (propagation.cancelled, records)
        };

        self.stop(&cancelled).await;
        self.persist(&records);
    }

    /// Mark queued cases `NotRun` and everything downstream of them
    async fn not_run(&self, ids: &[CaseId], reason: &str) {
        let (cancelled, records) = {
            let mut graph = self.graph.lock().await;
            let mut touched = Vec::new();
            let mut cancelled = Vec::new();
            for id in ids {
                if !graph.status(id).is_some_and(|s| s.is_queued()) {
                    continue;
                }
                if graph
                    .set_status(id, StatusName::NotRun, Some(reason.to_string()), None)
                    .is_err()
                {
                    continue;
                }
                touched.push(id.clone());
                if let Ok(propagation) = graph.propagate_failure(id) {
                    touched.extend(propagation.not_run);
                    touched.extend(propagation.cancelled.iter().cloned());
                    cancelled.extend(propagation.cancelled);
                }
            }
            let records: Vec<StatusRecord> =
                touched.iter().filter_map(|t| graph.record(t)).collect();
            (cancelled, records)
        };

        self.stop(&cancelled).await;
        self.persist(&records);
    }

    /// Move queued members to `Running`, each with a token derived from `parent`
    async fn start(
        &self,
        ids: &[CaseId],
        parent: &CancellationToken,
    ) -> HashMap<CaseId, CancellationToken> {
        let mut started = HashMap::new();
        let records = {
            let mut graph = self.graph.lock().await;
            let mut tokens = self.tokens.lock().await;
            let mut records = Vec::new();
            for id in ids {
                if !graph.status(id).is_some_and(|s| s.is_queued()) {
                    continue;
                }
                if graph
                    .set_status(id, StatusName::Running, None, None)
                    .is_err()
                {
                    continue;
                }
                let token = parent.child_token();
                tokens.insert(id.clone(), token.clone());
                started.insert(id.clone(), token);
                records.extend(graph.record(id));
            }
            records
        };
        self.persist(&records);
        started
    }

    async fn finish(&self, ids: &[CaseId]) {
        let mut tokens = self.tokens.lock().await;
        for id in ids {
            tokens.remove(id);
        }
    }

    async fn stop(&self, ids: &[CaseId]) {
        if ids.is_empty() {
            return;
        }
        let tokens = self.tokens.lock().await;
        for id in ids {
            if let Some(token) = tokens.get(id) {
                debug!(case = %id, "Stopping running case");
                token.cancel();
            }
        }
    }

    /// Members left `Running` after a runner crash become `Fail`
    async fn fail_running(&self, ids: &[CaseId], reason: &str) {
        for id in ids {
            if self.status(id).await == Some(StatusName::Running) {
                self.set_status(
                    id,
                    StatusName::Fail,
                    Some(reason.to_string()),
                    Some(RUNNER_ERROR_EXIT_CODE),
                )
                .await;
            }
        }
    }

    async fn all_succeeded(&self, ids: &[CaseId]) -> bool {
        let graph = self.graph.lock().await;
        ids.iter()
            .all(|id| graph.status(id).is_some_and(|s| s.is_success()))
    }

    fn persist(&self, records: &[StatusRecord]) {
        let Some(store) = &self.store else {
            return;
        };
        for record in records {
            if let Err(e) = store.put(record) {
                warn!(case = %record.id, error = %e, "Failed to persist status");
            }
        }
    }
}

/// Everything a unit task needs, cloned into each task
#[derive(Clone)]
struct Dispatch {
    shared: Arc<Shared>,
    resources: Arc<dyn ResourceProvider>,
    runner: Arc<dyn CaseRunner>,
    scheduler: Option<Arc<dyn SchedulerAdapter>>,
    workers: Arc<Semaphore>,
    halt: CancellationToken,
    work_dir: PathBuf,
    case_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl Dispatch {
    async fn run_unit(self, unit: Unit) -> UnitReport {
        let members = unit.members();
        let id = unit.batch.id;

        let permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => permit.ok(),
            _ = self.halt.cancelled() => None,
        };
        let Some(_permit) = permit else {
            self.shared
                .not_run(&members, "session stopped before dispatch")
                .await;
            return UnitReport {
                members,
                succeeded: false,
            };
        };

        let request = self.request_for(&unit).await;
        debug!(unit = %id, %request, "Allocating");
        let grant = match self.resources.allocate(request, &self.halt).await {
            Ok(grant) => grant,
            Err(ResourceError::Cancelled) => {
                self.shared
                    .not_run(&members, "session stopped while waiting for resources")
                    .await;
                return UnitReport {
                    members,
                    succeeded: false,
                };
            }
            Err(e) => {
                warn!(unit = %id, error = %e, "Allocation failed");
                self.shared.not_run(&members, &e.to_string()).await;
                return UnitReport {
                    members,
                    succeeded: false,
                };
            }
        };
        self.remember_span(&unit, &grant).await;

        let token = self.halt.child_token();
        let tokens = self.shared.start(&members, &token).await;
        info!(unit = %id, grant = grant.id, cases = tokens.len(), "Dispatched");

        let outcome = AssertUnwindSafe(self.execute(&unit, &grant, &token, &tokens))
            .catch_unwind()
            .await;

        if let Err(e) = self.resources.release(&grant).await {
            warn!(unit = %id, grant = grant.id, error = %e, "Failed to release grant");
        }
        self.shared.finish(&members).await;

        if outcome.is_err() {
            error!(unit = %id, "Runner panicked");
            self.shared.fail_running(&members, "runner panicked").await;
        }

        let succeeded = self.shared.all_succeeded(&members).await;
        debug!(unit = %id, succeeded, "Unit finished");
        UnitReport { members, succeeded }
    }

    async fn request_for(&self, unit: &Unit) -> AllocationRequest {
        let mut request = AllocationRequest::new(unit.batch.resources.clone(), unit.batch.affinity);
        if unit.batch.affinity == NodeAffinity::Match {
            if let Some(&span) = self.shared.spans.lock().await.get(unit.family()) {
                request = request.with_span(span);
            }
        }
        request
    }

    /// The first grant of a family fixes the node count its siblings must match
    async fn remember_span(&self, unit: &Unit, grant: &ResourceGrant) {
        if unit.batch.affinity == NodeAffinity::Match {
            self.shared
                .spans
                .lock()
                .await
                .entry(unit.family().to_string())
                .or_insert(grant.node_count());
        }
    }

    async fn execute(
        &self,
        unit: &Unit,
        grant: &ResourceGrant,
        token: &CancellationToken,
        tokens: &HashMap<CaseId, CancellationToken>,
    ) {
        match &self.scheduler {
            Some(scheduler) => self.submit(scheduler.as_ref(), unit, grant, token).await,
            None => self.run_local(unit, grant, tokens).await,
        }
    }

    /// Run members one after another inside the unit's allocation
    async fn run_local(
        &self,
        unit: &Unit,
        grant: &ResourceGrant,
        tokens: &HashMap<CaseId, CancellationToken>,
    ) {
        for case in &unit.cases {
            let Some(token) = tokens.get(&case.id) else {
                continue;
            };
            if self.shared.status(&case.id).await != Some(StatusName::Running) {
                debug!(case = %case.id, "Skipping member stopped while its batch ran");
                continue;
            }

            let limit = case
                .timeout
                .and_then(|t| Duration::try_from_secs_f64(t).ok())
                .or(self.case_timeout);
            let ctx = RunContext::new(&self.work_dir)
                .with_timeout(limit)
                .with_grant(Some(grant.clone()))
                .with_cancel(token.clone());

            let code = tokio::select! {
                code = self.runner.execute(case, &ctx) => code,
                _ = expire(limit) => TIMEOUT_EXIT_CODE,
                _ = token.cancelled() => INTERRUPTED_EXIT_CODE,
            };

            // propagation may already have recorded why the case stopped
            if self.shared.status(&case.id).await != Some(StatusName::Running) {
                continue;
            }
            if token.is_cancelled() {
                self.shared
                    .set_status(&case.id, StatusName::Cancelled, Some(STOPPED.into()), Some(code))
                    .await;
                continue;
            }

            let name = StatusName::from_exit_code(code);
            debug!(case = %case.id, code, status = %name, "Case finished");
            self.shared
                .set_status(&case.id, name, describe(name, code, limit), Some(code))
                .await;
        }
    }

    async fn submit(
        &self,
        scheduler: &dyn SchedulerAdapter,
        unit: &Unit,
        grant: &ResourceGrant,
        token: &CancellationToken,
    ) {
        let script = BatchScript::render(&unit.batch, &unit.cases, &self.work_dir, Some(grant));
        let job = match scheduler.submit(&unit.batch, &script).await {
            Ok(job) => job,
            Err(e) => {
                warn!(unit = %unit.batch.id, error = %e, "Batch submission failed");
                let failed = JobOutcome {
                    code: RUNNER_ERROR_EXIT_CODE,
                    per_case: BTreeMap::new(),
                };
                self.apply_outcome(unit, Some(&failed)).await;
                return;
            }
        };

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = scheduler.cancel(&job).await {
                        warn!(job = %job.id, error = %e, "Failed to cancel job");
                    }
                    break None;
                }
                _ = tokio::time::sleep(self.poll_interval) => match scheduler.poll(&job).await {
                    Ok(Some(outcome)) => break Some(outcome),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(job = %job.id, error = %e, "Failed to poll job");
                        break Some(JobOutcome {
                            code: RUNNER_ERROR_EXIT_CODE,
                            per_case: BTreeMap::new(),
                        });
                    }
                },
            }
        };

        info!(job = %job.id, unit = %unit.batch.id, code = ?outcome.as_ref().map(|o| o.code), "Job finished");
        self.apply_outcome(unit, outcome.as_ref()).await;
    }

    /// Members share the job's code unless the scheduler reported their own
    async fn apply_outcome(&self, unit: &Unit, outcome: Option<&JobOutcome>) {
        for case in &unit.cases {
            if self.shared.status(&case.id).await != Some(StatusName::Running) {
                continue;
            }
            match outcome {
                Some(outcome) => {
                    let code = outcome.code_for(&case.id);
                    let name = StatusName::from_exit_code(code);
                    self.shared
                        .set_status(&case.id, name, describe(name, code, None), Some(code))
                        .await;
                }
                None => {
                    self.shared
                        .set_status(&case.id, StatusName::Cancelled, Some(STOPPED.into()), None)
                        .await;
                }
            }
        }
    }
}

fn describe(name: StatusName, code: i32, limit: Option<Duration>) -> Option<String> {
    match name {
        StatusName::Success => None,
        StatusName::Timeout => Some(match limit {
            Some(limit) => format!("timed out after {limit:?}"),
            None => "timed out".to_string(),
        }),
        _ => Some(format!("exit code {code}")),
    }
}

/// Drives one session over a locked dependency graph
pub struct Driver {
    config: DriverConfig,
    graph: Arc<Mutex<DependencyGraph>>,
    resources: Arc<dyn ResourceProvider>,
    runner: Arc<dyn CaseRunner>,
    scheduler: Option<Arc<dyn SchedulerAdapter>>,
    store: Option<Arc<dyn StatusStore>>,
    state: SessionState,
    session_id: String,
    cancel: CancellationToken,
    next_batch: usize,
}

impl Driver {
    pub fn new(
        graph: DependencyGraph,
        resources: Arc<dyn ResourceProvider>,
        runner: Arc<dyn CaseRunner>,
        config: DriverConfig,
    ) -> Result<Self, DriverError> {
        if !graph.is_locked() {
            return Err(crate::error::GraphBuildError::NotLocked.into());
        }
        Ok(Self {
            config,
            graph: Arc::new(Mutex::new(graph)),
            resources,
            runner,
            scheduler: None,
            store: None,
            state: SessionState::Discovering,
            session_id: generate_session_id(),
            cancel: CancellationToken::new(),
            next_batch: 0,
        })
    }

    /// Submit units through a scheduler instead of running cases in-process
    pub fn with_scheduler(mut self, scheduler: Arc<dyn SchedulerAdapter>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = id.into();
        self
    }

    /// Cancelling this token stops the session
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub async fn records(&self) -> Vec<StatusRecord> {
        self.graph.lock().await.records()
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.session_id, from = %self.state, to = %next, "Session state");
        self.state = next;
    }

    /// Reject undeclared resource types and bad strategy settings before
    /// anything runs. Insufficient capacity is left to each unit.
    async fn preflight(&self) -> Result<(), DriverError> {
        self.config.partitioner.validate()?;

        let demands: Vec<(CaseId, Vec<_>)> = {
            let graph = self.graph.lock().await;
            graph
                .cases()
                .filter(|c| c.status_name().is_queued())
                .map(|c| (c.id.clone(), c.resources.clone()))
                .collect()
        };
        for (id, demands) in demands {
            match self.resources.satisfiable(&demands).await {
                Ok(true) => {}
                Ok(false) => debug!(case = %id, "Case exceeds pool capacity"),
                Err(ResourceError::Configuration(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Ready cases nobody has picked up yet, grouped into units
    async fn next_units(&mut self, claimed: &HashSet<CaseId>) -> Result<Vec<Unit>, DriverError> {
        let cases: Vec<TestCase> = {
            let graph = self.graph.lock().await;
            graph
                .ready_set()
                .into_iter()
                .filter(|id| !claimed.contains(id))
                .filter_map(|id| graph.get(&id).cloned())
                .collect()
        };
        if cases.is_empty() {
            return Ok(Vec::new());
        }

        let batches = self.config.partitioner.partition(&cases)?;
        let offset = self.next_batch;
        self.next_batch += batches.len();
        debug!(ready = cases.len(), units = batches.len(), "Partitioned ready set");

        let by_id: HashMap<&CaseId, &TestCase> = cases.iter().map(|c| (&c.id, c)).collect();
        Ok(batches
            .into_iter()
            .map(|mut batch| {
                batch.id = BatchId(batch.id.0 + offset);
                for dep in batch.depends_on.iter_mut() {
                    dep.0 += offset;
                }
                let cases = batch
                    .members
                    .iter()
                    .filter_map(|m| by_id.get(m).map(|c| (*c).clone()))
                    .collect();
                Unit { batch, cases }
            })
            .collect())
    }

    /// Run the session to completion.
    ///
    /// Configuration and graph errors are returned before any case runs; case
    /// failures only show up in the summary.
    pub async fn run(&mut self) -> Result<SessionSummary, DriverError> {
        if self.state != SessionState::Discovering {
            return Err(DriverError::AlreadyRan);
        }
        let started_at = Utc::now();
        if let Err(e) = self.preflight().await {
            self.transition(SessionState::Failed);
            return Err(e);
        }
        self.transition(SessionState::Ready);

        let shared = Arc::new(Shared {
            graph: self.graph.clone(),
            tokens: Mutex::default(),
            spans: Mutex::default(),
            store: self.store.clone(),
        });
        let halt = self.cancel.child_token();
        let dispatch = Dispatch {
            shared: shared.clone(),
            resources: self.resources.clone(),
            runner: self.runner.clone(),
            scheduler: self.scheduler.clone(),
            workers: Arc::new(Semaphore::new(self.config.workers.max(1))),
            halt: halt.clone(),
            work_dir: self.config.work_dir.clone(),
            case_timeout: self.config.case_timeout,
            poll_interval: self.config.poll_interval,
        };

        self.transition(SessionState::Running);
        info!(
            session = %self.session_id,
            workers = self.config.workers,
            strategy = %self.config.partitioner.strategy,
            "Session started"
        );

        let mut tasks: JoinSet<UnitReport> = JoinSet::new();
        let mut claimed: HashSet<CaseId> = HashSet::new();
        let mut ending: Option<SessionState> = None;
        let deadline = expire(self.config.session_timeout);
        tokio::pin!(deadline);

        'session: loop {
            let units = match self.next_units(&claimed).await {
                Ok(units) => units,
                Err(e) => {
                    error!(error = %e, "Failed to partition ready cases");
                    ending = Some(SessionState::Failed);
                    break;
                }
            };

            for unit in units {
                let members = unit.members();
                let reason = match self.resources.satisfiable(&unit.batch.resources).await {
                    Ok(true) => None,
                    Ok(false) => Some(
                        ResourceError::Unsatisfiable(format!(
                            "{} needs more than the pool holds",
                            unit.batch
                        ))
                        .to_string(),
                    ),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = reason {
                    warn!(unit = %unit.batch.id, %reason, "Unit cannot run");
                    shared.not_run(&members, &reason).await;
                    if self.config.fail_fast {
                        ending = Some(SessionState::Failed);
                        break 'session;
                    }
                    continue;
                }

                claimed.extend(members);
                tasks.spawn(dispatch.clone().run_unit(unit));
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(report)) => {
                        for id in &report.members {
                            claimed.remove(id);
                        }
                        if !report.succeeded && self.config.fail_fast {
                            warn!("Unit failed, stopping session");
                            ending = Some(SessionState::Failed);
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Unit task aborted");
                        if self.config.fail_fast {
                            ending = Some(SessionState::Failed);
                        }
                    }
                    None => {}
                },
                _ = &mut deadline => {
                    warn!(timeout = ?self.config.session_timeout, "Session timed out");
                    ending = Some(SessionState::Cancelled);
                }
                _ = self.cancel.cancelled() => {
                    warn!("Session cancelled");
                    ending = Some(SessionState::Cancelled);
                }
            }

            if ending.is_some() {
                break;
            }
        }

        if ending.is_some() {
            halt.cancel();
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Unit task aborted");
            }
        }

        let state = ending.unwrap_or(SessionState::Complete);
        let records = {
            let mut graph = self.graph.lock().await;
            for id in graph.running() {
                let _ = graph.set_status(&id, StatusName::Cancelled, Some(STOPPED.into()), None);
            }
            let reason = match state {
                SessionState::Failed => "session stopped after a failure",
                SessionState::Cancelled => "session cancelled",
                _ => "dependencies never succeeded",
            };
            let abandoned = graph.abandon_queued(reason);
            if !abandoned.is_empty() {
                debug!(count = abandoned.len(), "Abandoned queued cases");
            }
            graph.records()
        };
        shared.persist(&records);
        self.transition(state);

        let summary = SessionSummary::new(self.session_id.clone(), state, started_at, records);
        info!(
            session = %summary.session_id,
            state = %summary.state,
            total = summary.total,
            exit_code = summary.exit_code,
            "Session finished in {}ms",
            summary.duration_ms()
        );
        Ok(summary)
    }
}
