//! Case runners and scheduler adapters
//!
//! A [`CaseRunner`] executes one case and reports an exit code; it never fails.
//! A [`SchedulerAdapter`] takes a whole batch as a script and hands back a job
//! handle that can be polled.

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchId};
use crate::models::{CaseId, TestCase, RUNNER_ERROR_EXIT_CODE, TIMEOUT_EXIT_CODE};
use crate::resource::ResourceGrant;

/// Exit code reported for a case stopped by cancellation
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Everything a runner needs besides the case itself
#[derive(Clone, Debug)]
pub struct RunContext {
    pub work_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub grant: Option<ResourceGrant>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            timeout: None,
            grant: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grant(mut self, grant: Option<ResourceGrant>) -> Self {
        self.grant = grant;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Executes a single case
#[async_trait]
pub trait CaseRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run the case and return its exit code. Internal errors are encoded as
    /// non-zero codes, never raised.
    async fn execute(&self, case: &TestCase, ctx: &RunContext) -> i32;
}

/// Opaque handle of a submitted batch job
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub id: String,
    pub batch: BatchId,
}

/// Final result of a batch job
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub code: i32,
    /// Per-case codes, when the scheduler can report them
    pub per_case: BTreeMap<CaseId, i32>,
}

impl JobOutcome {
    pub fn code_for(&self, id: &CaseId) -> i32 {
        self.per_case.get(id).copied().unwrap_or(self.code)
    }
}

/// Submits batches to an external job scheduler
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, batch: &Batch, script: &BatchScript) -> Result<JobHandle>;

    /// `None` while the job is still running
    async fn poll(&self, job: &JobHandle) -> Result<Option<JobOutcome>>;

    async fn cancel(&self, job: &JobHandle) -> Result<()>;
}

/// Directory name for a case id
pub fn case_dir_name(id: &CaseId) -> String {
    id.as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '=') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Environment exported to a case: its id, parameters and granted slots
pub fn case_environment(case: &TestCase, grant: Option<&ResourceGrant>) -> Vec<(String, String)> {
    let mut env = vec![
        ("BATCHTEST_CASE_ID".to_string(), case.id.to_string()),
        ("BATCHTEST_FAMILY".to_string(), case.family.clone()),
        ("BATCHTEST_PARAMETERS".to_string(), case.parameter_string()),
    ];
    for (name, value) in &case.parameters {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        env.push((format!("BATCHTEST_PARAM_{}", env_key(name)), value));
    }
    if let Some(grant) = grant {
        for rtype in grant.types() {
            env.push((
                format!("BATCHTEST_{}_IDS", env_key(&rtype)),
                grant.instances(&rtype).join(","),
            ));
        }
        let nodes: Vec<String> = grant.nodes().iter().map(|n| n.to_string()).collect();
        env.push(("BATCHTEST_NODES".to_string(), nodes.join(",")));
    }
    env
}

pub(crate) async fn expire(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
    }
}

/// Runs the case's command as a child process
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, case: &TestCase, ctx: &RunContext) -> Result<i32> {
        // a composite without a command only aggregates its instances
        if case.composite && case.command.is_empty() {
            return Ok(0);
        }
        let (program, args) = case
            .command
            .split_first()
            .with_context(|| format!("Case {} has no command", case.id))?;

        let dir = ctx.work_dir.join(case_dir_name(&case.id));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create case directory: {}", dir.display()))?;
        let log = std::fs::File::create(dir.join("output.log"))
            .with_context(|| format!("Failed to create output log in {}", dir.display()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&dir)
            .envs(case_environment(case, ctx.grant.as_ref()))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {program}"))?;

        debug!(case = %case.id, pid = ?child.id(), "Spawned case process");

        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for case process")?;
                Ok(status.code().unwrap_or(RUNNER_ERROR_EXIT_CODE))
            }
            _ = expire(ctx.timeout) => {
                warn!(case = %case.id, timeout = ?ctx.timeout, "Case timed out");
                let _ = child.kill().await;
                Ok(TIMEOUT_EXIT_CODE)
            }
            _ = ctx.cancel.cancelled() => {
                debug!(case = %case.id, "Killing cancelled case");
                let _ = child.kill().await;
                Ok(INTERRUPTED_EXIT_CODE)
            }
        }
    }
}

#[async_trait]
impl CaseRunner for ProcessRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, case: &TestCase, ctx: &RunContext) -> i32 {
        match self.run(case, ctx).await {
            Ok(code) => code,
            Err(e) => {
                warn!(case = %case.id, error = %e, "Case runner error");
                RUNNER_ERROR_EXIT_CODE
            }
        }
    }
}

/// Quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Shell script that runs a batch's members one after another and records
/// each member's exit code
#[derive(Clone, Debug, PartialEq)]
pub struct BatchScript {
    pub batch: BatchId,
    pub path: PathBuf,
    pub results: PathBuf,
    pub work_dir: PathBuf,
    pub body: String,
}

impl BatchScript {
    /// Render the script for `batch`; `cases` must contain every member.
    ///
    /// Paths in the script are absolute, since the job runs from `work_dir`.
    pub fn render(
        batch: &Batch,
        cases: &[TestCase],
        work_dir: &Path,
        grant: Option<&ResourceGrant>,
    ) -> Self {
        let work_dir = std::path::absolute(work_dir).unwrap_or_else(|_| work_dir.to_path_buf());
        let work_dir = work_dir.as_path();
        let dir = work_dir.join("batches");
        let path = dir.join(format!("{}.sh", batch.id));
        let results = dir.join(format!("{}.codes", batch.id));
        let by_id: HashMap<&CaseId, &TestCase> = cases.iter().map(|c| (&c.id, c)).collect();

        let mut body = String::new();
        body.push_str("#!/bin/sh\n");
        body.push_str(&format!(
            "# {} - {} cases, {:.1}s estimated\n",
            batch.id,
            batch.members.len(),
            batch.duration
        ));
        body.push_str(&format!(
            "results={}\n: > \"$results\"\nstatus=0\n",
            shell_quote(&results.to_string_lossy())
        ));

        for member in &batch.members {
            let Some(case) = by_id.get(member) else {
                continue;
            };
            let case_dir = work_dir.join(case_dir_name(&case.id));
            let exports: Vec<String> = case_environment(case, grant)
                .iter()
                .map(|(k, v)| format!("{k}={}", shell_quote(v)))
                .collect();
            let argv: Vec<String> = case.command.iter().map(|a| shell_quote(a)).collect();
            let dir = shell_quote(&case_dir.to_string_lossy());

            body.push_str(&format!("\n# {}\n", case.id));
            body.push_str(&format!("mkdir -p {dir}\n"));
            if argv.is_empty() && case.composite {
                body.push_str("code=0\n");
            } else if argv.is_empty() {
                body.push_str(&format!("code={RUNNER_ERROR_EXIT_CODE}\n"));
            } else {
                body.push_str(&format!(
                    "(cd {dir} && exec env {} {}) > {dir}/output.log 2>&1\ncode=$?\n",
                    exports.join(" "),
                    argv.join(" ")
                ));
            }
            body.push_str(&format!(
                "echo {} $code >> \"$results\"\n[ $code -ne 0 ] && status=$code\n",
                shell_quote(case.id.as_str())
            ));
        }
        body.push_str("\nexit $status\n");

        Self {
            batch: batch.id,
            path,
            results,
            work_dir: work_dir.to_path_buf(),
            body,
        }
    }

    pub fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&self.path, &self.body)
            .with_context(|| format!("Failed to write batch script: {}", self.path.display()))
    }
}

/// Parse `<case id> <code>` lines written by a batch script
pub fn parse_case_codes(content: &str) -> BTreeMap<CaseId, i32> {
    content
        .lines()
        .filter_map(|line| {
            let (id, code) = line.trim().rsplit_once(' ')?;
            Some((CaseId::new(id), code.parse().ok()?))
        })
        .collect()
}

struct ShellJob {
    child: Child,
    results: PathBuf,
}

/// Runs batch scripts with `sh` on the local machine
#[derive(Default)]
pub struct ShellAdapter {
    jobs: Mutex<HashMap<String, ShellJob>>,
    next_id: AtomicU64,
}

impl ShellAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchedulerAdapter for ShellAdapter {
    fn name(&self) -> &str {
        "shell"
    }

    async fn submit(&self, batch: &Batch, script: &BatchScript) -> Result<JobHandle> {
        script.write()?;
        let child = Command::new("sh")
            .arg(&script.path)
            .current_dir(&script.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to submit {}", batch.id))?;

        let id = format!("shell-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(job = %id, batch = %batch.id, "Submitted batch");
        self.jobs.lock().await.insert(
            id.clone(),
            ShellJob {
                child,
                results: script.results.clone(),
            },
        );
        Ok(JobHandle {
            id,
            batch: batch.id,
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<Option<JobOutcome>> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(&job.id)
            .with_context(|| format!("Unknown job {}", job.id))?;
        let Some(status) = entry.child.try_wait()? else {
            return Ok(None);
        };

        let results = entry.results.clone();
        jobs.remove(&job.id);
        let per_case = tokio::fs::read_to_string(&results)
            .await
            .map(|content| parse_case_codes(&content))
            .unwrap_or_default();
        Ok(Some(JobOutcome {
            code: status.code().unwrap_or(RUNNER_ERROR_EXIT_CODE),
            per_case,
        }))
    }

    async fn cancel(&self, job: &JobHandle) -> Result<()> {
        if let Some(mut entry) = self.jobs.lock().await.remove(&job.id) {
            entry.child.kill().await.context("Failed to kill batch job")?;
            info!(job = %job.id, "Cancelled batch job");
        }
        Ok(())
    }
}
