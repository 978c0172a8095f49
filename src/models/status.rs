//! Case status lifecycle
//!
//! Defines status names, the exit-code table and the timestamped status value
//! each test case owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Exit code a case runner reports for a skipped case
pub const SKIP_EXIT_CODE: i32 = 63;

/// Exit code a case runner reports for a result mismatch
pub const DIFF_EXIT_CODE: i32 = 64;

/// Exit code a case runner reports when the case exceeded its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 66;

/// Exit code used for failures inside the runner itself (spawn errors etc.)
pub const RUNNER_ERROR_EXIT_CODE: i32 = 1;

/// Ordered exit-code lookup table. Anything not listed and non-zero is `Fail`.
const EXIT_CODE_TABLE: &[(i32, StatusName)] = &[
    (0, StatusName::Success),
    (SKIP_EXIT_CODE, StatusName::Skipped),
    (DIFF_EXIT_CODE, StatusName::Diff),
    (TIMEOUT_EXIT_CODE, StatusName::Timeout),
];

/// Every state a test case can be in
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusName {
    Pending,
    Ready,
    Running,
    Success,
    Diff,
    Fail,
    Timeout,
    Skipped,
    NotRun,
    Cancelled,
    Masked,
}

impl StatusName {
    /// Map a runner exit code to a status
    pub fn from_exit_code(code: i32) -> Self {
        EXIT_CODE_TABLE
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, name)| *name)
            .unwrap_or(StatusName::Fail)
    }

    /// The canonical exit code for this status, if it has one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            StatusName::Fail => Some(RUNNER_ERROR_EXIT_CODE),
            other => EXIT_CODE_TABLE
                .iter()
                .find(|(_, name)| name == other)
                .map(|(c, _)| *c),
        }
    }

    /// States that will never change again during a session
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            StatusName::Pending | StatusName::Ready | StatusName::Running
        )
    }

    /// Terminal states that make dependents unrunnable
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StatusName::Fail
                | StatusName::Diff
                | StatusName::Timeout
                | StatusName::Skipped
                | StatusName::Cancelled
        )
    }

    /// Still waiting to be dispatched
    pub fn is_queued(&self) -> bool {
        matches!(self, StatusName::Pending | StatusName::Ready)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusName::Success)
    }

    /// Bit contributed to the session exit code
    pub fn exit_bit(&self) -> i32 {
        match self {
            StatusName::Success | StatusName::Masked => 0,
            StatusName::Diff => 2,
            StatusName::Fail => 4,
            StatusName::Timeout => 8,
            StatusName::Pending | StatusName::Ready | StatusName::Running | StatusName::NotRun => {
                16
            }
            StatusName::Cancelled => 32,
            StatusName::Skipped => 64,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            StatusName::Success => "✓",
            StatusName::Diff => "≠",
            StatusName::Fail | StatusName::Timeout => "✗",
            StatusName::Skipped | StatusName::NotRun | StatusName::Masked => "○",
            StatusName::Cancelled => "!",
            StatusName::Pending | StatusName::Ready | StatusName::Running => "…",
        }
    }

    pub fn all() -> [StatusName; 11] {
        [
            StatusName::Pending,
            StatusName::Ready,
            StatusName::Running,
            StatusName::Success,
            StatusName::Diff,
            StatusName::Fail,
            StatusName::Timeout,
            StatusName::Skipped,
            StatusName::NotRun,
            StatusName::Cancelled,
            StatusName::Masked,
        ]
    }
}

impl fmt::Display for StatusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusName::Pending => "PENDING",
            StatusName::Ready => "READY",
            StatusName::Running => "RUNNING",
            StatusName::Success => "SUCCESS",
            StatusName::Diff => "DIFF",
            StatusName::Fail => "FAIL",
            StatusName::Timeout => "TIMEOUT",
            StatusName::Skipped => "SKIPPED",
            StatusName::NotRun => "NOT_RUN",
            StatusName::Cancelled => "CANCELLED",
            StatusName::Masked => "MASKED",
        };
        write!(f, "{s}")
    }
}

/// Current status of a case plus the time each state was last entered
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: StatusName,
    pub message: Option<String>,
    pub code: Option<i32>,
    pub timestamps: BTreeMap<StatusName, DateTime<Utc>>,
}

impl Status {
    pub fn new(name: StatusName) -> Self {
        let mut timestamps = BTreeMap::new();
        timestamps.insert(name, Utc::now());
        Self {
            name,
            message: None,
            code: None,
            timestamps,
        }
    }

    /// Overwrite the status unconditionally.
    ///
    /// No transition is rejected: a re-run must be able to move a finished case
    /// back to `Pending`.
    pub fn set(&mut self, name: StatusName, message: Option<String>, code: Option<i32>) {
        self.name = name;
        self.message = message;
        self.code = code;
        self.timestamps.insert(name, Utc::now());
    }

    /// Status derived from a runner exit code
    pub fn from_exit_code(code: i32) -> Self {
        let mut status = Self::new(StatusName::from_exit_code(code));
        status.code = Some(code);
        status
    }

    pub fn entered_at(&self, name: StatusName) -> Option<DateTime<Utc>> {
        self.timestamps.get(&name).copied()
    }

    /// Wall time between entering `Running` and the current state
    pub fn elapsed_ms(&self) -> Option<u64> {
        let started = self.entered_at(StatusName::Running)?;
        let ended = self.entered_at(self.name)?;
        (ended - started).num_milliseconds().try_into().ok()
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new(StatusName::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(msg) = &self.message {
            write!(f, " ({msg})")?;
        }
        Ok(())
    }
}
