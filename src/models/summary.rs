//! Session summaries and persisted case records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::case::{CaseId, TestCase};
use super::status::StatusName;

/// Durable per-case record read by reporters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: CaseId,
    pub status_name: StatusName,
    pub message: Option<String>,
    pub code: Option<i32>,
    pub timestamps: BTreeMap<StatusName, DateTime<Utc>>,
}

impl StatusRecord {
    pub fn from_case(case: &TestCase) -> Self {
        Self {
            id: case.id.clone(),
            status_name: case.status.name,
            message: case.status.message.clone(),
            code: case.status.code,
            timestamps: case.status.timestamps.clone(),
        }
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.status_name.symbol(), self.id, self.status_name)?;
        if let Some(msg) = &self.message {
            write!(f, " - {msg}")?;
        }
        Ok(())
    }
}

/// Lifecycle of a whole session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Discovering,
    Ready,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Discovering => "DISCOVERING",
            SessionState::Ready => "READY",
            SessionState::Running => "RUNNING",
            SessionState::Complete => "COMPLETE",
            SessionState::Failed => "FAILED",
            SessionState::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// Summary of a finished session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub total: usize,
    pub counts: BTreeMap<StatusName, usize>,
    pub exit_code: i32,
    pub records: Vec<StatusRecord>,
}

impl SessionSummary {
    pub fn new(
        session_id: impl Into<String>,
        state: SessionState,
        started_at: DateTime<Utc>,
        mut records: Vec<StatusRecord>,
    ) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut counts = BTreeMap::new();
        for record in &records {
            *counts.entry(record.status_name).or_insert(0) += 1;
        }

        Self {
            session_id: session_id.into(),
            state,
            started_at,
            completed_at: Utc::now(),
            total: records.len(),
            counts,
            exit_code: aggregate_exit_code(records.iter().map(|r| r.status_name)),
            records,
        }
    }

    pub fn count(&self, name: StatusName) -> usize {
        self.counts.get(&name).copied().unwrap_or(0)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }

    /// Percentage of non-masked cases that succeeded
    pub fn pass_rate(&self) -> f64 {
        let considered = self.total - self.count(StatusName::Masked);
        if considered == 0 {
            0.0
        } else {
            (self.count(StatusName::Success) as f64 / considered as f64) * 100.0
        }
    }

    pub fn is_all_passed(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session {} - {}", self.session_id, self.state)?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for record in &self.records {
            writeln!(f, "  {record}")?;
        }
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        let counts: Vec<String> = self
            .counts
            .iter()
            .map(|(name, n)| format!("{name}: {n}"))
            .collect();
        writeln!(f, "Total: {} | {}", self.total, counts.join(" | "))?;
        writeln!(
            f,
            "Pass Rate: {:.1}% | Duration: {}ms | Exit: {}",
            self.pass_rate(),
            self.duration_ms(),
            self.exit_code
        )
    }
}

/// OR together the exit bits of every status; zero only if all succeeded
pub fn aggregate_exit_code(statuses: impl IntoIterator<Item = StatusName>) -> i32 {
    statuses.into_iter().fold(0, |code, s| code | s.exit_bit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Status;

    fn record(id: &str, name: StatusName) -> StatusRecord {
        let mut case = TestCase::new(id);
        case.status = Status::new(name);
        StatusRecord::from_case(&case)
    }

    #[test]
    fn test_exit_code_zero_only_when_all_succeed() {
        assert_eq!(
            aggregate_exit_code([StatusName::Success, StatusName::Masked]),
            0
        );
        assert_eq!(
            aggregate_exit_code([StatusName::Success, StatusName::Diff]),
            2
        );
        assert_eq!(
            aggregate_exit_code([StatusName::Fail, StatusName::Timeout, StatusName::Fail]),
            12
        );
        assert_ne!(aggregate_exit_code([StatusName::Skipped]), 0);
    }

    #[test]
    fn test_session_summary() {
        let records = vec![
            record("b", StatusName::Fail),
            record("a", StatusName::Success),
            record("c", StatusName::NotRun),
            record("d", StatusName::Masked),
        ];
        let summary = SessionSummary::new("s1", SessionState::Complete, Utc::now(), records);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.count(StatusName::Success), 1);
        assert_eq!(summary.records[0].id, CaseId::new("a"));
        assert_eq!(summary.exit_code, 4 | 16);
        assert!((summary.pass_rate() - 100.0 / 3.0).abs() < 1e-9);
        assert!(!summary.is_all_passed());
    }

    #[test]
    fn test_record_shape() {
        let json = serde_json::to_value(record("x", StatusName::Timeout)).unwrap();
        assert_eq!(json["id"], "x");
        assert_eq!(json["status_name"], "timeout");
        assert!(json["timestamps"].is_object());
    }
}
