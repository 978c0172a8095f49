//! Data models for test orchestration
//!
//! This module contains the case, status and summary types shared by the
//! graph, the batch engine and the driver.

mod case;
mod status;
mod summary;

pub use case::{demand_totals, CaseId, NodeAffinity, ResourceDemand, TestCase};
pub use status::{
    Status, StatusName, DIFF_EXIT_CODE, RUNNER_ERROR_EXIT_CODE, SKIP_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use summary::{aggregate_exit_code, SessionState, SessionSummary, StatusRecord};
