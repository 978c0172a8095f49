//! Error taxonomy
//!
//! Configuration and graph errors abort a session before anything runs;
//! resource errors are scoped to the unit of work that raised them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::CaseId;

/// Defects in the session or pool configuration
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigurationError {
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("Resource pool is already configured")]
    AlreadyConfigured,

    #[error("Resource pool is not configured")]
    NotConfigured,

    #[error("Invalid pool snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}

/// Failures raised by the resource pool, the arbiter or the broker.
///
/// Serializable so the broker can send them back over the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Resources unsatisfiable: {0}")]
    Unsatisfiable(String),

    #[error("Allocation cancelled")]
    Cancelled,

    #[error("Unknown or already released grant: {0}")]
    UnknownGrant(u64),

    #[error("Resource broker error: {0}")]
    Broker(String),
}

/// Structural defects found when locking the dependency graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("Dependency cycle: {}", format_cycle(.0))]
    Cycle(Vec<CaseId>),

    #[error("Case {case} depends on unknown case {missing}")]
    DanglingDependency { case: CaseId, missing: CaseId },

    #[error("Duplicate case id: {0}")]
    DuplicateCase(CaseId),

    #[error("Unknown case id: {0}")]
    UnknownCase(CaseId),

    #[error("Graph is locked; structure can no longer change")]
    Locked,

    #[error("Graph must be locked first")]
    NotLocked,
}

fn format_cycle(ids: &[CaseId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Invalid arguments to a partition strategy
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PartitionError {
    #[error("Batch count must be positive")]
    InvalidCount,

    #[error("Batch duration must be positive, got {0}")]
    InvalidDuration(f64),

    #[error("Bin dimensions must be positive, got {width}x{height}")]
    InvalidBin { width: u32, height: f64 },
}

/// Errors that abort a whole session
#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Graph(#[from] GraphBuildError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("Resource provider failure: {0}")]
    Resource(#[from] ResourceError),

    #[error("Session already ran")]
    AlreadyRan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message() {
        let err = GraphBuildError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle: a -> b -> a");
    }

    #[test]
    fn test_configuration_wraps_into_resource_error() {
        let err: ResourceError = ConfigurationError::UnknownResourceType("fpga".into()).into();
        assert_eq!(err.to_string(), "Unknown resource type: fpga");
    }
}
