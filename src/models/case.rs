//! Test case model
//!
//! A test case is one parameterized instance of a test, with its resource
//! demands, duration forecast and dependencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::status::{Status, StatusName};

/// Identifier of a test case, unique within a session
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One joint demand: `slots` units of resource type `rtype`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDemand {
    #[serde(rename = "type")]
    pub rtype: String,
    pub slots: u32,
}

impl ResourceDemand {
    pub fn new(rtype: impl Into<String>, slots: u32) -> Self {
        Self {
            rtype: rtype.into(),
            slots,
        }
    }

    pub fn cpus(slots: u32) -> Self {
        Self::new("cpus", slots)
    }

    pub fn gpus(slots: u32) -> Self {
        Self::new("gpus", slots)
    }
}

impl fmt::Display for ResourceDemand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}", self.slots, self.rtype)
    }
}

/// Sum demands per resource type
pub fn demand_totals(demands: &[ResourceDemand]) -> BTreeMap<String, u32> {
    let mut totals: BTreeMap<String, u32> = BTreeMap::new();
    for d in demands {
        let total = totals.entry(d.rtype.clone()).or_default();
        *total = total.saturating_add(d.slots);
    }
    totals
}

/// Placement constraint on the nodes a grant may come from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAffinity {
    /// Slots may be spread over any nodes
    #[default]
    Any,
    /// All slots must come from one node
    Same,
    /// The grant must span as many nodes as a sibling grant
    Match,
}

impl NodeAffinity {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "any" => Some(NodeAffinity::Any),
            "same" => Some(NodeAffinity::Same),
            "match" => Some(NodeAffinity::Match),
            _ => None,
        }
    }

    /// The tighter of two constraints: `same` over `match` over `any`
    pub fn strictest(self, other: Self) -> Self {
        fn rank(a: NodeAffinity) -> u8 {
            match a {
                NodeAffinity::Any => 0,
                NodeAffinity::Match => 1,
                NodeAffinity::Same => 2,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for NodeAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAffinity::Any => write!(f, "any"),
            NodeAffinity::Same => write!(f, "same"),
            NodeAffinity::Match => write!(f, "match"),
        }
    }
}

/// A single parameterized test case
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCase {
    pub id: CaseId,

    /// Name shared by every instance of a parameter sweep
    pub family: String,

    /// Parameter name → value, sorted by name
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub status: Status,

    /// Ids of the cases this one depends on
    #[serde(default)]
    pub dependencies: Vec<CaseId>,

    /// Demands that must all be satisfied together
    #[serde(default)]
    pub resources: Vec<ResourceDemand>,

    /// Forecast runtime in seconds, used only for balancing
    #[serde(default)]
    pub estimated_duration: f64,

    #[serde(default)]
    pub affinity: NodeAffinity,

    /// Aggregate/analysis step of a sweep
    #[serde(default)]
    pub composite: bool,

    /// Per-case timeout in seconds
    #[serde(default)]
    pub timeout: Option<f64>,

    /// Command line the process runner executes
    #[serde(default)]
    pub command: Vec<String>,
}

impl TestCase {
    pub fn new(id: impl Into<CaseId>) -> Self {
        let id = id.into();
        let family = id
            .as_str()
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id,
            family,
            parameters: BTreeMap::new(),
            status: Status::default(),
            dependencies: Vec::new(),
            resources: Vec::new(),
            estimated_duration: 0.0,
            affinity: NodeAffinity::Any,
            composite: false,
            timeout: None,
            command: Vec::new(),
        }
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_resource(mut self, demand: ResourceDemand) -> Self {
        self.resources.push(demand);
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.estimated_duration = seconds;
        self
    }

    pub fn with_affinity(mut self, affinity: NodeAffinity) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<CaseId>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn with_command(mut self, argv: Vec<String>) -> Self {
        self.command = argv;
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn composite(mut self) -> Self {
        self.composite = true;
        self
    }

    /// Total number of slots over every demand; the width of the case when packed
    pub fn footprint(&self) -> u32 {
        self.resources
            .iter()
            .fold(0u32, |total, d| total.saturating_add(d.slots))
    }

    pub fn status_name(&self) -> StatusName {
        self.status.name
    }

    pub fn is_masked(&self) -> bool {
        self.status.name == StatusName::Masked
    }

    /// Parameter string in `k=v` form, ordered by name
    pub fn parameter_string(&self) -> String {
        self.parameters
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}={s}"),
                other => format!("{k}={other}"),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.id, self.status.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_case_builder() {
        let case = TestCase::new("heat.np=4")
            .with_parameter("np", json!(4))
            .with_resource(ResourceDemand::cpus(4))
            .with_resource(ResourceDemand::gpus(1))
            .with_duration(12.5)
            .with_dependency("mesh")
            .with_dependency("mesh");

        assert_eq!(case.family, "heat");
        assert_eq!(case.footprint(), 5);
        assert_eq!(case.dependencies.len(), 1);
        assert_eq!(case.parameter_string(), "np=4");
        assert_eq!(case.status_name(), StatusName::Pending);
    }

    #[test]
    fn test_demand_totals() {
        let totals = demand_totals(&[
            ResourceDemand::cpus(2),
            ResourceDemand::gpus(1),
            ResourceDemand::cpus(3),
        ]);
        assert_eq!(totals.get("cpus"), Some(&5));
        assert_eq!(totals.get("gpus"), Some(&1));
    }

    #[test]
    fn test_demand_totals_saturate() {
        let totals = demand_totals(&[ResourceDemand::cpus(u32::MAX), ResourceDemand::cpus(2)]);
        assert_eq!(totals.get("cpus"), Some(&u32::MAX));

        let case = TestCase::new("huge")
            .with_resource(ResourceDemand::cpus(u32::MAX))
            .with_resource(ResourceDemand::gpus(1));
        assert_eq!(case.footprint(), u32::MAX);
    }

    #[test]
    fn test_strictest_affinity() {
        use NodeAffinity::*;
        assert_eq!(Any.strictest(Match), Match);
        assert_eq!(Match.strictest(Any), Match);
        assert_eq!(Match.strictest(Same), Same);
        assert_eq!(Same.strictest(Any), Same);
        assert_eq!(Any.strictest(Any), Any);
    }

    #[test]
    fn test_affinity_from_str() {
        assert_eq!(NodeAffinity::from_str("SAME"), Some(NodeAffinity::Same));
        assert_eq!(NodeAffinity::from_str("match"), Some(NodeAffinity::Match));
        assert_eq!(NodeAffinity::from_str("nearby"), None);
    }

    #[test]
    fn test_demand_serializes_type_key() {
        let json = serde_json::to_value(ResourceDemand::gpus(2)).unwrap();
        assert_eq!(json, json!({"type": "gpus", "slots": 2}));
    }
}
