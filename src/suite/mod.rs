//! Suite definitions
//!
//! A suite file lists case templates. Each template expands into one case per
//! combination of its parameter values; a composite template also gets an
//! aggregate case that depends on every instance.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::config::is_yaml_file;
use crate::error::GraphBuildError;
use crate::graph::DependencyGraph;
use crate::models::{CaseId, NodeAffinity, ResourceDemand, TestCase};

/// Slot count, either fixed or taken from a parameter of the instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotCount {
    Fixed(u32),
    Parameter(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemandTemplate {
    #[serde(rename = "type")]
    pub rtype: String,
    pub slots: SlotCount,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseTemplate {
    pub name: String,

    /// Values per parameter; instances cover the cartesian product.
    ///
    /// Names are kept sorted, so case ids and expansion order do not depend on
    /// the key order of the suite file.
    #[serde(default)]
    pub parameters: BTreeMap<String, Vec<Value>>,

    /// Argument vector; `{name}` is replaced by the instance's parameter value
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub resources: Vec<DemandTemplate>,

    /// Estimated seconds, used for balancing only
    #[serde(default)]
    pub duration: f64,

    #[serde(default)]
    pub timeout: Option<f64>,

    #[serde(default)]
    pub affinity: NodeAffinity,

    /// Template names or case ids
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub composite: bool,

    /// Command of the composite case; a composite without one only aggregates
    #[serde(default)]
    pub analyze: Vec<String>,
}

impl CaseTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.parameters.insert(name.into(), values);
        self
    }

    pub fn with_dependency(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(target.into());
        self
    }

    pub fn composite(mut self) -> Self {
        self.composite = true;
        self
    }

    /// Every combination of parameter values, keys in order
    fn combinations(&self) -> Vec<BTreeMap<String, Value>> {
        let mut combos = vec![BTreeMap::new()];
        for (name, values) in &self.parameters {
            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    values.iter().map(move |v| {
                        let mut next = combo.clone();
                        next.insert(name.clone(), v.clone());
                        next
                    })
                })
                .collect();
        }
        combos
    }

    fn instance(&self, params: BTreeMap<String, Value>) -> Result<TestCase> {
        let id = if params.is_empty() {
            self.name.clone()
        } else {
            let suffix: Vec<String> = params
                .iter()
                .map(|(k, v)| format!("{k}={}", render(v)))
                .collect();
            format!("{}.{}", self.name, suffix.join("."))
        };

        let mut case = TestCase::new(id)
            .with_family(self.name.clone())
            .with_duration(self.duration)
            .with_affinity(self.affinity)
            .with_command(self.command.iter().map(|a| substitute(a, &params)).collect());
        if let Some(timeout) = self.timeout {
            case = case.with_timeout(timeout);
        }
        for demand in &self.resources {
            let slots = match &demand.slots {
                SlotCount::Fixed(n) => *n,
                SlotCount::Parameter(p) => params
                    .get(p)
                    .and_then(Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .with_context(|| {
                        format!("{}: slots parameter '{p}' is not a count", case.id)
                    })?,
            };
            case = case.with_resource(ResourceDemand::new(demand.rtype.clone(), slots));
        }
        for (name, value) in params {
            case = case.with_parameter(name, value);
        }
        if self.parameters.is_empty() && self.composite {
            case = case.composite();
        }
        Ok(case)
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute(arg: &str, params: &BTreeMap<String, Value>) -> String {
    params.iter().fold(arg.to_string(), |acc, (k, v)| {
        acc.replace(&format!("{{{k}}}"), &render(v))
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Suite {
    #[serde(default)]
    pub name: Option<String>,
    pub cases: Vec<CaseTemplate>,
}

impl Suite {
    pub fn new(cases: Vec<CaseTemplate>) -> Self {
        Self { name: None, cases }
    }

    /// Load a suite from a JSON or YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read suite file: {}", path.display()))?;

        let suite: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML suite: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON suite: {}", path.display()))?
        };
        info!(
            "Loaded {} templates from {}",
            suite.cases.len(),
            path.display()
        );
        Ok(suite)
    }

    /// Expand every template into concrete cases with resolved dependencies
    pub fn expand(&self) -> Result<Vec<TestCase>> {
        let mut seen = HashSet::new();
        for template in &self.cases {
            if !seen.insert(template.name.as_str()) {
                bail!("Duplicate template name: {}", template.name);
            }
        }

        // what a dependency on each template name resolves to
        let mut targets: HashMap<&str, Vec<CaseId>> = HashMap::new();
        let mut expanded: Vec<(usize, Vec<TestCase>)> = Vec::new();

        for (t, template) in self.cases.iter().enumerate() {
            if template.parameters.values().any(|v| v.is_empty()) {
                bail!("Template {} has a parameter with no values", template.name);
            }
            let mut cases = template
                .combinations()
                .into_iter()
                .map(|params| template.instance(params))
                .collect::<Result<Vec<_>>>()?;

            if template.composite && !template.parameters.is_empty() {
                let mut aggregate = TestCase::new(template.name.clone())
                    .with_family(template.name.clone())
                    .with_command(template.analyze.clone())
                    .composite();
                if let Some(timeout) = template.timeout {
                    aggregate = aggregate.with_timeout(timeout);
                }
                for case in &cases {
                    aggregate = aggregate.with_dependency(case.id.clone());
                }
                targets.insert(&template.name, vec![aggregate.id.clone()]);
                cases.push(aggregate);
            } else {
                targets.insert(&template.name, cases.iter().map(|c| c.id.clone()).collect());
            }
            expanded.push((t, cases));
        }

        let mut result = Vec::new();
        for (t, cases) in expanded {
            let template = &self.cases[t];
            let mut deps: Vec<CaseId> = Vec::new();
            for target in &template.depends_on {
                match targets.get(target.as_str()) {
                    Some(ids) => deps.extend(ids.iter().cloned()),
                    None => deps.push(CaseId::new(target.clone())),
                }
            }
            for mut case in cases {
                // composites already wait on their instances, which carry the deps
                if !(case.composite && !template.parameters.is_empty()) {
                    for dep in &deps {
                        if dep != &case.id && !case.dependencies.contains(dep) {
                            case.dependencies.push(dep.clone());
                        }
                    }
                }
                result.push(case);
            }
        }

        debug!(
            templates = self.cases.len(),
            cases = result.len(),
            "Expanded suite"
        );
        Ok(result)
    }
}

/// Narrow an unlocked graph before it runs.
///
/// With a keyword, cases whose id does not contain it are masked. With `only`,
/// everything outside those ids and their dependency closure is masked.
/// Returns the number of masked cases.
pub fn select(
    graph: &mut DependencyGraph,
    keyword: Option<&str>,
    only: &[CaseId],
) -> Result<usize, GraphBuildError> {
    let mut masked = 0;
    if !only.is_empty() {
        let keep = graph.closure(only)?;
        masked += graph.mask_where(|c| !keep.contains(&c.id), "not selected")?;
    }
    if let Some(keyword) = keyword {
        masked += graph.mask_where(
            |c| !c.id.as_str().contains(keyword),
            &format!("does not match keyword '{keyword}'"),
        )?;
    }
    if masked > 0 {
        info!("Masked {} cases", masked);
    }
    Ok(masked)
}

/// Load, expand, select and lock in one step
pub fn build_graph(
    suite: &Suite,
    keyword: Option<&str>,
    only: &[CaseId],
) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for case in suite.expand()? {
        graph.add_case(case)?;
    }
    select(&mut graph, keyword, only)?;
    graph.lock()?;
    Ok(graph)
}
