//! Pool configuration snapshot
//!
//! JSON description of every slot in the pool, loaded at session start and
//! written back as the durable description of a running session's pool.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One allocatable instance of a resource type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub id: String,
    pub slots: u32,
}

impl SlotSpec {
    pub fn new(id: impl Into<String>, slots: u32) -> Self {
        Self {
            id: id.into(),
            slots,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalProperties {
    pub nodes: usize,
}

/// `{"resources": {type: [{"id", "slots"}]}, "additional_properties": {"nodes"}}`
///
/// Instances of each type are split evenly and contiguously across nodes: with
/// 8 cpu entries and 2 nodes, entries 0-3 live on node 0 and 4-7 on node 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub resources: BTreeMap<String, Vec<SlotSpec>>,
    pub additional_properties: AdditionalProperties,
}

impl PoolSnapshot {
    /// Uniform layout: `nodes` nodes, each with `per_node[type]` single-slot instances
    pub fn uniform(nodes: usize, per_node: &BTreeMap<String, u32>) -> Self {
        let resources = per_node
            .iter()
            .map(|(rtype, count)| {
                let specs = (0..nodes as u32 * count)
                    .map(|i| SlotSpec::new(i.to_string(), 1))
                    .collect();
                (rtype.clone(), specs)
            })
            .collect();

        Self {
            resources,
            additional_properties: AdditionalProperties { nodes },
        }
    }

    pub fn nodes(&self) -> usize {
        self.additional_properties.nodes
    }

    /// Total slots declared for a type
    pub fn capacity(&self, rtype: &str) -> Option<u32> {
        self.resources
            .get(rtype)
            .map(|specs| specs.iter().map(|s| s.slots).sum())
    }

    /// Load a snapshot from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pool snapshot: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pool snapshot: {}", path.display()))
    }

    /// Save the snapshot as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize pool")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write pool snapshot: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uniform_layout() {
        let per_node = BTreeMap::from([("cpus".to_string(), 4), ("gpus".to_string(), 1)]);
        let snapshot = PoolSnapshot::uniform(2, &per_node);
        assert_eq!(snapshot.nodes(), 2);
        assert_eq!(snapshot.capacity("cpus"), Some(8));
        assert_eq!(snapshot.capacity("gpus"), Some(2));
        assert_eq!(snapshot.capacity("fpga"), None);
    }

    #[test]
    fn test_parses_wire_shape() {
        let raw = json!({
            "resources": {
                "cpus": [{"id": "0", "slots": 1}, {"id": "1", "slots": 1}],
                "gpus": [{"id": "a", "slots": 2}]
            },
            "additional_properties": {"nodes": 1}
        });
        let snapshot: PoolSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(snapshot.capacity("cpus"), Some(2));
        assert_eq!(snapshot.capacity("gpus"), Some(2));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pool.json");
        let per_node = BTreeMap::from([("cpus".to_string(), 3)]);
        let snapshot = PoolSnapshot::uniform(3, &per_node);

        snapshot.save(&path).unwrap();
        assert_eq!(PoolSnapshot::load(&path).unwrap(), snapshot);
    }
}
