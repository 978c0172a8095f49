//! Two-dimensional shelf packing
//!
//! Each case is a block `footprint` slots wide and `estimated_duration` tall.
//! Blocks are placed in decreasing-height order (ties keep insertion order) on
//! shelves inside fixed-size bins.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

use super::batch::{assemble, has_inset_dependency, stable_order, Batch};
use crate::error::PartitionError;
use crate::models::{CaseId, NodeAffinity, TestCase};

/// How a block picks among shelves it fits on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackingStrategy {
    /// First shelf, in bin then shelf order
    #[default]
    FirstFit,
    /// Shelf that leaves the least unused width
    BestFit,
}

impl PackingStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "first_fit" | "first" => Some(PackingStrategy::FirstFit),
            "best_fit" | "best" => Some(PackingStrategy::BestFit),
            _ => None,
        }
    }
}

impl fmt::Display for PackingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackingStrategy::FirstFit => write!(f, "first-fit"),
            PackingStrategy::BestFit => write!(f, "best-fit"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Block {
    pub index: usize,
    pub width: u32,
    pub height: f64,
}

#[derive(Debug)]
struct Shelf {
    height: f64,
    used: u32,
}

#[derive(Debug, Default)]
struct Bin {
    shelves: Vec<Shelf>,
    members: Vec<usize>,
    sealed: bool,
}

impl Bin {
    fn used_height(&self) -> f64 {
        self.shelves.iter().map(|s| s.height).sum()
    }
}

/// Pack blocks into bins of `width` × `height`; returns block indices per bin
pub fn pack_blocks(
    blocks: &[Block],
    width: u32,
    height: f64,
    strategy: PackingStrategy,
) -> Result<Vec<Vec<usize>>, PartitionError> {
    if width == 0 || height.is_nan() || height <= 0.0 {
        return Err(PartitionError::InvalidBin { width, height });
    }

    let mut sorted = blocks.to_vec();
    // stable sort keeps insertion order among equal heights
    sorted.sort_by(|a, b| b.height.total_cmp(&a.height));

    let mut bins: Vec<Bin> = Vec::new();
    for block in sorted {
        if block.width > width || block.height > height {
            bins.push(Bin {
                shelves: Vec::new(),
                members: vec![block.index],
                sealed: true,
            });
            continue;
        }

        let shelf = match strategy {
            PackingStrategy::FirstFit => first_shelf(&bins, &block, width),
            PackingStrategy::BestFit => best_shelf(&bins, &block, width),
        };
        if let Some((b, s)) = shelf {
            bins[b].shelves[s].used += block.width;
            bins[b].members.push(block.index);
            continue;
        }

        let fresh = match strategy {
            PackingStrategy::FirstFit => bins
                .iter()
                .position(|bin| !bin.sealed && bin.used_height() + block.height <= height),
            PackingStrategy::BestFit => bins
                .iter()
                .enumerate()
                .filter(|(_, bin)| !bin.sealed && bin.used_height() + block.height <= height)
                .min_by(|(_, x), (_, y)| {
                    (height - x.used_height()).total_cmp(&(height - y.used_height()))
                })
                .map(|(i, _)| i),
        };
        let target = match fresh {
            Some(b) => b,
            None => {
                bins.push(Bin::default());
                bins.len() - 1
            }
        };
        bins[target].shelves.push(Shelf {
            height: block.height,
            used: block.width,
        });
        bins[target].members.push(block.index);
    }

    Ok(bins.into_iter().map(|b| b.members).collect())
}

fn first_shelf(bins: &[Bin], block: &Block, width: u32) -> Option<(usize, usize)> {
    bins.iter().enumerate().filter(|(_, bin)| !bin.sealed).find_map(|(b, bin)| {
        bin.shelves
            .iter()
            .position(|s| s.used + block.width <= width && block.height <= s.height)
            .map(|s| (b, s))
    })
}

fn best_shelf(bins: &[Bin], block: &Block, width: u32) -> Option<(usize, usize)> {
    let mut best: Option<((usize, usize), u32)> = None;
    for (b, bin) in bins.iter().enumerate().filter(|(_, bin)| !bin.sealed) {
        for (s, shelf) in bin.shelves.iter().enumerate() {
            if shelf.used + block.width > width || block.height > shelf.height {
                continue;
            }
            let leftover = width - shelf.used - block.width;
            if best.map_or(true, |(_, l)| leftover < l) {
                best = Some(((b, s), leftover));
            }
        }
    }
    best.map(|(pos, _)| pos)
}

/// Pack cases into batches. See [`pack_to_height_grouped`].
pub fn pack_to_height(
    cases: &[TestCase],
    width: u32,
    height: f64,
    strategy: PackingStrategy,
) -> Result<Vec<Batch>, PartitionError> {
    pack_to_height_grouped(cases, width, height, strategy, |_| ())
}

/// Pack each group produced by `grouper` separately.
///
/// Cases that depend on other cases in the set are packed in later rounds, one
/// round per dependency depth, so every bin comes after the bins of its
/// dependencies.
pub fn pack_to_height_grouped<K: Ord>(
    cases: &[TestCase],
    width: u32,
    height: f64,
    strategy: PackingStrategy,
    grouper: impl Fn(&TestCase) -> K,
) -> Result<Vec<Batch>, PartitionError> {
    if width == 0 || height.is_nan() || height <= 0.0 {
        return Err(PartitionError::InvalidBin { width, height });
    }

    let ids: HashMap<&CaseId, usize> = cases.iter().enumerate().map(|(i, c)| (&c.id, i)).collect();
    let mut depth = vec![0usize; cases.len()];
    for idx in stable_order(cases) {
        if has_inset_dependency(&cases[idx], &ids) {
            depth[idx] = cases[idx]
                .dependencies
                .iter()
                .filter_map(|d| ids.get(d))
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
    }

    let mut rounds: BTreeMap<usize, BTreeMap<K, Vec<Block>>> = BTreeMap::new();
    for (idx, case) in cases.iter().enumerate() {
        rounds
            .entry(depth[idx])
            .or_default()
            .entry(grouper(case))
            .or_default()
            .push(Block {
                index: idx,
                width: case.footprint(),
                height: case.estimated_duration,
            });
    }

    let mut groups = Vec::new();
    for (_, by_key) in rounds {
        for (_, blocks) in by_key {
            groups.extend(pack_blocks(&blocks, width, height, strategy)?);
        }
    }

    let batches = assemble(cases, groups, NodeAffinity::Any);
    debug!(
        cases = cases.len(),
        batches = batches.len(),
        %strategy,
        "Packed cases"
    );
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceDemand;

    fn block(index: usize, width: u32, height: f64) -> Block {
        Block {
            index,
            width,
            height,
        }
    }

    #[test]
    fn test_rejects_empty_bin() {
        assert!(matches!(
            pack_blocks(&[], 0, 1.0, PackingStrategy::FirstFit),
            Err(PartitionError::InvalidBin { .. })
        ));
        assert!(pack_blocks(&[], 4, -1.0, PackingStrategy::FirstFit).is_err());
    }

    #[test]
    fn test_first_fit_shelves() {
        let blocks = [
            block(0, 2, 5.0),
            block(1, 2, 5.0),
            block(2, 3, 4.0),
            block(3, 1, 3.0),
        ];
        let bins = pack_blocks(&blocks, 4, 10.0, PackingStrategy::FirstFit).unwrap();
        // shelf 1 (h=5): 0, 1; shelf 2 (h=4): 2, 3
        assert_eq!(bins, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_decreasing_height_with_stable_ties() {
        let blocks = [block(0, 4, 1.0), block(1, 4, 3.0), block(2, 4, 3.0)];
        let bins = pack_blocks(&blocks, 4, 3.0, PackingStrategy::FirstFit).unwrap();
        assert_eq!(bins, vec![vec![1], vec![2], vec![0]]);
    }

    #[test]
    fn test_best_fit_prefers_tightest_shelf() {
        // bin 0: shelf of height 6 with 1 free, bin 1: shelf of height 6 with 3 free
        let blocks = [
            block(0, 5, 6.0),
            block(1, 3, 6.0),
            block(2, 1, 2.0),
        ];
        let first = pack_blocks(&blocks, 6, 6.0, PackingStrategy::FirstFit).unwrap();
        let best = pack_blocks(&blocks, 6, 6.0, PackingStrategy::BestFit).unwrap();
        assert_eq!(first, vec![vec![0, 2], vec![1]]);
        assert_eq!(best, vec![vec![0, 2], vec![1]]);

        let blocks = [
            block(0, 3, 6.0),
            block(1, 5, 6.0),
            block(2, 1, 2.0),
        ];
        let first = pack_blocks(&blocks, 6, 6.0, PackingStrategy::FirstFit).unwrap();
        let best = pack_blocks(&blocks, 6, 6.0, PackingStrategy::BestFit).unwrap();
        assert_eq!(first, vec![vec![0, 2], vec![1]]);
        assert_eq!(best, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_oversize_block_is_alone() {
        let blocks = [block(0, 8, 1.0), block(1, 1, 1.0), block(2, 1, 9.0)];
        let bins = pack_blocks(&blocks, 4, 5.0, PackingStrategy::FirstFit).unwrap();
        assert_eq!(bins, vec![vec![2], vec![0], vec![1]]);
    }

    #[test]
    fn test_grouped_packing_keeps_groups_apart() {
        let cases: Vec<TestCase> = (0..6)
            .map(|i| {
                TestCase::new(format!("t{i}"))
                    .with_resource(ResourceDemand::cpus(if i % 2 == 0 { 1 } else { 4 }))
                    .with_duration(1.0)
            })
            .collect();
        let batches =
            pack_to_height_grouped(&cases, 8, 10.0, PackingStrategy::FirstFit, |c| c.footprint())
                .unwrap();

        assert_eq!(batches.len(), 2);
        for batch in &batches {
            let widths: Vec<u32> = batch
                .members
                .iter()
                .map(|m| cases.iter().find(|c| &c.id == m).unwrap().footprint())
                .collect();
            assert!(widths.windows(2).all(|w| w[0] == w[1]));
        }
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_packed_batch_keeps_member_affinity() {
        let cases = vec![
            TestCase::new("wide")
                .with_resource(ResourceDemand::cpus(2))
                .with_duration(4.0)
                .with_affinity(NodeAffinity::Same),
            TestCase::new("narrow")
                .with_resource(ResourceDemand::cpus(1))
                .with_duration(4.0),
            TestCase::new("alone")
                .with_resource(ResourceDemand::cpus(4))
                .with_duration(4.0),
        ];
        let batches = pack_to_height(&cases, 4, 4.0, PackingStrategy::FirstFit).unwrap();

        assert_eq!(batches.len(), 2);
        let wide = batches
            .iter()
            .find(|b| b.contains(&CaseId::new("wide")))
            .unwrap();
        assert_eq!(wide.affinity, NodeAffinity::Same);
        assert!(wide.contains(&CaseId::new("narrow")));
        let alone = batches
            .iter()
            .find(|b| b.contains(&CaseId::new("alone")))
            .unwrap();
        assert_eq!(alone.affinity, NodeAffinity::Any);
    }

    #[test]
    fn test_dependents_packed_after_dependencies() {
        let cases = vec![
            TestCase::new("sweep")
                .composite()
                .with_dependency("sweep.n=1")
                .with_dependency("sweep.n=2"),
            TestCase::new("sweep.n=1")
                .with_resource(ResourceDemand::cpus(1))
                .with_duration(1.0),
            TestCase::new("sweep.n=2")
                .with_resource(ResourceDemand::cpus(1))
                .with_duration(1.0),
        ];
        let batches = pack_to_height(&cases, 4, 10.0, PackingStrategy::FirstFit).unwrap();
        assert_eq!(batches.len(), 2);
        assert!(batches[1].contains(&CaseId::new("sweep")));
        assert_eq!(batches[1].depends_on, vec![batches[0].id]);
    }
}
