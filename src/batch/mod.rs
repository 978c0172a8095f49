//! Batch planning
//!
//! Groups cases into submission units by count, by aggregate duration, or by
//! two-dimensional packing, optionally keeping composite cases in a trailing
//! batch of their own.

mod batch;
mod packing;
mod partition;

pub use batch::{Batch, BatchId};
pub use packing::{pack_blocks, pack_to_height, pack_to_height_grouped, Block, PackingStrategy};
pub use partition::{
    one_per_batch, partition_n, partition_t, partition_x, MatchMode, NodeShape, Partitioner,
    Strategy,
};
