//! User-created pools: a private block vector with its own policy.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::block_vector::BlockVector;
use crate::DeviceSize;

/// Placement algorithm of a pool's blocks, fixed at pool creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolAlgorithm {
	/// Free-list placement with coalescing. Supports out-of-order free, the
	/// lost-allocation protocol and defragmentation. The default.
	#[default]
	Generic,
	/// Stack / double stack / ring buffer placement for strictly ordered
	/// lifetimes. Near-zero bookkeeping, no defragmentation.
	Linear,
	/// Power-of-two buddy placement. Fast coalescing, internal fragmentation
	/// from size round-up.
	Buddy,
}

/// Parameters of [`create_pool`](crate::Allocator::create_pool).
#[derive(Debug, Clone, Default)]
pub struct PoolCreateInfo {
	/// Index of the memory type all blocks of this pool are created from.
	pub memory_type: u32,
	/// Fixed size of each block. Zero means the allocator's preferred block
	/// size with its usual growth schedule.
	pub block_size: DeviceSize,
	/// Blocks created eagerly at pool creation and never freed.
	pub min_block_count: usize,
	/// Hard cap on blocks. Zero means unlimited.
	pub max_block_count: usize,
	pub algorithm: PoolAlgorithm,
	/// Overrides the allocator-wide frame-in-use window for this pool's
	/// lost-allocation decisions.
	pub frame_in_use_count: Option<u32>,
	/// Debug margin reserved after each suballocation. Only the generic
	/// algorithm honors it.
	pub margin: DeviceSize,
	/// Shows up in the statistics dump and in leak warnings.
	pub name: Option<String>,
}

pub(crate) struct PoolShared {
	pub id: u64,
	pub name: Option<String>,
	pub vector: BlockVector,
}

/// Handle to a user pool. Cheap to clone; pass it in
/// [`AllocationCreateInfo::pool`](crate::AllocationCreateInfo::pool) to draw
/// from the pool instead of the default vectors.
#[derive(Clone)]
pub struct Pool {
	pub(crate) shared: Arc<PoolShared>,
}

impl fmt::Debug for Pool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Pool")
			.field("id", &self.shared.id)
			.field("name", &self.shared.name)
			.finish()
	}
}

impl PartialEq for Pool {
	fn eq(&self, other: &Pool) -> bool {
		self.shared.id == other.shared.id
	}
}
impl Eq for Pool {}

impl Pool {
	pub fn name(&self) -> Option<&str> {
		self.shared.name.as_deref()
	}

	pub fn algorithm(&self) -> PoolAlgorithm {
		self.shared.vector.config.algorithm
	}

	/// Number of live allocations across the pool's blocks.
	pub fn allocation_count(&self) -> usize {
		self.shared.vector.allocation_count()
	}

	pub fn block_count(&self) -> usize {
		self.shared.vector.block_count()
	}

	pub(crate) fn id(&self) -> u64 {
		self.shared.id
	}
}
