//! Placement algorithms operating purely on offsets and sizes inside one block.
//!
//! The three algorithms form a closed set, chosen at pool creation and fixed
//! for a block's lifetime, so they are a tagged enum rather than trait
//! objects - exhaustive matching keeps every call site honest about which
//! algorithms support which operations (only the generic free-list supports
//! the loss protocol and defragmentation).
//!
//! Allocation is a two-step request/commit protocol: `create_request`
//! computes a placement without mutating anything, `commit` applies it.
//! Both always run under the owning block vector's write lock, so a
//! placement can never go stale in between.

pub(crate) mod buddy;
pub(crate) mod generic;
pub(crate) mod linear;

use crate::allocation::{Allocation, AllocationCreateFlags};
use crate::pool::PoolAlgorithm;
use crate::stats::{RegionReport, StatInfo};
use crate::DeviceSize;

use self::buddy::BuddyMetadata;
use self::generic::GenericMetadata;
use self::linear::LinearMetadata;

/// Free-span selection strategy for the generic algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FitStrategy {
	/// Lowest acceptable offset. Predictable compaction; used by defragmentation.
	FirstFit,
	/// Smallest span that fits. The default; minimizes long-term fragmentation.
	BestFit,
	/// Largest span. Maximizes leftover per span, trading fragmentation for speed.
	WorstFit,
}

impl FitStrategy {
	pub fn from_flags(flags: AllocationCreateFlags) -> FitStrategy {
		if flags.contains(AllocationCreateFlags::STRATEGY_FIRST_FIT) {
			FitStrategy::FirstFit
		} else if flags.contains(AllocationCreateFlags::STRATEGY_WORST_FIT) {
			FitStrategy::WorstFit
		} else {
			FitStrategy::BestFit
		}
	}
}

/// One placement attempt, as seen by a metadata instance.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestContext {
	pub size: DeviceSize,
	/// Power of two; already validated by the allocator.
	pub alignment: DeviceSize,
	pub strategy: FitStrategy,
	/// Linear pools: allocate from the upper end of the block.
	pub upper_address: bool,
	/// Generic pools: lost-eligible neighbors may be evicted to make room.
	pub can_make_other_lost: bool,
	pub current_frame: u32,
	pub frame_in_use_count: u32,
}

/// A computed placement, to be passed back to [`BlockMetadata::commit`].
#[derive(Debug)]
pub(crate) enum Placement {
	Generic {
		offset: DeviceSize,
		/// Requested size plus the pool's debug margin (margin omitted when
		/// the region sits flush against the block end).
		padded_size: DeviceSize,
		/// Allocations that must be marked lost to open up this region.
		evict: Vec<Allocation>,
	},
	Linear {
		offset: DeviceSize,
		upper_address: bool,
		/// Ring-buffer wraparound: this placement starts a new lap at the
		/// low end of the block.
		wrap: bool,
	},
	Buddy {
		offset: DeviceSize,
		/// Power-of-two node size actually reserved (>= requested size).
		node_size: DeviceSize,
		/// Level at which a free node was found; `commit` splits it down
		/// to the target level.
		found_level: u8,
	},
}

impl Placement {
	pub fn offset(&self) -> DeviceSize {
		match self {
			Placement::Generic { offset, .. }
			| Placement::Linear { offset, .. }
			| Placement::Buddy { offset, .. } => *offset,
		}
	}
}

/// Per-block placement state: the free-space map and all live suballocations.
#[derive(Debug)]
pub(crate) enum BlockMetadata {
	Generic(GenericMetadata),
	Linear(LinearMetadata),
	Buddy(BuddyMetadata),
}

impl BlockMetadata {
	pub fn new(algorithm: PoolAlgorithm, size: DeviceSize, margin: DeviceSize) -> Self {
		match algorithm {
			PoolAlgorithm::Generic => BlockMetadata::Generic(GenericMetadata::new(size, margin)),
			PoolAlgorithm::Linear => BlockMetadata::Linear(LinearMetadata::new(size)),
			PoolAlgorithm::Buddy => BlockMetadata::Buddy(BuddyMetadata::new(size)),
		}
	}

	pub fn size(&self) -> DeviceSize {
		match self {
			BlockMetadata::Generic(m) => m.size(),
			BlockMetadata::Linear(m) => m.size(),
			BlockMetadata::Buddy(m) => m.size(),
		}
	}

	/// Bytes not currently reserved by any live suballocation. For the
	/// buddy algorithm this excludes the unusable tail.
	pub fn free_size(&self) -> DeviceSize {
		match self {
			BlockMetadata::Generic(m) => m.free_size(),
			BlockMetadata::Linear(m) => m.free_size(),
			BlockMetadata::Buddy(m) => m.free_size(),
		}
	}

	/// Tail bytes a non-power-of-two buddy block can never serve. Zero for
	/// the other algorithms.
	pub fn unusable_size(&self) -> DeviceSize {
		match self {
			BlockMetadata::Buddy(m) => m.unusable_size(),
			_ => 0,
		}
	}

	pub fn allocation_count(&self) -> usize {
		match self {
			BlockMetadata::Generic(m) => m.allocation_count(),
			BlockMetadata::Linear(m) => m.allocation_count(),
			BlockMetadata::Buddy(m) => m.allocation_count(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.allocation_count() == 0
	}

	pub fn create_request(&self, ctx: &RequestContext) -> Option<Placement> {
		match self {
			BlockMetadata::Generic(m) => m.create_request(ctx),
			BlockMetadata::Linear(m) => m.create_request(ctx),
			BlockMetadata::Buddy(m) => m.create_request(ctx),
		}
	}

	/// Applies a placement computed by [`create_request`](Self::create_request)
	/// on this same metadata under the same lock hold. Returns the
	/// allocations that were marked lost to make room.
	pub fn commit(&mut self, placement: Placement, allocation: &Allocation) -> Vec<Allocation> {
		match (self, placement) {
			(BlockMetadata::Generic(m), Placement::Generic { offset, padded_size, evict }) => {
				m.commit(offset, padded_size, evict, allocation)
			}
			(BlockMetadata::Linear(m), Placement::Linear { offset, upper_address, wrap }) => {
				m.commit(offset, upper_address, wrap, allocation);
				Vec::new()
			}
			(BlockMetadata::Buddy(m), Placement::Buddy { offset, node_size, found_level }) => {
				m.commit(offset, node_size, found_level, allocation);
				Vec::new()
			}
			_ => unreachable!("placement committed against a different metadata algorithm"),
		}
	}

	/// Returns the region to free space. `offset` is the allocation's
	/// current offset as recorded in its backing. Returns the number of
	/// bytes released (including any margin padding).
	pub fn free(&mut self, allocation: &Allocation, offset: DeviceSize) -> DeviceSize {
		match self {
			BlockMetadata::Generic(m) => m.free(allocation, offset),
			BlockMetadata::Linear(m) => m.free(allocation, offset),
			BlockMetadata::Buddy(m) => m.free(allocation, offset),
		}
	}

	/// Converts every lost-eligible live allocation to `Lost` and merges
	/// its region into free space. Only the generic algorithm participates
	/// in the loss protocol. Returns the lost handles and the bytes reclaimed.
	pub fn make_allocations_lost(
		&mut self,
		current_frame: u32,
		frame_in_use_count: u32,
	) -> (Vec<Allocation>, DeviceSize) {
		match self {
			BlockMetadata::Generic(m) => m.make_allocations_lost(current_frame, frame_in_use_count),
			_ => (Vec::new(), 0),
		}
	}

	/// Live allocations with their current offsets, ascending. The
	/// defragmentation planner consumes this; only generic blocks are
	/// defragmented, the other algorithms return nothing.
	pub fn allocations_by_offset(&self) -> Vec<(DeviceSize, Allocation)> {
		match self {
			BlockMetadata::Generic(m) => m.allocations_by_offset(),
			_ => Vec::new(),
		}
	}

	/// Margin padding spans of live regions, for sentinel write/verify.
	/// Only the generic algorithm reserves margins.
	pub fn margin_regions(&self) -> Vec<(DeviceSize, DeviceSize)> {
		match self {
			BlockMetadata::Generic(m) => m.margin_regions(),
			_ => Vec::new(),
		}
	}

	/// Margin padding after the region at `offset`, if any.
	pub fn padding_after(&self, offset: DeviceSize) -> Option<(DeviceSize, DeviceSize)> {
		match self {
			BlockMetadata::Generic(m) => m.padding_after(offset),
			_ => None,
		}
	}

	pub fn add_to_stats(&self, info: &mut StatInfo) {
		match self {
			BlockMetadata::Generic(m) => m.add_to_stats(info),
			BlockMetadata::Linear(m) => m.add_to_stats(info),
			BlockMetadata::Buddy(m) => m.add_to_stats(info),
		}
	}

	pub fn report_regions(&self) -> Vec<RegionReport> {
		match self {
			BlockMetadata::Generic(m) => m.report_regions(),
			BlockMetadata::Linear(m) => m.report_regions(),
			BlockMetadata::Buddy(m) => m.report_regions(),
		}
	}

	/// Internal consistency check, compiled into debug builds only.
	#[cfg(debug_assertions)]
	pub fn validate(&self) {
		match self {
			BlockMetadata::Generic(m) => m.validate(),
			BlockMetadata::Linear(m) => m.validate(),
			BlockMetadata::Buddy(m) => m.validate(),
		}
	}
}
