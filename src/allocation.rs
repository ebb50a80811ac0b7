//! The opaque [`Allocation`] handle returned to callers.
//!
//! An allocation is a tagged variant over three backings: a sub-region of a
//! shared block, a dedicated memory object of its own, or `Lost` - the
//! placeholder left behind when the allocator reclaimed the region to
//! satisfy a later request. Handles are cheap `Arc` clones; identity
//! persists across defragmentation moves even though the (block, offset)
//! pair changes underneath.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{DeviceMemoryHandle, MappedPtr};
use crate::pool::Pool;
use crate::DeviceSize;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct AllocationCreateFlags: u32 {
		/// Allocate a whole dedicated memory object, bypassing block suballocation.
		const DEDICATED = 1 << 0;
		/// Only suballocate from existing blocks; never create a new one.
		const NEVER_ALLOCATE = 1 << 1;
		/// Keep the allocation persistently mapped for its whole lifetime.
		const MAPPED = 1 << 2;
		/// The allocation may be silently invalidated (marked lost) under
		/// memory pressure. Callers must re-check liveness every frame.
		const CAN_BECOME_LOST = 1 << 3;
		/// This request may evict lost-eligible allocations to make room.
		const CAN_MAKE_OTHER_LOST = 1 << 4;
		/// Fail the allocation rather than exceed the device-reported budget.
		const WITHIN_BUDGET = 1 << 5;
		/// Linear pools only: allocate from the upper end of the block.
		const UPPER_ADDRESS = 1 << 6;
		/// Placement strategy: minimize leftover span space (the default).
		const STRATEGY_BEST_FIT = 1 << 7;
		/// Placement strategy: take the first span that fits, favoring low offsets.
		const STRATEGY_FIRST_FIT = 1 << 8;
		/// Placement strategy: maximize leftover span space, trading
		/// fragmentation for allocation speed.
		const STRATEGY_WORST_FIT = 1 << 9;
	}
}

/// Parameters of one allocation request, besides the size/alignment/type
/// mask that come from the resource's own [requirements](crate::MemoryRequirements).
#[derive(Debug, Clone, Default)]
pub struct AllocationCreateInfo {
	pub flags: AllocationCreateFlags,
	/// Property flags every candidate memory type must have.
	pub required_flags: crate::MemoryPropertyFlags,
	/// Property flags used only to rank candidate types, most-preferred first.
	pub preferred_flags: crate::MemoryPropertyFlags,
	/// Draw from this pool instead of the default per-type block vectors.
	pub pool: Option<Pool>,
	/// Opaque user payload stored with the allocation and echoed in the
	/// statistics dump.
	pub user_data: Option<String>,
}

/// Everything a caller can learn about an allocation at a point in time.
///
/// For a lost allocation, `memory` is [`DeviceMemoryHandle::NULL`] and
/// `size` is zero - that query result *is* the liveness protocol.
#[derive(Debug, Clone)]
pub struct AllocationInfo {
	pub memory_type: u32,
	pub memory: DeviceMemoryHandle,
	pub offset: DeviceSize,
	pub size: DeviceSize,
	pub mapped_ptr: Option<*mut u8>,
	pub user_data: Option<String>,
}

/// Unique id of an allocation within one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct AllocationId(pub u64);

/// Which block vector an allocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum VectorRef {
	/// The default vector of the given memory type.
	Default(u32),
	/// A user pool, by pool id.
	Pool(u64),
}

/// Unique id of a block within one block vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(pub u64);

#[derive(Debug, Clone)]
pub(crate) enum AllocationBacking {
	Block {
		vector: VectorRef,
		block: BlockId,
		offset: DeviceSize,
		memory: DeviceMemoryHandle,
	},
	Dedicated {
		memory: DeviceMemoryHandle,
	},
	Lost,
}

pub(crate) struct AllocationMutable {
	pub backing: AllocationBacking,
	/// How many times the caller currently has this allocation mapped.
	/// A persistently-mapped allocation starts at one and never drops below it.
	pub map_count: u32,
	/// Cached pointer for this allocation (block base plus offset), valid
	/// while `map_count > 0`.
	pub mapped_ptr: Option<MappedPtr>,
	pub user_data: Option<String>,
}

pub(crate) struct AllocationInner {
	pub id: AllocationId,
	pub size: DeviceSize,
	pub alignment: DeviceSize,
	pub memory_type: u32,
	pub heap_index: u32,
	pub flags: AllocationCreateFlags,
	/// Frame index this allocation was last touched in. Read/written with
	/// relaxed atomics; a slightly stale value at worst delays loss
	/// eligibility by a frame.
	pub last_use_frame: AtomicU32,
	pub m: Mutex<AllocationMutable>,
}

/// Opaque, cheaply clonable handle to one live (or lost) allocation.
#[derive(Clone)]
pub struct Allocation {
	pub(crate) inner: Arc<AllocationInner>,
}

impl fmt::Debug for Allocation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Allocation")
			.field("id", &self.inner.id.0)
			.field("size", &self.inner.size)
			.field("lost", &self.is_lost())
			.finish()
	}
}

impl PartialEq for Allocation {
	fn eq(&self, other: &Allocation) -> bool {
		self.inner.id == other.inner.id
	}
}
impl Eq for Allocation {}

impl std::hash::Hash for Allocation {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.inner.id.0.hash(state);
	}
}

impl Allocation {
	pub(crate) fn new(
		id: AllocationId,
		size: DeviceSize,
		alignment: DeviceSize,
		memory_type: u32,
		heap_index: u32,
		flags: AllocationCreateFlags,
		backing: AllocationBacking,
		user_data: Option<String>,
		current_frame: u32,
	) -> Self {
		Allocation {
			inner: Arc::new(AllocationInner {
				id,
				size,
				alignment,
				memory_type,
				heap_index,
				flags,
				last_use_frame: AtomicU32::new(current_frame),
				m: Mutex::new(AllocationMutable {
					backing,
					map_count: 0,
					mapped_ptr: None,
					user_data,
				}),
			}),
		}
	}

	/// Size of the allocation in bytes. Stable for the allocation's
	/// lifetime; a lost allocation reports zero through
	/// [`get_allocation_info`](crate::Allocator::get_allocation_info) but
	/// keeps its original size here.
	pub fn size(&self) -> DeviceSize {
		self.inner.size
	}

	/// Whether this allocation has been marked lost.
	pub fn is_lost(&self) -> bool {
		matches!(self.inner.m.lock().backing, AllocationBacking::Lost)
	}

	pub(crate) fn id(&self) -> AllocationId {
		self.inner.id
	}

	pub(crate) fn can_become_lost(&self) -> bool {
		self.inner.flags.contains(AllocationCreateFlags::CAN_BECOME_LOST)
	}

	/// Loss eligibility per the frame-in-use window: an allocation is
	/// evictable once it was last touched strictly before
	/// `current_frame - frame_in_use_count`.
	pub(crate) fn is_lost_eligible(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
		if !self.can_become_lost() {
			return false;
		}
		// A caller-held mapping pins the allocation regardless of frames.
		if self.inner.m.lock().map_count > 0 {
			return false;
		}
		let last_use = self.inner.last_use_frame.load(Ordering::Relaxed);
		last_use.wrapping_add(frame_in_use_count) < current_frame
	}

	pub(crate) fn touch_frame(&self, current_frame: u32) {
		self.inner.last_use_frame.store(current_frame, Ordering::Relaxed);
	}

	/// Current (block, offset) backing, or `None` once lost or dedicated.
	pub(crate) fn block_backing(&self) -> Option<(VectorRef, BlockId, DeviceSize)> {
		match self.inner.m.lock().backing {
			AllocationBacking::Block {
				vector,
				block,
				offset,
				..
			} => Some((vector, block, offset)),
			_ => None,
		}
	}

	/// Flip the backing to `Lost`. Returns false if the allocation was
	/// already lost (idempotent).
	pub(crate) fn mark_lost(&self) -> bool {
		let mut m = self.inner.m.lock();
		if matches!(m.backing, AllocationBacking::Lost) {
			return false;
		}
		m.backing = AllocationBacking::Lost;
		m.mapped_ptr = None;
		true
	}
}
