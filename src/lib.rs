//! Gravel is a general-purpose suballocator for GPU device memory.
//!
//! A graphics driver hands out *device memory objects* in whole blocks, each
//! belonging to a memory type backed by a physical heap. Creating and
//! destroying those objects is expensive and their count is limited, so
//! instead of asking the driver for one object per buffer or image, gravel
//! allocates large blocks and hands out sub-regions of them.
//!
//! The top-level entry point is [`Allocator`]. It owns one default
//! [block vector](crate::block_vector) per memory type plus any number of
//! user-created [`Pool`]s, routes each request to the right place, tracks
//! per-heap [budgets](Budget), and drives [defragmentation](DefragmentationContext).
//!
//! Gravel never talks to a real graphics API. Everything it needs from the
//! driver goes through the [`MemoryDevice`] trait, which the embedding
//! application implements over Vulkan, D3D12, or (in tests) plain host memory.

pub mod allocation;
pub mod allocator;
pub mod budget;
pub mod defrag;
pub mod device;
pub mod error;
pub mod pool;
pub mod stats;

pub(crate) mod block;
pub(crate) mod block_vector;
pub(crate) mod metadata;
pub(crate) mod trace;

pub use allocation::{Allocation, AllocationCreateFlags, AllocationCreateInfo, AllocationInfo};
pub use allocator::{Allocator, AllocatorCreateInfo, MemoryRequirements};
pub use budget::{Budget, HeapBudget};
pub use defrag::{DefragmentationContext, DefragmentationInfo, DefragmentationStats, DefragmentationMove};
pub use device::{
	DeviceError, DeviceMemoryHandle, MemoryDevice, MemoryHeap, MemoryProperties,
	MemoryPropertyFlags, MemoryType, MockDevice,
};
pub use error::{AllocatorError, ErrorKind};
pub use pool::{Pool, PoolAlgorithm, PoolCreateInfo};
pub use stats::{AllocatorStats, StatInfo};

use std::collections::{HashMap, HashSet};

use xxhash_rust::xxh3::Xxh3Builder;

/// Sizes and offsets of device memory, in bytes.
pub type DeviceSize = u64;

/// Non-cryptographic hashmap for internally-generated structures.
pub(crate) type FastHashMap<K, V> = HashMap<K, V, Xxh3Builder>;
/// Non-cryptographic hashset for internally-generated structures.
pub(crate) type FastHashSet<T> = HashSet<T, Xxh3Builder>;

pub(crate) fn new_fast_hash_map<K, V>() -> FastHashMap<K, V> {
	HashMap::with_hasher(Xxh3Builder::new())
}
pub(crate) fn new_fast_hash_set<T>() -> FastHashSet<T> {
	HashSet::with_hasher(Xxh3Builder::new())
}

/// Smallest multiple of `alignment` that is not less than `value`.
/// `alignment` must be a power of two.
#[inline(always)]
pub(crate) fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
	debug_assert!(alignment.is_power_of_two());
	(value + alignment - 1) & !(alignment - 1)
}

/// Largest multiple of `alignment` that is not greater than `value`.
/// `alignment` must be a power of two.
#[inline(always)]
pub(crate) fn align_down(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
	debug_assert!(alignment.is_power_of_two());
	value & !(alignment - 1)
}

/// Largest power of two that is not greater than `value`, or zero for zero.
#[inline(always)]
pub(crate) fn prev_power_of_two(value: DeviceSize) -> DeviceSize {
	if value == 0 {
		0
	} else {
		1 << (63 - value.leading_zeros() as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn align_helpers() {
		assert_eq!(align_up(0, 16), 0);
		assert_eq!(align_up(1, 16), 16);
		assert_eq!(align_up(16, 16), 16);
		assert_eq!(align_up(17, 1), 17);
		assert_eq!(align_down(17, 16), 16);
		assert_eq!(align_down(15, 16), 0);
	}

	#[test]
	fn prev_pow2() {
		assert_eq!(prev_power_of_two(0), 0);
		assert_eq!(prev_power_of_two(1), 1);
		assert_eq!(prev_power_of_two(255), 128);
		assert_eq!(prev_power_of_two(256), 256);
		assert_eq!(prev_power_of_two(257), 256);
	}
}
