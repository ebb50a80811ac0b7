//! Aggregated statistics and the JSON dump model.
//!
//! [`StatInfo`] is the per-scope accumulator (one per block vector, memory
//! type, heap, and one grand total); block metadata feeds it through
//! [`add_allocation`](StatInfo::add_allocation) and
//! [`add_unused_range`](StatInfo::add_unused_range). The dump structs mirror
//! the allocator's internal layout closely enough that a fragmentation
//! problem can be diagnosed from the serialized output alone.

use serde::Serialize;

use crate::DeviceSize;

/// Whether a reported region holds a suballocation or free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
	Free,
	Used,
}

/// One contiguous region of a block, as reported in the statistics dump.
#[derive(Debug, Clone, Serialize)]
pub struct RegionReport {
	pub offset: DeviceSize,
	pub size: DeviceSize,
	pub kind: RegionKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub allocation_id: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_data: Option<String>,
}

/// Aggregated counters over some scope (a block vector, a memory type, a
/// heap, or the whole allocator).
#[derive(Debug, Clone, Serialize)]
pub struct StatInfo {
	pub block_count: usize,
	pub allocation_count: usize,
	pub unused_range_count: usize,
	/// Bytes occupied by live suballocations (requested sizes, not padded).
	pub used_bytes: DeviceSize,
	/// Bytes in free ranges available to future requests.
	pub unused_bytes: DeviceSize,
	/// Bytes no request can ever occupy (non-power-of-two buddy tails).
	pub unusable_bytes: DeviceSize,
	/// Bytes reserved beyond what was requested: buddy node round-up and
	/// debug-margin padding.
	pub internal_fragmentation_bytes: DeviceSize,
	pub allocation_size_min: DeviceSize,
	pub allocation_size_max: DeviceSize,
	pub unused_range_size_min: DeviceSize,
	pub unused_range_size_max: DeviceSize,
}

impl Default for StatInfo {
	fn default() -> Self {
		StatInfo {
			block_count: 0,
			allocation_count: 0,
			unused_range_count: 0,
			used_bytes: 0,
			unused_bytes: 0,
			unusable_bytes: 0,
			internal_fragmentation_bytes: 0,
			allocation_size_min: DeviceSize::MAX,
			allocation_size_max: 0,
			unused_range_size_min: DeviceSize::MAX,
			unused_range_size_max: 0,
		}
	}
}

impl StatInfo {
	pub(crate) fn add_allocation(&mut self, size: DeviceSize) {
		self.allocation_count += 1;
		self.used_bytes += size;
		self.allocation_size_min = self.allocation_size_min.min(size);
		self.allocation_size_max = self.allocation_size_max.max(size);
	}

	pub(crate) fn add_unused_range(&mut self, size: DeviceSize) {
		self.unused_range_count += 1;
		self.unused_bytes += size;
		self.unused_range_size_min = self.unused_range_size_min.min(size);
		self.unused_range_size_max = self.unused_range_size_max.max(size);
	}

	pub(crate) fn merge(&mut self, other: &StatInfo) {
		self.block_count += other.block_count;
		self.allocation_count += other.allocation_count;
		self.unused_range_count += other.unused_range_count;
		self.used_bytes += other.used_bytes;
		self.unused_bytes += other.unused_bytes;
		self.unusable_bytes += other.unusable_bytes;
		self.internal_fragmentation_bytes += other.internal_fragmentation_bytes;
		self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
		self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
		self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
		self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
	}

	/// Zeroes the sentinel minimums of an empty scope so serialized output
	/// never shows `u64::MAX`.
	pub(crate) fn normalize(&mut self) {
		if self.allocation_count == 0 {
			self.allocation_size_min = 0;
		}
		if self.unused_range_count == 0 {
			self.unused_range_size_min = 0;
		}
	}
}

/// Full statistics across the allocator, broken down by memory type and heap.
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
	pub total: StatInfo,
	/// Indexed by memory type.
	pub memory_type: Vec<StatInfo>,
	/// Indexed by heap.
	pub memory_heap: Vec<StatInfo>,
	/// Allocations ever marked lost, by eviction or an explicit sweep.
	pub lost_allocation_count: usize,
}

/// One block in the detailed JSON dump.
#[derive(Debug, Serialize)]
pub struct BlockDump {
	pub id: u64,
	pub size: DeviceSize,
	pub allocation_count: usize,
	pub regions: Vec<RegionReport>,
}

/// The default block vector of one memory type, in the detailed JSON dump.
#[derive(Debug, Serialize)]
pub struct MemoryTypeDump {
	pub memory_type: u32,
	pub heap_index: u32,
	pub stats: StatInfo,
	pub blocks: Vec<BlockDump>,
}

/// One user pool in the detailed JSON dump.
#[derive(Debug, Serialize)]
pub struct PoolDump {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	pub memory_type: u32,
	pub algorithm: crate::pool::PoolAlgorithm,
	pub stats: StatInfo,
	pub blocks: Vec<BlockDump>,
}

/// Root of the detailed JSON dump produced by
/// [`build_stats_json`](crate::Allocator::build_stats_json).
#[derive(Debug, Serialize)]
pub struct AllocatorDump {
	pub total: StatInfo,
	pub memory_types: Vec<MemoryTypeDump>,
	pub pools: Vec<PoolDump>,
	pub dedicated_count: usize,
	pub dedicated_bytes: DeviceSize,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merge_and_normalize() {
		let mut a = StatInfo::default();
		a.add_allocation(100);
		a.add_allocation(300);
		a.add_unused_range(50);

		let mut b = StatInfo::default();
		b.add_allocation(10);
		b.block_count = 2;

		a.merge(&b);
		assert_eq!(a.allocation_count, 3);
		assert_eq!(a.used_bytes, 410);
		assert_eq!(a.allocation_size_min, 10);
		assert_eq!(a.allocation_size_max, 300);
		assert_eq!(a.unused_range_count, 1);
		assert_eq!(a.block_count, 2);

		let mut empty = StatInfo::default();
		empty.normalize();
		assert_eq!(empty.allocation_size_min, 0);
		assert_eq!(empty.unused_range_size_min, 0);
	}

	#[test]
	fn region_report_serializes_without_null_fields() {
		let region = RegionReport {
			offset: 0,
			size: 128,
			kind: RegionKind::Free,
			allocation_id: None,
			user_data: None,
		};
		let json = serde_json::to_value(&region).unwrap();
		assert_eq!(json["kind"], "free");
		assert!(json.get("allocation_id").is_none());
	}
}
