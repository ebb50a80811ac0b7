//! Buddy placement: power-of-two splitting with fast coalescing.
//!
//! The usable part of the block is the largest power of two that fits; any
//! tail beyond it is permanently unusable and reported separately, never as
//! free space. Conceptually the usable range is a binary tree of nodes -
//! level 0 is the whole range, each level halves the node size - stored as
//! one free-offset set per level. Requests round up to the smallest
//! power-of-two node size (never below [`MIN_NODE_SIZE`]); the surplus is
//! internal fragmentation and is surfaced in stats.
//!
//! Freeing coalesces exhaustively: a freed node merges with its buddy
//! whenever the buddy is free, repeating up the tree, so no two sibling
//! free nodes ever coexist.

use std::collections::{BTreeMap, BTreeSet};

use crate::allocation::Allocation;
use crate::stats::{RegionKind, RegionReport, StatInfo};
use crate::{prev_power_of_two, DeviceSize};

use super::{Placement, RequestContext};

/// Smallest node the tree is ever split into. Requests below this round up.
pub(crate) const MIN_NODE_SIZE: DeviceSize = 64;

#[derive(Debug)]
struct BuddyUsed {
	node_size: DeviceSize,
	alloc_size: DeviceSize,
	handle: Allocation,
}

#[derive(Debug)]
pub(crate) struct BuddyMetadata {
	size: DeviceSize,
	/// `size` rounded down to a power of two; the only range the tree serves.
	usable_size: DeviceSize,
	/// `free_lists[l]` holds the offsets of free nodes of size `usable_size >> l`.
	free_lists: Vec<BTreeSet<DeviceSize>>,
	used: BTreeMap<DeviceSize, BuddyUsed>,
	free_bytes: DeviceSize,
}

impl BuddyMetadata {
	pub fn new(size: DeviceSize) -> Self {
		let usable_size = prev_power_of_two(size);
		assert!(
			usable_size >= MIN_NODE_SIZE,
			"buddy block of {size} bytes is smaller than the minimum node size"
		);
		let level_count = (usable_size / MIN_NODE_SIZE).trailing_zeros() as usize + 1;
		let mut free_lists = vec![BTreeSet::new(); level_count];
		free_lists[0].insert(0);
		BuddyMetadata {
			size,
			usable_size,
			free_lists,
			used: BTreeMap::new(),
			free_bytes: usable_size,
		}
	}

	pub fn size(&self) -> DeviceSize {
		self.size
	}

	pub fn free_size(&self) -> DeviceSize {
		self.free_bytes
	}

	/// Tail bytes beyond the largest contained power of two.
	pub fn unusable_size(&self) -> DeviceSize {
		self.size - self.usable_size
	}

	pub fn allocation_count(&self) -> usize {
		self.used.len()
	}

	#[inline]
	fn node_size_at(&self, level: usize) -> DeviceSize {
		self.usable_size >> level
	}

	#[inline]
	fn level_of(&self, node_size: DeviceSize) -> usize {
		(self.usable_size / node_size).trailing_zeros() as usize
	}

	/// Node size a request actually occupies: the smallest power of two
	/// covering both size and alignment, never below the minimum node.
	/// Power-of-two placement makes every node offset a multiple of its own
	/// size, so alignment up to the node size comes for free; a larger
	/// alignment just forces the next level(s) up. `None` when the rounded
	/// size does not fit in a `u64`.
	fn required_node_size(size: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
		size.max(alignment)
			.max(MIN_NODE_SIZE)
			.checked_next_power_of_two()
	}

	pub fn create_request(&self, ctx: &RequestContext) -> Option<Placement> {
		let node_size = Self::required_node_size(ctx.size, ctx.alignment)?;
		if node_size > self.usable_size {
			return None;
		}
		let target_level = self.level_of(node_size);
		// Prefer an exact-size free node; otherwise take the smallest
		// larger one and split it down at commit time.
		for level in (0..=target_level).rev() {
			if let Some(&offset) = self.free_lists[level].first() {
				return Some(Placement::Buddy {
					offset,
					node_size,
					found_level: level as u8,
				});
			}
		}
		None
	}

	pub fn commit(
		&mut self,
		offset: DeviceSize,
		node_size: DeviceSize,
		found_level: u8,
		allocation: &Allocation,
	) {
		let mut level = found_level as usize;
		let removed = self.free_lists[level].remove(&offset);
		assert!(removed, "buddy placement committed against a non-free node");

		// Split left-to-right down to the target size; each split frees the
		// right child and keeps descending into the left.
		let target_level = self.level_of(node_size);
		while level < target_level {
			let child_size = self.node_size_at(level + 1);
			self.free_lists[level + 1].insert(offset + child_size);
			level += 1;
		}

		self.free_bytes -= node_size;
		self.used.insert(
			offset,
			BuddyUsed {
				node_size,
				alloc_size: allocation.size(),
				handle: allocation.clone(),
			},
		);
	}

	pub fn free(&mut self, allocation: &Allocation, offset: DeviceSize) -> DeviceSize {
		let entry = self
			.used
			.remove(&offset)
			.expect("free() called with an offset that holds no suballocation");
		debug_assert_eq!(entry.handle.id(), allocation.id());

		let released = entry.node_size;
		self.free_bytes += released;

		let mut offset = offset;
		let mut node_size = entry.node_size;
		let mut level = self.level_of(node_size);
		// Coalesce with the buddy as far up the tree as possible.
		while level > 0 {
			let buddy = offset ^ node_size;
			if !self.free_lists[level].remove(&buddy) {
				break;
			}
			offset = offset.min(buddy);
			node_size <<= 1;
			level -= 1;
		}
		self.free_lists[level].insert(offset);
		released
	}

	pub fn add_to_stats(&self, info: &mut StatInfo) {
		info.block_count += 1;
		info.unusable_bytes += self.unusable_size();
		for region in self.used.values() {
			info.add_allocation(region.alloc_size);
			info.internal_fragmentation_bytes += region.node_size - region.alloc_size;
		}
		for (level, list) in self.free_lists.iter().enumerate() {
			let node_size = self.node_size_at(level);
			for _ in list.iter() {
				info.add_unused_range(node_size);
			}
		}
	}

	pub fn report_regions(&self) -> Vec<RegionReport> {
		let mut regions: Vec<RegionReport> = self
			.used
			.iter()
			.map(|(&off, r)| RegionReport {
				offset: off,
				size: r.node_size,
				kind: RegionKind::Used,
				allocation_id: Some(r.handle.id().0),
				user_data: r.handle.inner.m.lock().user_data.clone(),
			})
			.collect();
		for (level, list) in self.free_lists.iter().enumerate() {
			let node_size = self.node_size_at(level);
			for &off in list.iter() {
				regions.push(RegionReport {
					offset: off,
					size: node_size,
					kind: RegionKind::Free,
					allocation_id: None,
					user_data: None,
				});
			}
		}
		regions.sort_by_key(|r| r.offset);
		regions
	}

	#[cfg(debug_assertions)]
	pub fn validate(&self) {
		let mut free_total = 0;
		for (level, list) in self.free_lists.iter().enumerate() {
			let node_size = self.node_size_at(level);
			for &offset in list.iter() {
				assert_eq!(offset % node_size, 0, "free node misaligned for its level");
				if level > 0 {
					let buddy = offset ^ node_size;
					assert!(
						!list.contains(&buddy) || buddy == offset,
						"two sibling free nodes left uncoalesced at level {level}"
					);
				}
				free_total += node_size;
			}
		}
		assert_eq!(free_total, self.free_bytes);

		let used_total: DeviceSize = self.used.values().map(|r| r.node_size).sum();
		assert_eq!(used_total + self.free_bytes, self.usable_size);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::allocation::{
		AllocationBacking, AllocationCreateFlags, AllocationId, BlockId, VectorRef,
	};
	use crate::device::DeviceMemoryHandle;
	use crate::metadata::FitStrategy;

	fn request(size: DeviceSize, alignment: DeviceSize) -> RequestContext {
		RequestContext {
			size,
			alignment,
			strategy: FitStrategy::BestFit,
			upper_address: false,
			can_make_other_lost: false,
			current_frame: 0,
			frame_in_use_count: 0,
		}
	}

	fn dummy(id: u64, size: DeviceSize, offset: DeviceSize) -> Allocation {
		Allocation::new(
			AllocationId(id),
			size,
			1,
			0,
			0,
			AllocationCreateFlags::empty(),
			AllocationBacking::Block {
				vector: VectorRef::Default(0),
				block: BlockId(0),
				offset,
				memory: DeviceMemoryHandle(1),
			},
			None,
			0,
		)
	}

	fn alloc(
		meta: &mut BuddyMetadata,
		id: u64,
		size: DeviceSize,
		alignment: DeviceSize,
	) -> Option<(DeviceSize, Allocation)> {
		let placement = meta.create_request(&request(size, alignment))?;
		let offset = placement.offset();
		let a = dummy(id, size, offset);
		match placement {
			Placement::Buddy { offset, node_size, found_level } => {
				meta.commit(offset, node_size, found_level, &a)
			}
			_ => unreachable!(),
		}
		#[cfg(debug_assertions)]
		meta.validate();
		Some((offset, a))
	}

	#[test]
	fn splits_and_coalesces_exhaustively() {
		let mut meta = BuddyMetadata::new(1024);
		let mut live = Vec::new();
		for i in 0..16 {
			live.push(alloc(&mut meta, i, 64, 1).unwrap());
		}
		assert_eq!(meta.free_size(), 0);
		assert!(meta.create_request(&request(64, 1)).is_none());

		// Free in an interleaved order; every free must coalesce as far as
		// its buddies allow, and the final state must be one root node.
		for step in [0usize, 2, 4, 6, 8, 10, 12, 14, 1, 3, 5, 7, 9, 11, 13, 15] {
			let (offset, a) = &live[step];
			meta.free(a, *offset);
			#[cfg(debug_assertions)]
			meta.validate();
		}
		assert_eq!(meta.free_size(), 1024);
		assert_eq!(meta.allocation_count(), 0);
		// Fully coalesced: the whole block is allocatable again.
		let (offset, _a) = alloc(&mut meta, 99, 1024, 1).unwrap();
		assert_eq!(offset, 0);
	}

	#[test]
	fn rounds_up_to_power_of_two_nodes() {
		let mut meta = BuddyMetadata::new(1024);
		let (o1, _a1) = alloc(&mut meta, 1, 200, 1).unwrap();
		// 200 rounds to a 256-byte node.
		assert_eq!(meta.free_size(), 1024 - 256);
		assert_eq!(o1 % 256, 0);

		let mut info = StatInfo::default();
		meta.add_to_stats(&mut info);
		assert_eq!(info.internal_fragmentation_bytes, 56);
	}

	#[test]
	fn sub_minimum_requests_round_to_min_node() {
		let mut meta = BuddyMetadata::new(1024);
		let (_o, _a) = alloc(&mut meta, 1, 5, 1).unwrap();
		assert_eq!(meta.free_size(), 1024 - MIN_NODE_SIZE);
	}

	#[test]
	fn non_power_of_two_tail_is_unusable() {
		let meta = BuddyMetadata::new(1000);
		assert_eq!(meta.unusable_size(), 1000 - 512);
		assert_eq!(meta.free_size(), 512);
		assert!(meta.create_request(&request(513, 1)).is_none());
	}

	#[test]
	fn oversized_requests_are_rejected() {
		let meta = BuddyMetadata::new(1024);
		// Sizes whose power-of-two round-up does not fit in a u64.
		assert!(meta.create_request(&request((1 << 63) + 1, 1)).is_none());
		assert!(meta.create_request(&request(DeviceSize::MAX - 50, 1)).is_none());
	}

	#[test]
	fn large_alignment_forces_higher_level() {
		let mut meta = BuddyMetadata::new(1024);
		let (_o1, _a1) = alloc(&mut meta, 1, 64, 1).unwrap();
		let (o2, _a2) = alloc(&mut meta, 2, 64, 512).unwrap();
		assert_eq!(o2 % 512, 0);
		// The 512-aligned request occupies a whole 512 node.
		assert_eq!(meta.free_size(), 1024 - 64 - 512);
	}
}
