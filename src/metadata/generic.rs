//! General-purpose free-list placement.
//!
//! Tracks an offset-ordered map of free spans and an offset-ordered map of
//! used regions; the two tile the block exactly. Free spans are kept
//! maximally coalesced at all times - freeing merges with both neighbors
//! immediately. This is the only algorithm that supports out-of-order free,
//! the lost-allocation protocol, and defragmentation.
//!
//! When the pool's debug margin is enabled, every region reserves `margin`
//! padding bytes after the caller-visible range so that overruns land in
//! pool-owned bytes instead of a neighbor. The padding is part of the used
//! region and is returned to free space with it. The last region in a block
//! may sit flush against the block end without margin.

use std::collections::BTreeMap;

use crate::allocation::Allocation;
use crate::stats::{RegionKind, RegionReport, StatInfo};
use crate::{align_up, DeviceSize};

use super::{FitStrategy, Placement, RequestContext};

#[derive(Debug)]
struct UsedRegion {
	/// Bytes reserved, including margin padding.
	padded_size: DeviceSize,
	/// Bytes the caller asked for.
	alloc_size: DeviceSize,
	handle: Allocation,
}

#[derive(Debug)]
pub(crate) struct GenericMetadata {
	size: DeviceSize,
	margin: DeviceSize,
	/// offset -> span length. Invariant: spans never overlap, never touch
	/// (always coalesced), and together with `used` tile [0, size).
	free: BTreeMap<DeviceSize, DeviceSize>,
	/// offset -> live suballocation.
	used: BTreeMap<DeviceSize, UsedRegion>,
	free_bytes: DeviceSize,
}

impl GenericMetadata {
	pub fn new(size: DeviceSize, margin: DeviceSize) -> Self {
		let mut free = BTreeMap::new();
		free.insert(0, size);
		GenericMetadata {
			size,
			margin,
			free,
			used: BTreeMap::new(),
			free_bytes: size,
		}
	}

	pub fn size(&self) -> DeviceSize {
		self.size
	}

	pub fn free_size(&self) -> DeviceSize {
		self.free_bytes
	}

	pub fn allocation_count(&self) -> usize {
		self.used.len()
	}

	/// Tries to fit `size` bytes at `alignment` into the span
	/// `[span_start, span_start + span_len)`. Returns (offset, padded size).
	fn fit_in_span(
		&self,
		span_start: DeviceSize,
		span_len: DeviceSize,
		size: DeviceSize,
		alignment: DeviceSize,
	) -> Option<(DeviceSize, DeviceSize)> {
		let span_end = span_start + span_len;
		let offset = align_up(span_start, alignment);
		if offset >= span_end {
			return None;
		}
		if offset + size + self.margin <= span_end {
			return Some((offset, size + self.margin));
		}
		// Flush-against-block-end: the tail region needs no margin because
		// nothing can ever be placed after it. Any leftover smaller than
		// the margin is absorbed as padding.
		if span_end == self.size && offset + size <= span_end {
			return Some((offset, span_end - offset));
		}
		None
	}

	pub fn create_request(&self, ctx: &RequestContext) -> Option<Placement> {
		if ctx.size > self.size {
			// Larger than the whole block. Rejecting here also keeps the
			// span arithmetic below away from u64 overflow.
			return None;
		}
		if let Some((offset, padded_size)) = self.find_fit(ctx.size, ctx.alignment, ctx.strategy) {
			return Some(Placement::Generic {
				offset,
				padded_size,
				evict: Vec::new(),
			});
		}
		if ctx.can_make_other_lost {
			return self.find_fit_evicting(ctx);
		}
		None
	}

	fn find_fit(
		&self,
		size: DeviceSize,
		alignment: DeviceSize,
		strategy: FitStrategy,
	) -> Option<(DeviceSize, DeviceSize)> {
		let mut best: Option<(DeviceSize, DeviceSize, DeviceSize)> = None; // (offset, padded, span_len)
		for (&start, &len) in self.free.iter() {
			let Some((offset, padded)) = self.fit_in_span(start, len, size, alignment) else {
				continue;
			};
			match strategy {
				FitStrategy::FirstFit => return Some((offset, padded)),
				FitStrategy::BestFit => {
					if best.map_or(true, |(_, _, l)| len < l) {
						best = Some((offset, padded, len));
					}
				}
				FitStrategy::WorstFit => {
					if best.map_or(true, |(_, _, l)| len > l) {
						best = Some((offset, padded, len));
					}
				}
			}
		}
		best.map(|(offset, padded, _)| (offset, padded))
	}

	/// Second-chance scan: walk the block in offset order, merging runs of
	/// free spans and lost-eligible used regions, and place into the first
	/// run that fits. Never evicts an allocation that is not eligible.
	fn find_fit_evicting(&self, ctx: &RequestContext) -> Option<Placement> {
		let mut run_start: Option<DeviceSize> = None;
		let mut run_evict: Vec<(DeviceSize, DeviceSize, Allocation)> = Vec::new();

		let mut cursor = 0u64;
		while cursor < self.size {
			let (region_len, evictable_handle) = if let Some(len) = self.free.get(&cursor) {
				(*len, None)
			} else if let Some(used) = self.used.get(&cursor) {
				let eligible = used
					.handle
					.is_lost_eligible(ctx.current_frame, ctx.frame_in_use_count);
				(used.padded_size, eligible.then(|| used.handle.clone()))
			} else {
				debug_assert!(false, "free and used regions must tile the block");
				return None;
			};

			let extends_run = self.free.contains_key(&cursor) || evictable_handle.is_some();
			if extends_run {
				if run_start.is_none() {
					run_start = Some(cursor);
					run_evict.clear();
				}
				if let Some(handle) = evictable_handle {
					run_evict.push((cursor, region_len, handle));
				}
				let start = run_start.unwrap();
				let run_len = cursor + region_len - start;
				if let Some((offset, padded)) =
					self.fit_in_span(start, run_len, ctx.size, ctx.alignment)
				{
					let evict = run_evict
						.iter()
						.filter(|(r_off, r_len, _)| *r_off < offset + padded && r_off + r_len > offset)
						.map(|(_, _, h)| h.clone())
						.collect();
					return Some(Placement::Generic {
						offset,
						padded_size: padded,
						evict,
					});
				}
			} else {
				run_start = None;
				run_evict.clear();
			}
			cursor += region_len;
		}
		None
	}

	/// Marks the evicted allocations lost, merges their regions into free
	/// space, then carves the placed region out. Returns the evicted handles.
	pub fn commit(
		&mut self,
		offset: DeviceSize,
		padded_size: DeviceSize,
		evict: Vec<Allocation>,
		allocation: &Allocation,
	) -> Vec<Allocation> {
		for victim in &evict {
			let backing = victim.block_backing();
			let Some((_, _, victim_offset)) = backing else {
				continue;
			};
			if victim.mark_lost() {
				self.release_region(victim_offset);
			}
		}
		self.place(offset, padded_size, allocation);
		evict
	}

	/// Inserts a used region, splitting the free span that contains it.
	/// The region must be exactly free; anything else is a caller bug.
	fn place(&mut self, offset: DeviceSize, padded_size: DeviceSize, allocation: &Allocation) {
		let (&span_start, &span_len) = self
			.free
			.range(..=offset)
			.next_back()
			.expect("placement target is not inside a free span");
		assert!(
			offset >= span_start && offset + padded_size <= span_start + span_len,
			"placement target is not exactly free"
		);

		self.free.remove(&span_start);
		if offset > span_start {
			self.free.insert(span_start, offset - span_start);
		}
		let back_start = offset + padded_size;
		let back_len = span_start + span_len - back_start;
		if back_len > 0 {
			self.free.insert(back_start, back_len);
		}
		self.free_bytes -= padded_size;

		self.used.insert(
			offset,
			UsedRegion {
				padded_size,
				alloc_size: allocation.size(),
				handle: allocation.clone(),
			},
		);
	}

	pub fn free(&mut self, allocation: &Allocation, offset: DeviceSize) -> DeviceSize {
		let region = self
			.used
			.get(&offset)
			.expect("free() called with an offset that holds no suballocation");
		debug_assert_eq!(region.handle.id(), allocation.id());
		let padded = region.padded_size;
		self.release_region(offset);
		padded
	}

	/// Removes a used region and merges the resulting free span with its
	/// immediate neighbors.
	fn release_region(&mut self, offset: DeviceSize) {
		let region = self
			.used
			.remove(&offset)
			.expect("release_region on an offset that holds no suballocation");
		self.insert_free(offset, region.padded_size);
	}

	fn insert_free(&mut self, mut offset: DeviceSize, mut len: DeviceSize) {
		self.free_bytes += len;

		// Merge with the span ending exactly at `offset`.
		if let Some((&prev_start, &prev_len)) = self.free.range(..offset).next_back() {
			if prev_start + prev_len == offset {
				self.free.remove(&prev_start);
				offset = prev_start;
				len += prev_len;
			}
		}
		// Merge with the span starting exactly at the new end.
		if let Some(&next_len) = self.free.get(&(offset + len)) {
			self.free.remove(&(offset + len));
			len += next_len;
		}
		self.free.insert(offset, len);
	}

	/// Returns the handles that were marked lost and the padded bytes reclaimed.
	pub fn make_allocations_lost(
		&mut self,
		current_frame: u32,
		frame_in_use_count: u32,
	) -> (Vec<Allocation>, DeviceSize) {
		let eligible: Vec<(DeviceSize, Allocation)> = self
			.used
			.iter()
			.filter(|(_, r)| r.handle.is_lost_eligible(current_frame, frame_in_use_count))
			.map(|(&off, r)| (off, r.handle.clone()))
			.collect();

		let mut lost = Vec::new();
		let mut bytes = 0;
		for (offset, handle) in eligible {
			if handle.mark_lost() {
				bytes += self.used.get(&offset).map(|r| r.padded_size).unwrap_or(0);
				self.release_region(offset);
				lost.push(handle);
			}
		}
		(lost, bytes)
	}

	/// `(start, length)` of the margin padding after each live region that
	/// has any. Sentinel bytes live here when corruption detection is on.
	pub fn margin_regions(&self) -> Vec<(DeviceSize, DeviceSize)> {
		self.used
			.iter()
			.filter(|(_, r)| r.padded_size > r.alloc_size)
			.map(|(&off, r)| (off + r.alloc_size, r.padded_size - r.alloc_size))
			.collect()
	}

	/// Margin padding after the region at `offset`, if any.
	pub fn padding_after(&self, offset: DeviceSize) -> Option<(DeviceSize, DeviceSize)> {
		let region = self.used.get(&offset)?;
		if region.padded_size > region.alloc_size {
			Some((offset + region.alloc_size, region.padded_size - region.alloc_size))
		} else {
			None
		}
	}

	pub fn allocations_by_offset(&self) -> Vec<(DeviceSize, Allocation)> {
		self.used
			.iter()
			.map(|(&off, r)| (off, r.handle.clone()))
			.collect()
	}

	pub fn add_to_stats(&self, info: &mut StatInfo) {
		info.block_count += 1;
		for region in self.used.values() {
			info.add_allocation(region.alloc_size);
			info.internal_fragmentation_bytes += region.padded_size - region.alloc_size;
		}
		for &len in self.free.values() {
			info.add_unused_range(len);
		}
	}

	pub fn report_regions(&self) -> Vec<RegionReport> {
		let mut regions: Vec<RegionReport> = self
			.used
			.iter()
			.map(|(&off, r)| RegionReport {
				offset: off,
				size: r.padded_size,
				kind: RegionKind::Used,
				allocation_id: Some(r.handle.id().0),
				user_data: r.handle.inner.m.lock().user_data.clone(),
			})
			.chain(self.free.iter().map(|(&off, &len)| RegionReport {
				offset: off,
				size: len,
				kind: RegionKind::Free,
				allocation_id: None,
				user_data: None,
			}))
			.collect();
		regions.sort_by_key(|r| r.offset);
		regions
	}

	#[cfg(debug_assertions)]
	pub fn validate(&self) {
		let mut cursor = 0u64;
		let mut prev_was_free = false;
		let mut free_total = 0u64;
		while cursor < self.size {
			if let Some(&len) = self.free.get(&cursor) {
				assert!(!prev_was_free, "two adjacent free spans left uncoalesced");
				assert!(len > 0);
				prev_was_free = true;
				free_total += len;
				cursor += len;
			} else if let Some(region) = self.used.get(&cursor) {
				assert!(region.padded_size > 0);
				prev_was_free = false;
				cursor += region.padded_size;
			} else {
				panic!("gap at offset {cursor}: regions do not tile the block");
			}
		}
		assert_eq!(cursor, self.size, "regions overrun the block end");
		assert_eq!(free_total, self.free_bytes);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::allocation::{AllocationBacking, AllocationCreateFlags, AllocationId, BlockId, VectorRef};
	use crate::device::DeviceMemoryHandle;

	fn request(size: DeviceSize, alignment: DeviceSize, strategy: FitStrategy) -> RequestContext {
		RequestContext {
			size,
			alignment,
			strategy,
			upper_address: false,
			can_make_other_lost: false,
			current_frame: 0,
			frame_in_use_count: 0,
		}
	}

	fn dummy_allocation(size: DeviceSize, offset: DeviceSize) -> Allocation {
		dummy_allocation_flags(size, offset, AllocationCreateFlags::empty())
	}

	fn dummy_allocation_flags(
		size: DeviceSize,
		offset: DeviceSize,
		flags: AllocationCreateFlags,
	) -> Allocation {
		Allocation::new(
			AllocationId(offset + 1_000_000 * size),
			size,
			1,
			0,
			0,
			flags,
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

	fn alloc(meta: &mut GenericMetadata, size: DeviceSize, alignment: DeviceSize) -> Option<(DeviceSize, Allocation)> {
		let placement = meta.create_request(&request(size, alignment, FitStrategy::BestFit))?;
		let offset = placement.offset();
		let a = dummy_allocation(size, offset);
		if let Placement::Generic { offset, padded_size, evict } = placement {
			meta.commit(offset, padded_size, evict, &a);
		}
		#[cfg(debug_assertions)]
		meta.validate();
		Some((offset, a))
	}

	#[test]
	fn fills_from_empty_and_round_trips() {
		let mut meta = GenericMetadata::new(1024, 0);
		assert_eq!(meta.free_size(), 1024);

		let (o1, a1) = alloc(&mut meta, 100, 1).unwrap();
		let (o2, a2) = alloc(&mut meta, 200, 1).unwrap();
		let (o3, a3) = alloc(&mut meta, 300, 1).unwrap();
		assert_eq!(meta.free_size(), 1024 - 600);
		assert!(o1 < o2 && o2 < o3);

		// Free out of order; coalescing must restore one big span.
		meta.free(&a2, o2);
		meta.free(&a1, o1);
		meta.free(&a3, o3);
		assert_eq!(meta.free_size(), 1024);
		assert_eq!(meta.allocation_count(), 0);
		#[cfg(debug_assertions)]
		meta.validate();
	}

	#[test]
	fn respects_alignment() {
		let mut meta = GenericMetadata::new(1024, 0);
		let (_, _keep) = alloc(&mut meta, 10, 1).unwrap();
		let (offset, _a) = alloc(&mut meta, 16, 64).unwrap();
		assert_eq!(offset % 64, 0);
	}

	#[test]
	fn oversized_requests_are_rejected() {
		let mut meta = GenericMetadata::new(1024, 16);
		let (_, _keep) = alloc(&mut meta, 100, 1).unwrap();

		// Larger than the block, including sizes whose span arithmetic would
		// not even fit in a u64.
		assert!(meta
			.create_request(&request(1025, 1, FitStrategy::BestFit))
			.is_none());
		assert!(meta
			.create_request(&request(DeviceSize::MAX - 50, 1, FitStrategy::BestFit))
			.is_none());
		#[cfg(debug_assertions)]
		meta.validate();
	}

	#[test]
	fn best_fit_prefers_smallest_span() {
		let mut meta = GenericMetadata::new(1000, 0);
		// Carve the block into spans of 100 and 700 with a used region between.
		let (o1, a1) = alloc(&mut meta, 100, 1).unwrap();
		let (_o2, _a2) = alloc(&mut meta, 200, 1).unwrap();
		meta.free(&a1, o1);
		// Spans now: [0,100) free, [300,1000) free.
		let placement = meta
			.create_request(&request(50, 1, FitStrategy::BestFit))
			.unwrap();
		assert_eq!(placement.offset(), 0);
		let placement = meta
			.create_request(&request(50, 1, FitStrategy::WorstFit))
			.unwrap();
		assert_eq!(placement.offset(), 300);
	}

	#[test]
	fn allocation_flush_against_block_end() {
		let mut meta = GenericMetadata::new(256, 0);
		let (offset, _a) = alloc(&mut meta, 256, 1).unwrap();
		assert_eq!(offset, 0);
		assert_eq!(meta.free_size(), 0);
		assert!(meta.create_request(&request(1, 1, FitStrategy::BestFit)).is_none());
	}

	#[test]
	fn margin_reserved_between_allocations() {
		let mut meta = GenericMetadata::new(1024, 16);
		let (o1, _a1) = alloc(&mut meta, 100, 1).unwrap();
		let (o2, _a2) = alloc(&mut meta, 100, 1).unwrap();
		assert!(o2 >= o1 + 100 + 16, "margin must separate regions");
	}

	#[test]
	fn evicts_only_lost_eligible_neighbors() {
		let mut meta = GenericMetadata::new(300, 0);
		// One evictable allocation in the middle of two pinned ones.
		let (o1, _pinned1) = alloc(&mut meta, 100, 1).unwrap();
		let p = meta
			.create_request(&request(100, 1, FitStrategy::BestFit))
			.unwrap();
		let evictable = dummy_allocation_flags(100, p.offset(), AllocationCreateFlags::CAN_BECOME_LOST);
		let o2 = p.offset();
		if let Placement::Generic { offset, padded_size, evict } = p {
			meta.commit(offset, padded_size, evict, &evictable);
		}
		let (_o3, _pinned2) = alloc(&mut meta, 100, 1).unwrap();
		assert_eq!(meta.free_size(), 0);

		// Not eligible yet: frame window still protects it.
		let mut ctx = request(100, 1, FitStrategy::BestFit);
		ctx.can_make_other_lost = true;
		ctx.current_frame = 0;
		ctx.frame_in_use_count = 2;
		assert!(meta.create_request(&ctx).is_none());

		// Frame has advanced beyond the in-use window.
		ctx.current_frame = 10;
		let placement = meta.create_request(&ctx).unwrap();
		assert_eq!(placement.offset(), o2);
		let replacement = dummy_allocation(100, o2);
		let evicted = match placement {
			Placement::Generic { offset, padded_size, evict } => {
				meta.commit(offset, padded_size, evict, &replacement)
			}
			_ => unreachable!(),
		};
		assert_eq!(evicted.len(), 1);
		assert!(evictable.is_lost());
		assert_eq!(meta.allocation_count(), 3);
		assert_eq!(o1, 0);
		#[cfg(debug_assertions)]
		meta.validate();
	}

	#[test]
	fn make_allocations_lost_sweep() {
		let mut meta = GenericMetadata::new(400, 0);
		let p = meta.create_request(&request(100, 1, FitStrategy::BestFit)).unwrap();
		let transient = dummy_allocation_flags(100, p.offset(), AllocationCreateFlags::CAN_BECOME_LOST);
		if let Placement::Generic { offset, padded_size, evict } = p {
			meta.commit(offset, padded_size, evict, &transient);
		}
		let (_o, _pinned) = alloc(&mut meta, 100, 1).unwrap();

		let (lost, bytes) = meta.make_allocations_lost(10, 1);
		assert_eq!(lost.len(), 1);
		assert_eq!(bytes, 100);
		assert!(transient.is_lost());
		assert_eq!(meta.allocation_count(), 1);
		assert_eq!(meta.free_size(), 300);
	}
}
