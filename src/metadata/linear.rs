//! Linear placement: stack, double-ended stack, and ring buffer.
//!
//! Allocation is O(1): a cursor moves forward (or backward, for
//! upper-address requests) and never searches. Freeing is O(1) amortized:
//! only the current top of a stack physically reclaims space; anything
//! freed out of order leaves a hole that is reclaimed when the top recedes
//! past it.
//!
//! Two suballocation vectors express the three usage patterns, after the
//! double-stack design: `first` is the lower stack growing up from offset
//! zero; `second` is either the upper stack growing down from the block end
//! (when a request carries the upper-address flag) or the wrapped lap of a
//! ring buffer (entered automatically when the lower stack runs out of room
//! at the end while space has been freed at the front). Once the old lap is
//! fully consumed, the wrapped lap becomes the new `first` and the cycle
//! repeats.

use crate::allocation::Allocation;
use crate::stats::{RegionKind, RegionReport, StatInfo};
use crate::{align_down, align_up, DeviceSize};

use super::{Placement, RequestContext};

#[derive(Debug)]
struct LinearSuballoc {
	offset: DeviceSize,
	size: DeviceSize,
	/// `None` marks a hole: freed out of order, space not yet reclaimed.
	handle: Option<Allocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecondVectorMode {
	Empty,
	/// `second` holds the wrapped lap, growing from offset zero toward the
	/// surviving front of `first`.
	RingBuffer,
	/// `second` holds the upper stack, offsets descending from the block end.
	DoubleStack,
}

#[derive(Debug)]
pub(crate) struct LinearMetadata {
	size: DeviceSize,
	first: Vec<LinearSuballoc>,
	second: Vec<LinearSuballoc>,
	mode: SecondVectorMode,
	used_bytes: DeviceSize,
	alloc_count: usize,
}

impl LinearMetadata {
	pub fn new(size: DeviceSize) -> Self {
		LinearMetadata {
			size,
			first: Vec::new(),
			second: Vec::new(),
			mode: SecondVectorMode::Empty,
			used_bytes: 0,
			alloc_count: 0,
		}
	}

	pub fn size(&self) -> DeviceSize {
		self.size
	}

	pub fn free_size(&self) -> DeviceSize {
		self.size - self.used_bytes
	}

	pub fn allocation_count(&self) -> usize {
		self.alloc_count
	}

	/// End of the lower stack: one past the last byte in `first`.
	fn lower_end(&self) -> DeviceSize {
		self.first.last().map(|s| s.offset + s.size).unwrap_or(0)
	}

	/// Start of the upper stack: the lowest offset used by `second` in
	/// double-stack mode, or the block end.
	fn upper_start(&self) -> DeviceSize {
		if self.mode == SecondVectorMode::DoubleStack {
			self.second.last().map(|s| s.offset).unwrap_or(self.size)
		} else {
			self.size
		}
	}

	/// Offset of the oldest surviving suballocation in `first` - the limit
	/// the wrapped ring lap must not cross.
	fn ring_limit(&self) -> DeviceSize {
		self.first.first().map(|s| s.offset).unwrap_or(self.size)
	}

	pub fn create_request(&self, ctx: &RequestContext) -> Option<Placement> {
		if ctx.size > self.size {
			// Larger than the whole block; a fresh block of the same size
			// would not help either.
			return None;
		}

		if ctx.upper_address {
			// Upper-address allocation is incompatible with an active ring.
			if self.mode == SecondVectorMode::RingBuffer {
				return None;
			}
			let end = self.upper_start();
			if end < ctx.size {
				return None;
			}
			let offset = align_down(end - ctx.size, ctx.alignment);
			if offset >= self.lower_end() {
				return Some(Placement::Linear {
					offset,
					upper_address: true,
					wrap: false,
				});
			}
			return None;
		}

		if self.mode == SecondVectorMode::RingBuffer {
			// Ring active: the current lap lives in `second`.
			let base = self.second.last().map(|s| s.offset + s.size).unwrap_or(0);
			let offset = align_up(base, ctx.alignment);
			if offset + ctx.size <= self.ring_limit() {
				return Some(Placement::Linear {
					offset,
					upper_address: false,
					wrap: false,
				});
			}
			return None;
		}

		// Plain lower stack.
		let offset = align_up(self.lower_end(), ctx.alignment);
		if offset + ctx.size <= self.upper_start() {
			return Some(Placement::Linear {
				offset,
				upper_address: false,
				wrap: false,
			});
		}

		// No room at the end. If nothing uses the upper half and space has
		// been freed at the front, wrap around and start a ring lap.
		if self.mode == SecondVectorMode::Empty && !self.first.is_empty() {
			let offset = 0;
			if ctx.size <= self.ring_limit() {
				return Some(Placement::Linear {
					offset,
					upper_address: false,
					wrap: true,
				});
			}
		}
		None
	}

	pub fn commit(
		&mut self,
		offset: DeviceSize,
		upper_address: bool,
		wrap: bool,
		allocation: &Allocation,
	) {
		let entry = LinearSuballoc {
			offset,
			size: allocation.size(),
			handle: Some(allocation.clone()),
		};
		if upper_address {
			debug_assert_ne!(self.mode, SecondVectorMode::RingBuffer);
			self.mode = SecondVectorMode::DoubleStack;
			self.second.push(entry);
		} else if wrap {
			debug_assert_eq!(self.mode, SecondVectorMode::Empty);
			debug_assert!(self.second.is_empty());
			self.mode = SecondVectorMode::RingBuffer;
			self.second.push(entry);
		} else if self.mode == SecondVectorMode::RingBuffer {
			self.second.push(entry);
		} else {
			self.first.push(entry);
		}
		self.used_bytes += allocation.size();
		self.alloc_count += 1;
	}

	pub fn free(&mut self, allocation: &Allocation, offset: DeviceSize) -> DeviceSize {
		let size = allocation.size();
		let entry = self
			.first
			.iter_mut()
			.chain(self.second.iter_mut())
			.find(|s| s.offset == offset && s.handle.is_some())
			.expect("free() called with an offset that holds no suballocation");
		debug_assert_eq!(
			entry.handle.as_ref().map(|h| h.id()),
			Some(allocation.id())
		);
		entry.handle = None;
		self.used_bytes -= size;
		self.alloc_count -= 1;
		self.reclaim();
		size
	}

	/// Physically reclaims whatever holes have become reachable from a
	/// stack top or the ring front.
	fn reclaim(&mut self) {
		match self.mode {
			SecondVectorMode::RingBuffer => {
				// The old lap is consumed from its front.
				let keep_from = self
					.first
					.iter()
					.position(|s| s.handle.is_some())
					.unwrap_or(self.first.len());
				self.first.drain(..keep_from);
				// Old lap fully consumed: the wrapped lap becomes the new
				// lower stack and the ring collapses.
				if self.first.is_empty() {
					std::mem::swap(&mut self.first, &mut self.second);
					self.mode = SecondVectorMode::Empty;
				}
				// The lap tail recedes like any stack top.
				while self.first.last().map_or(false, |s| s.handle.is_none()) {
					self.first.pop();
				}
			}
			_ => {
				while self.first.last().map_or(false, |s| s.handle.is_none()) {
					self.first.pop();
				}
				// Holes at the very front are genuinely free space; dropping
				// them keeps the ring-wrap limit honest.
				let keep_from = self
					.first
					.iter()
					.position(|s| s.handle.is_some())
					.unwrap_or(self.first.len());
				self.first.drain(..keep_from);
				while self.second.last().map_or(false, |s| s.handle.is_none()) {
					self.second.pop();
				}
				if self.second.is_empty() && self.mode == SecondVectorMode::DoubleStack {
					self.mode = SecondVectorMode::Empty;
				}
			}
		}
	}

	fn live_regions_sorted(&self) -> Vec<(DeviceSize, DeviceSize, &Allocation)> {
		let mut regions: Vec<_> = self
			.first
			.iter()
			.chain(self.second.iter())
			.filter_map(|s| s.handle.as_ref().map(|h| (s.offset, s.size, h)))
			.collect();
		regions.sort_by_key(|&(off, _, _)| off);
		regions
	}

	pub fn add_to_stats(&self, info: &mut StatInfo) {
		info.block_count += 1;
		let mut cursor = 0;
		for (offset, size, _) in self.live_regions_sorted() {
			if offset > cursor {
				info.add_unused_range(offset - cursor);
			}
			info.add_allocation(size);
			cursor = offset + size;
		}
		if cursor < self.size {
			info.add_unused_range(self.size - cursor);
		}
	}

	pub fn report_regions(&self) -> Vec<RegionReport> {
		let mut out = Vec::new();
		let mut cursor = 0;
		for (offset, size, handle) in self.live_regions_sorted() {
			if offset > cursor {
				out.push(RegionReport {
					offset: cursor,
					size: offset - cursor,
					kind: RegionKind::Free,
					allocation_id: None,
					user_data: None,
				});
			}
			out.push(RegionReport {
				offset,
				size,
				kind: RegionKind::Used,
				allocation_id: Some(handle.id().0),
				user_data: handle.inner.m.lock().user_data.clone(),
			});
			cursor = offset + size;
		}
		if cursor < self.size {
			out.push(RegionReport {
				offset: cursor,
				size: self.size - cursor,
				kind: RegionKind::Free,
				allocation_id: None,
				user_data: None,
			});
		}
		out
	}

	#[cfg(debug_assertions)]
	pub fn validate(&self) {
		let regions = self.live_regions_sorted();
		let mut prev_end = 0;
		for &(offset, size, _) in &regions {
			assert!(offset >= prev_end, "overlapping linear suballocations");
			assert!(offset + size <= self.size);
			prev_end = offset + size;
		}
		if self.mode == SecondVectorMode::DoubleStack {
			let lower = self.lower_end();
			let upper = self.upper_start();
			assert!(lower <= upper, "lower stack ran into the upper stack");
		}
		assert_eq!(
			self.alloc_count,
			self.first
				.iter()
				.chain(self.second.iter())
				.filter(|s| s.handle.is_some())
				.count()
		);
	}
}
