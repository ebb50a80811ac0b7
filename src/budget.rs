//! Per-heap budget accounting.
//!
//! Two counters per heap, maintained with relaxed atomics: bytes held in
//! device memory blocks (what the driver actually sees) and bytes handed out
//! to live suballocations (what the application is actually using). The gap
//! between the two is the allocator's own overhead plus free space kept for
//! reuse.
//!
//! Heap size limits are enforced with a reserve-then-rollback scheme so two
//! racing block creations can never both slip under a nearly-full limit.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::device::MemoryDevice;
use crate::DeviceSize;

/// Budget snapshot for one heap.
#[derive(Debug, Clone, Serialize)]
pub struct HeapBudget {
	pub heap_index: u32,
	/// Total size of the heap as reported by the device.
	pub heap_size: DeviceSize,
	/// Bytes currently held in device memory objects created by this allocator.
	pub block_bytes: DeviceSize,
	/// Bytes currently occupied by live suballocations and dedicated allocations.
	pub allocation_bytes: DeviceSize,
	/// Bytes this process may use from the heap. Device-reported when the
	/// platform exposes live budgets, otherwise the heap size.
	pub device_budget: DeviceSize,
}

/// Per-heap budget snapshot across the whole device.
#[derive(Debug, Clone, Serialize)]
pub struct Budget {
	pub heaps: Vec<HeapBudget>,
}

struct HeapCounters {
	block_bytes: AtomicU64,
	allocation_bytes: AtomicU64,
}

pub(crate) struct BudgetTracker {
	heaps: Vec<HeapCounters>,
}

impl BudgetTracker {
	pub fn new(heap_count: usize) -> Self {
		BudgetTracker {
			heaps: (0..heap_count)
				.map(|_| HeapCounters {
					block_bytes: AtomicU64::new(0),
					allocation_bytes: AtomicU64::new(0),
				})
				.collect(),
		}
	}

	/// Reserves `size` block bytes against `limit`, if any. On success the
	/// counter already includes the new block; a failed reservation leaves
	/// the counter unchanged. The optimistic add means a concurrent reserve
	/// can transiently observe an overshoot, but never commit one.
	pub fn try_reserve_block(
		&self,
		heap_index: u32,
		size: DeviceSize,
		limit: Option<DeviceSize>,
	) -> bool {
		let counter = &self.heaps[heap_index as usize].block_bytes;
		let prev = counter.fetch_add(size, Ordering::Relaxed);
		if let Some(limit) = limit {
			if prev.saturating_add(size) > limit {
				counter.fetch_sub(size, Ordering::Relaxed);
				return false;
			}
		}
		true
	}

	/// Undo a reservation whose device allocation failed, or account a freed block.
	pub fn remove_block(&self, heap_index: u32, size: DeviceSize) {
		self.heaps[heap_index as usize]
			.block_bytes
			.fetch_sub(size, Ordering::Relaxed);
	}

	pub fn add_allocation(&self, heap_index: u32, size: DeviceSize) {
		self.heaps[heap_index as usize]
			.allocation_bytes
			.fetch_add(size, Ordering::Relaxed);
	}

	pub fn remove_allocation(&self, heap_index: u32, size: DeviceSize) {
		self.heaps[heap_index as usize]
			.allocation_bytes
			.fetch_sub(size, Ordering::Relaxed);
	}

	pub fn block_bytes(&self, heap_index: u32) -> DeviceSize {
		self.heaps[heap_index as usize].block_bytes.load(Ordering::Relaxed)
	}

	pub fn snapshot(&self, device: &dyn MemoryDevice) -> Budget {
		let props = device.memory_properties();
		let device_budgets = device.heap_budgets();
		Budget {
			heaps: self
				.heaps
				.iter()
				.enumerate()
				.map(|(i, counters)| {
					let heap_size = props.heaps[i].size;
					HeapBudget {
						heap_index: i as u32,
						heap_size,
						block_bytes: counters.block_bytes.load(Ordering::Relaxed),
						allocation_bytes: counters.allocation_bytes.load(Ordering::Relaxed),
						device_budget: device_budgets
							.as_ref()
							.map(|b| b[i])
							.unwrap_or(heap_size),
					}
				})
				.collect(),
		}
	}
}
