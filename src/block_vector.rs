//! A growable sequence of blocks of one memory type, one placement
//! algorithm, shared by all allocations routed to it.
//!
//! One vector exists per memory type (the defaults) plus one per user pool.
//! All placement decisions for a vector happen under its single write lock;
//! the request/commit split in the metadata layer exists so that the whole
//! decision is made under one lock hold and can never go stale.
//!
//! The allocation path escalates in order: fit into an existing block,
//! create a new block, and as a last resort evict lost-eligible allocations.
//! New default-vector blocks follow a geometric growth schedule (an eighth
//! of the preferred size, doubling per block created) so that tiny workloads
//! do not pin whole preferred-size blocks.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::allocation::{
	Allocation, AllocationBacking, AllocationCreateFlags, AllocationId, BlockId, VectorRef,
};
use crate::block::DeviceMemoryBlock;
use crate::budget::BudgetTracker;
use crate::device::{DeviceMemoryHandle, MappedPtr, MemoryDevice};
use crate::error::AllocatorError;
use crate::metadata::{FitStrategy, Placement, RequestContext};
use crate::pool::PoolAlgorithm;
use crate::stats::{BlockDump, StatInfo};
use crate::{new_fast_hash_set, DeviceSize, FastHashSet};

pub(crate) struct BlockVectorConfig {
	pub memory_type: u32,
	pub heap_index: u32,
	pub algorithm: PoolAlgorithm,
	pub preferred_block_size: DeviceSize,
	pub min_block_count: usize,
	pub max_block_count: usize,
	/// Fixed pool block size: disables geometric growth and the
	/// halve-and-retry fallback on device allocation failure.
	pub explicit_block_size: bool,
	pub frame_in_use_count: u32,
	pub margin: DeviceSize,
	/// Whether the memory type can be mapped; gates the margin sentinel
	/// writes and corruption checks.
	pub host_visible: bool,
}

/// Byte written into every margin region of a host-visible vector. A margin
/// byte that no longer holds this value means a caller wrote past the end of
/// its allocation.
const MARGIN_FILL: u8 = 0x8e;

struct VectorInner {
	blocks: Vec<DeviceMemoryBlock>,
	next_block_id: u64,
	/// Blocks ever created, including since-freed ones; drives growth.
	created_count: u32,
}

/// One intended relocation, planned against reserved destination space.
///
/// Between planning and commit the source region stays live and the
/// destination region is already reserved in its block's metadata, so the
/// byte copy can happen with both sides pinned.
pub(crate) struct PlannedMove {
	pub allocation: Allocation,
	pub src_block: BlockId,
	pub src_offset: DeviceSize,
	pub src_memory: DeviceMemoryHandle,
	pub dst_block: BlockId,
	pub dst_offset: DeviceSize,
	pub dst_memory: DeviceMemoryHandle,
	pub size: DeviceSize,
}

pub(crate) struct BlockVector {
	pub config: BlockVectorConfig,
	vector_ref: VectorRef,
	inner: RwLock<VectorInner>,
	/// Allocations this vector has ever marked lost, by eviction or sweep.
	lost_count: AtomicUsize,
}

impl BlockVector {
	pub fn new(config: BlockVectorConfig, vector_ref: VectorRef) -> Self {
		BlockVector {
			config,
			vector_ref,
			inner: RwLock::new(VectorInner {
				blocks: Vec::new(),
				next_block_id: 1,
				created_count: 0,
			}),
			lost_count: AtomicUsize::new(0),
		}
	}

	pub fn vector_ref(&self) -> VectorRef {
		self.vector_ref
	}

	/// Pool preallocation: create blocks up front until `min_block_count`.
	pub fn ensure_min_blocks(
		&self,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
		heap_limit: Option<DeviceSize>,
	) -> Result<(), AllocatorError> {
		let mut inner = self.inner.write();
		while inner.blocks.len() < self.config.min_block_count {
			self.create_block(&mut inner, device, budget, heap_limit, 0, false)?;
		}
		Ok(())
	}

	pub fn allocate(
		&self,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
		heap_limit: Option<DeviceSize>,
		id: AllocationId,
		size: DeviceSize,
		alignment: DeviceSize,
		flags: AllocationCreateFlags,
		user_data: Option<String>,
		current_frame: u32,
	) -> Result<Allocation, AllocatorError> {
		let mut ctx = RequestContext {
			size,
			alignment,
			strategy: FitStrategy::from_flags(flags),
			upper_address: flags.contains(AllocationCreateFlags::UPPER_ADDRESS),
			can_make_other_lost: false,
			current_frame,
			frame_in_use_count: self.config.frame_in_use_count,
		};

		let mut inner = self.inner.write();

		if let Some(allocation) =
			self.try_existing_blocks(&mut inner, device, budget, &ctx, id, flags, &user_data)?
		{
			return Ok(allocation);
		}

		if !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
			&& inner.blocks.len() < self.config.max_block_count
		{
			let min_size = self.min_block_size_for(size, alignment);
			let within_budget = flags.contains(AllocationCreateFlags::WITHIN_BUDGET);
			match self.create_block(&mut inner, device, budget, heap_limit, min_size, within_budget)
			{
				Ok(index) => {
					// A fresh block sized to fit must take the request.
					if let Some(placement) = inner.blocks[index].metadata.create_request(&ctx) {
						return self.commit_into_block(
							&mut inner, index, placement, device, budget, &ctx, id, flags,
							&user_data,
						);
					}
					log::error!(
						"new block of {} bytes rejected a {} byte request (memory type {})",
						inner.blocks[index].size,
						size,
						self.config.memory_type
					);
				}
				Err(AllocatorError::OutOfDeviceMemory) => {}
				Err(other) => return Err(other),
			}
		}

		// Last resort: the same scan, but allowed to evict lost-eligible
		// neighbors.
		if flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST) {
			ctx.can_make_other_lost = true;
			if let Some(allocation) =
				self.try_existing_blocks(&mut inner, device, budget, &ctx, id, flags, &user_data)?
			{
				return Ok(allocation);
			}
		}

		Err(AllocatorError::OutOfDeviceMemory)
	}

	fn try_existing_blocks(
		&self,
		inner: &mut VectorInner,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
		ctx: &RequestContext,
		id: AllocationId,
		flags: AllocationCreateFlags,
		user_data: &Option<String>,
	) -> Result<Option<Allocation>, AllocatorError> {
		// Newest blocks have the most free space, so scan them first;
		// first-fit promises the lowest address and scans forward instead.
		let count = inner.blocks.len();
		let order: Vec<usize> = if ctx.strategy == FitStrategy::FirstFit {
			(0..count).collect()
		} else {
			(0..count).rev().collect()
		};
		for index in order {
			let Some(placement) = inner.blocks[index].metadata.create_request(ctx) else {
				continue;
			};
			return self
				.commit_into_block(inner, index, placement, device, budget, ctx, id, flags, user_data)
				.map(Some);
		}
		Ok(None)
	}

	#[allow(clippy::too_many_arguments)]
	fn commit_into_block(
		&self,
		inner: &mut VectorInner,
		index: usize,
		placement: Placement,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
		ctx: &RequestContext,
		id: AllocationId,
		flags: AllocationCreateFlags,
		user_data: &Option<String>,
	) -> Result<Allocation, AllocatorError> {
		let block = &mut inner.blocks[index];
		let offset = placement.offset();
		let margin_span = match &placement {
			Placement::Generic { padded_size, .. } if *padded_size > ctx.size => {
				Some((offset + ctx.size, padded_size - ctx.size))
			}
			_ => None,
		};
		let allocation = Allocation::new(
			id,
			ctx.size,
			ctx.alignment,
			self.config.memory_type,
			self.config.heap_index,
			flags,
			AllocationBacking::Block {
				vector: self.vector_ref,
				block: block.id,
				offset,
				memory: block.memory,
			},
			user_data.clone(),
			ctx.current_frame,
		);

		let evicted = block.metadata.commit(placement, &allocation);
		for victim in &evicted {
			budget.remove_allocation(self.config.heap_index, victim.size());
		}
		if !evicted.is_empty() {
			self.lost_count.fetch_add(evicted.len(), Ordering::Relaxed);
			log::debug!(
				"evicted {} lost-eligible allocations to place {} bytes in block {:?}",
				evicted.len(),
				ctx.size,
				block.id
			);
		}
		budget.add_allocation(self.config.heap_index, ctx.size);

		if flags.contains(AllocationCreateFlags::MAPPED) {
			match block.map(device) {
				Ok(base) => {
					let mut m = allocation.inner.m.lock();
					m.map_count = 1;
					m.mapped_ptr = Some(MappedPtr(unsafe { base.0.add(offset as usize) }));
				}
				Err(e) => {
					block.metadata.free(&allocation, offset);
					budget.remove_allocation(self.config.heap_index, ctx.size);
					return Err(e);
				}
			}
		}

		if let Some((start, len)) = margin_span {
			if self.config.host_visible {
				self.write_margin_fill(block, device, start, len);
			}
		}

		#[cfg(debug_assertions)]
		block.metadata.validate();
		Ok(allocation)
	}

	/// Fills a margin region with the sentinel byte. Best effort: a mapping
	/// failure here only disables detection for this region.
	fn write_margin_fill(
		&self,
		block: &DeviceMemoryBlock,
		device: &dyn MemoryDevice,
		start: DeviceSize,
		len: DeviceSize,
	) {
		match block.map(device) {
			Ok(base) => {
				unsafe {
					std::ptr::write_bytes(base.0.add(start as usize), MARGIN_FILL, len as usize);
				}
				if let Err(e) = block.unmap(device) {
					log::error!("releasing margin fill mapping failed: {}", e);
				}
			}
			Err(e) => {
				log::debug!("could not map block {:?} to fill a margin: {}", block.id, e);
			}
		}
	}

	/// Verifies the sentinel bytes of every margin region in the vector.
	/// Returns how many regions were checked; the first mismatch aborts the
	/// scan with [`AllocatorError::CorruptedMargin`].
	pub fn check_corruption(&self, device: &dyn MemoryDevice) -> Result<usize, AllocatorError> {
		if self.config.margin == 0 || !self.config.host_visible {
			return Ok(0);
		}
		let inner = self.inner.read();
		let mut checked = 0;
		for block in &inner.blocks {
			let regions = block.metadata.margin_regions();
			if regions.is_empty() {
				continue;
			}
			let base = block.map(device)?;
			for (start, len) in regions {
				let bytes = unsafe {
					std::slice::from_raw_parts(base.0.add(start as usize), len as usize)
				};
				if bytes.iter().any(|&b| b != MARGIN_FILL) {
					if let Err(e) = block.unmap(device) {
						log::error!("releasing corruption check mapping failed: {}", e);
					}
					return Err(AllocatorError::CorruptedMargin(start));
				}
				checked += 1;
			}
			if let Err(e) = block.unmap(device) {
				log::error!("releasing corruption check mapping failed: {}", e);
			}
		}
		Ok(checked)
	}

	pub fn lost_allocation_count(&self) -> usize {
		self.lost_count.load(Ordering::Relaxed)
	}

	/// Smallest block that can hold a request of this size and alignment.
	/// Buddy blocks must cover the rounded power-of-two node.
	fn min_block_size_for(&self, size: DeviceSize, alignment: DeviceSize) -> DeviceSize {
		match self.config.algorithm {
			// A rounded size too large for u64 can never be served; MAX makes
			// every block-creation path below report out of device memory.
			PoolAlgorithm::Buddy => size
				.max(alignment)
				.max(crate::metadata::buddy::MIN_NODE_SIZE)
				.checked_next_power_of_two()
				.unwrap_or(DeviceSize::MAX),
			_ => size,
		}
	}

	/// Creates one block and appends it. `min_size` of zero means "the
	/// scheduled size, whatever it is" (used by pool preallocation).
	fn create_block(
		&self,
		inner: &mut VectorInner,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
		heap_limit: Option<DeviceSize>,
		min_size: DeviceSize,
		within_budget: bool,
	) -> Result<usize, AllocatorError> {
		let mut block_size = if self.config.explicit_block_size {
			if min_size > self.config.preferred_block_size {
				return Err(AllocatorError::OutOfDeviceMemory);
			}
			self.config.preferred_block_size
		} else {
			let shift = 3u32 - inner.created_count.min(3);
			(self.config.preferred_block_size >> shift).max(min_size)
		};

		let mut limit = heap_limit;
		if within_budget {
			if let Some(budgets) = device.heap_budgets() {
				let device_budget = budgets[self.config.heap_index as usize];
				limit = Some(limit.map_or(device_budget, |l| l.min(device_budget)));
			}
		}

		loop {
			let memory = if budget.try_reserve_block(self.config.heap_index, block_size, limit) {
				match device.allocate_memory(self.config.memory_type, block_size) {
					Ok(memory) => Some(memory),
					Err(e) => {
						budget.remove_block(self.config.heap_index, block_size);
						log::debug!("device refused a {} byte block: {}", block_size, e);
						None
					}
				}
			} else {
				None
			};

			if let Some(memory) = memory {
				let id = BlockId(inner.next_block_id);
				inner.next_block_id += 1;
				inner.created_count += 1;
				log::debug!(
					"created block {:?} of {} bytes in memory type {}",
					id,
					block_size,
					self.config.memory_type
				);
				inner.blocks.push(DeviceMemoryBlock::new(
					id,
					memory,
					self.config.memory_type,
					self.config.heap_index,
					self.config.algorithm,
					block_size,
					self.config.margin,
				));
				return Ok(inner.blocks.len() - 1);
			}

			// Halve and retry, as long as the request still fits.
			let halved = block_size / 2;
			if self.config.explicit_block_size || halved < min_size.max(1) {
				return Err(AllocatorError::OutOfDeviceMemory);
			}
			block_size = halved;
		}
	}

	/// Releases the allocation's region. `map_refs` is how many mapping
	/// references the allocation held; they are returned to the block here.
	pub fn free(
		&self,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
		allocation: &Allocation,
		block_id: BlockId,
		offset: DeviceSize,
		map_refs: u32,
	) {
		let mut inner = self.inner.write();
		let Some(index) = inner.blocks.iter().position(|b| b.id == block_id) else {
			log::error!("freed allocation referenced unknown block {:?}", block_id);
			return;
		};

		for _ in 0..map_refs {
			if let Err(e) = inner.blocks[index].unmap(device) {
				log::error!("releasing mapping of freed allocation failed: {}", e);
				break;
			}
		}
		inner.blocks[index].metadata.free(allocation, offset);
		budget.remove_allocation(self.config.heap_index, allocation.size());
		#[cfg(debug_assertions)]
		inner.blocks[index].metadata.validate();

		if inner.blocks[index].metadata.is_empty() {
			self.maybe_release_block(&mut inner, index, device, budget);
		}
	}

	/// Hysteresis: one empty block is kept as a hot spare, a second one is
	/// returned to the device. Never drops below `min_block_count`.
	fn maybe_release_block(
		&self,
		inner: &mut VectorInner,
		index: usize,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
	) {
		if inner.blocks.len() <= self.config.min_block_count {
			return;
		}
		let another_empty = inner
			.blocks
			.iter()
			.enumerate()
			.any(|(i, b)| i != index && b.metadata.is_empty());
		if !another_empty {
			return;
		}
		let block = inner.blocks.remove(index);
		budget.remove_block(self.config.heap_index, block.size);
		log::debug!("released empty block {:?} ({} bytes)", block.id, block.size);
		block.destroy(device);
	}

	/// Frees every empty block above `min_block_count`, no spare kept.
	/// Used after defragmentation, where emptied blocks are the whole point.
	pub fn free_empty_blocks(
		&self,
		device: &dyn MemoryDevice,
		budget: &BudgetTracker,
	) -> (usize, DeviceSize) {
		let mut inner = self.inner.write();
		let mut freed = 0;
		let mut bytes = 0;
		let mut index = 0;
		while index < inner.blocks.len() {
			if inner.blocks[index].metadata.is_empty()
				&& inner.blocks.len() > self.config.min_block_count
			{
				let block = inner.blocks.remove(index);
				bytes += block.size;
				budget.remove_block(self.config.heap_index, block.size);
				block.destroy(device);
				freed += 1;
			} else {
				index += 1;
			}
		}
		(freed, bytes)
	}

	/// Sweeps every block for lost-eligible allocations and reclaims them.
	pub fn make_allocations_lost(
		&self,
		budget: &BudgetTracker,
		current_frame: u32,
	) -> (usize, DeviceSize) {
		let mut inner = self.inner.write();
		let mut count = 0;
		let mut bytes = 0;
		for block in &mut inner.blocks {
			let (lost, reclaimed) = block
				.metadata
				.make_allocations_lost(current_frame, self.config.frame_in_use_count);
			for handle in &lost {
				budget.remove_allocation(self.config.heap_index, handle.size());
			}
			count += lost.len();
			bytes += reclaimed;
		}
		self.lost_count.fetch_add(count, Ordering::Relaxed);
		(count, bytes)
	}

	/// Takes one mapping reference on the given block.
	pub fn map_block(
		&self,
		device: &dyn MemoryDevice,
		block_id: BlockId,
	) -> Result<MappedPtr, AllocatorError> {
		let inner = self.inner.read();
		let block = inner
			.blocks
			.iter()
			.find(|b| b.id == block_id)
			.ok_or(AllocatorError::AllocationLost)?;
		block.map(device)
	}

	/// Returns one mapping reference on the given block.
	pub fn unmap_block(
		&self,
		device: &dyn MemoryDevice,
		block_id: BlockId,
	) -> Result<(), AllocatorError> {
		let inner = self.inner.read();
		let block = inner
			.blocks
			.iter()
			.find(|b| b.id == block_id)
			.ok_or(AllocatorError::AllocationLost)?;
		block.unmap(device)
	}

	/// Maps an allocation, bumping both the block's and the allocation's
	/// mapping counts. Locks are taken vector-then-allocation, the same
	/// order every other path uses.
	pub fn map_allocation(
		&self,
		device: &dyn MemoryDevice,
		allocation: &Allocation,
	) -> Result<*mut u8, AllocatorError> {
		let inner = self.inner.read();
		let mut m = allocation.inner.m.lock();
		let AllocationBacking::Block { block, offset, .. } = m.backing else {
			return Err(AllocatorError::AllocationLost);
		};
		let b = inner
			.blocks
			.iter()
			.find(|b| b.id == block)
			.ok_or(AllocatorError::AllocationLost)?;
		let base = b.map(device)?;
		let ptr = unsafe { base.0.add(offset as usize) };
		m.map_count += 1;
		m.mapped_ptr = Some(MappedPtr(ptr));
		Ok(ptr)
	}

	/// Releases one caller mapping of an allocation. The persistent mapping
	/// reference of a `MAPPED` allocation is never released this way.
	pub fn unmap_allocation(
		&self,
		device: &dyn MemoryDevice,
		allocation: &Allocation,
	) -> Result<(), AllocatorError> {
		let inner = self.inner.read();
		let mut m = allocation.inner.m.lock();
		let persistent = allocation
			.inner
			.flags
			.contains(AllocationCreateFlags::MAPPED) as u32;
		if m.map_count <= persistent {
			return Err(AllocatorError::NotMapped);
		}
		let AllocationBacking::Block { block, .. } = m.backing else {
			return Err(AllocatorError::AllocationLost);
		};
		let b = inner
			.blocks
			.iter()
			.find(|b| b.id == block)
			.ok_or(AllocatorError::AllocationLost)?;
		b.unmap(device)?;
		m.map_count -= 1;
		if m.map_count == 0 {
			m.mapped_ptr = None;
		}
		Ok(())
	}

	// --- defragmentation ---------------------------------------------------

	/// Plans relocations that compact the vector: walk allocations from the
	/// last block and highest offsets, pull each to the earliest spot that
	/// can hold it (first-fit over earlier blocks), and reserve that spot in
	/// the destination metadata. Only generic vectors participate.
	///
	/// Returns the planned moves and whether a per-pass limit cut the plan
	/// short (more passes would find more work).
	pub fn plan_defrag_moves(
		&self,
		max_bytes: DeviceSize,
		max_allocations: usize,
		filter: Option<&FastHashSet<AllocationId>>,
	) -> (Vec<PlannedMove>, bool) {
		if self.config.algorithm != PoolAlgorithm::Generic {
			return (Vec::new(), false);
		}
		let mut inner = self.inner.write();
		let mut moves: Vec<PlannedMove> = Vec::new();
		let mut planned_ids = new_fast_hash_set();
		let mut bytes: DeviceSize = 0;
		let mut saturated = false;

		'blocks: for src_index in (0..inner.blocks.len()).rev() {
			let mut candidates = inner.blocks[src_index].metadata.allocations_by_offset();
			candidates.reverse();
			let src_block = inner.blocks[src_index].id;
			let src_memory = inner.blocks[src_index].memory;

			for (src_offset, allocation) in candidates {
				if let Some(filter) = filter {
					if !filter.contains(&allocation.id()) {
						continue;
					}
				}
				if planned_ids.contains(&allocation.id()) {
					continue;
				}
				// A mapping the caller holds pins the allocation in place;
				// the allocator's own persistent mapping is transferred at
				// commit instead.
				{
					let m = allocation.inner.m.lock();
					let persistent =
						allocation.inner.flags.contains(AllocationCreateFlags::MAPPED) as u32;
					if m.map_count > persistent {
						continue;
					}
				}

				if moves.len() >= max_allocations
					|| bytes.saturating_add(allocation.size()) > max_bytes
				{
					saturated = true;
					break 'blocks;
				}

				let ctx = RequestContext {
					size: allocation.size(),
					alignment: allocation.inner.alignment,
					strategy: FitStrategy::FirstFit,
					upper_address: false,
					can_make_other_lost: false,
					current_frame: 0,
					frame_in_use_count: 0,
				};
				let mut planned: Option<(usize, Placement)> = None;
				for dst_index in 0..=src_index {
					let Some(p) = inner.blocks[dst_index].metadata.create_request(&ctx) else {
						continue;
					};
					// Only strictly-earlier destinations compact anything.
					if dst_index < src_index || p.offset() < src_offset {
						planned = Some((dst_index, p));
					}
					break;
				}
				let Some((dst_index, placement)) = planned else {
					continue;
				};

				let dst_offset = placement.offset();
				let dst_block = inner.blocks[dst_index].id;
				let dst_memory = inner.blocks[dst_index].memory;
				inner.blocks[dst_index].metadata.commit(placement, &allocation);

				bytes += allocation.size();
				planned_ids.insert(allocation.id());
				moves.push(PlannedMove {
					size: allocation.size(),
					allocation,
					src_block,
					src_offset,
					src_memory,
					dst_block,
					dst_offset,
					dst_memory,
				});
			}
		}
		(moves, saturated)
	}

	/// Completes planned moves after their bytes were copied: frees the
	/// source regions, repoints the allocations at their destinations, and
	/// transfers any persistent mapping references.
	pub fn commit_defrag_moves(&self, device: &dyn MemoryDevice, moves: &[PlannedMove]) {
		let mut inner = self.inner.write();
		for mv in moves {
			let src_index = inner.blocks.iter().position(|b| b.id == mv.src_block);
			let dst_index = inner.blocks.iter().position(|b| b.id == mv.dst_block);
			let (Some(src_index), Some(dst_index)) = (src_index, dst_index) else {
				log::error!("defragmentation move references a vanished block");
				continue;
			};

			inner.blocks[src_index].metadata.free(&mv.allocation, mv.src_offset);

			let mut m = mv.allocation.inner.m.lock();
			m.backing = AllocationBacking::Block {
				vector: self.vector_ref,
				block: mv.dst_block,
				offset: mv.dst_offset,
				memory: mv.dst_memory,
			};

			let refs = m.map_count;
			if refs > 0 {
				let mut base = None;
				for _ in 0..refs {
					match inner.blocks[dst_index].map(device) {
						Ok(ptr) => base = Some(ptr),
						Err(e) => {
							log::error!("remapping a moved allocation failed: {}", e);
							break;
						}
					}
					if let Err(e) = inner.blocks[src_index].unmap(device) {
						log::error!("releasing a moved allocation's old mapping failed: {}", e);
					}
				}
				m.mapped_ptr = base
					.map(|b| MappedPtr(unsafe { b.0.add(mv.dst_offset as usize) }));
			}
			drop(m);

			if self.config.margin > 0 && self.config.host_visible {
				if let Some((start, len)) =
					inner.blocks[dst_index].metadata.padding_after(mv.dst_offset)
				{
					self.write_margin_fill(&inner.blocks[dst_index], device, start, len);
				}
			}

			#[cfg(debug_assertions)]
			{
				inner.blocks[src_index].metadata.validate();
				inner.blocks[dst_index].metadata.validate();
			}
		}
	}

	// --- introspection -----------------------------------------------------

	pub fn allocation_count(&self) -> usize {
		let inner = self.inner.read();
		inner.blocks.iter().map(|b| b.metadata.allocation_count()).sum()
	}

	pub fn block_count(&self) -> usize {
		self.inner.read().blocks.len()
	}

	pub fn add_to_stats(&self, info: &mut StatInfo) {
		let inner = self.inner.read();
		for block in &inner.blocks {
			block.metadata.add_to_stats(info);
		}
	}

	pub fn dump_blocks(&self) -> Vec<BlockDump> {
		let inner = self.inner.read();
		inner
			.blocks
			.iter()
			.map(|b| BlockDump {
				id: b.id.0,
				size: b.size,
				allocation_count: b.metadata.allocation_count(),
				regions: b.metadata.report_regions(),
			})
			.collect()
	}

	/// Returns every block to the device. Live allocations at this point are
	/// leaks; they are logged and their memory freed regardless.
	pub fn destroy(&self, device: &dyn MemoryDevice, budget: &BudgetTracker) {
		let mut inner = self.inner.write();
		for block in inner.blocks.drain(..) {
			let leaked = block.metadata.allocation_count();
			if leaked > 0 {
				log::warn!(
					"destroying block {:?} with {} live allocations still in it",
					block.id,
					leaked
				);
			}
			budget.remove_block(self.config.heap_index, block.size);
			block.destroy(device);
		}
	}
}
