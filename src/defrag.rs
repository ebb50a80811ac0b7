//! Incremental defragmentation.
//!
//! Compaction runs as a series of passes so a frame budget can be honored:
//! [`begin_pass`](DefragmentationContext::begin_pass) plans relocations and
//! reserves their destinations, the caller copies the bytes (on the GPU, or
//! with [`copy_moves_on_host`](DefragmentationContext::copy_moves_on_host)
//! for host-visible memory), and
//! [`end_pass`](DefragmentationContext::end_pass) retires the old regions
//! and repoints the allocation handles. Between begin and end both the old
//! and the new region are reserved, so every allocation stays readable at
//! its old location for the whole pass.
//!
//! Only generic (free-list) vectors are compacted. Allocations the caller
//! currently has mapped stay where they are; persistent mappings made with
//! `MAPPED` are transferred to the new block automatically.

use crate::allocation::{Allocation, AllocationId};
use crate::allocator::Allocator;
use crate::block_vector::PlannedMove;
use crate::device::{DeviceMemoryHandle, MemoryPropertyFlags};
use crate::error::AllocatorError;
use crate::pool::{Pool, PoolAlgorithm};
use crate::trace::TraceEntry;
use crate::{new_fast_hash_set, DeviceSize, FastHashSet};

/// Scope and per-pass budget of a defragmentation run.
#[derive(Default)]
pub struct DefragmentationInfo {
	/// Pools to compact. Empty means every pool plus the default vectors.
	pub pools: Vec<Pool>,
	/// Restrict compaction to these allocations. Empty means no restriction.
	pub allocations: Vec<Allocation>,
	/// Upper bound on bytes copied per pass. Zero means unlimited.
	pub max_bytes_per_pass: DeviceSize,
	/// Upper bound on allocations moved per pass. Zero means unlimited.
	pub max_allocations_per_pass: usize,
}

/// One relocation the caller must copy before ending the pass: `size` bytes
/// from (`src_memory`, `src_offset`) to (`dst_memory`, `dst_offset`).
#[derive(Debug, Clone)]
pub struct DefragmentationMove {
	pub allocation: Allocation,
	pub src_memory: DeviceMemoryHandle,
	pub src_offset: DeviceSize,
	pub dst_memory: DeviceMemoryHandle,
	pub dst_offset: DeviceSize,
	pub size: DeviceSize,
}

/// Totals over a whole defragmentation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefragmentationStats {
	pub bytes_moved: DeviceSize,
	pub allocations_moved: usize,
	/// Bytes returned to the device by freeing emptied blocks.
	pub bytes_freed: DeviceSize,
	pub device_memory_blocks_freed: usize,
}

enum TargetVector {
	Default(std::sync::Arc<crate::block_vector::BlockVector>),
	Pool(Pool),
}

impl TargetVector {
	fn vector(&self) -> &crate::block_vector::BlockVector {
		match self {
			TargetVector::Default(v) => v,
			TargetVector::Pool(p) => &p.shared.vector,
		}
	}
}

#[derive(PartialEq, Eq)]
enum State {
	Idle,
	PassActive,
}

/// An in-flight defragmentation run. Dropping the context without calling
/// [`end`](Self::end) commits any active pass first.
pub struct DefragmentationContext {
	allocator: Allocator,
	targets: Vec<TargetVector>,
	filter: Option<FastHashSet<AllocationId>>,
	max_bytes_per_pass: DeviceSize,
	max_allocations_per_pass: usize,
	state: State,
	pending: Vec<(usize, Vec<PlannedMove>)>,
	last_pass_saturated: bool,
	stats: DefragmentationStats,
}

impl Allocator {
	/// Starts a defragmentation run over the given scope.
	pub fn begin_defragmentation(&self, info: DefragmentationInfo) -> DefragmentationContext {
		let mut targets = Vec::new();
		if info.pools.is_empty() {
			for vector in &self.shared.default_vectors {
				targets.push(TargetVector::Default(vector.clone()));
			}
			for pool in self.shared.pools.read().values() {
				if pool.algorithm() == PoolAlgorithm::Generic {
					targets.push(TargetVector::Pool(pool.clone()));
				}
			}
		} else {
			for pool in info.pools {
				if pool.algorithm() == PoolAlgorithm::Generic {
					targets.push(TargetVector::Pool(pool));
				} else {
					log::debug!(
						"skipping pool {:?}: only generic pools can be defragmented",
						pool.name()
					);
				}
			}
		}

		let filter = if info.allocations.is_empty() {
			None
		} else {
			let mut set = new_fast_hash_set();
			for allocation in &info.allocations {
				set.insert(allocation.id());
			}
			Some(set)
		};

		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::DefragmentationBegin);
		}

		DefragmentationContext {
			allocator: self.clone(),
			targets,
			filter,
			max_bytes_per_pass: if info.max_bytes_per_pass == 0 {
				DeviceSize::MAX
			} else {
				info.max_bytes_per_pass
			},
			max_allocations_per_pass: if info.max_allocations_per_pass == 0 {
				usize::MAX
			} else {
				info.max_allocations_per_pass
			},
			state: State::Idle,
			pending: Vec::new(),
			last_pass_saturated: false,
			stats: DefragmentationStats::default(),
		}
	}

	/// One-call defragmentation of host-visible memory: runs passes until no
	/// more compaction is possible, copying bytes through mapped pointers.
	pub fn defragment(
		&self,
		info: DefragmentationInfo,
	) -> Result<DefragmentationStats, AllocatorError> {
		let mut context = self.begin_defragmentation(info);
		context.retain_host_visible();
		loop {
			let moves = context.begin_pass()?;
			if !moves.is_empty() {
				context.copy_moves_on_host()?;
			}
			let has_more = context.end_pass()?;
			if !has_more {
				break;
			}
		}
		Ok(context.end())
	}
}

impl DefragmentationContext {
	/// Drops targets whose memory type cannot be mapped. Used by the
	/// host-copy convenience path.
	fn retain_host_visible(&mut self) {
		let properties = &self.allocator.shared.properties;
		self.targets.retain(|target| {
			let memory_type = target.vector().config.memory_type as usize;
			properties.types[memory_type]
				.properties
				.contains(MemoryPropertyFlags::HOST_VISIBLE)
		});
	}

	/// Plans one pass of relocations and reserves their destinations.
	/// Returns the copies the caller must perform before
	/// [`end_pass`](Self::end_pass).
	pub fn begin_pass(&mut self) -> Result<Vec<DefragmentationMove>, AllocatorError> {
		if self.state == State::PassActive {
			return Err(AllocatorError::DefragmentationState(
				"begin_pass called while a pass is active",
			));
		}

		let mut remaining_bytes = self.max_bytes_per_pass;
		let mut remaining_allocations = self.max_allocations_per_pass;
		let mut saturated = false;
		let mut moves = Vec::new();
		self.pending.clear();

		for (index, target) in self.targets.iter().enumerate() {
			if remaining_bytes == 0 || remaining_allocations == 0 {
				saturated = true;
				break;
			}
			let (planned, target_saturated) = target.vector().plan_defrag_moves(
				remaining_bytes,
				remaining_allocations,
				self.filter.as_ref(),
			);
			saturated |= target_saturated;
			if planned.is_empty() {
				continue;
			}
			remaining_bytes =
				remaining_bytes.saturating_sub(planned.iter().map(|m| m.size).sum::<DeviceSize>());
			remaining_allocations = remaining_allocations.saturating_sub(planned.len());
			moves.extend(planned.iter().map(|m| DefragmentationMove {
				allocation: m.allocation.clone(),
				src_memory: m.src_memory,
				src_offset: m.src_offset,
				dst_memory: m.dst_memory,
				dst_offset: m.dst_offset,
				size: m.size,
			}));
			self.pending.push((index, planned));
		}

		self.last_pass_saturated = saturated;
		self.state = State::PassActive;
		Ok(moves)
	}

	/// Copies every pending move through mapped pointers. Only valid while a
	/// pass is active and only for host-visible memory. Copies within one
	/// memory object may overlap and are handled like `memmove`.
	pub fn copy_moves_on_host(&self) -> Result<(), AllocatorError> {
		if self.state != State::PassActive {
			return Err(AllocatorError::DefragmentationState(
				"copy_moves_on_host called outside a pass",
			));
		}
		let device = &*self.allocator.shared.device;
		for (target_index, planned) in &self.pending {
			let vector = self.targets[*target_index].vector();
			for mv in planned {
				let src_base = vector.map_block(device, mv.src_block)?;
				let dst_base = vector.map_block(device, mv.dst_block)?;
				unsafe {
					std::ptr::copy(
						src_base.0.add(mv.src_offset as usize),
						dst_base.0.add(mv.dst_offset as usize),
						mv.size as usize,
					);
				}
				vector.unmap_block(device, mv.src_block)?;
				vector.unmap_block(device, mv.dst_block)?;
			}
		}
		Ok(())
	}

	/// Retires the pass: frees the source regions, repoints the moved
	/// allocations, and returns emptied blocks to the device. Returns
	/// whether another pass would find more work.
	pub fn end_pass(&mut self) -> Result<bool, AllocatorError> {
		if self.state != State::PassActive {
			return Err(AllocatorError::DefragmentationState(
				"end_pass called without an active pass",
			));
		}
		self.commit_pending();
		self.state = State::Idle;
		Ok(self.last_pass_saturated)
	}

	fn commit_pending(&mut self) {
		let device = &*self.allocator.shared.device;
		let budget = &self.allocator.shared.budget;
		for (target_index, planned) in self.pending.drain(..) {
			let vector = self.targets[target_index].vector();
			self.stats.bytes_moved += planned.iter().map(|m| m.size).sum::<DeviceSize>();
			self.stats.allocations_moved += planned.len();
			vector.commit_defrag_moves(device, &planned);
		}
		for target in &self.targets {
			let (freed, bytes) = target.vector().free_empty_blocks(device, budget);
			self.stats.device_memory_blocks_freed += freed;
			self.stats.bytes_freed += bytes;
		}
	}

	/// Finishes the run. An active pass is committed first, as if
	/// [`end_pass`](Self::end_pass) had been called.
	pub fn end(mut self) -> DefragmentationStats {
		if self.state == State::PassActive {
			self.commit_pending();
			self.state = State::Idle;
		}
		let stats = self.stats;
		if let Some(trace) = &self.allocator.shared.trace {
			trace.record(&TraceEntry::DefragmentationEnd {
				bytes_moved: stats.bytes_moved,
				allocations_moved: stats.allocations_moved,
				bytes_freed: stats.bytes_freed,
				blocks_freed: stats.device_memory_blocks_freed,
			});
		}
		stats
	}
}

impl Drop for DefragmentationContext {
	fn drop(&mut self) {
		if self.state == State::PassActive {
			self.commit_pending();
			self.state = State::Idle;
		}
	}
}
