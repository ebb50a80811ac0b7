//! The allocator front end: request validation, memory type selection,
//! routing between default block vectors, user pools and dedicated
//! allocations, frame tracking, budgets and statistics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::allocation::{
	Allocation, AllocationBacking, AllocationCreateFlags, AllocationCreateInfo, AllocationId,
	AllocationInfo, VectorRef,
};
use crate::block_vector::{BlockVector, BlockVectorConfig};
use crate::budget::{Budget, BudgetTracker};
use crate::device::{DeviceMemoryHandle, MemoryDevice, MemoryProperties, MemoryPropertyFlags};
use crate::error::AllocatorError;
use crate::pool::{Pool, PoolAlgorithm, PoolCreateInfo, PoolShared};
use crate::stats::{
	AllocatorDump, AllocatorStats, MemoryTypeDump, PoolDump, StatInfo,
};
use crate::trace::{TraceEntry, TraceRecorder};
use crate::{new_fast_hash_map, DeviceSize, FastHashMap};

/// Preferred size of default-vector blocks when the caller does not override it.
const DEFAULT_PREFERRED_BLOCK_SIZE: DeviceSize = 256 * 1024 * 1024;

/// Configuration of a new [`Allocator`].
pub struct AllocatorCreateInfo {
	/// Target size of full-grown blocks in the default vectors. Zero means
	/// 256 MiB. Blocks start at an eighth of this and grow geometrically.
	pub preferred_block_size: DeviceSize,
	/// How many frames back an allocation must have been touched before it
	/// is eligible to be marked lost.
	pub frame_in_use_count: u32,
	/// Optional hard cap of bytes the allocator may hold per heap, indexed
	/// by heap. Enforced before any device call.
	pub heap_size_limits: Option<Vec<Option<DeviceSize>>>,
	/// Debug margin reserved after each suballocation in the default
	/// vectors. Zero in release use.
	pub margin: DeviceSize,
	/// Sink for the JSON-lines operation trace, if recording is wanted.
	pub trace_sink: Option<Box<dyn std::io::Write + Send>>,
}

impl Default for AllocatorCreateInfo {
	fn default() -> Self {
		AllocatorCreateInfo {
			preferred_block_size: 0,
			frame_in_use_count: 0,
			heap_size_limits: None,
			margin: 0,
			trace_sink: None,
		}
	}
}

/// What a resource needs from its memory, as reported by the graphics API.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
	pub size: DeviceSize,
	/// Power of two.
	pub alignment: DeviceSize,
	/// Bitmask of acceptable memory type indices.
	pub memory_type_bits: u32,
	/// The API suggests a dedicated memory object for this resource.
	pub prefers_dedicated: bool,
	/// The API requires a dedicated memory object for this resource.
	pub requires_dedicated: bool,
}

pub(crate) struct AllocatorShared {
	pub device: Arc<dyn MemoryDevice>,
	pub properties: MemoryProperties,
	pub budget: BudgetTracker,
	/// One generic vector per memory type, index-aligned with `properties.types`.
	pub default_vectors: Vec<Arc<BlockVector>>,
	pub pools: RwLock<FastHashMap<u64, Pool>>,
	/// Dedicated allocations by id, for stats and leak detection.
	pub dedicated: Mutex<FastHashMap<u64, Allocation>>,
	pub current_frame: AtomicU32,
	pub next_allocation_id: AtomicU64,
	pub next_pool_id: AtomicU64,
	pub frame_in_use_count: u32,
	pub preferred_block_size: DeviceSize,
	pub heap_limits: Vec<Option<DeviceSize>>,
	pub trace: Option<TraceRecorder>,
}

enum RoutedVector {
	Default(Arc<BlockVector>),
	Pool(Pool),
}

impl RoutedVector {
	fn vector(&self) -> &BlockVector {
		match self {
			RoutedVector::Default(v) => v,
			RoutedVector::Pool(p) => &p.shared.vector,
		}
	}
}

/// The allocator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Allocator {
	pub(crate) shared: Arc<AllocatorShared>,
}

impl Allocator {
	pub fn new(
		device: Arc<dyn MemoryDevice>,
		info: AllocatorCreateInfo,
	) -> Result<Allocator, AllocatorError> {
		let properties = device.memory_properties().clone();
		let heap_count = properties.heaps.len();

		let heap_limits = match info.heap_size_limits {
			Some(limits) => {
				if limits.len() != heap_count {
					return Err(AllocatorError::HeapLimitMismatch(limits.len(), heap_count));
				}
				limits
			}
			None => vec![None; heap_count],
		};

		let preferred_block_size = if info.preferred_block_size == 0 {
			DEFAULT_PREFERRED_BLOCK_SIZE
		} else {
			info.preferred_block_size
		};

		let default_vectors = properties
			.types
			.iter()
			.enumerate()
			.map(|(index, memory_type)| {
				Arc::new(BlockVector::new(
					BlockVectorConfig {
						memory_type: index as u32,
						heap_index: memory_type.heap_index,
						algorithm: PoolAlgorithm::Generic,
						preferred_block_size,
						min_block_count: 0,
						max_block_count: usize::MAX,
						explicit_block_size: false,
						frame_in_use_count: info.frame_in_use_count,
						margin: info.margin,
						host_visible: memory_type
							.properties
							.contains(MemoryPropertyFlags::HOST_VISIBLE),
					},
					VectorRef::Default(index as u32),
				))
			})
			.collect();

		log::info!(
			"allocator created: {} memory types over {} heaps, preferred block size {}",
			properties.types.len(),
			heap_count,
			preferred_block_size
		);

		Ok(Allocator {
			shared: Arc::new(AllocatorShared {
				budget: BudgetTracker::new(heap_count),
				properties,
				device,
				default_vectors,
				pools: RwLock::new(new_fast_hash_map()),
				dedicated: Mutex::new(new_fast_hash_map()),
				current_frame: AtomicU32::new(0),
				next_allocation_id: AtomicU64::new(1),
				next_pool_id: AtomicU64::new(1),
				frame_in_use_count: info.frame_in_use_count,
				preferred_block_size,
				heap_limits,
				trace: info.trace_sink.map(TraceRecorder::new),
			}),
		})
	}

	// --- allocation --------------------------------------------------------

	pub fn allocate_memory(
		&self,
		requirements: &MemoryRequirements,
		create_info: &AllocationCreateInfo,
	) -> Result<Allocation, AllocatorError> {
		self.validate_request(requirements, create_info)?;
		let current_frame = self.shared.current_frame.load(Ordering::Relaxed);
		let flags = create_info.flags;

		if let Some(pool) = &create_info.pool {
			let memory_type = pool.shared.vector.config.memory_type;
			let type_props = self.shared.properties.types[memory_type as usize].properties;
			if requirements.memory_type_bits & (1u32 << memory_type) == 0
				|| !type_props.contains(create_info.required_flags)
			{
				return Err(AllocatorError::NoSuitableMemoryType {
					mask: requirements.memory_type_bits,
					required: create_info.required_flags,
				});
			}
			let heap_index = pool.shared.vector.config.heap_index;
			let allocation = pool.shared.vector.allocate(
				&*self.shared.device,
				&self.shared.budget,
				self.heap_limit(heap_index),
				self.next_allocation_id(),
				requirements.size,
				requirements.alignment,
				flags,
				create_info.user_data.clone(),
				current_frame,
			)?;
			self.trace_allocate(&allocation, requirements, Some(pool.id()), false);
			return Ok(allocation);
		}

		let candidates = self.candidate_memory_types(
			requirements.memory_type_bits,
			create_info.required_flags,
			create_info.preferred_flags,
		);
		if candidates.is_empty() {
			return Err(AllocatorError::NoSuitableMemoryType {
				mask: requirements.memory_type_bits,
				required: create_info.required_flags,
			});
		}

		let force_dedicated =
			flags.contains(AllocationCreateFlags::DEDICATED) || requirements.requires_dedicated;
		let prefer_dedicated = force_dedicated
			|| requirements.prefers_dedicated
			|| requirements.size > self.shared.preferred_block_size / 2;

		let mut last_err = AllocatorError::OutOfDeviceMemory;
		for &memory_type in &candidates {
			let result = if flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) {
				self.vector_allocate(memory_type, requirements, create_info, current_frame)
			} else if prefer_dedicated {
				self.allocate_dedicated(memory_type, requirements, create_info, current_frame)
					.or_else(|e| {
						if force_dedicated {
							Err(e)
						} else {
							self.vector_allocate(memory_type, requirements, create_info, current_frame)
						}
					})
			} else {
				self.vector_allocate(memory_type, requirements, create_info, current_frame)
					.or_else(|e| match e {
						AllocatorError::OutOfDeviceMemory => self.allocate_dedicated(
							memory_type,
							requirements,
							create_info,
							current_frame,
						),
						other => Err(other),
					})
			};
			match result {
				Ok(allocation) => {
					let dedicated = matches!(
						allocation.inner.m.lock().backing,
						AllocationBacking::Dedicated { .. }
					);
					self.trace_allocate(&allocation, requirements, None, dedicated);
					return Ok(allocation);
				}
				Err(e) => last_err = e,
			}
		}
		Err(last_err)
	}

	/// Allocates `count` allocations with identical parameters, all or
	/// nothing: if any of them fails, the ones already made are freed and
	/// the error is returned.
	pub fn allocate_memory_pages(
		&self,
		requirements: &MemoryRequirements,
		create_info: &AllocationCreateInfo,
		count: usize,
	) -> Result<Vec<Allocation>, AllocatorError> {
		let mut allocations = Vec::with_capacity(count);
		for _ in 0..count {
			match self.allocate_memory(requirements, create_info) {
				Ok(allocation) => allocations.push(allocation),
				Err(e) => {
					for made in &allocations {
						self.free_memory(made);
					}
					return Err(e);
				}
			}
		}
		Ok(allocations)
	}

	pub fn free_memory(&self, allocation: &Allocation) {
		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::Free {
				id: allocation.inner.id.0,
			});
		}

		let (backing, map_refs) = {
			let mut m = allocation.inner.m.lock();
			let backing = std::mem::replace(&mut m.backing, AllocationBacking::Lost);
			let refs = std::mem::replace(&mut m.map_count, 0);
			m.mapped_ptr = None;
			(backing, refs)
		};

		match backing {
			// Already lost: its region was reclaimed when it was marked.
			AllocationBacking::Lost => {}
			AllocationBacking::Dedicated { memory } => {
				self.shared.dedicated.lock().remove(&allocation.inner.id.0);
				if map_refs > 0 {
					self.shared.device.unmap_memory(memory);
				}
				self.shared.device.free_memory(memory);
				let heap = allocation.inner.heap_index;
				self.shared.budget.remove_allocation(heap, allocation.size());
				self.shared.budget.remove_block(heap, allocation.size());
			}
			AllocationBacking::Block {
				vector,
				block,
				offset,
				..
			} => match self.vector_for(vector) {
				Some(routed) => routed.vector().free(
					&*self.shared.device,
					&self.shared.budget,
					allocation,
					block,
					offset,
					map_refs,
				),
				None => log::error!("freed allocation references a destroyed pool"),
			},
		}
	}

	pub fn free_memory_pages(&self, allocations: &[Allocation]) {
		for allocation in allocations {
			self.free_memory(allocation);
		}
	}

	// --- mapping -----------------------------------------------------------

	pub fn map_memory(&self, allocation: &Allocation) -> Result<*mut u8, AllocatorError> {
		let memory_type = allocation.inner.memory_type;
		let type_props = self.shared.properties.types[memory_type as usize].properties;
		if !type_props.contains(MemoryPropertyFlags::HOST_VISIBLE) {
			return Err(AllocatorError::NotHostVisible(memory_type));
		}

		let backing = allocation.inner.m.lock().backing.clone();
		match backing {
			AllocationBacking::Lost => Err(AllocatorError::AllocationLost),
			AllocationBacking::Dedicated { memory } => {
				let mut m = allocation.inner.m.lock();
				let ptr = match m.mapped_ptr {
					Some(ptr) => ptr,
					None => {
						let ptr = self
							.shared
							.device
							.map_memory(memory)
							.map_err(AllocatorError::MapFailed)?;
						m.mapped_ptr = Some(ptr);
						ptr
					}
				};
				m.map_count += 1;
				Ok(ptr.0)
			}
			AllocationBacking::Block { vector, .. } => self
				.vector_for(vector)
				.ok_or(AllocatorError::AllocationLost)?
				.vector()
				.map_allocation(&*self.shared.device, allocation),
		}
	}

	pub fn unmap_memory(&self, allocation: &Allocation) -> Result<(), AllocatorError> {
		let backing = allocation.inner.m.lock().backing.clone();
		match backing {
			AllocationBacking::Lost => Err(AllocatorError::AllocationLost),
			AllocationBacking::Dedicated { memory } => {
				let mut m = allocation.inner.m.lock();
				let persistent = allocation
					.inner
					.flags
					.contains(AllocationCreateFlags::MAPPED) as u32;
				if m.map_count <= persistent {
					return Err(AllocatorError::NotMapped);
				}
				m.map_count -= 1;
				if m.map_count == 0 {
					self.shared.device.unmap_memory(memory);
					m.mapped_ptr = None;
				}
				Ok(())
			}
			AllocationBacking::Block { vector, .. } => self
				.vector_for(vector)
				.ok_or(AllocatorError::AllocationLost)?
				.vector()
				.unmap_allocation(&*self.shared.device, allocation),
		}
	}

	// --- queries and frames ------------------------------------------------

	/// Point-in-time view of an allocation. For a lost allocation the
	/// handle is [`DeviceMemoryHandle::NULL`] and the size zero.
	pub fn get_allocation_info(&self, allocation: &Allocation) -> AllocationInfo {
		let m = allocation.inner.m.lock();
		match m.backing {
			AllocationBacking::Lost => AllocationInfo {
				memory_type: allocation.inner.memory_type,
				memory: DeviceMemoryHandle::NULL,
				offset: 0,
				size: 0,
				mapped_ptr: None,
				user_data: m.user_data.clone(),
			},
			AllocationBacking::Dedicated { memory } => AllocationInfo {
				memory_type: allocation.inner.memory_type,
				memory,
				offset: 0,
				size: allocation.inner.size,
				mapped_ptr: m.mapped_ptr.map(|p| p.0),
				user_data: m.user_data.clone(),
			},
			AllocationBacking::Block { offset, memory, .. } => AllocationInfo {
				memory_type: allocation.inner.memory_type,
				memory,
				offset,
				size: allocation.inner.size,
				mapped_ptr: m.mapped_ptr.map(|p| p.0),
				user_data: m.user_data.clone(),
			},
		}
	}

	/// Records a use of the allocation in the current frame and reports
	/// whether it is still live. The standard per-frame liveness check for
	/// `CAN_BECOME_LOST` allocations.
	pub fn touch_allocation(&self, allocation: &Allocation) -> bool {
		if allocation.is_lost() {
			return false;
		}
		allocation.touch_frame(self.shared.current_frame.load(Ordering::Relaxed));
		true
	}

	pub fn set_allocation_user_data(&self, allocation: &Allocation, user_data: Option<String>) {
		allocation.inner.m.lock().user_data = user_data;
	}

	pub fn set_current_frame_index(&self, frame: u32) {
		self.shared.current_frame.store(frame, Ordering::Relaxed);
		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::SetFrame { frame });
		}
	}

	pub fn current_frame_index(&self) -> u32 {
		self.shared.current_frame.load(Ordering::Relaxed)
	}

	// --- pools -------------------------------------------------------------

	pub fn create_pool(&self, info: &PoolCreateInfo) -> Result<Pool, AllocatorError> {
		let type_count = self.shared.properties.types.len();
		if info.memory_type as usize >= type_count {
			return Err(AllocatorError::InvalidPoolCreateInfo(
				"memory_type index out of range",
			));
		}
		let max_block_count = if info.max_block_count == 0 {
			usize::MAX
		} else {
			info.max_block_count
		};
		if info.min_block_count > max_block_count {
			return Err(AllocatorError::InvalidPoolCreateInfo(
				"min_block_count exceeds max_block_count",
			));
		}
		let explicit = info.block_size != 0;
		let block_size = if explicit {
			info.block_size
		} else {
			self.shared.preferred_block_size
		};
		if info.algorithm == PoolAlgorithm::Buddy {
			if crate::prev_power_of_two(block_size) < crate::metadata::buddy::MIN_NODE_SIZE {
				return Err(AllocatorError::InvalidPoolCreateInfo(
					"buddy block size is below the minimum node size",
				));
			}
			if !block_size.is_power_of_two() {
				log::warn!(
					"buddy pool block size {} is not a power of two, {} bytes per block will be unusable",
					block_size,
					block_size - crate::prev_power_of_two(block_size)
				);
			}
		}

		let heap_index = self.shared.properties.types[info.memory_type as usize].heap_index;
		let id = self.shared.next_pool_id.fetch_add(1, Ordering::Relaxed);
		let vector = BlockVector::new(
			BlockVectorConfig {
				memory_type: info.memory_type,
				heap_index,
				algorithm: info.algorithm,
				preferred_block_size: block_size,
				min_block_count: info.min_block_count,
				max_block_count,
				explicit_block_size: explicit,
				frame_in_use_count: info
					.frame_in_use_count
					.unwrap_or(self.shared.frame_in_use_count),
				margin: info.margin,
				host_visible: self.shared.properties.types[info.memory_type as usize]
					.properties
					.contains(MemoryPropertyFlags::HOST_VISIBLE),
			},
			VectorRef::Pool(id),
		);
		vector.ensure_min_blocks(
			&*self.shared.device,
			&self.shared.budget,
			self.heap_limit(heap_index),
		)?;

		let pool = Pool {
			shared: Arc::new(PoolShared {
				id,
				name: info.name.clone(),
				vector,
			}),
		};
		self.shared.pools.write().insert(id, pool.clone());
		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::CreatePool {
				id,
				name: pool.name(),
				memory_type: info.memory_type,
			});
		}
		Ok(pool)
	}

	/// Destroys an empty pool, returning its blocks to the device.
	pub fn destroy_pool(&self, pool: &Pool) -> Result<(), AllocatorError> {
		let live = pool.allocation_count();
		if live > 0 {
			return Err(AllocatorError::PoolNotEmpty(pool.shared.name.clone(), live));
		}
		self.shared.pools.write().remove(&pool.id());
		pool.shared.vector.destroy(&*self.shared.device, &self.shared.budget);
		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::DestroyPool { id: pool.id() });
		}
		Ok(())
	}

	/// Marks every lost-eligible allocation in the pool lost, reclaiming
	/// their regions. Returns how many were lost.
	pub fn make_pool_allocations_lost(&self, pool: &Pool) -> usize {
		let frame = self.shared.current_frame.load(Ordering::Relaxed);
		let (count, bytes) = pool
			.shared
			.vector
			.make_allocations_lost(&self.shared.budget, frame);
		if count > 0 {
			log::debug!(
				"marked {} allocations lost in pool {:?}, reclaimed {} bytes",
				count,
				pool.shared.name,
				bytes
			);
		}
		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::MakeLost {
				pool: pool.id(),
				count,
				bytes,
			});
		}
		count
	}

	// --- budget and statistics ---------------------------------------------

	pub fn get_budget(&self) -> Budget {
		self.shared.budget.snapshot(&*self.shared.device)
	}

	pub fn calculate_stats(&self) -> AllocatorStats {
		let type_count = self.shared.properties.types.len();
		let heap_count = self.shared.properties.heaps.len();
		let mut memory_type = vec![StatInfo::default(); type_count];

		for (index, vector) in self.shared.default_vectors.iter().enumerate() {
			vector.add_to_stats(&mut memory_type[index]);
		}
		for pool in self.shared.pools.read().values() {
			let index = pool.shared.vector.config.memory_type as usize;
			pool.shared.vector.add_to_stats(&mut memory_type[index]);
		}
		for allocation in self.shared.dedicated.lock().values() {
			let info = &mut memory_type[allocation.inner.memory_type as usize];
			info.block_count += 1;
			info.add_allocation(allocation.size());
		}

		let mut memory_heap = vec![StatInfo::default(); heap_count];
		let mut total = StatInfo::default();
		for (index, info) in memory_type.iter_mut().enumerate() {
			let heap = self.shared.properties.types[index].heap_index as usize;
			memory_heap[heap].merge(info);
			total.merge(info);
			info.normalize();
		}
		for info in &mut memory_heap {
			info.normalize();
		}
		total.normalize();

		let mut lost_allocation_count = 0;
		for vector in &self.shared.default_vectors {
			lost_allocation_count += vector.lost_allocation_count();
		}
		for pool in self.shared.pools.read().values() {
			lost_allocation_count += pool.shared.vector.lost_allocation_count();
		}

		AllocatorStats {
			total,
			memory_type,
			memory_heap,
			lost_allocation_count,
		}
	}

	/// Verifies the sentinel bytes in the margins of every host-visible
	/// vector whose memory type is in `memory_type_bits`. Returns how many
	/// margin regions were checked. Only meaningful when the allocator (or a
	/// pool) was created with a nonzero `margin`.
	pub fn check_corruption(&self, memory_type_bits: u32) -> Result<usize, AllocatorError> {
		let device = &*self.shared.device;
		let mut checked = 0;
		for vector in &self.shared.default_vectors {
			if memory_type_bits & (1u32 << vector.config.memory_type) != 0 {
				checked += vector.check_corruption(device)?;
			}
		}
		for pool in self.shared.pools.read().values() {
			let vector = &pool.shared.vector;
			if memory_type_bits & (1u32 << vector.config.memory_type) != 0 {
				checked += vector.check_corruption(device)?;
			}
		}
		Ok(checked)
	}

	/// Serializes the full internal state (every block, every region) to a
	/// JSON document.
	pub fn build_stats_json(&self) -> Result<String, serde_json::Error> {
		let stats = self.calculate_stats();

		let memory_types = self
			.shared
			.default_vectors
			.iter()
			.enumerate()
			.map(|(index, vector)| {
				let mut info = StatInfo::default();
				vector.add_to_stats(&mut info);
				info.normalize();
				MemoryTypeDump {
					memory_type: index as u32,
					heap_index: self.shared.properties.types[index].heap_index,
					stats: info,
					blocks: vector.dump_blocks(),
				}
			})
			.collect();

		let mut pools: Vec<PoolDump> = self
			.shared
			.pools
			.read()
			.values()
			.map(|pool| {
				let mut info = StatInfo::default();
				pool.shared.vector.add_to_stats(&mut info);
				info.normalize();
				PoolDump {
					name: pool.shared.name.clone(),
					memory_type: pool.shared.vector.config.memory_type,
					algorithm: pool.shared.vector.config.algorithm,
					stats: info,
					blocks: pool.shared.vector.dump_blocks(),
				}
			})
			.collect();
		pools.sort_by_key(|p| p.memory_type);

		let dedicated = self.shared.dedicated.lock();
		let dump = AllocatorDump {
			total: stats.total,
			memory_types,
			pools,
			dedicated_count: dedicated.len(),
			dedicated_bytes: dedicated.values().map(|a| a.size()).sum(),
		};
		drop(dedicated);

		serde_json::to_string_pretty(&dump)
	}

	// --- internals ---------------------------------------------------------

	fn validate_request(
		&self,
		requirements: &MemoryRequirements,
		create_info: &AllocationCreateInfo,
	) -> Result<(), AllocatorError> {
		if requirements.size == 0 {
			return Err(AllocatorError::ZeroSize);
		}
		if requirements.alignment == 0 || !requirements.alignment.is_power_of_two() {
			return Err(AllocatorError::InvalidAlignment(requirements.alignment));
		}

		let flags = create_info.flags;
		if flags.contains(AllocationCreateFlags::DEDICATED | AllocationCreateFlags::NEVER_ALLOCATE)
		{
			return Err(AllocatorError::ConflictingFlags(
				"DEDICATED with NEVER_ALLOCATE",
			));
		}
		if requirements.requires_dedicated
			&& flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
		{
			return Err(AllocatorError::ConflictingFlags(
				"a dedicated-only resource with NEVER_ALLOCATE",
			));
		}
		if flags.contains(AllocationCreateFlags::CAN_BECOME_LOST) {
			if flags.contains(AllocationCreateFlags::MAPPED) {
				return Err(AllocatorError::ConflictingFlags("CAN_BECOME_LOST with MAPPED"));
			}
			if flags.contains(AllocationCreateFlags::DEDICATED) {
				return Err(AllocatorError::ConflictingFlags(
					"CAN_BECOME_LOST with DEDICATED",
				));
			}
		}
		let strategies = flags
			& (AllocationCreateFlags::STRATEGY_BEST_FIT
				| AllocationCreateFlags::STRATEGY_FIRST_FIT
				| AllocationCreateFlags::STRATEGY_WORST_FIT);
		if strategies.bits().count_ones() > 1 {
			return Err(AllocatorError::ConflictingFlags(
				"more than one placement strategy",
			));
		}

		match &create_info.pool {
			Some(pool) => {
				if flags.contains(AllocationCreateFlags::DEDICATED) {
					return Err(AllocatorError::ConflictingFlags("DEDICATED with a pool"));
				}
				if flags.contains(AllocationCreateFlags::CAN_BECOME_LOST)
					&& pool.algorithm() != PoolAlgorithm::Generic
				{
					return Err(AllocatorError::ConflictingFlags(
						"CAN_BECOME_LOST requires a generic pool",
					));
				}
				if flags.contains(AllocationCreateFlags::UPPER_ADDRESS)
					&& pool.algorithm() != PoolAlgorithm::Linear
				{
					return Err(AllocatorError::ConflictingFlags(
						"UPPER_ADDRESS requires a linear pool",
					));
				}
			}
			None => {
				if flags.contains(AllocationCreateFlags::UPPER_ADDRESS) {
					return Err(AllocatorError::ConflictingFlags(
						"UPPER_ADDRESS requires a linear pool",
					));
				}
			}
		}
		Ok(())
	}

	/// Candidate memory types for a request: filtered by the type mask and
	/// the required flags, ordered by how many preferred flags are missing.
	fn candidate_memory_types(
		&self,
		type_bits: u32,
		required: MemoryPropertyFlags,
		preferred: MemoryPropertyFlags,
	) -> Vec<u32> {
		let mut candidates: Vec<(u32, u32)> = Vec::new();
		for (index, memory_type) in self.shared.properties.types.iter().enumerate() {
			if index >= 32 || type_bits & (1u32 << index) == 0 {
				continue;
			}
			if !memory_type.properties.contains(required) {
				continue;
			}
			let missing = (preferred.bits() & !memory_type.properties.bits()).count_ones();
			candidates.push((missing, index as u32));
		}
		// Stable sort keeps the device's type order within a cost tier.
		candidates.sort_by_key(|&(missing, _)| missing);
		candidates.into_iter().map(|(_, index)| index).collect()
	}

	fn vector_allocate(
		&self,
		memory_type: u32,
		requirements: &MemoryRequirements,
		create_info: &AllocationCreateInfo,
		current_frame: u32,
	) -> Result<Allocation, AllocatorError> {
		let vector = &self.shared.default_vectors[memory_type as usize];
		vector.allocate(
			&*self.shared.device,
			&self.shared.budget,
			self.heap_limit(vector.config.heap_index),
			self.next_allocation_id(),
			requirements.size,
			requirements.alignment,
			create_info.flags,
			create_info.user_data.clone(),
			current_frame,
		)
	}

	fn allocate_dedicated(
		&self,
		memory_type: u32,
		requirements: &MemoryRequirements,
		create_info: &AllocationCreateInfo,
		current_frame: u32,
	) -> Result<Allocation, AllocatorError> {
		let flags = create_info.flags;
		let heap_index = self.shared.properties.types[memory_type as usize].heap_index;

		let mut limit = self.heap_limit(heap_index);
		if flags.contains(AllocationCreateFlags::WITHIN_BUDGET) {
			if let Some(budgets) = self.shared.device.heap_budgets() {
				let device_budget = budgets[heap_index as usize];
				limit = Some(limit.map_or(device_budget, |l| l.min(device_budget)));
			}
		}
		if !self
			.shared
			.budget
			.try_reserve_block(heap_index, requirements.size, limit)
		{
			return Err(AllocatorError::OutOfDeviceMemory);
		}

		let memory = match self
			.shared
			.device
			.allocate_memory(memory_type, requirements.size)
		{
			Ok(memory) => memory,
			Err(e) => {
				self.shared.budget.remove_block(heap_index, requirements.size);
				log::debug!(
					"device refused a dedicated allocation of {} bytes: {}",
					requirements.size,
					e
				);
				return Err(AllocatorError::OutOfDeviceMemory);
			}
		};

		let allocation = Allocation::new(
			self.next_allocation_id(),
			requirements.size,
			requirements.alignment,
			memory_type,
			heap_index,
			flags,
			AllocationBacking::Dedicated { memory },
			create_info.user_data.clone(),
			current_frame,
		);
		self.shared.budget.add_allocation(heap_index, requirements.size);

		if flags.contains(AllocationCreateFlags::MAPPED) {
			match self.shared.device.map_memory(memory) {
				Ok(ptr) => {
					let mut m = allocation.inner.m.lock();
					m.map_count = 1;
					m.mapped_ptr = Some(ptr);
				}
				Err(e) => {
					self.shared.budget.remove_allocation(heap_index, requirements.size);
					self.shared.budget.remove_block(heap_index, requirements.size);
					self.shared.device.free_memory(memory);
					return Err(AllocatorError::MapFailed(e));
				}
			}
		}

		self.shared
			.dedicated
			.lock()
			.insert(allocation.inner.id.0, allocation.clone());
		Ok(allocation)
	}

	fn vector_for(&self, vector_ref: VectorRef) -> Option<RoutedVector> {
		match vector_ref {
			VectorRef::Default(index) => Some(RoutedVector::Default(
				self.shared.default_vectors[index as usize].clone(),
			)),
			VectorRef::Pool(id) => self
				.shared
				.pools
				.read()
				.get(&id)
				.cloned()
				.map(RoutedVector::Pool),
		}
	}

	fn heap_limit(&self, heap_index: u32) -> Option<DeviceSize> {
		self.shared.heap_limits[heap_index as usize]
	}

	fn next_allocation_id(&self) -> AllocationId {
		AllocationId(self.shared.next_allocation_id.fetch_add(1, Ordering::Relaxed))
	}

	fn trace_allocate(
		&self,
		allocation: &Allocation,
		requirements: &MemoryRequirements,
		pool: Option<u64>,
		dedicated: bool,
	) {
		if let Some(trace) = &self.shared.trace {
			trace.record(&TraceEntry::Allocate {
				id: allocation.inner.id.0,
				size: requirements.size,
				alignment: requirements.alignment,
				memory_type: allocation.inner.memory_type,
				flags: allocation.inner.flags.bits(),
				pool,
				dedicated,
			});
		}
	}
}

impl Drop for AllocatorShared {
	fn drop(&mut self) {
		let dedicated = self.dedicated.get_mut();
		for allocation in dedicated.values() {
			log::warn!(
				"leaked dedicated allocation {:?} of {} bytes",
				allocation.inner.id,
				allocation.size()
			);
			let m = allocation.inner.m.lock();
			if let AllocationBacking::Dedicated { memory } = m.backing {
				self.device.free_memory(memory);
			}
		}
		dedicated.clear();

		for vector in &self.default_vectors {
			vector.destroy(&*self.device, &self.budget);
		}
		for pool in self.pools.get_mut().values() {
			pool.shared.vector.destroy(&*self.device, &self.budget);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::device::MockDevice;

	fn allocator() -> Allocator {
		Allocator::new(Arc::new(MockDevice::typical()), AllocatorCreateInfo::default()).unwrap()
	}

	fn requirements(size: DeviceSize) -> MemoryRequirements {
		MemoryRequirements {
			size,
			alignment: 64,
			memory_type_bits: !0,
			prefers_dedicated: false,
			requires_dedicated: false,
		}
	}

	#[test]
	fn rejects_malformed_requests() {
		let allocator = allocator();
		let info = AllocationCreateInfo::default();

		let err = allocator.allocate_memory(&requirements(0), &info).unwrap_err();
		assert_eq!(err, AllocatorError::ZeroSize);

		let mut bad_alignment = requirements(64);
		bad_alignment.alignment = 3;
		let err = allocator.allocate_memory(&bad_alignment, &info).unwrap_err();
		assert_eq!(err, AllocatorError::InvalidAlignment(3));

		let conflicting = AllocationCreateInfo {
			flags: AllocationCreateFlags::DEDICATED | AllocationCreateFlags::NEVER_ALLOCATE,
			..Default::default()
		};
		assert!(matches!(
			allocator.allocate_memory(&requirements(64), &conflicting),
			Err(AllocatorError::ConflictingFlags(_))
		));

		let lost_mapped = AllocationCreateInfo {
			flags: AllocationCreateFlags::CAN_BECOME_LOST | AllocationCreateFlags::MAPPED,
			..Default::default()
		};
		assert!(matches!(
			allocator.allocate_memory(&requirements(64), &lost_mapped),
			Err(AllocatorError::ConflictingFlags(_))
		));

		// A failed request leaves no trace in the stats.
		let stats = allocator.calculate_stats();
		assert_eq!(stats.total.allocation_count, 0);
		assert_eq!(stats.total.block_count, 0);
	}

	#[test]
	fn picks_type_by_required_and_preferred_flags() {
		let allocator = allocator();
		// Required HOST_VISIBLE narrows to types 1 and 2; preferring
		// DEVICE_LOCAL must pick type 2.
		let candidates = allocator.candidate_memory_types(
			!0,
			MemoryPropertyFlags::HOST_VISIBLE,
			MemoryPropertyFlags::DEVICE_LOCAL,
		);
		assert_eq!(candidates, vec![2, 1]);

		let candidates = allocator.candidate_memory_types(
			!0,
			MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
			MemoryPropertyFlags::empty(),
		);
		assert!(candidates.is_empty());

		// The type mask filters regardless of flags.
		let candidates =
			allocator.candidate_memory_types(0b010, MemoryPropertyFlags::empty(), MemoryPropertyFlags::empty());
		assert_eq!(candidates, vec![1]);
	}

	#[test]
	fn no_suitable_type_is_its_own_error() {
		let allocator = allocator();
		let info = AllocationCreateInfo {
			required_flags: MemoryPropertyFlags::HOST_CACHED,
			..Default::default()
		};
		let err = allocator.allocate_memory(&requirements(64), &info).unwrap_err();
		assert_eq!(err.kind(), crate::ErrorKind::NoSuitableMemoryType);
	}

	#[test]
	fn huge_requests_go_dedicated() {
		let allocator = allocator();
		let info = AllocationCreateInfo::default();
		// Larger than half the preferred block size.
		let a = allocator
			.allocate_memory(&requirements(200 * 1024 * 1024), &info)
			.unwrap();
		assert!(matches!(
			a.inner.m.lock().backing,
			AllocationBacking::Dedicated { .. }
		));
		allocator.free_memory(&a);
	}

	#[test]
	fn allocate_pages_rolls_back_on_failure() {
		let device = Arc::new(MockDevice::typical());
		let allocator = Allocator::new(
			device.clone(),
			AllocatorCreateInfo {
				heap_size_limits: Some(vec![Some(64 * 1024), None]),
				preferred_block_size: 16 * 1024,
				..Default::default()
			},
		)
		.unwrap();

		// Device-local only: heap 0, capped at 64 KiB, 16 KiB full blocks.
		let info = AllocationCreateInfo {
			required_flags: MemoryPropertyFlags::DEVICE_LOCAL,
			preferred_flags: MemoryPropertyFlags::empty(),
			..Default::default()
		};
		let req = MemoryRequirements {
			size: 16 * 1024,
			alignment: 64,
			memory_type_bits: 0b001,
			prefers_dedicated: false,
			requires_dedicated: false,
		};
		let err = allocator.allocate_memory_pages(&req, &info, 5).unwrap_err();
		assert_eq!(err, AllocatorError::OutOfDeviceMemory);
		// All-or-nothing: the four that succeeded were freed again.
		assert_eq!(allocator.calculate_stats().total.allocation_count, 0);
		assert_eq!(allocator.get_budget().heaps[0].allocation_bytes, 0);
	}

	#[test]
	fn user_data_round_trips_and_updates() {
		let allocator = allocator();
		let info = AllocationCreateInfo {
			user_data: Some("terrain-vertices".to_owned()),
			..Default::default()
		};
		let a = allocator.allocate_memory(&requirements(1024), &info).unwrap();
		assert_eq!(
			allocator.get_allocation_info(&a).user_data.as_deref(),
			Some("terrain-vertices")
		);
		allocator.set_allocation_user_data(&a, Some("terrain-indices".to_owned()));
		assert_eq!(
			allocator.get_allocation_info(&a).user_data.as_deref(),
			Some("terrain-indices")
		);
		allocator.free_memory(&a);
	}
}
