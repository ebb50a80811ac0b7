//! One device memory object plus its placement metadata.

use parking_lot::Mutex;

use crate::allocation::BlockId;
use crate::device::{DeviceMemoryHandle, MappedPtr, MemoryDevice};
use crate::error::AllocatorError;
use crate::metadata::BlockMetadata;
use crate::pool::PoolAlgorithm;
use crate::DeviceSize;

struct MappingState {
	ptr: Option<MappedPtr>,
	refs: u32,
}

/// A block: one memory object carved up by a [`BlockMetadata`].
///
/// Mapping is reference-counted per block, so any number of suballocations
/// can be mapped concurrently while the device sees exactly one map call.
pub(crate) struct DeviceMemoryBlock {
	pub id: BlockId,
	pub memory: DeviceMemoryHandle,
	pub memory_type: u32,
	pub heap_index: u32,
	pub size: DeviceSize,
	pub metadata: BlockMetadata,
	mapping: Mutex<MappingState>,
}

impl DeviceMemoryBlock {
	pub fn new(
		id: BlockId,
		memory: DeviceMemoryHandle,
		memory_type: u32,
		heap_index: u32,
		algorithm: PoolAlgorithm,
		size: DeviceSize,
		margin: DeviceSize,
	) -> Self {
		DeviceMemoryBlock {
			id,
			memory,
			memory_type,
			heap_index,
			size,
			metadata: BlockMetadata::new(algorithm, size, margin),
			mapping: Mutex::new(MappingState { ptr: None, refs: 0 }),
		}
	}

	/// Takes one mapping reference, mapping the memory object on the first.
	pub fn map(&self, device: &dyn MemoryDevice) -> Result<MappedPtr, AllocatorError> {
		let mut m = self.mapping.lock();
		let ptr = match m.ptr {
			Some(ptr) => ptr,
			None => {
				let ptr = device.map_memory(self.memory).map_err(AllocatorError::MapFailed)?;
				m.ptr = Some(ptr);
				ptr
			}
		};
		m.refs += 1;
		Ok(ptr)
	}

	/// Releases one mapping reference, unmapping on the last.
	pub fn unmap(&self, device: &dyn MemoryDevice) -> Result<(), AllocatorError> {
		let mut m = self.mapping.lock();
		if m.refs == 0 {
			return Err(AllocatorError::NotMapped);
		}
		m.refs -= 1;
		if m.refs == 0 {
			device.unmap_memory(self.memory);
			m.ptr = None;
		}
		Ok(())
	}

	/// Base pointer, if the block is currently mapped.
	pub fn mapped_ptr(&self) -> Option<MappedPtr> {
		self.mapping.lock().ptr
	}

	pub fn map_refs(&self) -> u32 {
		self.mapping.lock().refs
	}

	/// Frees the underlying memory object. Leak detection is the caller's
	/// job; any remaining mapping is released before destruction either way.
	pub fn destroy(self, device: &dyn MemoryDevice) {
		let m = self.mapping.into_inner();
		if m.ptr.is_some() {
			device.unmap_memory(self.memory);
		}
		device.free_memory(self.memory);
	}
}
