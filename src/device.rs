//! The "device" collaborator boundary.
//!
//! Gravel itself never calls a graphics API. Every operation that actually
//! touches driver state - creating and destroying device memory objects,
//! mapping them, querying heap budgets - goes through [`MemoryDevice`].
//! The embedding application implements this trait over its API of choice;
//! tests use [`MockDevice`], which backs "device memory" with plain host
//! buffers so that mapping, copying and checksumming all work for real.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{new_fast_hash_map, DeviceSize, FastHashMap};

bitflags::bitflags! {
	/// Property flags of a memory type, as reported by the device.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct MemoryPropertyFlags: u32 {
		/// Memory local to the GPU; fastest for device access.
		const DEVICE_LOCAL = 1 << 0;
		/// Mappable to a CPU pointer.
		const HOST_VISIBLE = 1 << 1;
		/// Host writes are visible to the device without explicit flushes.
		const HOST_COHERENT = 1 << 2;
		/// Cached on the host; host reads are fast.
		const HOST_CACHED = 1 << 3;
		/// Backed lazily by the implementation; only usable for transient attachments.
		const LAZILY_ALLOCATED = 1 << 4;
	}
}

impl Serialize for MemoryPropertyFlags {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u32(self.bits())
	}
}

/// One entry of the device-reported memory type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
	/// Index into [`MemoryProperties::heaps`] of the physical heap backing this type.
	pub heap_index: u32,
	pub properties: MemoryPropertyFlags,
}

/// One physical heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
	/// Total size of the heap in bytes.
	pub size: DeviceSize,
	/// Whether the heap is device-local.
	pub device_local: bool,
}

/// The static memory type/heap table the device reports once at startup.
#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
	pub types: Vec<MemoryType>,
	pub heaps: Vec<MemoryHeap>,
}

/// Opaque handle to one device memory object. `NULL` is what lost
/// allocations report from their info query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemoryHandle(pub u64);

impl DeviceMemoryHandle {
	pub const NULL: DeviceMemoryHandle = DeviceMemoryHandle(0);

	#[inline(always)]
	pub fn is_null(&self) -> bool {
		self.0 == 0
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
	#[error("the device could not allocate a memory object of {0} bytes from heap {1}")]
	OutOfDeviceMemory(DeviceSize, u32),
	#[error("the device failed to map memory object {0:?}")]
	MapFailed(DeviceMemoryHandle),
	#[error("unknown device memory handle {0:?}")]
	UnknownHandle(DeviceMemoryHandle),
}

/// A raw mapped pointer that may be stored and handed across threads.
///
/// Gravel serializes all of its own accesses through the owning block's
/// lock; synchronizing actual reads/writes through the pointer is the
/// caller's responsibility, exactly as it is with the underlying API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(pub *mut u8);

unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// Everything gravel needs from the driver.
///
/// Memory object creation is treated as atomic: it either succeeds or fails
/// immediately (e.g. out of device memory); the allocator never waits on the
/// device beyond this one call.
pub trait MemoryDevice: Send + Sync {
	/// The static memory type/heap table. Must not change over the device's lifetime.
	fn memory_properties(&self) -> &MemoryProperties;

	/// Create one device memory object of `size` bytes from `memory_type`.
	fn allocate_memory(
		&self,
		memory_type: u32,
		size: DeviceSize,
	) -> Result<DeviceMemoryHandle, DeviceError>;

	/// Destroy a memory object previously returned by [`allocate_memory`](Self::allocate_memory).
	fn free_memory(&self, memory: DeviceMemoryHandle);

	/// Map a whole memory object to a CPU pointer. Gravel reference-counts
	/// mappings per block, so this is called at most once per live object.
	fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<MappedPtr, DeviceError>;

	/// Release the mapping established by [`map_memory`](Self::map_memory).
	fn unmap_memory(&self, memory: DeviceMemoryHandle);

	/// Live per-heap budget in bytes, if the platform exposes one.
	/// Returning `None` makes the budget tracker fall back to heap sizes.
	fn heap_budgets(&self) -> Option<Vec<DeviceSize>> {
		None
	}
}

// ---------------------------------------------------------------------------
// Mock device
// ---------------------------------------------------------------------------

struct MockMemory {
	buffer: Box<[u8]>,
	heap_index: u32,
	size: DeviceSize,
}

#[derive(Default)]
struct MockDeviceState {
	memories: FastHashMap<u64, MockMemory>,
	allocated_per_heap: Vec<DeviceSize>,
}

/// Host-backed stand-in for a real driver, used throughout the test suite.
///
/// Every "device memory object" is an ordinary zeroed host buffer, so any
/// memory type can be mapped and copied regardless of its advertised
/// property flags. Allocation fails with [`DeviceError::OutOfDeviceMemory`]
/// once a heap's total would exceed its reported size.
pub struct MockDevice {
	properties: MemoryProperties,
	state: Mutex<MockDeviceState>,
	next_handle: AtomicU64,
	/// Device-reported budget per heap; defaults to 80% of the heap size.
	budget_fraction_percent: u64,
}

impl MockDevice {
	pub fn new(properties: MemoryProperties) -> Self {
		let heap_count = properties.heaps.len();
		MockDevice {
			properties,
			state: Mutex::new(MockDeviceState {
				memories: new_fast_hash_map(),
				allocated_per_heap: vec![0; heap_count],
			}),
			next_handle: AtomicU64::new(1),
			budget_fraction_percent: 80,
		}
	}

	/// A small desktop-like configuration: one device-local heap, one host
	/// heap, and three memory types covering the usual combinations.
	pub fn typical() -> Self {
		const GIB: DeviceSize = 1024 * 1024 * 1024;
		Self::new(MemoryProperties {
			types: vec![
				MemoryType {
					heap_index: 0,
					properties: MemoryPropertyFlags::DEVICE_LOCAL,
				},
				MemoryType {
					heap_index: 1,
					properties: MemoryPropertyFlags::HOST_VISIBLE
						| MemoryPropertyFlags::HOST_COHERENT,
				},
				MemoryType {
					heap_index: 0,
					properties: MemoryPropertyFlags::DEVICE_LOCAL
						| MemoryPropertyFlags::HOST_VISIBLE
						| MemoryPropertyFlags::HOST_COHERENT,
				},
			],
			heaps: vec![
				MemoryHeap {
					size: 2 * GIB,
					device_local: true,
				},
				MemoryHeap {
					size: 4 * GIB,
					device_local: false,
				},
			],
		})
	}

	/// Number of live memory objects, across all heaps.
	pub fn live_object_count(&self) -> usize {
		self.state.lock().memories.len()
	}

	/// Bytes currently allocated from the given heap.
	pub fn heap_allocated(&self, heap_index: u32) -> DeviceSize {
		self.state.lock().allocated_per_heap[heap_index as usize]
	}
}

impl MemoryDevice for MockDevice {
	fn memory_properties(&self) -> &MemoryProperties {
		&self.properties
	}

	fn allocate_memory(
		&self,
		memory_type: u32,
		size: DeviceSize,
	) -> Result<DeviceMemoryHandle, DeviceError> {
		let heap_index = self.properties.types[memory_type as usize].heap_index;
		let heap_size = self.properties.heaps[heap_index as usize].size;

		let mut state = self.state.lock();
		let allocated = &mut state.allocated_per_heap[heap_index as usize];
		if allocated.saturating_add(size) > heap_size {
			return Err(DeviceError::OutOfDeviceMemory(size, heap_index));
		}
		*allocated += size;

		let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
		state.memories.insert(
			handle,
			MockMemory {
				buffer: vec![0u8; size as usize].into_boxed_slice(),
				heap_index,
				size,
			},
		);
		Ok(DeviceMemoryHandle(handle))
	}

	fn free_memory(&self, memory: DeviceMemoryHandle) {
		let mut state = self.state.lock();
		if let Some(mem) = state.memories.remove(&memory.0) {
			state.allocated_per_heap[mem.heap_index as usize] -= mem.size;
		} else {
			log::warn!("MockDevice::free_memory called with unknown handle {:?}", memory);
		}
	}

	fn map_memory(&self, memory: DeviceMemoryHandle) -> Result<MappedPtr, DeviceError> {
		let mut state = self.state.lock();
		let mem = state
			.memories
			.get_mut(&memory.0)
			.ok_or(DeviceError::UnknownHandle(memory))?;
		Ok(MappedPtr(mem.buffer.as_mut_ptr()))
	}

	fn unmap_memory(&self, _memory: DeviceMemoryHandle) {
		// Host buffers stay valid until freed; nothing to do.
	}

	fn heap_budgets(&self) -> Option<Vec<DeviceSize>> {
		Some(
			self.properties
				.heaps
				.iter()
				.map(|h| h.size / 100 * self.budget_fraction_percent)
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mock_device_allocates_and_frees() {
		let device = MockDevice::typical();
		let handle = device.allocate_memory(1, 4096).unwrap();
		assert!(!handle.is_null());
		assert_eq!(device.live_object_count(), 1);
		assert_eq!(device.heap_allocated(1), 4096);

		let ptr = device.map_memory(handle).unwrap();
		unsafe {
			ptr.0.write(0xAB);
			assert_eq!(*ptr.0, 0xAB);
		}
		device.unmap_memory(handle);

		device.free_memory(handle);
		assert_eq!(device.live_object_count(), 0);
		assert_eq!(device.heap_allocated(1), 0);
	}

	#[test]
	fn mock_device_respects_heap_size() {
		let device = MockDevice::new(MemoryProperties {
			types: vec![MemoryType {
				heap_index: 0,
				properties: MemoryPropertyFlags::HOST_VISIBLE,
			}],
			heaps: vec![MemoryHeap {
				size: 1024,
				device_local: false,
			}],
		});
		let a = device.allocate_memory(0, 512).unwrap();
		let _b = device.allocate_memory(0, 512).unwrap();
		assert!(matches!(
			device.allocate_memory(0, 1),
			Err(DeviceError::OutOfDeviceMemory(1, 0))
		));
		device.free_memory(a);
		assert!(device.allocate_memory(0, 256).is_ok());
	}
}
