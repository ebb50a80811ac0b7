//! End-to-end allocator behavior against the mock device.

use std::sync::Arc;

use gravel::{
	AllocationCreateFlags, AllocationCreateInfo, Allocator, AllocatorCreateInfo, AllocatorError,
	DeviceMemoryHandle, ErrorKind, MemoryHeap, MemoryProperties, MemoryPropertyFlags,
	MemoryRequirements, MemoryType, MockDevice, PoolCreateInfo,
};

fn requirements(size: u64) -> MemoryRequirements {
	MemoryRequirements {
		size,
		alignment: 64,
		memory_type_bits: !0,
		prefers_dedicated: false,
		requires_dedicated: false,
	}
}

fn host_visible_info() -> AllocationCreateInfo {
	AllocationCreateInfo {
		required_flags: MemoryPropertyFlags::HOST_VISIBLE,
		..Default::default()
	}
}

/// One heap, one host-visible type. Large enough that the heap itself never
/// gets in the way of limit tests.
fn single_heap_device(heap_size: u64) -> MockDevice {
	MockDevice::new(MemoryProperties {
		types: vec![MemoryType {
			heap_index: 0,
			properties: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
		}],
		heaps: vec![MemoryHeap {
			size: heap_size,
			device_local: false,
		}],
	})
}

#[test]
fn allocate_map_write_free() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device.clone(), AllocatorCreateInfo::default()).unwrap();

	let a = allocator
		.allocate_memory(&requirements(4096), &host_visible_info())
		.unwrap();
	let info = allocator.get_allocation_info(&a);
	assert!(!info.memory.is_null());
	assert_eq!(info.size, 4096);

	let ptr = allocator.map_memory(&a).unwrap();
	unsafe {
		ptr.write_bytes(0x5A, 4096);
		assert_eq!(*ptr.add(4095), 0x5A);
	}
	allocator.unmap_memory(&a).unwrap();
	assert!(matches!(
		allocator.unmap_memory(&a),
		Err(AllocatorError::NotMapped)
	));

	allocator.free_memory(&a);
	let stats = allocator.calculate_stats();
	assert_eq!(stats.total.allocation_count, 0);
}

#[test]
fn persistently_mapped_allocation() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();

	let info = AllocationCreateInfo {
		flags: AllocationCreateFlags::MAPPED,
		required_flags: MemoryPropertyFlags::HOST_VISIBLE,
		..Default::default()
	};
	let a = allocator.allocate_memory(&requirements(1024), &info).unwrap();
	let mapped = allocator.get_allocation_info(&a).mapped_ptr;
	assert!(mapped.is_some(), "MAPPED allocations carry a pointer from birth");

	// The persistent reference cannot be taken away by unmap.
	assert!(matches!(
		allocator.unmap_memory(&a),
		Err(AllocatorError::NotMapped)
	));
	// But extra map/unmap pairs stack on top of it.
	let ptr = allocator.map_memory(&a).unwrap();
	assert_eq!(Some(ptr), mapped);
	allocator.unmap_memory(&a).unwrap();
	assert_eq!(allocator.get_allocation_info(&a).mapped_ptr, mapped);

	allocator.free_memory(&a);
}

#[test]
fn mapping_non_host_visible_fails() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();

	// Type 0 is DEVICE_LOCAL only.
	let req = MemoryRequirements {
		memory_type_bits: 0b001,
		..requirements(1024)
	};
	let a = allocator
		.allocate_memory(&req, &AllocationCreateInfo::default())
		.unwrap();
	assert!(matches!(
		allocator.map_memory(&a),
		Err(AllocatorError::NotHostVisible(0))
	));
	allocator.free_memory(&a);
}

#[test]
fn failed_request_changes_nothing() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device.clone(), AllocatorCreateInfo::default()).unwrap();

	let before = allocator.calculate_stats();
	let before_budget = allocator.get_budget();

	let err = allocator
		.allocate_memory(&requirements(0), &AllocationCreateInfo::default())
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Validation);

	let after = allocator.calculate_stats();
	let after_budget = allocator.get_budget();
	assert_eq!(before.total.allocation_count, after.total.allocation_count);
	assert_eq!(before.total.block_count, after.total.block_count);
	for (b, a) in before_budget.heaps.iter().zip(after_budget.heaps.iter()) {
		assert_eq!(b.block_bytes, a.block_bytes);
		assert_eq!(b.allocation_bytes, a.allocation_bytes);
	}
	assert_eq!(device.live_object_count(), 0);
}

#[test]
fn heap_limit_is_enforced_without_leaks() {
	const MIB: u64 = 1024 * 1024;
	let device = Arc::new(single_heap_device(1024 * MIB));
	let allocator = Allocator::new(
		device.clone(),
		AllocatorCreateInfo {
			heap_size_limits: Some(vec![Some(100 * MIB)]),
			..Default::default()
		},
	)
	.unwrap();

	let pool = allocator
		.create_pool(&PoolCreateInfo {
			memory_type: 0,
			block_size: 10 * MIB,
			..Default::default()
		})
		.unwrap();

	let info = AllocationCreateInfo {
		pool: Some(pool.clone()),
		..Default::default()
	};
	let mut live = Vec::new();
	for _ in 0..10 {
		live.push(allocator.allocate_memory(&requirements(10 * MIB), &info).unwrap());
	}
	assert_eq!(device.live_object_count(), 10);

	// The eleventh block would cross the 100 MiB cap.
	let err = allocator
		.allocate_memory(&requirements(10 * MIB), &info)
		.unwrap_err();
	assert_eq!(err, AllocatorError::OutOfDeviceMemory);
	assert_eq!(err.kind(), ErrorKind::OutOfDeviceMemory);

	// The failed attempt reserved nothing: usage still adds up exactly.
	let budget = allocator.get_budget();
	assert_eq!(budget.heaps[0].block_bytes, 100 * MIB);
	assert_eq!(budget.heaps[0].allocation_bytes, 100 * MIB);
	assert_eq!(device.live_object_count(), 10);

	for a in &live {
		allocator.free_memory(a);
	}
	allocator.destroy_pool(&pool).unwrap();
	assert_eq!(device.live_object_count(), 0);
	assert_eq!(allocator.get_budget().heaps[0].block_bytes, 0);
}

#[test]
fn lost_allocation_protocol() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();

	let pool = allocator
		.create_pool(&PoolCreateInfo {
			memory_type: 1,
			block_size: 1024,
			max_block_count: 1,
			frame_in_use_count: Some(1),
			..Default::default()
		})
		.unwrap();

	allocator.set_current_frame_index(0);
	let transient_info = AllocationCreateInfo {
		flags: AllocationCreateFlags::CAN_BECOME_LOST,
		pool: Some(pool.clone()),
		..Default::default()
	};
	let victim = allocator
		.allocate_memory(&requirements(1024), &transient_info)
		.unwrap();
	assert!(allocator.touch_allocation(&victim));

	// Inside the frame-in-use window nothing can be evicted.
	allocator.set_current_frame_index(1);
	let evicting_info = AllocationCreateInfo {
		flags: AllocationCreateFlags::CAN_MAKE_OTHER_LOST,
		pool: Some(pool.clone()),
		..Default::default()
	};
	assert!(allocator
		.allocate_memory(&requirements(1024), &evicting_info)
		.is_err());
	assert!(!victim.is_lost());

	// Past the window the victim is reclaimed to satisfy the new request.
	allocator.set_current_frame_index(5);
	let replacement = allocator
		.allocate_memory(&requirements(1024), &evicting_info)
		.unwrap();
	assert!(victim.is_lost());

	// A lost allocation reports a null handle and zero size; touching it
	// says "gone"; freeing it is a no-op.
	let info = allocator.get_allocation_info(&victim);
	assert_eq!(info.memory, DeviceMemoryHandle::NULL);
	assert_eq!(info.size, 0);
	assert!(!allocator.touch_allocation(&victim));
	allocator.free_memory(&victim);
	assert_eq!(pool.allocation_count(), 1);
	assert_eq!(allocator.calculate_stats().lost_allocation_count, 1);

	allocator.free_memory(&replacement);
	allocator.destroy_pool(&pool).unwrap();
}

#[test]
fn make_pool_allocations_lost_sweeps_stale_allocations() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();
	let pool = allocator
		.create_pool(&PoolCreateInfo {
			memory_type: 1,
			block_size: 4096,
			frame_in_use_count: Some(1),
			..Default::default()
		})
		.unwrap();

	allocator.set_current_frame_index(0);
	let transient = AllocationCreateInfo {
		flags: AllocationCreateFlags::CAN_BECOME_LOST,
		pool: Some(pool.clone()),
		..Default::default()
	};
	let pinned_info = AllocationCreateInfo {
		pool: Some(pool.clone()),
		..Default::default()
	};
	let stale = allocator.allocate_memory(&requirements(512), &transient).unwrap();
	let fresh = allocator.allocate_memory(&requirements(512), &transient).unwrap();
	let pinned = allocator.allocate_memory(&requirements(512), &pinned_info).unwrap();

	allocator.set_current_frame_index(4);
	allocator.touch_allocation(&fresh);
	let count = allocator.make_pool_allocations_lost(&pool);
	assert_eq!(count, 1);
	assert!(stale.is_lost());
	assert!(!fresh.is_lost());
	assert!(!pinned.is_lost());
	assert_eq!(allocator.calculate_stats().lost_allocation_count, 1);

	allocator.free_memory(&fresh);
	allocator.free_memory(&pinned);
	allocator.destroy_pool(&pool).unwrap();
}

#[test]
fn margin_sentinels_detect_overflow() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();
	let pool = allocator
		.create_pool(&PoolCreateInfo {
			memory_type: 1,
			block_size: 4096,
			margin: 16,
			..Default::default()
		})
		.unwrap();

	let info = AllocationCreateInfo {
		pool: Some(pool.clone()),
		..Default::default()
	};
	let a = allocator.allocate_memory(&requirements(100), &info).unwrap();
	assert_eq!(allocator.check_corruption(!0).unwrap(), 1);

	// Write one byte past the end of the allocation, into its margin.
	let ptr = allocator.map_memory(&a).unwrap();
	unsafe {
		*ptr.add(100) = 0xFF;
	}
	allocator.unmap_memory(&a).unwrap();
	assert_eq!(
		allocator.check_corruption(!0),
		Err(AllocatorError::CorruptedMargin(100))
	);

	allocator.free_memory(&a);
	allocator.destroy_pool(&pool).unwrap();
}

#[test]
fn stats_json_dump_is_valid_and_detailed() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();
	let pool = allocator
		.create_pool(&PoolCreateInfo {
			memory_type: 1,
			block_size: 4096,
			name: Some("staging".to_owned()),
			..Default::default()
		})
		.unwrap();

	let info = AllocationCreateInfo {
		pool: Some(pool.clone()),
		user_data: Some("upload-ring".to_owned()),
		..Default::default()
	};
	let a = allocator.allocate_memory(&requirements(1000), &info).unwrap();

	let json = allocator.build_stats_json().unwrap();
	let value: serde_json::Value = serde_json::from_str(&json).unwrap();
	assert_eq!(value["total"]["allocation_count"], 1);

	let pools = value["pools"].as_array().unwrap();
	assert_eq!(pools.len(), 1);
	assert_eq!(pools[0]["name"], "staging");
	assert_eq!(pools[0]["algorithm"], "generic");
	let regions = pools[0]["blocks"][0]["regions"].as_array().unwrap();
	let used: Vec<_> = regions.iter().filter(|r| r["kind"] == "used").collect();
	assert_eq!(used.len(), 1);
	assert_eq!(used[0]["user_data"], "upload-ring");

	allocator.free_memory(&a);
	allocator.destroy_pool(&pool).unwrap();
}

#[test]
fn budget_reflects_usage_and_device_budget() {
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device, AllocatorCreateInfo::default()).unwrap();

	let a = allocator
		.allocate_memory(&requirements(1024 * 1024), &host_visible_info())
		.unwrap();
	let budget = allocator.get_budget();
	let heap = &budget.heaps[1];
	assert!(heap.block_bytes >= 1024 * 1024);
	assert_eq!(heap.allocation_bytes, 1024 * 1024);
	assert!(heap.device_budget > 0 && heap.device_budget <= heap.heap_size);

	allocator.free_memory(&a);
	assert_eq!(allocator.get_budget().heaps[1].allocation_bytes, 0);
}
