//! Concurrent allocation from cloned handles, plus a randomized churn run.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gravel::{
	AllocationCreateInfo, Allocator, AllocatorCreateInfo, MemoryPropertyFlags, MemoryRequirements,
	MockDevice, PoolCreateInfo,
};

fn init_logging() {
	let _ = simplelog::TermLogger::init(
		simplelog::LevelFilter::Warn,
		simplelog::Config::default(),
		simplelog::TerminalMode::Mixed,
		simplelog::ColorChoice::Auto,
	);
}

fn requirements(size: u64, alignment: u64) -> MemoryRequirements {
	MemoryRequirements {
		size,
		alignment,
		memory_type_bits: !0,
		prefers_dedicated: false,
		requires_dedicated: false,
	}
}

#[test]
fn parallel_allocations_never_overlap() {
	init_logging();
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(device.clone(), AllocatorCreateInfo::default()).unwrap();

	let host_visible = AllocationCreateInfo {
		required_flags: MemoryPropertyFlags::HOST_VISIBLE,
		..Default::default()
	};

	const THREADS: u64 = 2;
	const PER_THREAD: u64 = 1000;
	let mut per_thread_results = Vec::new();
	std::thread::scope(|scope| {
		let mut handles = Vec::new();
		for thread in 0..THREADS {
			let allocator = allocator.clone();
			let host_visible = &host_visible;
			handles.push(scope.spawn(move || {
				let mut allocations = Vec::with_capacity(PER_THREAD as usize);
				for i in 0..PER_THREAD {
					let size = 64 + (thread * PER_THREAD + i) % 960;
					let allocation = allocator
						.allocate_memory(&requirements(size, 64), host_visible)
						.unwrap();
					allocations.push(allocation);
				}
				allocations
			}));
		}
		for handle in handles {
			per_thread_results.push(handle.join().unwrap());
		}
	});

	let stats = allocator.calculate_stats();
	assert_eq!(stats.total.allocation_count as u64, THREADS * PER_THREAD);

	// No two live allocations may share bytes of the same memory object.
	let mut by_memory: HashMap<u64, Vec<(u64, u64)>> = HashMap::new();
	for allocation in per_thread_results.iter().flatten() {
		let info = allocator.get_allocation_info(allocation);
		assert!(!info.memory.is_null());
		by_memory
			.entry(info.memory.0)
			.or_default()
			.push((info.offset, info.size));
	}
	for regions in by_memory.values_mut() {
		regions.sort_unstable();
		for pair in regions.windows(2) {
			assert!(
				pair[0].0 + pair[0].1 <= pair[1].0,
				"allocations overlap: {:?} and {:?}",
				pair[0],
				pair[1]
			);
		}
	}

	for allocation in per_thread_results.iter().flatten() {
		allocator.free_memory(allocation);
	}
	let budget = allocator.get_budget();
	assert!(budget.heaps.iter().all(|h| h.allocation_bytes == 0));
	drop(allocator);
	assert_eq!(device.live_object_count(), 0);
}

#[test]
fn randomized_churn_settles_to_zero() {
	init_logging();
	let device = Arc::new(MockDevice::typical());
	let allocator = Allocator::new(
		device.clone(),
		AllocatorCreateInfo {
			preferred_block_size: 1 << 20,
			..Default::default()
		},
	)
	.unwrap();
	let pool = allocator
		.create_pool(&PoolCreateInfo {
			memory_type: 1,
			block_size: 1 << 16,
			..Default::default()
		})
		.unwrap();

	let mut rng = StdRng::seed_from_u64(0x6772_6176);
	let mut live = Vec::new();
	for _ in 0..4000 {
		if live.is_empty() || rng.gen_bool(0.55) {
			let size = rng.gen_range(1..=8192);
			let alignment = 1u64 << rng.gen_range(0..=8);
			let info = if rng.gen_bool(0.3) {
				AllocationCreateInfo {
					pool: Some(pool.clone()),
					..Default::default()
				}
			} else {
				AllocationCreateInfo {
					required_flags: MemoryPropertyFlags::HOST_VISIBLE,
					..Default::default()
				}
			};
			live.push(allocator.allocate_memory(&requirements(size, alignment), &info).unwrap());
		} else {
			let index = rng.gen_range(0..live.len());
			allocator.free_memory(&live.swap_remove(index));
		}
	}

	let stats = allocator.calculate_stats();
	assert_eq!(stats.total.allocation_count, live.len());
	let live_bytes: u64 = live.iter().map(|a| a.size()).sum();
	assert_eq!(stats.total.used_bytes, live_bytes);

	for allocation in &live {
		allocator.free_memory(allocation);
	}
	live.clear();

	let stats = allocator.calculate_stats();
	assert_eq!(stats.total.allocation_count, 0);
	assert_eq!(stats.total.used_bytes, 0);
	let budget = allocator.get_budget();
	assert!(budget.heaps.iter().all(|h| h.allocation_bytes == 0));

	allocator.destroy_pool(&pool).unwrap();
	drop(allocator);
	assert_eq!(device.live_object_count(), 0);
}
