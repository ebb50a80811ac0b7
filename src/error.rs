//! Error types for every fallible public operation.
//!
//! The taxonomy matters more than the individual variants: callers are
//! expected to branch on [`AllocatorError::kind`], which collapses the
//! variants into the three categories a caller can meaningfully react to.
//! Internal placement failures (a single block or vector being too
//! fragmented) are never surfaced here - they just make the router try the
//! next block, then a new block, then the next memory type.

use crate::DeviceSize;

/// Broad category of an [`AllocatorError`], for callers that only care
/// whether to fix their request, fall back to a smaller one, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// The request itself was malformed. Retrying the same call can never succeed.
	Validation,
	/// The device refused to create a memory object, or a configured
	/// heap/pool ceiling would be exceeded.
	OutOfDeviceMemory,
	/// No memory type satisfies the required property flags and type mask.
	NoSuitableMemoryType,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
	#[error("allocation requests of size zero are invalid")]
	ZeroSize,
	#[error("alignment {0} is invalid, alignments must be powers of two")]
	InvalidAlignment(DeviceSize),
	#[error("conflicting allocation create flags: {0}")]
	ConflictingFlags(&'static str),
	#[error("pool create info is invalid: {0}")]
	InvalidPoolCreateInfo(&'static str),
	#[error("heap size limits were given for {0} heaps but the device reports {1}")]
	HeapLimitMismatch(usize, usize),
	#[error("tried to destroy pool {0:?} while it still holds {1} live allocations - free them first")]
	PoolNotEmpty(Option<String>, usize),
	#[error("this allocation has been marked lost, its memory was reclaimed; query liveness with touch_allocation() and re-create the resource")]
	AllocationLost,
	#[error("cannot map memory of type {0}, it is not host-visible")]
	NotHostVisible(u32),
	#[error("unmap_memory called on an allocation that is not currently mapped")]
	NotMapped,
	#[error("defragmentation context is not in the right state for this call: {0}")]
	DefragmentationState(&'static str),
	#[error("memory corruption detected: the margin starting at offset {0} was overwritten")]
	CorruptedMargin(DeviceSize),
	#[error("device memory mapping failed: {0}")]
	MapFailed(crate::device::DeviceError),
	#[error("no memory type matches type mask {mask:#b} with required flags {required:?}")]
	NoSuitableMemoryType { mask: u32, required: crate::MemoryPropertyFlags },
	#[error("out of device memory: every candidate memory type was exhausted, or a heap size limit would be exceeded")]
	OutOfDeviceMemory,
}

impl AllocatorError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			AllocatorError::ZeroSize
			| AllocatorError::InvalidAlignment(_)
			| AllocatorError::ConflictingFlags(_)
			| AllocatorError::InvalidPoolCreateInfo(_)
			| AllocatorError::HeapLimitMismatch(_, _)
			| AllocatorError::PoolNotEmpty(_, _)
			| AllocatorError::AllocationLost
			| AllocatorError::NotHostVisible(_)
			| AllocatorError::NotMapped
			| AllocatorError::DefragmentationState(_)
			| AllocatorError::CorruptedMargin(_) => ErrorKind::Validation,
			AllocatorError::NoSuitableMemoryType { .. } => ErrorKind::NoSuitableMemoryType,
			AllocatorError::MapFailed(_) | AllocatorError::OutOfDeviceMemory => {
				ErrorKind::OutOfDeviceMemory
			}
		}
	}
}
