//! Optional operation trace: one JSON object per line, written as operations
//! happen. A recorded trace replays an application's allocation pattern
//! offline, which is how fragmentation pathologies get diagnosed and how
//! allocator changes get benchmarked against real workloads.

use std::io::Write;

use parking_lot::Mutex;
use serde::Serialize;

use crate::DeviceSize;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum TraceEntry<'a> {
	Allocate {
		id: u64,
		size: DeviceSize,
		alignment: DeviceSize,
		memory_type: u32,
		flags: u32,
		#[serde(skip_serializing_if = "Option::is_none")]
		pool: Option<u64>,
		dedicated: bool,
	},
	Free {
		id: u64,
	},
	CreatePool {
		id: u64,
		#[serde(skip_serializing_if = "Option::is_none")]
		name: Option<&'a str>,
		memory_type: u32,
	},
	DestroyPool {
		id: u64,
	},
	SetFrame {
		frame: u32,
	},
	MakeLost {
		pool: u64,
		count: usize,
		bytes: DeviceSize,
	},
	DefragmentationBegin,
	DefragmentationEnd {
		bytes_moved: DeviceSize,
		allocations_moved: usize,
		bytes_freed: DeviceSize,
		blocks_freed: usize,
	},
}

/// Line-oriented trace writer. Failures are logged once per recorder and the
/// trace silently stops; allocation must never fail because a log disk is full.
pub(crate) struct TraceRecorder {
	sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl TraceRecorder {
	pub fn new(sink: Box<dyn Write + Send>) -> Self {
		TraceRecorder {
			sink: Mutex::new(Some(sink)),
		}
	}

	pub fn record(&self, entry: &TraceEntry<'_>) {
		let mut guard = self.sink.lock();
		let Some(sink) = guard.as_mut() else {
			return;
		};
		let result = serde_json::to_writer(&mut *sink, entry)
			.map_err(std::io::Error::from)
			.and_then(|_| sink.write_all(b"\n"));
		if let Err(e) = result {
			log::warn!("operation trace disabled, write failed: {}", e);
			*guard = None;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex as StdMutex};

	#[derive(Clone)]
	struct SharedBuf(Arc<StdMutex<Vec<u8>>>);

	impl Write for SharedBuf {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}
		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn records_json_lines() {
		let buf = SharedBuf(Arc::new(StdMutex::new(Vec::new())));
		let recorder = TraceRecorder::new(Box::new(buf.clone()));
		recorder.record(&TraceEntry::SetFrame { frame: 7 });
		recorder.record(&TraceEntry::Free { id: 3 });

		let bytes = buf.0.lock().unwrap().clone();
		let text = String::from_utf8(bytes).unwrap();
		let lines: Vec<&str> = text.lines().collect();
		assert_eq!(lines.len(), 2);
		let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
		assert_eq!(first["op"], "set_frame");
		assert_eq!(first["frame"], 7);
	}
}
