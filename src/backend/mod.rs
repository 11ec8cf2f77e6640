use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use crossbeam_channel::Sender;

use kawpow_spec::{HASH_BYTES, HEADER_BYTES};

pub mod cpu;
pub mod error;
pub mod nvidia;

/// One contiguous nonce range to scan against a header/target pair.
///
/// `work_id` is non-zero and monotonically increasing; backends use it
/// to replace stale work and to arbitrate the first solution.
#[derive(Debug, Clone)]
pub struct SearchJob {
    pub work_id: u64,
    pub header: [u8; HEADER_BYTES],
    pub target: [u8; HASH_BYTES],
    pub start_nonce: u64,
    pub nonce_count: u64,
    pub stop_at: Instant,
}

#[derive(Debug, Clone)]
pub struct MiningSolution {
    pub work_id: u64,
    pub nonce: u64,
    pub hash: [u8; HASH_BYTES],
    pub mix: [u8; HASH_BYTES],
    pub backend: &'static str,
}

#[derive(Debug, Clone)]
pub enum BackendEvent {
    Hashes {
        backend: &'static str,
        work_id: u64,
        count: u64,
    },
    Solution(MiningSolution),
    /// The assigned range was fully scanned without a solution.
    Exhausted {
        backend: &'static str,
        work_id: u64,
    },
    Error {
        backend: &'static str,
        message: String,
    },
}

pub trait PowBackend: Send {
    fn name(&self) -> &'static str;

    /// Concurrent hash lanes this backend runs (threads for the CPU
    /// path, resident kernel threads for a GPU).
    fn lanes(&self) -> usize;

    fn set_event_sink(&mut self, sink: Sender<BackendEvent>);

    /// Hand the backend its (device-resident, read-only) copy of the DAG.
    fn load_dag(&mut self, dag: Arc<Vec<u8>>) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);

    fn set_work(&self, job: SearchJob) -> Result<()>;

    fn kernel_bench(&self, _seconds: u64, _shutdown: &AtomicBool) -> Result<u64> {
        bail!(
            "kernel benchmark is not implemented for backend '{}'",
            self.name()
        )
    }
}

/// How many nonces of a `nonce_count`-sized chunk land on the lane at
/// `lane_idx` when lanes stride by `stride`.
pub(crate) fn lane_quota_for_chunk(nonce_count: u64, lane_idx: u64, stride: u64) -> u64 {
    let stride = stride.max(1);
    if lane_idx >= nonce_count {
        return 0;
    }
    (nonce_count - lane_idx).div_ceil(stride)
}
