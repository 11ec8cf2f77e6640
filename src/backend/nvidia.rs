//! NVIDIA CUDA backend.
//!
//! Owns one CUDA context on a worker thread. The search kernel is
//! embedded as CUDA C and compiled with NVRTC at DAG-load time for the
//! probed compute capability; the DAG is uploaded once and kept
//! device-resident. Each assignment is processed as a sequence of
//! launches sized `grid * block * NONCES_PER_THREAD`, with the result
//! slot read back between launches.

use std::collections::VecDeque;
use std::ffi::{c_char, CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use cudarc::{
    driver::{
        sys, CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
    },
    nvrtc::{result as nvrtc_result, sys as nvrtc_sys, Ptx},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kawpow_spec::{HASH_BYTES, HEADER_BYTES, PROGPOW_CACHE_BYTES};

use crate::backend::error::{validate_search_inputs, GpuError, GpuResult};
use crate::backend::{BackendEvent, MiningSolution, PowBackend, SearchJob};

const BACKEND_NAME: &str = "nvidia";
const KERNEL_SRC: &str = include_str!("kawpow_kernel.cu");
const KERNEL_NAME: &str = "kawpow_search";
const COMMAND_CHANNEL_CAPACITY: usize = 64;
const NONCES_PER_THREAD: u32 = 3;
const DEFAULT_BLOCK_THREADS: u32 = 128;
const BLOCKS_PER_SM_CANDIDATES: &[u32] = &[1, 2, 3, 4];
const AUTOTUNE_SCHEMA_VERSION: u32 = 1;
const HASH_EVENT_BATCH_LAUNCHES: u64 = 8;

#[derive(Debug, Clone)]
pub struct NvidiaDeviceInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub memory_free_mib: Option<u64>,
}

/// Resolved kernel launch geometry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchTuning {
    pub grid_blocks: u32,
    pub block_threads: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct NvidiaTuningOptions {
    pub grid_blocks_override: Option<u32>,
    pub block_threads: u32,
    pub autotune_secs: u64,
}

impl Default for NvidiaTuningOptions {
    fn default() -> Self {
        Self {
            grid_blocks_override: None,
            block_threads: DEFAULT_BLOCK_THREADS,
            autotune_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct AutotuneKey {
    device_name: String,
    compute_cap_major: u32,
    compute_cap_minor: u32,
    block_threads: u32,
    nonces_per_thread: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutotuneRecord {
    key: AutotuneKey,
    grid_blocks: u32,
    measured_hps: f64,
    timestamp_unix_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AutotuneCache {
    schema_version: u32,
    records: Vec<AutotuneRecord>,
}

struct NvidiaShared {
    event_sink: RwLock<Option<Sender<BackendEvent>>>,
    lanes: AtomicUsize,
}

enum WorkerCommand {
    LoadDag(Arc<Vec<u8>>, Sender<Result<()>>),
    Assign(SearchJob),
    Stop,
}

struct NvidiaWorker {
    command_tx: Sender<WorkerCommand>,
    handle: JoinHandle<()>,
}

struct ActiveAssignment {
    job: SearchJob,
    next_nonce: u64,
    remaining: u64,
    launches_since_event: u64,
    hashes_since_event: u64,
}

pub struct NvidiaBackend {
    requested_device_index: Option<u32>,
    tuning_options: NvidiaTuningOptions,
    autotune_cache_path: PathBuf,
    shared: Arc<NvidiaShared>,
    pending_dag: Mutex<Option<Arc<Vec<u8>>>>,
    worker: Mutex<Option<NvidiaWorker>>,
}

impl NvidiaBackend {
    pub fn new(
        device_index: Option<u32>,
        autotune_cache_path: PathBuf,
        tuning_options: NvidiaTuningOptions,
    ) -> Self {
        Self {
            requested_device_index: device_index,
            tuning_options,
            autotune_cache_path,
            shared: Arc::new(NvidiaShared {
                event_sink: RwLock::new(None),
                lanes: AtomicUsize::new(1),
            }),
            pending_dag: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn select_device(&self) -> Result<NvidiaDeviceInfo> {
        let devices = query_nvidia_devices()?;
        match self.requested_device_index {
            Some(requested) => devices
                .iter()
                .find(|device| device.index == requested)
                .cloned()
                .ok_or_else(|| {
                    let available = devices
                        .iter()
                        .map(|device| device.index.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    anyhow!(
                        "NVIDIA device index {requested} not found; available: [{available}]"
                    )
                }),
            None => Ok(devices[0].clone()),
        }
    }

    fn command_tx(&self) -> Result<Sender<WorkerCommand>> {
        let guard = self
            .worker
            .lock()
            .map_err(|_| anyhow!("nvidia worker lock poisoned"))?;
        let Some(worker) = guard.as_ref() else {
            bail!("NVIDIA backend is not started");
        };
        Ok(worker.command_tx.clone())
    }
}

impl Drop for NvidiaBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PowBackend for NvidiaBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn lanes(&self) -> usize {
        self.shared.lanes.load(Ordering::Acquire).max(1)
    }

    fn set_event_sink(&mut self, sink: Sender<BackendEvent>) {
        if let Ok(mut slot) = self.shared.event_sink.write() {
            *slot = Some(sink);
        }
    }

    fn load_dag(&mut self, dag: Arc<Vec<u8>>) -> Result<()> {
        validate_search_inputs(HEADER_BYTES, dag.len() as u64)
            .map_err(|err| anyhow!("rejecting DAG: {err}"))?;

        {
            let mut pending = self
                .pending_dag
                .lock()
                .map_err(|_| anyhow!("nvidia DAG lock poisoned"))?;
            *pending = Some(Arc::clone(&dag));
        }

        // If the worker is already up, upload right away and wait for
        // the engine rebuild to finish.
        if let Ok(tx) = self.command_tx() {
            let (ack_tx, ack_rx) = bounded::<Result<()>>(1);
            tx.send(WorkerCommand::LoadDag(dag, ack_tx))
                .map_err(|_| anyhow!("nvidia worker channel closed while loading DAG"))?;
            ack_rx
                .recv()
                .map_err(|_| anyhow!("nvidia worker did not acknowledge DAG load"))??;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        {
            let guard = self
                .worker
                .lock()
                .map_err(|_| anyhow!("nvidia worker lock poisoned"))?;
            if guard.is_some() {
                return Ok(());
            }
        }

        let device = self.select_device()?;
        info!(
            device = device.name.as_str(),
            index = device.index,
            memory_mib = device.memory_total_mib,
            free_mib = ?device.memory_free_mib,
            "starting NVIDIA backend"
        );

        let (command_tx, command_rx) = bounded::<WorkerCommand>(COMMAND_CHANNEL_CAPACITY);
        let shared = Arc::clone(&self.shared);
        let options = self.tuning_options;
        let cache_path = self.autotune_cache_path.clone();
        let handle = thread::Builder::new()
            .name(format!("kawminer-nvidia-{}", device.index))
            .spawn(move || worker_loop(device, options, cache_path, command_rx, shared))
            .map_err(|err| anyhow!("failed to spawn nvidia worker thread: {err}"))?;

        {
            let mut guard = self
                .worker
                .lock()
                .map_err(|_| anyhow!("nvidia worker lock poisoned"))?;
            *guard = Some(NvidiaWorker { command_tx, handle });
        }

        // Replay a DAG that was handed to us before start.
        let pending = self
            .pending_dag
            .lock()
            .map_err(|_| anyhow!("nvidia DAG lock poisoned"))?
            .clone();
        if let Some(dag) = pending {
            let tx = self.command_tx()?;
            let (ack_tx, ack_rx) = bounded::<Result<()>>(1);
            tx.send(WorkerCommand::LoadDag(dag, ack_tx))
                .map_err(|_| anyhow!("nvidia worker channel closed while loading DAG"))?;
            ack_rx
                .recv()
                .map_err(|_| anyhow!("nvidia worker did not acknowledge DAG load"))??;
        }

        Ok(())
    }

    fn stop(&mut self) {
        let worker = match self.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            let _ = worker.command_tx.send(WorkerCommand::Stop);
            let _ = worker.handle.join();
        }
    }

    fn set_work(&self, job: SearchJob) -> Result<()> {
        if job.work_id == 0 {
            bail!("work_id must be non-zero");
        }
        if job.nonce_count == 0 {
            bail!("nonce_count must be non-zero");
        }
        self.command_tx()?
            .send(WorkerCommand::Assign(job))
            .map_err(|_| anyhow!("nvidia worker channel closed while assigning work"))
    }

    fn kernel_bench(&self, seconds: u64, shutdown: &AtomicBool) -> Result<u64> {
        let device = self.select_device()?;
        let dag = {
            let pending = self
                .pending_dag
                .lock()
                .map_err(|_| anyhow!("nvidia DAG lock poisoned"))?
                .clone();
            pending.unwrap_or_else(|| {
                Arc::new(kawpow_spec::dag::synthetic_dag(16 * 1024 * 1024))
            })
        };

        let tuning = LaunchTuning {
            grid_blocks: self.tuning_options.grid_blocks_override.unwrap_or(0),
            block_threads: self.tuning_options.block_threads,
        };
        let mut engine = CudaSearchEngine::new(device.index, &dag, tuning)
            .with_context(|| format!("failed to initialize CUDA engine on '{}'", device.name))?;

        // Impossible target: the bench never terminates early.
        engine.set_job_inputs(&[0u8; HEADER_BYTES], &[0u8; HASH_BYTES])?;

        let deadline = Instant::now() + Duration::from_secs(seconds.max(1));
        let mut nonce_cursor = 1u64;
        let mut total = 0u64;
        while Instant::now() < deadline && !shutdown.load(Ordering::Acquire) {
            engine.launch(nonce_cursor)?;
            engine.synchronize()?;
            nonce_cursor = nonce_cursor.wrapping_add(engine.nonces_per_launch());
            total = total.saturating_add(engine.nonces_per_launch());
        }
        Ok(total)
    }
}

struct CudaSearchEngine {
    stream: Arc<CudaStream>,
    kernel: CudaFunction,
    dag: CudaSlice<u8>,
    dag_size: u64,
    header: CudaSlice<u8>,
    target: CudaSlice<u8>,
    result_nonce: CudaSlice<u64>,
    result_hash: CudaSlice<u8>,
    result_mix: CudaSlice<u8>,
    grid_blocks: u32,
    block_threads: u32,
    sm_count: u32,
    compute_cap: (u32, u32),
}

impl CudaSearchEngine {
    /// Build a device context, compile the kernel for the probed
    /// compute capability, and upload the DAG. A `grid_blocks` of 0
    /// defers to `2 * sm_count`.
    fn new(device_index: u32, dag_bytes: &[u8], tuning: LaunchTuning) -> GpuResult<Self> {
        validate_search_inputs(HEADER_BYTES, dag_bytes.len() as u64)?;

        let ctx = CudaContext::new(device_index as usize)?;
        let stream = ctx.default_stream();

        let (cc_major, cc_minor) = ctx.compute_capability()?;
        let sm_count = ctx
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)
            .map(|count| count.max(1) as u32)
            .unwrap_or(1);

        let nvrtc_options = vec![
            "--std=c++14".to_string(),
            format!("--gpu-architecture=sm_{}{}", cc_major, cc_minor),
            format!("-DKAWPOW_NONCES_PER_THREAD={}u", NONCES_PER_THREAD),
        ];
        debug!(options = ?nvrtc_options, "compiling kawpow_search with NVRTC");
        let cubin = compile_cubin(KERNEL_SRC, "kawpow_kernel.cu", &nvrtc_options)?;
        let module = ctx.load_module(Ptx::from_binary(cubin))?;
        let kernel = module
            .load_function(KERNEL_NAME)
            .map_err(|err| GpuError::Compilation(format!("missing kernel entry point: {err:?}")))?;

        info!(
            mib = dag_bytes.len() / (1024 * 1024),
            "uploading DAG to device"
        );
        let mut dag = unsafe { stream.alloc::<u8>(dag_bytes.len()) }.map_err(|err| {
            GpuError::DeviceMemory(format!(
                "failed to allocate {} DAG bytes: {err:?}",
                dag_bytes.len()
            ))
        })?;
        stream.memcpy_htod(dag_bytes, &mut dag)?;

        let header = stream.alloc_zeros::<u8>(HEADER_BYTES)?;
        let target = stream.alloc_zeros::<u8>(HASH_BYTES)?;
        let result_nonce = stream.alloc_zeros::<u64>(1)?;
        let result_hash = stream.alloc_zeros::<u8>(HASH_BYTES)?;
        let result_mix = stream.alloc_zeros::<u8>(HASH_BYTES)?;

        let grid_blocks = if tuning.grid_blocks > 0 {
            tuning.grid_blocks
        } else {
            sm_count * 2
        };

        Ok(Self {
            stream,
            kernel,
            dag,
            dag_size: dag_bytes.len() as u64,
            header,
            target,
            result_nonce,
            result_hash,
            result_mix,
            grid_blocks,
            block_threads: tuning.block_threads.max(32),
            sm_count,
            compute_cap: (
                u32::try_from(cc_major).unwrap_or(0),
                u32::try_from(cc_minor).unwrap_or(0),
            ),
        })
    }

    fn nonces_per_launch(&self) -> u64 {
        u64::from(self.grid_blocks) * u64::from(self.block_threads) * u64::from(NONCES_PER_THREAD)
    }

    fn resident_threads(&self) -> usize {
        (self.grid_blocks * self.block_threads) as usize
    }

    /// Upload header and target and clear the result slot.
    fn set_job_inputs(
        &mut self,
        header: &[u8; HEADER_BYTES],
        target: &[u8; HASH_BYTES],
    ) -> GpuResult<()> {
        self.stream.memcpy_htod(&header[..], &mut self.header)?;
        self.stream.memcpy_htod(&target[..], &mut self.target)?;
        self.reset_result()
    }

    fn reset_result(&mut self) -> GpuResult<()> {
        let zero = [0u64];
        self.stream.memcpy_htod(&zero[..], &mut self.result_nonce)?;
        Ok(())
    }

    fn launch(&mut self, start_nonce: u64) -> GpuResult<()> {
        let cfg = LaunchConfig {
            grid_dim: (self.grid_blocks, 1, 1),
            block_dim: (self.block_threads, 1, 1),
            shared_mem_bytes: PROGPOW_CACHE_BYTES as u32,
        };

        let header_len = HEADER_BYTES as u32;
        let dag_size = self.dag_size;
        unsafe {
            let mut launch = self.stream.launch_builder(&self.kernel);
            launch
                .arg(&self.header)
                .arg(&header_len)
                .arg(&self.dag)
                .arg(&dag_size)
                .arg(&self.target)
                .arg(&start_nonce)
                .arg(&mut self.result_nonce)
                .arg(&mut self.result_hash)
                .arg(&mut self.result_mix);
            launch
                .launch(cfg)
                .map_err(|err| GpuError::LaunchFailure(format!("{err:?}")))?;
        }
        Ok(())
    }

    fn synchronize(&self) -> GpuResult<()> {
        self.stream.synchronize()?;
        Ok(())
    }

    /// Read back the result slot; `Some` means a thread won the CAS.
    fn poll_result(&mut self) -> GpuResult<Option<(u64, [u8; HASH_BYTES], [u8; HASH_BYTES])>> {
        self.synchronize()?;
        let mut nonce_out = [0u64; 1];
        self.stream
            .memcpy_dtoh(&self.result_nonce, &mut nonce_out[..])?;
        if nonce_out[0] == 0 {
            return Ok(None);
        }

        let mut hash = [0u8; HASH_BYTES];
        let mut mix = [0u8; HASH_BYTES];
        self.stream.memcpy_dtoh(&self.result_hash, &mut hash[..])?;
        self.stream.memcpy_dtoh(&self.result_mix, &mut mix[..])?;
        Ok(Some((nonce_out[0], hash, mix)))
    }
}

fn worker_loop(
    device: NvidiaDeviceInfo,
    options: NvidiaTuningOptions,
    cache_path: PathBuf,
    command_rx: Receiver<WorkerCommand>,
    shared: Arc<NvidiaShared>,
) {
    let mut engine: Option<CudaSearchEngine> = None;
    let mut active: Option<ActiveAssignment> = None;
    let mut queued: VecDeque<SearchJob> = VecDeque::new();

    loop {
        // Drain commands; block only when there is nothing to run.
        let mut disconnected = false;
        loop {
            let command = if active.is_none() && queued.is_empty() {
                match command_rx.recv() {
                    Ok(command) => command,
                    Err(_) => {
                        disconnected = true;
                        break;
                    }
                }
            } else {
                match command_rx.try_recv() {
                    Ok(command) => command,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            };

            match command {
                WorkerCommand::LoadDag(dag, ack) => {
                    // A new DAG means a new epoch; in-flight work is stale.
                    active = None;
                    queued.clear();
                    let result = build_engine(&device, &options, &cache_path, &dag, &shared);
                    match result {
                        Ok(built) => {
                            engine = Some(built);
                            let _ = ack.send(Ok(()));
                        }
                        Err(err) => {
                            let _ = ack.send(Err(anyhow!("{err}")));
                        }
                    }
                }
                WorkerCommand::Assign(job) => {
                    // Replace semantics: new work supersedes the old.
                    active = None;
                    queued.clear();
                    queued.push_back(job);
                }
                WorkerCommand::Stop => return,
            }
        }
        if disconnected {
            return;
        }

        if active.is_none() {
            if let Some(job) = queued.pop_front() {
                let Some(engine) = engine.as_mut() else {
                    emit_error(&shared, "no DAG loaded; dropping assignment".to_string());
                    continue;
                };
                if let Err(err) = engine.set_job_inputs(&job.header, &job.target) {
                    emit_error(&shared, format!("failed to stage job inputs: {err}"));
                    continue;
                }
                active = Some(ActiveAssignment {
                    next_nonce: job.start_nonce,
                    remaining: job.nonce_count,
                    launches_since_event: 0,
                    hashes_since_event: 0,
                    job,
                });
            }
        }

        if active.is_some() && engine.is_none() {
            active = None;
            continue;
        }
        let (Some(assignment), Some(engine)) = (active.as_mut(), engine.as_mut()) else {
            continue;
        };

        if assignment.remaining == 0 || Instant::now() >= assignment.job.stop_at {
            flush_hashes(&shared, assignment);
            emit_event(
                &shared,
                BackendEvent::Exhausted {
                    backend: BACKEND_NAME,
                    work_id: assignment.job.work_id,
                },
            );
            active = None;
            continue;
        }

        // The kernel always covers a full launch worth of nonces; a
        // partial tail chunk is overscanned rather than resized.
        let per_launch = engine.nonces_per_launch();
        let result = engine
            .launch(assignment.next_nonce)
            .and_then(|()| engine.poll_result());
        match result {
            Ok(Some((nonce, hash, mix))) => {
                assignment.hashes_since_event += per_launch.min(assignment.remaining);
                assignment.remaining = 0;
                flush_hashes(&shared, assignment);
                emit_event(
                    &shared,
                    BackendEvent::Solution(MiningSolution {
                        work_id: assignment.job.work_id,
                        nonce,
                        hash,
                        mix,
                        backend: BACKEND_NAME,
                    }),
                );
                active = None;
            }
            Ok(None) => {
                let counted = per_launch.min(assignment.remaining);
                assignment.next_nonce = assignment.next_nonce.wrapping_add(per_launch);
                assignment.remaining = assignment.remaining.saturating_sub(per_launch);
                assignment.hashes_since_event += counted;
                assignment.launches_since_event += 1;
                if assignment.launches_since_event >= HASH_EVENT_BATCH_LAUNCHES {
                    flush_hashes(&shared, assignment);
                }
            }
            Err(err) => {
                emit_error(&shared, format!("CUDA launch failed: {err}"));
                active = None;
            }
        }
    }
}

fn build_engine(
    device: &NvidiaDeviceInfo,
    options: &NvidiaTuningOptions,
    cache_path: &Path,
    dag: &[u8],
    shared: &NvidiaShared,
) -> GpuResult<CudaSearchEngine> {
    let tuning = LaunchTuning {
        grid_blocks: options.grid_blocks_override.unwrap_or(0),
        block_threads: options.block_threads,
    };
    let mut engine = CudaSearchEngine::new(device.index, dag, tuning)?;

    if options.grid_blocks_override.is_none() {
        let key = AutotuneKey {
            device_name: device.name.clone(),
            compute_cap_major: engine.compute_cap.0,
            compute_cap_minor: engine.compute_cap.1,
            block_threads: engine.block_threads,
            nonces_per_thread: NONCES_PER_THREAD,
        };

        if let Some(cached) = load_cached_tuning(cache_path, &key) {
            debug!(grid_blocks = cached.grid_blocks, "using cached launch tuning");
            engine.grid_blocks = cached.grid_blocks;
        } else {
            let tuned = autotune_grid(&mut engine, options.autotune_secs);
            if let Some((grid_blocks, hps)) = tuned {
                engine.grid_blocks = grid_blocks;
                if let Err(err) = persist_tuning(cache_path, key, grid_blocks, hps) {
                    warn!("failed to persist launch tuning: {err:#}");
                }
            }
        }
    }

    info!(
        grid_blocks = engine.grid_blocks,
        block_threads = engine.block_threads,
        sm_count = engine.sm_count,
        nonces_per_launch = engine.nonces_per_launch(),
        "CUDA search engine ready"
    );
    shared
        .lanes
        .store(engine.resident_threads(), Ordering::Release);
    Ok(engine)
}

/// Measure candidate grid sizes with an impossible target and keep the
/// fastest. Returns `(grid_blocks, hashes_per_second)`.
fn autotune_grid(engine: &mut CudaSearchEngine, secs: u64) -> Option<(u32, f64)> {
    if engine
        .set_job_inputs(&[0u8; HEADER_BYTES], &[0u8; HASH_BYTES])
        .is_err()
    {
        return None;
    }

    let per_candidate = Duration::from_secs(secs.max(1))
        / BLOCKS_PER_SM_CANDIDATES.len() as u32;
    let mut best: Option<(u32, f64)> = None;

    for &blocks_per_sm in BLOCKS_PER_SM_CANDIDATES {
        let grid_blocks = engine.sm_count * blocks_per_sm;
        engine.grid_blocks = grid_blocks;

        let started = Instant::now();
        let deadline = started + per_candidate;
        let mut hashes = 0u64;
        let mut nonce_cursor = 1u64;
        let mut failed = false;
        while Instant::now() < deadline {
            if engine
                .launch(nonce_cursor)
                .and_then(|()| engine.synchronize())
                .is_err()
            {
                failed = true;
                break;
            }
            nonce_cursor = nonce_cursor.wrapping_add(engine.nonces_per_launch());
            hashes = hashes.saturating_add(engine.nonces_per_launch());
        }
        if failed || hashes == 0 {
            continue;
        }

        let hps = hashes as f64 / started.elapsed().as_secs_f64().max(1e-6);
        debug!(grid_blocks, hps, "autotune sample");
        match best {
            Some((_, best_hps)) if hps <= best_hps => {}
            _ => best = Some((grid_blocks, hps)),
        }
    }

    best
}

fn empty_autotune_cache() -> AutotuneCache {
    AutotuneCache {
        schema_version: AUTOTUNE_SCHEMA_VERSION,
        records: Vec::new(),
    }
}

fn load_autotune_cache(path: &Path) -> Option<AutotuneCache> {
    let raw = fs::read_to_string(path).ok()?;
    let parsed = serde_json::from_str::<AutotuneCache>(&raw).ok()?;
    if parsed.schema_version != AUTOTUNE_SCHEMA_VERSION {
        return None;
    }
    Some(parsed)
}

fn load_cached_tuning(path: &Path, key: &AutotuneKey) -> Option<LaunchTuning> {
    let cache = load_autotune_cache(path)?;
    let record = cache
        .records
        .iter()
        .filter(|record| &record.key == key && record.grid_blocks > 0)
        .max_by_key(|record| record.timestamp_unix_secs)?;
    Some(LaunchTuning {
        grid_blocks: record.grid_blocks,
        block_threads: key.block_threads,
    })
}

fn persist_tuning(path: &Path, key: AutotuneKey, grid_blocks: u32, measured_hps: f64) -> Result<()> {
    let mut cache = load_autotune_cache(path).unwrap_or_else(empty_autotune_cache);

    let timestamp_unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0);
    let updated = AutotuneRecord {
        key: key.clone(),
        grid_blocks,
        measured_hps: if measured_hps.is_finite() {
            measured_hps.max(0.0)
        } else {
            0.0
        },
        timestamp_unix_secs,
    };
    if let Some(existing) = cache.records.iter_mut().find(|record| record.key == key) {
        *existing = updated;
    } else {
        cache.records.push(updated);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create tuning cache directory '{}'", parent.display())
        })?;
    }
    let payload = serde_json::to_string_pretty(&cache)?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write tuning cache '{}'", path.display()))?;
    Ok(())
}

fn flush_hashes(shared: &NvidiaShared, assignment: &mut ActiveAssignment) {
    if assignment.hashes_since_event == 0 {
        return;
    }
    let count = assignment.hashes_since_event;
    assignment.hashes_since_event = 0;
    assignment.launches_since_event = 0;
    emit_event(
        shared,
        BackendEvent::Hashes {
            backend: BACKEND_NAME,
            work_id: assignment.job.work_id,
            count,
        },
    );
}

fn emit_error(shared: &NvidiaShared, message: String) {
    emit_event(
        shared,
        BackendEvent::Error {
            backend: BACKEND_NAME,
            message,
        },
    );
}

fn emit_event(shared: &NvidiaShared, event: BackendEvent) {
    let tx = match shared.event_sink.read() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Owns an NVRTC program handle; releasing it on drop keeps every
/// error path below leak-free without explicit destroy calls.
struct NvrtcProgram(nvrtc_sys::nvrtcProgram);

impl NvrtcProgram {
    fn create(source: &CString, name: &CString) -> GpuResult<Self> {
        nvrtc_result::create_program(source, Some(name))
            .map(Self)
            .map_err(|err| nvrtc_failure("nvrtcCreateProgram", err))
    }

    /// Compiler diagnostics, if NVRTC produced any.
    fn log(&self) -> Option<String> {
        let raw = unsafe { nvrtc_result::get_program_log(self.0) }.ok()?;
        if raw.is_empty() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(raw.as_ptr()) }
            .to_string_lossy()
            .trim()
            .to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn cubin(&self) -> GpuResult<Vec<u8>> {
        let mut size = 0usize;
        unsafe { nvrtc_sys::nvrtcGetCUBINSize(self.0, &mut size) }
            .result()
            .map_err(|err| nvrtc_failure("nvrtcGetCUBINSize", err))?;
        if size == 0 {
            return Err(GpuError::Compilation(
                "NVRTC produced an empty CUBIN".to_string(),
            ));
        }

        let mut cubin = vec![0u8; size];
        unsafe { nvrtc_sys::nvrtcGetCUBIN(self.0, cubin.as_mut_ptr().cast::<c_char>()) }
            .result()
            .map_err(|err| nvrtc_failure("nvrtcGetCUBIN", err))?;
        Ok(cubin)
    }
}

impl Drop for NvrtcProgram {
    fn drop(&mut self) {
        let _ = unsafe { nvrtc_result::destroy_program(self.0) };
    }
}

fn nvrtc_failure(call: &str, err: impl std::fmt::Debug) -> GpuError {
    GpuError::Compilation(format!("{call} failed: {err:?}"))
}

fn compile_cubin(source: &str, program_name: &str, options: &[String]) -> GpuResult<Vec<u8>> {
    let source_c = CString::new(source)
        .map_err(|_| GpuError::Compilation("kernel source contains NUL byte".to_string()))?;
    let name_c = CString::new(program_name)
        .map_err(|_| GpuError::Compilation("program name contains NUL byte".to_string()))?;

    let program = NvrtcProgram::create(&source_c, &name_c)?;
    if let Err(err) = unsafe { nvrtc_result::compile_program(program.0, options) } {
        return Err(GpuError::Compilation(match program.log() {
            Some(log) => format!("{err:?}; log: {log}"),
            None => format!("{err:?}"),
        }));
    }
    program.cubin()
}

fn query_nvidia_devices() -> Result<Vec<NvidiaDeviceInfo>> {
    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .context("could not run nvidia-smi; is the NVIDIA driver installed?")?;

    if !output.status.success() {
        bail!(
            "nvidia-smi exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let devices = parse_nvidia_smi_query_output(&String::from_utf8_lossy(&output.stdout))?;
    if devices.is_empty() {
        bail!("nvidia-smi reported no devices");
    }
    Ok(devices)
}

/// Each row is `index, name, memory.total[, memory.free]`. GPU names
/// may themselves contain commas, so the index is taken from the front,
/// the memory numbers from the back, and the name is whatever sits
/// between them. Three-field rows come from drivers that do not report
/// memory.free.
fn parse_nvidia_smi_row(row: &str) -> Result<NvidiaDeviceInfo> {
    let fields: Vec<&str> = row.split(',').map(str::trim).collect();
    let memory_field_count = match fields.len() {
        0..=2 => bail!("truncated nvidia-smi row '{row}'"),
        3 => 1,
        _ => 2,
    };

    let index: u32 = fields[0]
        .parse()
        .with_context(|| format!("bad GPU index in nvidia-smi row '{row}'"))?;

    let memory = &fields[fields.len() - memory_field_count..];
    let memory_total_mib: u64 = memory[0]
        .parse()
        .with_context(|| format!("bad memory.total in nvidia-smi row '{row}'"))?;
    let memory_free_mib = match memory.get(1) {
        Some(field) => Some(
            field
                .parse()
                .with_context(|| format!("bad memory.free in nvidia-smi row '{row}'"))?,
        ),
        None => None,
    };

    let name = fields[1..fields.len() - memory_field_count].join(", ");
    if name.is_empty() {
        bail!("missing GPU name in nvidia-smi row '{row}'");
    }

    Ok(NvidiaDeviceInfo {
        index,
        name,
        memory_total_mib,
        memory_free_mib,
    })
}

fn parse_nvidia_smi_query_output(raw: &str) -> Result<Vec<NvidiaDeviceInfo>> {
    raw.lines()
        .map(str::trim)
        .filter(|row| !row.is_empty())
        .map(parse_nvidia_smi_row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_file(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be >= unix epoch")
            .as_nanos();
        path.push(format!(
            "kawminer-tuning-{}-{}-{name}.json",
            std::process::id(),
            now
        ));
        path
    }

    fn test_key() -> AutotuneKey {
        AutotuneKey {
            device_name: "NVIDIA GeForce RTX 3060".to_string(),
            compute_cap_major: 8,
            compute_cap_minor: 6,
            block_threads: 128,
            nonces_per_thread: NONCES_PER_THREAD,
        }
    }

    #[test]
    fn parse_smi_output_with_free_memory() {
        let parsed = parse_nvidia_smi_query_output(
            "0, NVIDIA GeForce RTX 3060, 12288, 11000\n1, NVIDIA RTX A4000, 16384, 15000\n",
        )
        .expect("query output should parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].index, 0);
        assert_eq!(parsed[0].name, "NVIDIA GeForce RTX 3060");
        assert_eq!(parsed[0].memory_total_mib, 12_288);
        assert_eq!(parsed[0].memory_free_mib, Some(11_000));
        assert_eq!(parsed[1].name, "NVIDIA RTX A4000");
    }

    #[test]
    fn parse_smi_output_without_free_memory() {
        let parsed = parse_nvidia_smi_query_output("0, Tesla T4, 15360\n")
            .expect("3-column output should parse");
        assert_eq!(parsed[0].memory_total_mib, 15_360);
        assert_eq!(parsed[0].memory_free_mib, None);
    }

    #[test]
    fn parse_smi_output_reassembles_comma_names() {
        let parsed =
            parse_nvidia_smi_query_output("0, NVIDIA TITAN V, JHH Edition, 12288, 9000\n")
                .expect("comma name should parse");
        assert_eq!(parsed[0].name, "NVIDIA TITAN V, JHH Edition");
        assert_eq!(parsed[0].memory_total_mib, 12_288);
        assert_eq!(parsed[0].memory_free_mib, Some(9_000));
    }

    #[test]
    fn parse_smi_output_rejects_garbage() {
        let err = parse_nvidia_smi_query_output("abc, RTX, 8192")
            .expect_err("invalid index should fail");
        assert!(format!("{err:#}").contains("bad GPU index"));
        assert!(parse_nvidia_smi_query_output("0, RTX").is_err());
    }

    #[test]
    fn tuning_cache_round_trip_keeps_latest_record() {
        let path = unique_temp_file("roundtrip");
        let key = test_key();
        persist_tuning(&path, key.clone(), 28, 1.0e7).expect("first record should persist");
        persist_tuning(&path, key.clone(), 56, 2.0e7).expect("second record should persist");

        let loaded = load_cached_tuning(&path, &key).expect("cached tuning should load");
        assert_eq!(loaded.grid_blocks, 56);
        assert_eq!(loaded.block_threads, 128);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn tuning_cache_misses_on_different_key() {
        let path = unique_temp_file("keymiss");
        persist_tuning(&path, test_key(), 28, 1.0).expect("record should persist");

        let mut other = test_key();
        other.block_threads = 256;
        assert!(load_cached_tuning(&path, &other).is_none());
        let _ = fs::remove_file(path);
    }

    #[test]
    fn tuning_cache_ignores_unknown_schema() {
        let path = unique_temp_file("schema");
        fs::write(&path, r#"{"schema_version": 999, "records": []}"#).unwrap();
        assert!(load_autotune_cache(&path).is_none());
        let _ = fs::remove_file(path);
    }

    #[test]
    #[ignore] // requires a CUDA device
    fn gpu_end_to_end_easy_target() {
        use kawpow_spec::dag::synthetic_dag;

        let dag = Arc::new(synthetic_dag(1024 * 1024));
        let mut engine =
            CudaSearchEngine::new(0, &dag, LaunchTuning { grid_blocks: 8, block_threads: 128 })
                .expect("engine should build");
        engine
            .set_job_inputs(&[0u8; 32], &[0xFF; 32])
            .expect("inputs should stage");
        engine.launch(1).expect("launch should succeed");
        let (nonce, hash, mix) = engine
            .poll_result()
            .expect("poll should succeed")
            .expect("every nonce meets an all-ones target");

        // The winning nonce must reproduce on the CPU oracle.
        let dag_view = kawpow_spec::dag::DagView::new(&dag).unwrap();
        let expect = kawpow_spec::progpow::progpow_hash(&[0u8; 32], nonce, &dag_view);
        assert_eq!(hash, expect.digest);
        assert_eq!(mix, expect.mix);
    }

    #[test]
    #[ignore] // requires a CUDA device
    fn gpu_impossible_target_scans_clean() {
        use kawpow_spec::dag::synthetic_dag;

        let dag = Arc::new(synthetic_dag(1024 * 1024));
        let mut engine =
            CudaSearchEngine::new(0, &dag, LaunchTuning { grid_blocks: 56, block_threads: 128 })
                .expect("engine should build");
        engine
            .set_job_inputs(&[0u8; 32], &[0u8; 32])
            .expect("inputs should stage");

        // Scan at least 10^6 nonces; the result slot must stay zero.
        let mut scanned = 0u64;
        let mut nonce_cursor = 1u64;
        while scanned < 1_000_000 {
            engine.launch(nonce_cursor).expect("launch should succeed");
            assert!(engine.poll_result().expect("poll should succeed").is_none());
            nonce_cursor = nonce_cursor.wrapping_add(engine.nonces_per_launch());
            scanned += engine.nonces_per_launch();
        }
    }
}
