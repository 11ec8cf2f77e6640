//! CPU reference backend.
//!
//! Not a competitive execution path; it exists as the oracle the GPU
//! dispatchers are checked against and as a fallback when no device is
//! present. Worker threads stride the nonce range so that any prefix of
//! the range is covered evenly.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::Sender;

use kawpow_spec::dag::{synthetic_dag, DagView};
use kawpow_spec::progpow::progpow_hash;
use kawpow_spec::{hash_meets_target, PROGPOW_CACHE_BYTES};

use crate::backend::{
    lane_quota_for_chunk, BackendEvent, MiningSolution, PowBackend, SearchJob,
};

const BACKEND_NAME: &str = "cpu";
const IDLE_SLEEP: Duration = Duration::from_millis(2);
const STALE_SLEEP: Duration = Duration::from_millis(1);
const HASH_EVENT_BATCH: u64 = 16;
const BENCH_DAG_BYTES: usize = 1024 * 1024;

struct Shared {
    started: AtomicBool,
    shutdown: AtomicBool,
    current_work: AtomicU64,
    solved_work: AtomicU64,
    finished_workers: AtomicUsize,
    work: RwLock<Option<Arc<SearchJob>>>,
    dag: RwLock<Option<Arc<Vec<u8>>>>,
    event_sink: RwLock<Option<Sender<BackendEvent>>>,
}

pub struct CpuBackend {
    threads: usize,
    shared: Arc<Shared>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl CpuBackend {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            shared: Arc::new(Shared {
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                current_work: AtomicU64::new(0),
                solved_work: AtomicU64::new(0),
                finished_workers: AtomicUsize::new(0),
                work: RwLock::new(None),
                dag: RwLock::new(None),
                event_sink: RwLock::new(None),
            }),
            worker_handles: Vec::new(),
        }
    }
}

impl PowBackend for CpuBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn lanes(&self) -> usize {
        self.threads
    }

    fn set_event_sink(&mut self, sink: Sender<BackendEvent>) {
        if let Ok(mut slot) = self.shared.event_sink.write() {
            *slot = Some(sink);
        }
    }

    fn load_dag(&mut self, dag: Arc<Vec<u8>>) -> Result<()> {
        DagView::new(&dag).map_err(|err| anyhow!("rejecting DAG: {err}"))?;
        let mut slot = self
            .shared
            .dag
            .write()
            .map_err(|_| anyhow!("cpu DAG lock poisoned"))?;
        *slot = Some(dag);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.shutdown.store(false, Ordering::SeqCst);
        self.shared.current_work.store(0, Ordering::SeqCst);
        self.shared.solved_work.store(0, Ordering::SeqCst);
        self.shared.finished_workers.store(0, Ordering::SeqCst);

        if let Ok(mut work) = self.shared.work.write() {
            *work = None;
        }

        let lanes = self.threads;
        for thread_idx in 0..lanes {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("kawminer-cpu-{thread_idx}"))
                .spawn(move || cpu_worker_loop(shared, thread_idx, lanes))
                .map_err(|err| anyhow!("failed to spawn cpu worker thread: {err}"))?;
            self.worker_handles.push(handle);
        }

        Ok(())
    }

    fn stop(&mut self) {
        if !self.shared.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.shared.shutdown.store(true, Ordering::SeqCst);
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }

        if let Ok(mut work) = self.shared.work.write() {
            *work = None;
        }
        self.shared.current_work.store(0, Ordering::SeqCst);
        self.shared.solved_work.store(0, Ordering::SeqCst);
    }

    fn set_work(&self, job: SearchJob) -> Result<()> {
        if !self.shared.started.load(Ordering::SeqCst) {
            bail!("CPU backend is not started");
        }
        if job.work_id == 0 {
            bail!("work_id must be non-zero");
        }
        if job.nonce_count == 0 {
            bail!("nonce_count must be non-zero");
        }
        if self
            .shared
            .dag
            .read()
            .map_err(|_| anyhow!("cpu DAG lock poisoned"))?
            .is_none()
        {
            bail!("no DAG loaded");
        }

        let work_id = job.work_id;
        self.shared.solved_work.store(0, Ordering::SeqCst);
        self.shared.finished_workers.store(0, Ordering::SeqCst);
        {
            let mut slot = self
                .shared
                .work
                .write()
                .map_err(|_| anyhow!("cpu work lock poisoned"))?;
            *slot = Some(Arc::new(job));
        }
        self.shared.current_work.store(work_id, Ordering::SeqCst);
        Ok(())
    }

    fn kernel_bench(&self, seconds: u64, shutdown: &AtomicBool) -> Result<u64> {
        let dag_arc = match self.shared.dag.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let dag_bytes = match dag_arc {
            Some(dag) => dag,
            None => Arc::new(synthetic_dag(BENCH_DAG_BYTES.max(PROGPOW_CACHE_BYTES))),
        };
        let dag = DagView::new(&dag_bytes).map_err(|err| anyhow!("bench DAG invalid: {err}"))?;

        let lanes = self.threads;
        let stop_at = Instant::now() + Duration::from_secs(seconds.max(1));
        let total_hashes = AtomicU64::new(0);

        thread::scope(|scope| {
            for lane in 0..lanes {
                let total_hashes = &total_hashes;
                let dag = &dag;
                scope.spawn(move || {
                    let mut header = [0u8; 32];
                    for (i, byte) in header.iter_mut().enumerate() {
                        *byte = (i as u8).wrapping_mul(31).wrapping_add(7);
                    }

                    let mut nonce = lane as u64;
                    let mut local_hashes = 0u64;
                    let stride = lanes as u64;

                    while Instant::now() < stop_at && !shutdown.load(Ordering::Relaxed) {
                        let _ = progpow_hash(&header, nonce, dag);
                        nonce = nonce.wrapping_add(stride);
                        local_hashes += 1;
                    }

                    total_hashes.fetch_add(local_hashes, Ordering::Relaxed);
                });
            }
        });

        Ok(total_hashes.load(Ordering::Relaxed))
    }
}

fn cpu_worker_loop(shared: Arc<Shared>, thread_idx: usize, lanes: usize) {
    let stride = lanes as u64;
    let mut local_work_id = 0u64;
    let mut local_work: Option<Arc<SearchJob>> = None;
    let mut local_dag: Option<Arc<Vec<u8>>> = None;
    let mut nonce = 0u64;
    let mut lane_iters = 0u64;
    let mut lane_quota = 0u64;
    let mut range_done = false;
    let mut hash_batch = 0u64;

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
            break;
        }

        let current_work = shared.current_work.load(Ordering::Acquire);
        if current_work == 0 {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        if current_work != local_work_id {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
            let (next_work, next_dag) = match (shared.work.read(), shared.dag.read()) {
                (Ok(work), Ok(dag)) => (work.clone(), dag.clone()),
                _ => {
                    emit_error(&shared, format!("cpu thread {thread_idx}: lock poisoned"));
                    shared.shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            };

            let (Some(work), Some(dag)) = (next_work, next_dag) else {
                thread::sleep(IDLE_SLEEP);
                continue;
            };
            if work.work_id != current_work {
                thread::yield_now();
                continue;
            }

            nonce = work.start_nonce.wrapping_add(thread_idx as u64);
            lane_iters = 0;
            lane_quota = lane_quota_for_chunk(work.nonce_count, thread_idx as u64, stride);
            range_done = false;
            local_work_id = current_work;
            local_work = Some(work);
            local_dag = Some(dag);
        }

        let (Some(work), Some(dag_bytes)) = (local_work.as_ref(), local_dag.as_ref()) else {
            thread::sleep(IDLE_SLEEP);
            continue;
        };

        if shared.solved_work.load(Ordering::Relaxed) == local_work_id {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
            thread::sleep(STALE_SLEEP);
            continue;
        }

        if lane_iters >= lane_quota || Instant::now() >= work.stop_at {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
            if !range_done {
                range_done = true;
                mark_worker_finished(&shared, local_work_id, lanes);
            }
            thread::sleep(STALE_SLEEP);
            continue;
        }

        let dag = match DagView::new(dag_bytes) {
            Ok(dag) => dag,
            Err(err) => {
                emit_error(&shared, format!("cpu thread {thread_idx}: {err}"));
                shared.shutdown.store(true, Ordering::SeqCst);
                break;
            }
        };

        let out = progpow_hash(&work.header, nonce, &dag);
        lane_iters += 1;
        hash_batch += 1;
        if hash_batch >= HASH_EVENT_BATCH {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
        }

        if hash_meets_target(&out.digest, &work.target)
            && shared
                .solved_work
                .compare_exchange(0, local_work_id, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            flush_hash_batch(&shared, local_work_id, &mut hash_batch);
            emit_event(
                &shared,
                BackendEvent::Solution(MiningSolution {
                    work_id: local_work_id,
                    nonce,
                    hash: out.digest,
                    mix: out.mix,
                    backend: BACKEND_NAME,
                }),
            );
        }

        nonce = nonce.wrapping_add(stride);
    }
}

fn mark_worker_finished(shared: &Shared, work_id: u64, lanes: usize) {
    let finished = shared.finished_workers.fetch_add(1, Ordering::AcqRel) + 1;
    if finished == lanes && shared.solved_work.load(Ordering::Acquire) != work_id {
        emit_event(
            shared,
            BackendEvent::Exhausted {
                backend: BACKEND_NAME,
                work_id,
            },
        );
    }
}

fn flush_hash_batch(shared: &Shared, work_id: u64, hash_batch: &mut u64) {
    if work_id == 0 || *hash_batch == 0 {
        return;
    }
    let count = *hash_batch;
    *hash_batch = 0;
    emit_event(
        shared,
        BackendEvent::Hashes {
            backend: BACKEND_NAME,
            work_id,
            count,
        },
    );
}

fn emit_error(shared: &Shared, message: String) {
    emit_event(
        shared,
        BackendEvent::Error {
            backend: BACKEND_NAME,
            message,
        },
    );
}

fn emit_event(shared: &Shared, event: BackendEvent) {
    let tx = match shared.event_sink.read() {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    };
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}
