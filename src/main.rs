mod backend;
mod config;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kawpow_spec::dag::synthetic_dag;

use backend::cpu::CpuBackend;
use backend::nvidia::NvidiaBackend;
use backend::{BackendEvent, PowBackend, SearchJob};
use config::{BackendKind, Cli, Command};
use types::{format_hash, format_hashrate, parse_bytes32, parse_target};

const EVENT_WAIT: Duration = Duration::from_millis(200);
const STATS_INTERVAL: Duration = Duration::from_secs(5);

fn main() {
    if let Err(err) = run() {
        eprintln!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to install ctrl-c handler")?;
    }

    let mut backend = build_backend(&cli)?;

    info!(
        backend = backend.name(),
        dag_mib = cli.dag_mib,
        "generating synthetic DAG"
    );
    let started = Instant::now();
    let dag = Arc::new(synthetic_dag(cli.dag_bytes()));
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "DAG ready");

    match cli.command {
        Command::Bench { seconds } => run_bench(backend.as_mut(), dag, seconds, &shutdown),
        Command::Search {
            ref header,
            ref target,
            start_nonce,
            nonce_count,
            timeout_secs,
        } => {
            let header = parse_bytes32(header).context("invalid --header")?;
            let target = parse_target(target).context("invalid --target")?;
            if start_nonce == 0 {
                bail!("--start-nonce 0 collides with the empty result sentinel");
            }
            run_search(
                backend.as_mut(),
                dag,
                SearchJob {
                    work_id: 1,
                    header,
                    target,
                    start_nonce,
                    nonce_count,
                    stop_at: Instant::now() + Duration::from_secs(timeout_secs.max(1)),
                },
                &shutdown,
            )
        }
    }
}

fn build_backend(cli: &Cli) -> Result<Box<dyn PowBackend>> {
    match cli.backend {
        BackendKind::Cpu => Ok(Box::new(CpuBackend::new(cli.cpu_threads()))),
        BackendKind::Nvidia => Ok(Box::new(NvidiaBackend::new(
            cli.device,
            cli.tuning_cache.clone(),
            cli.nvidia_tuning_options(),
        ))),
    }
}

fn run_bench(
    backend: &mut dyn PowBackend,
    dag: Arc<Vec<u8>>,
    seconds: u64,
    shutdown: &AtomicBool,
) -> Result<()> {
    backend.load_dag(dag)?;
    info!(seconds, backend = backend.name(), "running kernel benchmark");
    let started = Instant::now();
    let hashes = backend.kernel_bench(seconds, shutdown)?;
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);

    println!(
        "bench: {} hashes in {:.1}s | {}",
        hashes,
        elapsed,
        format_hashrate(hashes as f64 / elapsed)
    );
    Ok(())
}

fn run_search(
    backend: &mut dyn PowBackend,
    dag: Arc<Vec<u8>>,
    job: SearchJob,
    shutdown: &AtomicBool,
) -> Result<()> {
    let (event_tx, event_rx) = unbounded::<BackendEvent>();
    backend.set_event_sink(event_tx);
    backend.start()?;
    backend.load_dag(dag)?;

    info!(
        backend = backend.name(),
        lanes = backend.lanes(),
        start_nonce = job.start_nonce,
        nonce_count = job.nonce_count,
        "scanning nonce range"
    );
    let stop_at = job.stop_at;
    backend.set_work(job)?;

    let started = Instant::now();
    let mut total_hashes = 0u64;
    let mut next_stats_at = started + STATS_INTERVAL;
    let mut outcome: Option<Result<()>> = None;

    while outcome.is_none() {
        if shutdown.load(Ordering::SeqCst) {
            outcome = Some(Err(anyhow!("interrupted")));
            break;
        }
        if Instant::now() >= stop_at {
            outcome = Some(Err(anyhow!("search timed out")));
            break;
        }

        match event_rx.recv_timeout(EVENT_WAIT) {
            Ok(BackendEvent::Hashes { count, .. }) => {
                total_hashes = total_hashes.saturating_add(count);
            }
            Ok(BackendEvent::Solution(solution)) => {
                let elapsed = started.elapsed().as_secs_f64().max(1e-6);
                println!(
                    "share found by {} backend (work {})",
                    solution.backend, solution.work_id
                );
                println!("  nonce: 0x{:016x}", solution.nonce);
                println!("  hash:  {}", format_hash(&solution.hash));
                println!("  mix:   {}", format_hash(&solution.mix));
                println!(
                    "  {} hashes | {}",
                    total_hashes,
                    format_hashrate(total_hashes as f64 / elapsed)
                );
                outcome = Some(Ok(()));
            }
            Ok(BackendEvent::Exhausted { .. }) => {
                println!(
                    "range exhausted without a share ({total_hashes} hashes reported)"
                );
                outcome = Some(Ok(()));
            }
            Ok(BackendEvent::Error { backend, message }) => {
                outcome = Some(Err(anyhow!("{backend} backend error: {message}")));
            }
            Err(_) => {}
        }

        let now = Instant::now();
        if now >= next_stats_at {
            let elapsed = started.elapsed().as_secs_f64().max(1e-6);
            info!(
                hashes = total_hashes,
                hashrate = format_hashrate(total_hashes as f64 / elapsed).as_str(),
                "searching"
            );
            next_stats_at = now + STATS_INTERVAL;
        }
    }

    backend.stop();
    match outcome {
        Some(result) => result,
        None => {
            warn!("event loop ended without an outcome");
            Ok(())
        }
    }
}
