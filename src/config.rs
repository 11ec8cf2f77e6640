use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::backend::nvidia::NvidiaTuningOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Cpu,
    Nvidia,
}

#[derive(Debug, Parser)]
#[command(
    name = "kawminer",
    about = "GPU-accelerated KawPow/ProgPoW proof-of-work search engine",
    version
)]
pub struct Cli {
    /// Which execution backend to drive.
    #[arg(long, value_enum, default_value_t = BackendKind::Cpu)]
    pub backend: BackendKind,

    /// CPU worker threads (defaults to the available parallelism).
    #[arg(long)]
    pub threads: Option<usize>,

    /// NVIDIA device index (defaults to the first device).
    #[arg(long)]
    pub device: Option<u32>,

    /// Synthetic DAG size in MiB for bench/search runs.
    #[arg(long, default_value_t = 64)]
    pub dag_mib: u64,

    /// Override the kernel grid size in blocks (skips autotuning).
    #[arg(long)]
    pub gpu_grid: Option<u32>,

    /// Kernel block size in threads.
    #[arg(long, default_value_t = 128)]
    pub gpu_block: u32,

    /// Seconds spent measuring launch-geometry candidates.
    #[arg(long, default_value_t = 2)]
    pub autotune_secs: u64,

    /// Where measured launch tunings are cached.
    #[arg(long, default_value = "kawminer-tuning.json")]
    pub tuning_cache: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Measure raw kernel throughput against a synthetic DAG.
    Bench {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Scan one nonce range for a share.
    Search {
        /// 32-byte header preamble, hex.
        #[arg(long, default_value_t = String::from("00").repeat(32))]
        header: String,

        /// 256-bit target, hex in display order (ff… = easiest).
        #[arg(long)]
        target: String,

        /// First nonce of the range. Nonce 0 is reserved as the empty
        /// result-slot sentinel and cannot be reported.
        #[arg(long, default_value_t = 1)]
        start_nonce: u64,

        /// Number of nonces to scan.
        #[arg(long, default_value_t = 1 << 24)]
        nonce_count: u64,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}

impl Cli {
    pub fn cpu_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }

    pub fn dag_bytes(&self) -> usize {
        (self.dag_mib.max(1) as usize) * 1024 * 1024
    }

    pub fn nvidia_tuning_options(&self) -> NvidiaTuningOptions {
        NvidiaTuningOptions {
            grid_blocks_override: self.gpu_grid.filter(|&grid| grid > 0),
            block_threads: self.gpu_block.max(32),
            autotune_secs: self.autotune_secs.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bench_defaults_parse() {
        let cli = Cli::parse_from(["kawminer", "bench"]);
        assert_eq!(cli.backend, BackendKind::Cpu);
        assert_eq!(cli.dag_mib, 64);
        assert!(matches!(cli.command, Command::Bench { seconds: 10 }));
        assert!(cli.cpu_threads() >= 1);
    }

    #[test]
    fn search_arguments_parse() {
        let cli = Cli::parse_from([
            "kawminer",
            "--backend",
            "nvidia",
            "--dag-mib",
            "128",
            "--gpu-grid",
            "56",
            "search",
            "--target",
            &"ff".repeat(32),
            "--start-nonce",
            "100",
            "--nonce-count",
            "4096",
        ]);
        assert_eq!(cli.backend, BackendKind::Nvidia);
        assert_eq!(cli.dag_bytes(), 128 * 1024 * 1024);
        assert_eq!(cli.nvidia_tuning_options().grid_blocks_override, Some(56));
        match cli.command {
            Command::Search {
                start_nonce,
                nonce_count,
                ..
            } => {
                assert_eq!(start_nonce, 100);
                assert_eq!(nonce_count, 4096);
            }
            _ => panic!("expected search subcommand"),
        }
    }

    #[test]
    fn zero_grid_override_is_ignored() {
        let cli = Cli::parse_from(["kawminer", "--gpu-grid", "0", "bench"]);
        assert_eq!(cli.nvidia_tuning_options().grid_blocks_override, None);
    }
}
