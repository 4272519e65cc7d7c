use std::path::PathBuf;

use clap::Parser;

/// GPU scheduler daemon: a lightweight local scheduler for GPU-bound child
/// processes on a single host (spec §1).
#[derive(Debug, Parser)]
#[command(name = "gpu-schedulerd", author, version = gpu_scheduler::version(), about = "GPU scheduler daemon")]
pub struct Cli {
    /// Configuration file to layer under defaults/environment
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port the HTTP control API binds to (spec §6, default 8000)
    #[arg(long)]
    pub port: Option<u16>,

    /// Control loop tick period in seconds (spec §6, default 30)
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Minimum free memory (MB) for a GPU to count as available (default 1000)
    #[arg(long)]
    pub min_free_memory: Option<u64>,

    /// Maximum utilization (%) for a GPU to count as available (default 10)
    #[arg(long)]
    pub max_gpu_util: Option<u32>,

    /// Path to the `gpu-query` device probe binary
    #[arg(long)]
    pub probe_path: Option<String>,

    /// Directory holding per-job stdout/stderr (default `<home>/gpu-scheduler/output`)
    #[arg(long)]
    pub output_root: Option<PathBuf>,

    #[command(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}
