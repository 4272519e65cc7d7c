mod cli;

use clap::Parser;
use gpu_scheduler::api::{self, ApiState};
use gpu_scheduler::config;
use gpu_scheduler::core::gpu;
use gpu_scheduler::core::output;
use gpu_scheduler::core::scheduler::{self, SchedulerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.verbose.tracing_level_filter().into())
                .from_env_lossy(),
        )
        .init();

    let mut cfg = config::load_config(cli.config.as_ref())?;
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(secs) = cli.poll_interval {
        cfg.poll_interval = secs;
    }
    if let Some(mb) = cli.min_free_memory {
        cfg.min_free_memory = mb;
    }
    if let Some(pct) = cli.max_gpu_util {
        cfg.max_gpu_util = pct;
    }
    if let Some(probe) = cli.probe_path {
        cfg.probe_path = probe;
    }
    if let Some(root) = cli.output_root {
        cfg.output_root = Some(root);
    }

    // Fatal per spec §7: absence of the GPU probe binary at startup, the
    // daemon refuses to start. Everything else is recoverable.
    gpu::ensure_probe_available(&cfg.probe_path)?;

    let output_root = cfg
        .output_root
        .clone()
        .unwrap_or_else(output::default_output_root);
    std::fs::create_dir_all(&output_root)?;

    tracing::info!(
        port = cfg.port,
        poll_interval = cfg.poll_interval,
        min_free_memory = cfg.min_free_memory,
        max_gpu_util = cfg.max_gpu_util,
        probe_path = %cfg.probe_path,
        output_root = %output_root.display(),
        "starting gpu-schedulerd"
    );

    let state = Arc::new(RwLock::new(SchedulerState::new(
        output_root.clone(),
        cfg.probe_path.clone(),
        cfg.min_free_memory,
        cfg.max_gpu_util,
    )));

    // Bounded: a burst of submissions beyond capacity just means the loop
    // wakes once instead of per-submission, which is harmless since a tick
    // already drains the whole queue.
    let (wake_tx, wake_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control_loop = tokio::spawn(scheduler::run(
        state.clone(),
        Duration::from_secs(cfg.poll_interval),
        wake_rx,
        shutdown_rx,
        || chrono::Utc::now().timestamp(),
    ));

    let api_state = ApiState {
        scheduler: state,
        wake_up: wake_tx,
        output_root: Arc::new(output_root),
    };
    let app = api::build_router(api_state);

    let addr = format!("127.0.0.1:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("control api stopped, signalling control loop shutdown");
    let _ = shutdown_tx.send(true);
    control_loop.await?;

    Ok(())
}

/// SIGINT/SIGTERM both trigger graceful shutdown: stop accepting HTTP
/// connections, then stop the control loop (which itself terminates every
/// still-running job's process group), per spec §6.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating graceful shutdown");
        }
    }
}
