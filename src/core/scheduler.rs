use crate::core::gpu::{self, GpuInventory};
use crate::core::job::{JobConfig, JobConfigError, JobStatus};
use crate::core::output;
use crate::core::placement;
use crate::core::process::ProcessSupervisor;
use crate::core::queue::PriorityQueue;
use crate::core::store::JobStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// All scheduler-owned state behind a single lock, per spec §5's
/// single-central-mutex concurrency model. The teacher guards its
/// equivalent aggregate (`SchedulerRuntime`) the same way; we use a plain
/// `RwLock` rather than a reentrant lock since nothing here needs to
/// re-acquire it recursively.
pub struct SchedulerState {
    pub store: JobStore,
    pub gpus: GpuInventory,
    pub queue: PriorityQueue,
    pub supervisor: ProcessSupervisor,
    pub probe_path: String,
    pub min_free_memory_mb: u64,
    pub max_gpu_util_pct: u32,
}

pub type Shared = Arc<RwLock<SchedulerState>>;

/// Snapshot a caller needs to run the GPU probe subprocess without holding
/// the scheduler lock: the probe binary's path and which GPU ids are
/// currently held by a running job, as of the reap that preceded it.
pub struct ProbeRequest {
    pub probe_path: String,
    pub running_assignments: HashMap<u32, String>,
}

impl SchedulerState {
    pub fn new(
        output_root: PathBuf,
        probe_path: String,
        min_free_memory_mb: u64,
        max_gpu_util_pct: u32,
    ) -> Self {
        Self {
            store: JobStore::new(),
            gpus: GpuInventory::new(),
            queue: PriorityQueue::new(),
            supervisor: ProcessSupervisor::new(output_root),
            probe_path,
            min_free_memory_mb,
            max_gpu_util_pct,
        }
    }

    /// Submits a job: validates, stores it, and enqueues it at the tail of
    /// its priority bucket. Returns the new job's id. The daemon should wake
    /// the control loop after calling this so the job isn't stuck waiting
    /// for the next poll interval.
    pub fn submit(&mut self, config: JobConfig, now: i64) -> Result<String, JobConfigError> {
        config.validate()?;
        let priority = config.priority;
        let job_id = self.store.create(config, now);
        self.queue.push(job_id.clone(), priority, now);
        Ok(job_id)
    }

    /// Cancels a job by id, per spec §4.E/§4.G. Returns `false` if the job
    /// doesn't exist or is already in a terminal state.
    pub fn cancel(&mut self, job_id: &str, now: i64) -> bool {
        let cancelled = self
            .supervisor
            .cancel(&mut self.store, &mut self.gpus, job_id, now);
        if cancelled {
            self.queue.remove(job_id);
        }
        cancelled
    }

    /// GPU ids currently held by a running job, used to feed the poller's
    /// reconciliation rule (spec §4.A).
    fn running_assignments(&self) -> HashMap<u32, String> {
        self.store
            .list()
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .flat_map(|j| j.assigned_gpus.iter().map(move |id| (*id, j.job_id.clone())))
            .collect()
    }

    /// First half of a tick, per spec §4.F: reap finished processes (so
    /// their GPUs are free for this same tick's placement) and snapshot
    /// what the probe subprocess needs.
    ///
    /// Reap must run before poll/placement: otherwise a job that finished
    /// between ticks would still be seen as holding its GPUs during this
    /// tick's reconciliation, and a newly queued job that could have used
    /// that GPU would wait an extra interval.
    ///
    /// Callers that must not block the scheduler lock on the probe
    /// subprocess (spec §5: "subprocess runs unlocked; parsing then takes
    /// the lock for a short reconciliation") run [`gpu::run_probe`] with the
    /// returned [`ProbeRequest`] *after* releasing the lock, then pass the
    /// result to [`Self::apply_probe_and_place`] under a freshly acquired
    /// lock. [`Self::tick`] composes both halves for callers that don't need
    /// that split (tests, or any single-threaded caller).
    pub fn reap_and_prepare_probe(&mut self, now: i64) -> ProbeRequest {
        self.supervisor.reap(&mut self.store, &mut self.gpus, now);
        ProbeRequest {
            probe_path: self.probe_path.clone(),
            running_assignments: self.running_assignments(),
        }
    }

    /// Second half of a tick: reconcile an already-fetched probe result
    /// against the snapshot taken by [`Self::reap_and_prepare_probe`], then
    /// run one placement pass and launch whatever it assigns.
    pub fn apply_probe_and_place(
        &mut self,
        probe_result: anyhow::Result<String>,
        request: &ProbeRequest,
        now: i64,
    ) {
        self.gpus.apply_probe_result(
            probe_result,
            &request.running_assignments,
            self.min_free_memory_mb,
            self.max_gpu_util_pct,
        );

        let free = self.gpus.free_ids();
        let instructions = placement::run_pass(&self.store, &mut self.queue, free);

        for instruction in instructions {
            self.supervisor.launch(
                &mut self.store,
                &mut self.gpus,
                &instruction.job_id,
                instruction.gpu_ids,
                now,
            );
        }
    }

    /// One full control-loop tick, per spec §4.F, run start to finish on the
    /// caller's own stack: reap, poll, place, launch. Used directly by tests
    /// and any caller that owns `self` outright rather than sharing it
    /// behind the lock `run` uses — there's no handler to block in that
    /// case, so running the probe inline is harmless.
    pub fn tick(&mut self, now: i64) {
        let request = self.reap_and_prepare_probe(now);
        let probe_result = gpu::run_probe(&request.probe_path);
        self.apply_probe_and_place(probe_result, &request, now);
    }

    /// Best-effort recent output for a job's detail view (spec §4.H).
    pub fn recent_output(&self, output_root: &std::path::Path, job_id: &str) -> Option<String> {
        self.store.get(job_id)?;
        let path = output::stdout_path(output_root, job_id);
        Some(output::tail_lines(&path, output::DEFAULT_TAIL_LINES))
    }

    /// Signals every running job's process group and drops supervisor
    /// handles. Called once on daemon shutdown.
    pub fn shutdown(&mut self) {
        self.supervisor.shutdown(&self.store);
    }
}

/// Runs the control loop until `shutdown` resolves, per spec §4.F. Mirrors
/// the teacher's `scheduler_runtime::run` discipline: the lock is acquired
/// only for the brief state-mutation phases (reap, then reconcile/place/
/// launch) and is released while the probe subprocess runs, per spec §5
/// ("the reference design chooses (a) for the poller: subprocess runs
/// unlocked; parsing then takes the lock for a short reconciliation"). The
/// probe itself (`Command::output`, a blocking syscall) runs on a blocking
/// thread via `spawn_blocking` rather than the async executor, so a hung
/// `gpu-query` can't stall other tokio tasks either.
pub async fn run(
    state: Shared,
    poll_interval: Duration,
    mut notify: tokio::sync::mpsc::Receiver<()>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    now_fn: impl Fn() -> i64,
) {
    let mut interval = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = notify.recv() => {
                tracing::debug!("control loop woken by job submission");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }

        let now = now_fn();

        let request = {
            let mut guard = state.write().await;
            guard.reap_and_prepare_probe(now)
        };

        let probe_path = request.probe_path.clone();
        let probe_result = match tokio::task::spawn_blocking(move || gpu::run_probe(&probe_path)).await
        {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("gpu probe task panicked: {e}")),
        };

        let mut guard = state.write().await;
        guard.apply_probe_and_place(probe_result, &request, now);
    }

    tracing::info!("control loop shutting down, terminating running jobs");
    let mut guard = state.write().await;
    guard.shutdown();
}
