use crate::core::gpu::GpuInventory;
use crate::core::job::JobStatus;
use crate::core::output;
use crate::core::store::JobStore;
use std::collections::HashMap;
use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Checks whether `systemd-run` is reachable on PATH, used to pick the
/// memory-limiting launch strategy (spec §4.E: best-effort memory
/// enforcement).
fn systemd_run_available() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("systemd-run").is_file()))
        .unwrap_or(false)
}

/// Builds the shell command line actually executed for a job. Prefers a
/// user-scoped `systemd-run` transient unit with `MemoryMax` set to the
/// job's memory limit; falls back to a `ulimit -v` wrapper when
/// `systemd-run` is unavailable (e.g. non-systemd hosts, containers). Either
/// way enforcement is best-effort, per spec §3/§7 ("accurate per-job memory
/// enforcement" is an explicit non-goal).
fn build_launch_command(command: &str, memory_limit_gb: u32) -> (String, Vec<String>) {
    if systemd_run_available() {
        (
            "systemd-run".to_string(),
            vec![
                "--user".to_string(),
                "--scope".to_string(),
                format!("--property=MemoryMax={memory_limit_gb}G"),
                "--".to_string(),
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
        )
    } else {
        let kb = memory_limit_gb as u64 * 1024 * 1024;
        (
            "sh".to_string(),
            vec![
                "-c".to_string(),
                format!("ulimit -v {kb}; exec {command}"),
            ],
        )
    }
}

/// Supervises the child process backing one running job: launch, liveness
/// check, reap, and cancellation. Mirrors the role the teacher's
/// [`crate::tmux`]-session wrapper plays for tmux-hosted jobs, but spawns
/// the command directly in its own process group instead of inside a tmux
/// pane (spec §4.E).
pub struct ProcessSupervisor {
    output_root: PathBuf,
    handles: HashMap<String, std::process::Child>,
}

impl ProcessSupervisor {
    pub fn new(output_root: PathBuf) -> Self {
        Self {
            output_root,
            handles: HashMap::new(),
        }
    }

    /// Launches `job_id` on `assigned_gpus`. On success, transitions the job
    /// to `running` and stamps `start_time`/`assigned_gpus`/`pid`/
    /// `output_file`/`error_file`. On failure, transitions straight to
    /// `failed` and releases the GPUs back to the inventory, matching the
    /// teacher's `handle_execution_failures` pattern of reconciling state
    /// immediately rather than leaving a job stuck mid-transition.
    pub fn launch(
        &mut self,
        store: &mut JobStore,
        gpus: &mut GpuInventory,
        job_id: &str,
        assigned_gpus: Vec<u32>,
        now: i64,
    ) {
        let job = match store.get(job_id) {
            Some(j) => j.clone(),
            None => return,
        };

        let result = self.spawn(&job, &assigned_gpus);

        match result {
            Ok((child, stdout_path, stderr_path)) => {
                let pid = child.id();
                self.handles.insert(job_id.to_string(), child);
                // Stamp the inventory immediately rather than waiting for the
                // next poll's reconciliation (spec §4.E step 1), so GET /gpus
                // can't observe a busy GPU as available in between ticks.
                for gpu_id in &assigned_gpus {
                    gpus.assign(*gpu_id, job_id);
                }
                store.update(job_id, |j| {
                    j.try_transition(JobStatus::Running);
                    j.start_time = Some(now);
                    j.assigned_gpus = assigned_gpus.clone();
                    j.pid = Some(pid);
                    j.output_file = Some(stdout_path);
                    j.error_file = Some(stderr_path);
                });
            }
            Err(e) => {
                tracing::warn!("failed to launch job {job_id}: {e}");
                for gpu_id in &assigned_gpus {
                    gpus.release(*gpu_id);
                }
                store.update(job_id, |j| {
                    j.try_transition(JobStatus::Failed);
                    j.end_time = Some(now);
                    j.exit_code = -1;
                });
            }
        }
    }

    fn spawn(
        &self,
        job: &crate::core::job::Job,
        assigned_gpus: &[u32],
    ) -> anyhow::Result<(std::process::Child, PathBuf, PathBuf)> {
        let dir = output::job_dir(&self.output_root, &job.job_id);
        fs::create_dir_all(&dir)?;
        let stdout_path = output::stdout_path(&self.output_root, &job.job_id);
        let stderr_path = output::stderr_path(&self.output_root, &job.job_id);
        let stdout = File::create(&stdout_path)?;
        let stderr = File::create(&stderr_path)?;

        let visible_devices = assigned_gpus
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let (program, args) = build_launch_command(&job.command, job.memory_limit_gb);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&job.env)
            .env("CUDA_VISIBLE_DEVICES", visible_devices)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        if let Some(dir) = &job.working_dir {
            cmd.current_dir(dir);
        }

        // New session/process group so cancellation can signal the whole
        // subtree via killpg instead of just the immediate child.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        Ok((child, stdout_path, stderr_path))
    }

    /// Non-blocking liveness check over all tracked children. Jobs whose
    /// child has exited are transitioned to `completed` (exit_code carries
    /// the real status, including non-zero — only launch errors produce
    /// `failed`) and their GPUs released, per spec §4.E/§4.F.
    pub fn reap(&mut self, store: &mut JobStore, gpus: &mut GpuInventory, now: i64) {
        let mut finished = Vec::new();

        for (job_id, child) in self.handles.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    finished.push((job_id.clone(), status.code().unwrap_or(-1)));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("failed to poll job {job_id}: {e}");
                    finished.push((job_id.clone(), -1));
                }
            }
        }

        for (job_id, exit_code) in finished {
            self.handles.remove(&job_id);
            let assigned_gpus = store
                .get(&job_id)
                .map(|j| j.assigned_gpus.clone())
                .unwrap_or_default();
            for gpu_id in assigned_gpus {
                gpus.release(gpu_id);
            }
            store.update(&job_id, |j| {
                j.try_transition(JobStatus::Completed);
                j.end_time = Some(now);
                j.exit_code = exit_code;
            });
        }
    }

    /// Cancels a job. A queued job is simply marked cancelled. A running job
    /// has SIGTERM sent to its whole process group (the negative pid
    /// convention for `kill(2)`), is marked cancelled immediately rather
    /// than waiting for the child to actually exit, and has its GPUs
    /// released so they're available on the next poll — matching the
    /// spec's note that cancellation is not required to wait for process
    /// exit.
    pub fn cancel(&mut self, store: &mut JobStore, gpus: &mut GpuInventory, job_id: &str, now: i64) -> bool {
        let job = match store.get(job_id) {
            Some(j) => j.clone(),
            None => return false,
        };

        match job.status {
            JobStatus::Queued => store.update(job_id, |j| {
                j.try_transition(JobStatus::Cancelled);
                j.end_time = Some(now);
            }),
            JobStatus::Running => {
                if let Some(pid) = job.pid {
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGTERM);
                    }
                }
                self.handles.remove(job_id);
                for gpu_id in &job.assigned_gpus {
                    gpus.release(*gpu_id);
                }
                store.update(job_id, |j| {
                    j.try_transition(JobStatus::Cancelled);
                    j.end_time = Some(now);
                })
            }
            _ => false,
        }
    }

    /// Sends SIGTERM to every still-running job's process group. Called on
    /// daemon shutdown; does not wait for exit.
    pub fn shutdown(&mut self, store: &JobStore) {
        for job_id in self.handles.keys() {
            if let Some(job) = store.get(job_id) {
                if let Some(pid) = job.pid {
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGTERM);
                    }
                }
            }
        }
        self.handles.clear();
    }
}
