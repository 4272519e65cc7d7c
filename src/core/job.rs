use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use strum::{Display, EnumString};

/// Submission shape accepted by `POST /jobs`. Carries no scheduler-managed
/// fields (no id, no status, no timestamps) — those belong to [`Job`].
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub command: String,
    #[serde(default)]
    pub gpu_ids: Option<Vec<u32>>,
    #[serde(default = "default_num_gpus")]
    pub num_gpus: u32,
    #[serde(default = "default_memory_limit_gb", rename = "memory_limit")]
    pub memory_limit_gb: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

fn default_num_gpus() -> u32 {
    1
}

fn default_memory_limit_gb() -> u32 {
    5
}

#[derive(Debug)]
pub enum JobConfigError {
    MissingCommand,
    InvalidNumGpus,
    InvalidMemoryLimit,
    EmptyGpuIds,
}

impl fmt::Display for JobConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobConfigError::MissingCommand => write!(f, "command must not be empty"),
            JobConfigError::InvalidNumGpus => write!(f, "num_gpus must be at least 1"),
            JobConfigError::InvalidMemoryLimit => write!(f, "memory_limit must be at least 1"),
            JobConfigError::EmptyGpuIds => write!(f, "gpu_ids must not be an empty list"),
        }
    }
}

impl std::error::Error for JobConfigError {}

impl JobConfig {
    /// Validation at the API boundary, per the spec's error taxonomy: missing
    /// command, non-positive num_gpus, malformed gpu_ids all reject with 400.
    pub fn validate(&self) -> Result<(), JobConfigError> {
        if self.command.trim().is_empty() {
            return Err(JobConfigError::MissingCommand);
        }
        if self.num_gpus == 0 {
            return Err(JobConfigError::InvalidNumGpus);
        }
        if self.memory_limit_gb == 0 {
            return Err(JobConfigError::InvalidMemoryLimit);
        }
        if let Some(ids) = &self.gpu_ids {
            if ids.is_empty() {
                return Err(JobConfigError::EmptyGpuIds);
            }
        }
        Ok(())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Hash,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// The DAG of legal transitions from spec §3 invariant 3:
    /// `queued -> running -> {completed, failed, cancelled}` and
    /// `queued -> cancelled` directly.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub name: String,
    pub command: String,
    pub gpu_ids: Option<Vec<u32>>,
    pub num_gpus: u32,
    pub memory_limit_gb: u32,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub priority: i64,
    pub status: JobStatus,
    pub assigned_gpus: Vec<u32>,
    pub submit_time: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub exit_code: i32,
    pub pid: Option<u32>,
    pub output_file: Option<PathBuf>,
    pub error_file: Option<PathBuf>,
}

impl Job {
    /// Build a freshly queued job from a submission, per spec §4.B
    /// `create(config)`: assigns id, stamps submit_time, defaults name.
    pub fn from_config(job_id: String, config: JobConfig, now: i64) -> Self {
        let name = config
            .name
            .unwrap_or_else(|| format!("job-{job_id}"));
        Job {
            job_id,
            name,
            command: config.command,
            gpu_ids: config.gpu_ids,
            num_gpus: config.num_gpus,
            memory_limit_gb: config.memory_limit_gb,
            env: config.env,
            working_dir: config.working_dir,
            priority: config.priority,
            status: JobStatus::Queued,
            assigned_gpus: Vec::new(),
            submit_time: now,
            start_time: None,
            end_time: None,
            exit_code: -1,
            pid: None,
            output_file: None,
            error_file: None,
        }
    }

    pub fn try_transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}
