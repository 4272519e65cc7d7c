use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

/// In-memory snapshot of one accelerator as reported by the probe,
/// augmented with assignment state. Created on first poll, mutated only by
/// the poller and by assignment/release transitions, never destroyed while
/// the daemon runs (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuRecord {
    pub id: u32,
    pub name: String,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub utilization_pct: u32,
    pub temperature_c: i32,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub is_available: bool,
    pub assigned_job_id: Option<String>,
}

fn numeric_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?[0-9]+(\.[0-9]+)?").unwrap())
}

/// Strips units and surrounding whitespace (e.g. `"45 %"`, `"250.00 W"`,
/// `"8192 MiB"`) and parses the remaining number, per spec §4.A.
fn parse_numeric(field: &str) -> Option<f64> {
    numeric_regex()
        .find(field.trim())
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

struct RawRow {
    id: u32,
    name: String,
    total_memory_mb: u64,
    used_memory_mb: u64,
    utilization_pct: u32,
    temperature_c: i32,
    power_draw_w: f64,
    power_limit_w: f64,
}

/// Parses one CSV line into a raw row. Rows with fewer than eight fields are
/// skipped, per spec §4.A / the probe contract in §6.
fn parse_row(record: &csv::StringRecord) -> Option<RawRow> {
    if record.len() < 8 {
        return None;
    }
    let id = parse_numeric(record.get(0)?)? as u32;
    let name = record.get(1)?.trim().to_string();
    let total_memory_mb = parse_numeric(record.get(2)?)? as u64;
    let used_memory_mb = parse_numeric(record.get(3)?)? as u64;
    let utilization_pct = parse_numeric(record.get(4)?)? as u32;
    let temperature_c = parse_numeric(record.get(5)?)? as i32;
    let power_draw_w = parse_numeric(record.get(6)?)?;
    let power_limit_w = parse_numeric(record.get(7)?)?;
    Some(RawRow {
        id,
        name,
        total_memory_mb,
        used_memory_mb,
        utilization_pct,
        temperature_c,
        power_draw_w,
        power_limit_w,
    })
}

fn parse_probe_output(stdout: &str) -> Vec<RawRow> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(stdout.as_bytes());
    reader
        .records()
        .filter_map(Result::ok)
        .filter_map(|record| parse_row(&record))
        .collect()
}

/// Invokes the external device-query probe and returns its stdout. A
/// non-zero exit is treated as a transient failure, per the probe contract
/// in spec §6.
///
/// This is a blocking call (`Command::output` waits for the child to exit).
/// Callers running inside an async context must keep it off the executor
/// thread (`tokio::task::spawn_blocking`) and must not hold the scheduler
/// lock while it runs — spec §5: "the reference design chooses (a) for the
/// poller (subprocess runs unlocked; parsing then takes the lock for a short
/// reconciliation)".
pub(crate) fn run_probe(probe_path: &str) -> anyhow::Result<String> {
    let output = Command::new(probe_path).output()?;
    if !output.status.success() {
        anyhow::bail!(
            "gpu probe '{probe_path}' exited with {:?}",
            output.status.code()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// In-memory mapping of GPU id to GPU record, owned by the Poller.
#[derive(Default)]
pub struct GpuInventory {
    gpus: HashMap<u32, GpuRecord>,
}

impl GpuInventory {
    pub fn new() -> Self {
        Self {
            gpus: HashMap::new(),
        }
    }

    pub fn list(&self) -> Vec<GpuRecord> {
        let mut gpus: Vec<_> = self.gpus.values().cloned().collect();
        gpus.sort_by_key(|g| g.id);
        gpus
    }

    pub fn get(&self, id: u32) -> Option<&GpuRecord> {
        self.gpus.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.gpus.is_empty()
    }

    /// Free GPU ids (`is_available == true`), ascending, for deterministic
    /// placement (spec §4.D step 2).
    pub fn free_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .gpus
            .values()
            .filter(|g| g.is_available)
            .map(|g| g.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Reconciles freshly probed rows with `running_assignments` (gpu id ->
    /// job id for every GPU currently held by a running job), applying the
    /// two-step rule from spec §4.A:
    ///
    /// 1. A GPU held by a running job is forced unavailable and stamped with
    ///    that job's id, regardless of its reported utilization/memory.
    /// 2. Otherwise availability is derived from the free-memory and
    ///    utilization thresholds.
    fn reconcile(
        &mut self,
        rows: Vec<RawRow>,
        running_assignments: &HashMap<u32, String>,
        min_free_memory_mb: u64,
        max_gpu_util_pct: u32,
    ) {
        for row in rows {
            let assigned_job_id = running_assignments.get(&row.id).cloned();
            let is_available = if assigned_job_id.is_some() {
                false
            } else {
                let free_mem = row.total_memory_mb.saturating_sub(row.used_memory_mb);
                !(free_mem < min_free_memory_mb || row.utilization_pct > max_gpu_util_pct)
            };
            self.gpus.insert(
                row.id,
                GpuRecord {
                    id: row.id,
                    name: row.name,
                    total_memory_mb: row.total_memory_mb,
                    used_memory_mb: row.used_memory_mb,
                    utilization_pct: row.utilization_pct,
                    temperature_c: row.temperature_c,
                    power_draw_w: row.power_draw_w,
                    power_limit_w: row.power_limit_w,
                    is_available,
                    assigned_job_id,
                },
            );
        }
    }

    /// Runs one poll: invoke the probe, parse, reconcile. Probe failure is
    /// logged and the prior snapshot retained; it is never fatal (§4.A).
    ///
    /// Convenience wrapper around [`Self::apply_probe_result`] for callers
    /// that don't need to run the subprocess separately from the
    /// reconciliation (e.g. synchronous tests). The control loop's async
    /// path runs [`run_probe`] unlocked and calls `apply_probe_result`
    /// afterwards instead, so the probe never runs under the scheduler lock.
    pub fn poll_once(
        &mut self,
        probe_path: &str,
        running_assignments: &HashMap<u32, String>,
        min_free_memory_mb: u64,
        max_gpu_util_pct: u32,
    ) {
        let result = run_probe(probe_path);
        self.apply_probe_result(result, running_assignments, min_free_memory_mb, max_gpu_util_pct);
    }

    /// Applies an already-fetched probe result (or failure) to the
    /// inventory: parses and reconciles on success, logs and retains the
    /// prior snapshot on failure. Never fatal (§4.A).
    pub fn apply_probe_result(
        &mut self,
        probe_result: anyhow::Result<String>,
        running_assignments: &HashMap<u32, String>,
        min_free_memory_mb: u64,
        max_gpu_util_pct: u32,
    ) {
        match probe_result {
            Ok(stdout) => {
                let rows = parse_probe_output(&stdout);
                self.reconcile(rows, running_assignments, min_free_memory_mb, max_gpu_util_pct);
            }
            Err(e) => {
                tracing::warn!("gpu probe failed, retaining prior snapshot: {e}");
            }
        }
    }

    pub fn release(&mut self, gpu_id: u32) {
        if let Some(gpu) = self.gpus.get_mut(&gpu_id) {
            gpu.assigned_job_id = None;
        }
    }

    /// Marks a GPU unavailable and stamps it with the job holding it,
    /// immediately on launch (spec §4.E step 1) rather than waiting for the
    /// next poll's reconciliation — symmetric with [`Self::release`].
    pub fn assign(&mut self, gpu_id: u32, job_id: &str) {
        if let Some(gpu) = self.gpus.get_mut(&gpu_id) {
            gpu.is_available = false;
            gpu.assigned_job_id = Some(job_id.to_string());
        }
    }
}

/// Validates the probe binary exists on startup. Its absence is fatal, per
/// spec §7: "absence of the GPU probe binary at startup; the daemon refuses
/// to start."
pub fn ensure_probe_available(probe_path: &str) -> anyhow::Result<()> {
    if std::path::Path::new(probe_path).is_absolute() {
        if !std::path::Path::new(probe_path).exists() {
            anyhow::bail!("gpu probe binary '{probe_path}' does not exist");
        }
        return Ok(());
    }
    let found = std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(probe_path).is_file())
        })
        .unwrap_or(false);
    if !found {
        anyhow::bail!("gpu probe binary '{probe_path}' not found on PATH");
    }
    Ok(())
}
