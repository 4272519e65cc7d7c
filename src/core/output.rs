use std::path::{Path, PathBuf};

/// Default number of trailing lines surfaced as `recent_output` on a job
/// detail response, per spec §4.H.
pub const DEFAULT_TAIL_LINES: usize = 50;

/// Resolves the output directory for a job given the daemon's configured
/// `output_root` (spec §4.H / §7 default `<home>/gpu-scheduler/output`).
pub fn job_dir(output_root: &Path, job_id: &str) -> PathBuf {
    output_root.join(job_id)
}

pub fn stdout_path(output_root: &Path, job_id: &str) -> PathBuf {
    job_dir(output_root, job_id).join("stdout.txt")
}

pub fn stderr_path(output_root: &Path, job_id: &str) -> PathBuf {
    job_dir(output_root, job_id).join("stderr.txt")
}

/// Default output root, `<home>/gpu-scheduler/output`, used when the
/// daemon's configuration does not override it.
pub fn default_output_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpu-scheduler")
        .join("output")
}

/// Best-effort tail of the last `n` lines of a file. I/O errors (missing
/// file, permission denied) are swallowed and yield an empty string, since
/// `recent_output` is a convenience field, not a correctness-critical one
/// (spec §4.H).
pub fn tail_lines(path: &Path, n: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}
