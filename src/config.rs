//! Daemon configuration, layered `config` crate sources per spec §6
//! ("Daemon configuration (startup flags, equivalent env admissible)").
//!
//! Precedence, lowest to highest: built-in defaults, an optional config
//! file, `GFLOW_`-prefixed environment variables, then CLI flags (applied
//! by the caller after [`load_config`] returns, mirroring the teacher's
//! "CLI flag overrides config file" comment in `src/bin/gflowd/main.rs`).

use serde::Deserialize;
use std::path::PathBuf;

fn default_port() -> u16 {
    8000
}

fn default_poll_interval() -> u64 {
    30
}

fn default_min_free_memory() -> u64 {
    1000
}

fn default_max_gpu_util() -> u32 {
    10
}

fn default_probe_path() -> String {
    "gpu-query".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_min_free_memory")]
    pub min_free_memory: u64,
    #[serde(default = "default_max_gpu_util")]
    pub max_gpu_util: u32,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// Directory holding one subdirectory per job's stdout/stderr, spec §4.H.
    /// Absent in file/env config; resolved to `default_output_root()` by
    /// the daemon if still unset after layering.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            poll_interval: default_poll_interval(),
            min_free_memory: default_min_free_memory(),
            max_gpu_util: default_max_gpu_util(),
            probe_path: default_probe_path(),
            output_root: None,
        }
    }
}

/// Loads configuration from an optional file, layered under `GFLOW_`-prefixed
/// environment variables, layered under built-in defaults. A config path
/// that does not exist is a warning, not a hard failure (it may simply be
/// the unmodified default path), matching the teacher's `load_config`.
pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut sources = vec![];
    if let Some(path) = config_path {
        if path.exists() {
            sources.push(path.clone());
        } else {
            tracing::warn!("config file {path:?} not found, using defaults/env only");
        }
    }

    let builder = config::Config::builder();
    let builder = sources
        .drain(..)
        .fold(builder, |b, path| b.add_source(config::File::from(path.as_path())));

    builder
        .add_source(
            config::Environment::with_prefix("GFLOW")
                .separator("_")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
