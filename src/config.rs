use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shm_coord_core::accumulator::ACCUMULATOR_BASE;
use shm_coord_core::stack::STACK_BASE;
use shm_coord_core::WorkerMode;
use shm_coord_shared_memory::SegmentOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name looked up in the working directory when no --config is given
pub const CONFIG_FILE_NAME: &str = "shmcoord.toml";

/// shmcoord configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Default worker kind for `sum`
    #[serde(default = "default_mode")]
    pub mode: WorkerMode,

    /// Result file of `sum`
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Base name of accumulator segments
    #[serde(default = "default_sum_base")]
    pub sum_base: String,

    /// Base name of the shared stack
    #[serde(default = "default_stack_base")]
    pub stack_base: String,

    /// Wait on a held gate this long before checking whether its holder died
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    /// Wait this long for a concurrent creator to size a fresh region
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,

    /// Give up on the gate after this long; unset waits forever
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,

    /// How long a final destroy waits for the gate
    #[serde(default = "default_cleanup_timeout_ms")]
    pub cleanup_timeout_ms: u64,

    /// Per-worker deadline for `sum`; unset waits forever
    #[serde(default)]
    pub worker_deadline_secs: Option<u64>,

    /// Threads for symmetry checks, 0 = one per CPU
    #[serde(default = "default_threads")]
    pub threads: usize,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_mode() -> WorkerMode {
    WorkerMode::Process
}

fn default_output() -> PathBuf {
    PathBuf::from("res.txt")
}

fn default_sum_base() -> String {
    ACCUMULATOR_BASE.to_string()
}

fn default_stack_base() -> String {
    STACK_BASE.to_string()
}

fn default_recovery_interval_ms() -> u64 {
    200
}

fn default_attach_timeout_ms() -> u64 {
    1000
}

fn default_cleanup_timeout_ms() -> u64 {
    2000
}

fn default_threads() -> usize {
    0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            mode: default_mode(),
            output: default_output(),
            sum_base: default_sum_base(),
            stack_base: default_stack_base(),
            recovery_interval_ms: default_recovery_interval_ms(),
            attach_timeout_ms: default_attach_timeout_ms(),
            acquire_timeout_ms: None,
            cleanup_timeout_ms: default_cleanup_timeout_ms(),
            worker_deadline_secs: None,
            threads: default_threads(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config file {:?}", path.as_ref()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| format!("Cannot create directory {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("Cannot serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Cannot write config file {:?}", path.as_ref()))?;

        Ok(())
    }

    /// `shmcoord.toml` in the working directory, if present
    pub fn find_config_file() -> Option<PathBuf> {
        let candidate = PathBuf::from(CONFIG_FILE_NAME);
        candidate.is_file().then_some(candidate)
    }

    /// Segment tuning derived from the configuration
    pub fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            attach_timeout: Duration::from_millis(self.attach_timeout_ms),
            recovery_interval: Duration::from_millis(self.recovery_interval_ms),
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
            cleanup_timeout: Duration::from_millis(self.cleanup_timeout_ms),
        }
    }

    /// Thread count for symmetry checks with `0` resolved
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}
