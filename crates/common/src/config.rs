//! Configuration structures for TensorBridge
//!
//! This module defines the configuration shared by the host process and the
//! worker process. Configurations are loaded from YAML files and can be
//! overridden by `TENSORBRIDGE_*` environment variables.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path of the YAML configuration file, if any
pub const CONFIG_PATH_ENV: &str = "TENSORBRIDGE_CONFIG";

/// Execution mode override
pub const EXECUTION_MODE_ENV: &str = "TENSORBRIDGE_EXECUTION_MODE";

/// Worker executable override
pub const WORKER_PROGRAM_ENV: &str = "TENSORBRIDGE_WORKER_PROGRAM";

/// Segment directory; also how the host hands its directory to the worker
pub const SHM_DIR_ENV: &str = "TENSORBRIDGE_SHM_DIR";

/// Segment ownership flag; also how the host hands its policy to the worker
pub const READER_CLOSES_SEGMENT_ENV: &str = "TENSORBRIDGE_READER_CLOSES_SEGMENT";

/// Engine name override
pub const ENGINE_ENV: &str = "TENSORBRIDGE_ENGINE";

/// Log level override
pub const LOG_LEVEL_ENV: &str = "TENSORBRIDGE_LOG_LEVEL";

/// Top-level configuration for TensorBridge components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// In-process or out-of-process execution
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Worker process configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Shared memory configuration
    #[serde(default)]
    pub shm: ShmConfig,

    /// Model loading configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Execution configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
}

/// Where the model runs
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Load and run inside the host process
    InProcess,

    /// Load and run inside a supervised worker process
    OutOfProcess,

    /// Out-of-process on platforms where the native runtime is unstable
    /// in-process (Windows, Intel macOS), in-process elsewhere
    #[default]
    Auto,
}

impl ExecutionMode {
    /// Whether this mode resolves to a worker process on the running platform
    pub fn uses_worker_process(&self) -> bool {
        match self {
            ExecutionMode::InProcess => false,
            ExecutionMode::OutOfProcess => true,
            ExecutionMode::Auto => {
                cfg!(any(windows, all(target_os = "macos", target_arch = "x86_64")))
            }
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_process" | "in-process" => Some(ExecutionMode::InProcess),
            "out_of_process" | "out-of-process" => Some(ExecutionMode::OutOfProcess),
            "auto" => Some(ExecutionMode::Auto),
            _ => None,
        }
    }
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker executable (defaults to `tensorbridge-worker` next to the host binary)
    pub program: Option<PathBuf>,

    /// Arguments passed to the worker executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the worker process
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Time allowed for a clean exit after CLOSE before the worker is killed
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// How often a blocked wait checks whether the worker is still alive
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            shutdown_grace_ms: default_shutdown_grace(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Shared memory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShmConfig {
    /// Directory holding segment files
    pub dir: Option<PathBuf>,

    /// Whether the reading side releases a segment right after consuming it.
    /// Defaults to the platform rule (true on Windows).
    pub reader_closes_segment: Option<bool>,
}

/// Model loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Engine used to load and run models
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Packed archives looked for when a model directory is not unpacked yet
    #[serde(default = "default_archive_names")]
    pub archive_names: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            archive_names: default_archive_names(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Default value functions
fn default_shutdown_grace() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_engine() -> String {
    "reference".to_string()
}

fn default_archive_names() -> Vec<String> {
    vec!["weights.zip".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Platform default for the segment directory
pub fn default_segment_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if cfg!(target_os = "linux") && dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir().join("tensorbridge-shm")
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(BridgeError::config(format!("Invalid boolean for {}: {}", name, other))),
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: BridgeConfig = serde_yaml::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        BridgeConfig::default().with_env_overrides()
    }

    /// Load the file named by `TENSORBRIDGE_CONFIG` if set, then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let base = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => BridgeConfig::from_file(path)?,
            Err(_) => BridgeConfig::default(),
        };
        base.with_env_overrides()
    }

    /// Apply `TENSORBRIDGE_*` environment variables
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(EXECUTION_MODE_ENV) {
            self.execution.mode = ExecutionMode::parse(&mode)
                .ok_or_else(|| BridgeError::config(format!("Invalid execution mode: {}", mode)))?;
        }
        if let Some(program) = lookup(WORKER_PROGRAM_ENV) {
            self.worker.program = Some(PathBuf::from(program));
        }
        if let Some(dir) = lookup(SHM_DIR_ENV) {
            self.shm.dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup(READER_CLOSES_SEGMENT_ENV) {
            self.shm.reader_closes_segment = Some(parse_bool(READER_CLOSES_SEGMENT_ENV, &flag)?);
        }
        if let Some(engine) = lookup(ENGINE_ENV) {
            self.model.engine = engine;
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.observability.log_level = level;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.engine.trim().is_empty() {
            return Err(BridgeError::config("Engine name must not be empty"));
        }
        if self.model.archive_names.iter().any(|name| name.trim().is_empty()) {
            return Err(BridgeError::config("Archive names must not be empty"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(BridgeError::config("Worker poll interval must be positive"));
        }
        if let Some(program) = &self.worker.program {
            if program.as_os_str().is_empty() {
                return Err(BridgeError::config("Worker program must not be empty"));
            }
        }
        match self.observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(BridgeError::config(format!("Invalid log level: {}", other)));
            }
        }
        Ok(())
    }

    /// Directory holding segment files
    pub fn segment_dir(&self) -> PathBuf {
        self.shm.dir.clone().unwrap_or_else(default_segment_dir)
    }

    /// Resolved segment ownership flag
    pub fn reader_closes_segment(&self) -> bool {
        self.shm.reader_closes_segment.unwrap_or(cfg!(windows))
    }

    /// Get shutdown grace as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.worker.shutdown_grace_ms)
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_config_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
execution:
  mode: out_of_process
worker:
  program: /opt/tensorbridge/bin/tensorbridge-worker
  args: ["--quiet"]
  shutdown_grace_ms: 250
shm:
  dir: /tmp/segments
  reader_closes_segment: true
model:
  engine: reference
"#
        )
        .unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.execution.mode, ExecutionMode::OutOfProcess);
        assert!(config.execution.mode.uses_worker_process());
        assert_eq!(config.worker.args, vec!["--quiet".to_string()]);
        assert_eq!(config.shutdown_grace(), Duration::from_millis(250));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.segment_dir(), PathBuf::from("/tmp/segments"));
        assert!(config.reader_closes_segment());
        assert_eq!(config.model.archive_names, vec!["weights.zip".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (EXECUTION_MODE_ENV, "in-process"),
            (SHM_DIR_ENV, "/var/tmp/tb"),
            (READER_CLOSES_SEGMENT_ENV, "false"),
            (LOG_LEVEL_ENV, "debug"),
        ]
        .into_iter()
        .collect();

        let config = BridgeConfig::default()
            .with_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.execution.mode, ExecutionMode::InProcess);
        assert!(!config.execution.mode.uses_worker_process());
        assert_eq!(config.segment_dir(), PathBuf::from("/var/tmp/tb"));
        assert!(!config.reader_closes_segment());
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn test_config_validation_rejects_bad_values() {
        let bad_bool = BridgeConfig::default()
            .with_overrides(|name| (name == READER_CLOSES_SEGMENT_ENV).then(|| "maybe".to_string()));
        assert!(bad_bool.is_err());

        let mut config = BridgeConfig::default();
        config.worker.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.observability.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        assert!(BridgeConfig::default().validate().is_ok());
    }
}
