//! Configuration loading and root folder resolution
//!
//! Every value resolves in the same priority order:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. `MIXSCOPE_*` environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing or unreadable TOML file is never fatal: the service logs a warning and
//! continues with defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "MIXSCOPE_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "mixscope.db";

/// Top-level TOML configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Root folder holding the database
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default tracing filter (e.g. "info", "mixscope_analyzer=debug")
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Capacity of the job event broadcast channel
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 5740,
            event_capacity: 100,
        }
    }
}

/// `[worker]` section: pool size and queue lease timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of long-lived workers pulling from the queue
    pub concurrency: usize,
    /// Visibility lease granted on dequeue
    pub lease_secs: u64,
    /// Interval between heartbeats while a job is processing
    pub heartbeat_secs: u64,
    /// Sleep between empty dequeue attempts
    pub poll_interval_ms: u64,
    /// Upper bound on total retry time for queue transport and lock errors
    pub max_retry_wait_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            lease_secs: 180,
            heartbeat_secs: 30,
            poll_interval_ms: 500,
            max_retry_wait_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// External decode tool selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Spawn the ffmpeg command-line tool, falling back to symphonia when it is missing
    Ffmpeg,
    /// In-process symphonia decoder only
    Symphonia,
}

impl std::str::FromStr for DecoderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(DecoderKind::Ffmpeg),
            "symphonia" => Ok(DecoderKind::Symphonia),
            other => Err(Error::Config(format!("Unknown decoder: {}", other))),
        }
    }
}

/// `[pipeline]` section: timeouts and limits for a single analysis run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub decoder: DecoderKind,
    /// Path or name of the ffmpeg executable
    pub ffmpeg_path: String,
    /// Overall wall-clock budget for one job
    pub job_budget_secs: u64,
    pub decode_timeout_secs: u64,
    /// Independent timeout applied to each metric engine
    pub engine_timeout_secs: u64,
    /// Wall-clock budget checked inside the loudness block loop
    pub loudness_budget_secs: u64,
    /// Hard ceiling on frames produced by segmentation
    pub max_frames: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderKind::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            job_budget_secs: 120,
            decode_timeout_secs: 60,
            engine_timeout_secs: 60,
            loudness_budget_secs: 60,
            max_frames: 100_000,
        }
    }
}

impl PipelineConfig {
    pub fn job_budget(&self) -> Duration {
        Duration::from_secs(self.job_budget_secs)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_secs(self.decode_timeout_secs)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    pub fn loudness_budget(&self) -> Duration {
        Duration::from_secs(self.loudness_budget_secs)
    }
}

/// `[recovery]` section: orphan sweep behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// A processing job whose heartbeat is older than this is orphaned
    pub orphan_threshold_secs: u64,
    pub sweep_interval_secs: u64,
    /// Recoveries allowed before the job is quarantined as `error`
    pub max_recoveries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            orphan_threshold_secs: 300,
            sweep_interval_secs: 120,
            max_recoveries: 3,
        }
    }
}

impl RecoveryConfig {
    pub fn orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.orphan_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl TomlConfig {
    /// Load the config file from the platform location, or defaults when absent
    pub fn load_or_default() -> Self {
        match config_file_path() {
            Some(path) => match load_toml_config(&path) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded TOML config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable TOML config, using defaults");
                    TomlConfig::default()
                }
            },
            None => {
                info!("No TOML config found, using compiled defaults");
                TomlConfig::default()
            }
        }
    }

    /// Overlay `MIXSCOPE_*` environment variables onto the loaded values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MIXSCOPE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(bind) = std::env::var("MIXSCOPE_BIND") {
            self.server.bind = bind;
        }
        override_parsed("MIXSCOPE_PORT", &mut self.server.port);
        override_parsed("MIXSCOPE_WORKERS", &mut self.worker.concurrency);
        override_parsed("MIXSCOPE_LEASE_SECS", &mut self.worker.lease_secs);
        override_parsed("MIXSCOPE_JOB_BUDGET_SECS", &mut self.pipeline.job_budget_secs);
        override_parsed("MIXSCOPE_MAX_RECOVERIES", &mut self.recovery.max_recoveries);
        override_parsed("MIXSCOPE_DECODER", &mut self.pipeline.decoder);
        if let Ok(path) = std::env::var("MIXSCOPE_FFMPEG_PATH") {
            self.pipeline.ffmpeg_path = path;
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(var) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(variable = var, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Serialize and write a TOML config file, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Locate the config file: user config dir first, then the system-wide file
fn config_file_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("mixscope").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/mixscope/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("mixscope"))
        .unwrap_or_else(|| PathBuf::from("./mixscope_data"))
}

/// Resolves the root folder from CLI, environment, TOML, then default
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(cli_arg: Option<PathBuf>, toml: &TomlConfig) -> Self {
        Self {
            cli_arg,
            toml_value: toml.root_folder.clone(),
        }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Creates the root folder on first start and locates the database inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            info!(path = %self.root_folder.display(), "Creating root folder");
            std::fs::create_dir_all(&self.root_folder)?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = TomlConfig::default();
        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.worker.lease_secs, 180);
        assert_eq!(config.recovery.orphan_threshold_secs, 300);
        assert_eq!(config.recovery.max_recoveries, 3);
        assert_eq!(config.pipeline.job_budget_secs, 120);
        assert_eq!(config.pipeline.max_frames, 100_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [worker]
            concurrency = 8

            [pipeline]
            decoder = "symphonia"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.lease_secs, 180);
        assert_eq!(config.pipeline.decoder, DecoderKind::Symphonia);
        assert_eq!(config.pipeline.engine_timeout_secs, 60);
        assert!(config.root_folder.is_none());
    }

    #[test]
    fn test_write_then_load_preserves_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = TomlConfig::default();
        config.root_folder = Some(PathBuf::from("/srv/mixscope"));
        config.recovery.max_recoveries = 5;

        write_toml_config(&config, &path).unwrap();
        let loaded = load_toml_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unparsable_toml_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "[worker\nconcurrency = ").unwrap();

        match load_toml_config(&path) {
            Err(Error::Config(msg)) => assert!(msg.contains("Parse TOML failed")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_root_folder_priority() {
        std::env::remove_var(ROOT_FOLDER_ENV);
        let mut toml = TomlConfig::default();
        toml.root_folder = Some(PathBuf::from("/from/toml"));

        // CLI wins over everything
        let resolver = RootFolderResolver::new(Some(PathBuf::from("/from/cli")), &toml);
        assert_eq!(resolver.resolve(), PathBuf::from("/from/cli"));

        // Environment wins over TOML
        std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
        let resolver = RootFolderResolver::new(None, &toml);
        assert_eq!(resolver.resolve(), PathBuf::from("/from/env"));
        std::env::remove_var(ROOT_FOLDER_ENV);

        // TOML wins over the compiled default
        let resolver = RootFolderResolver::new(None, &toml);
        assert_eq!(resolver.resolve(), PathBuf::from("/from/toml"));

        let resolver = RootFolderResolver::new(None, &TomlConfig::default());
        assert_eq!(resolver.resolve(), default_root_folder());
    }

    #[test]
    #[serial]
    fn test_env_overrides_apply_and_ignore_garbage() {
        std::env::set_var("MIXSCOPE_WORKERS", "6");
        std::env::set_var("MIXSCOPE_PORT", "not-a-port");
        std::env::set_var("MIXSCOPE_DECODER", "symphonia");

        let mut config = TomlConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.worker.concurrency, 6);
        assert_eq!(config.server.port, 5740);
        assert_eq!(config.pipeline.decoder, DecoderKind::Symphonia);

        std::env::remove_var("MIXSCOPE_WORKERS");
        std::env::remove_var("MIXSCOPE_PORT");
        std::env::remove_var("MIXSCOPE_DECODER");
    }

    #[test]
    fn test_initializer_creates_folder() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("root");
        let initializer = RootFolderInitializer::new(root.clone());

        initializer.ensure_directory_exists().unwrap();
        assert!(root.is_dir());
        assert_eq!(initializer.database_path(), root.join(DATABASE_FILE_NAME));
    }
}
