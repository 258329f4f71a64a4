//! Engine configuration file
//!
//! One YAML document (JSON parses through the same reader) holds four
//! sections: `settings`, `devices`, `schedules` and `retention`. Device and
//! schedule entries stay as raw values here so the registry and scheduler can
//! reject malformed entries one at a time; a bad `settings` or `retention`
//! block fails the whole load.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fwvault_retry::RetryPolicy;

use crate::credential::{ChainResolver, EnvCredentialResolver, SecretsFileResolver};
use crate::job::DEFAULT_HISTORY_WINDOW;
use crate::retention::RetentionConfig;
use crate::{Result, VaultError};

/// Enumeration of supported storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Local filesystem storage
    #[default]
    Local,
    /// Process memory; nothing survives a restart
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub base_path: PathBuf,
    /// Gzip stored blobs
    pub compress: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            base_path: PathBuf::from("./backups"),
            compress: true,
        }
    }
}

impl StorageSettings {
    /// Local storage rooted at `base_path`
    pub fn local<P: Into<PathBuf>>(base_path: P) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == StorageBackend::Local && self.base_path.as_os_str().is_empty() {
            return Err(VaultError::config(
                "local storage requires a non-empty base_path",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    /// Upper bound on jobs running at once across all devices
    pub max_concurrent_jobs: usize,
    pub tick_interval_secs: u64,
    /// Where queued jobs and schedule positions are persisted on teardown
    pub state_path: Option<PathBuf>,
    /// Terminal jobs kept for history queries
    pub job_history_window: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: num_cpus::get().max(2),
            tick_interval_secs: 30,
            state_path: None,
            job_history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

impl SchedulerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(VaultError::config("max_concurrent_jobs must be at least 1"));
        }
        if self.tick_interval_secs == 0 {
            return Err(VaultError::config("tick_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSettings {
    /// Deadline for one transport call
    pub job_timeout_secs: u64,
    /// Attempt cap for a job, including the first attempt
    pub max_retries: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
    pub backoff_multiplier: f64,
    /// Captures shorter than this are treated as incomplete
    pub min_config_bytes: usize,
    /// Extra publish attempts after a storage failure
    pub storage_retries: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            job_timeout_secs: 120,
            max_retries: 3,
            backoff_initial_ms: 1_000,
            backoff_max_secs: 60,
            backoff_multiplier: 2.0,
            min_config_bytes: 100,
            storage_retries: 1,
        }
    }
}

impl ExecutionSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn transport_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            ..fwvault_retry::transport_backoff_policy()
        }
        .with_intervals(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
        .with_multiplier(self.backoff_multiplier)
    }

    pub fn storage_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.storage_retries + 1,
            ..fwvault_retry::storage_backoff_policy()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_timeout_secs == 0 {
            return Err(VaultError::config("job_timeout_secs must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(VaultError::config("max_retries must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(VaultError::config("backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialSettings {
    /// YAML secrets file backing `file:` references
    pub secrets_file: Option<PathBuf>,
}

impl CredentialSettings {
    /// Environment lookups, then the secrets file if one is configured
    pub fn resolver(&self) -> Result<ChainResolver> {
        let mut chain = ChainResolver::new().with(EnvCredentialResolver);
        if let Some(path) = &self.secrets_file {
            chain = chain.with(SecretsFileResolver::load(path)?);
        }
        Ok(chain)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub storage: StorageSettings,
    pub scheduler: SchedulerSettings,
    pub execution: ExecutionSettings,
    pub credentials: CredentialSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.scheduler.validate()?;
        self.execution.validate()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigFile {
    #[serde(default)]
    settings: Option<serde_yaml::Value>,
    #[serde(default)]
    devices: Vec<serde_yaml::Value>,
    #[serde(default)]
    schedules: Vec<serde_yaml::Value>,
    #[serde(default)]
    retention: Option<serde_yaml::Value>,
}

/// A parsed configuration file
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub settings: Settings,
    /// Raw inventory entries, parsed individually by the registry
    pub devices: Vec<serde_yaml::Value>,
    /// Raw schedule entries, parsed individually by the scheduler
    pub schedules: Vec<serde_yaml::Value>,
    pub retention: RetentionConfig,
    /// File the configuration came from, if any
    pub source: Option<PathBuf>,
}

/// Parse a configuration document
pub fn parse_config(raw: &str) -> Result<LoadedConfig> {
    let file: RawConfigFile = if raw.trim().is_empty() {
        RawConfigFile::default()
    } else {
        serde_yaml::from_str(raw)?
    };

    let settings: Settings = match file.settings {
        Some(value) => serde_yaml::from_value(value)
            .map_err(|e| VaultError::config(format!("invalid settings block: {e}")))?,
        None => Settings::default(),
    };
    settings.validate()?;

    let retention: RetentionConfig = match file.retention {
        Some(value) => serde_yaml::from_value(value)
            .map_err(|e| VaultError::config(format!("invalid retention block: {e}")))?,
        None => RetentionConfig::default(),
    };
    retention.validate()?;

    Ok(LoadedConfig {
        settings,
        devices: file.devices,
        schedules: file.schedules,
        retention,
        source: None,
    })
}

/// Read and parse a configuration file
pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<LoadedConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| {
        VaultError::config(format!("cannot read config {}: {e}", path.display()))
    })?;
    let mut loaded = parse_config(&raw)?;
    // Relative paths in the file are relative to the file itself
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        let storage = &mut loaded.settings.storage;
        if storage.base_path.is_relative() {
            storage.base_path = dir.join(&storage.base_path);
        }
        if let Some(secrets) = &mut loaded.settings.credentials.secrets_file {
            if secrets.is_relative() {
                *secrets = dir.join(&*secrets);
            }
        }
        if let Some(state) = &mut loaded.settings.scheduler.state_path {
            if state.is_relative() {
                *state = dir.join(&*state);
            }
        }
    }
    loaded.source = Some(path.to_path_buf());
    Ok(loaded)
}

/// Commented starting point written by `fwvault init`
pub const SAMPLE_CONFIG: &str = r#"# fwvault configuration
#
# Credentials are never written here. `env:FW01` reads FW01_USERNAME with
# FW01_PASSWORD or FW01_KEY_PATH, or FW01_TOKEN; `file:<key>` looks the key
# up in settings.credentials.secrets_file.

settings:
  storage:
    backend: local
    base_path: ./backups
    compress: true
  scheduler:
    max_concurrent_jobs: 4
    tick_interval_secs: 30
    state_path: ./backups/.scheduler-state.json
  execution:
    job_timeout_secs: 120
    max_retries: 3
    min_config_bytes: 100
  credentials:
    secrets_file: ./secrets.yaml

devices:
  - id: fw-hq-01
    group: datacenter
    transport: ssh_cli
    connection:
      host: 192.0.2.10
      credential: env:FW_HQ_01
      # host_key_fingerprint: SHA256:...
  - id: fw-branch-07
    group: branches
    transport: rest_api
    connection:
      host: 198.51.100.7
      port: 8443
      credential: file:branch-api
      options:
        vdom: root
  - id: fw-branch-08
    group: branches
    transport: manager_proxied
    connection:
      host: fmg.example.net
      credential: env:FMG
      options:
        manager_url: https://fmg.example.net
        adom: root

schedules:
  - id: nightly
    cron: "0 2 * * *"
  - id: branches-hourly
    cron: "@hourly"
    group: branches

retention:
  default:
    max_count: 30
  groups:
    branches:
      max_count: 90
      max_age_days: 180
"#;

/// Write the sample configuration, refusing to overwrite an existing file
pub fn write_sample_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Err(VaultError::config(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, SAMPLE_CONFIG)?;
    Ok(())
}
