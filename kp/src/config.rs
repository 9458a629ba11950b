//! keypace configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result, eyre};
use keystore::QueuePolicy;
use serde::{Deserialize, Serialize};

use crate::admission::RatePolicy;
use crate::lock::{LockRetryPolicy, ReleaseMode};
use crate::scheduler::SchedulerConfig;

/// Prefix for every store key unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "keypace";

/// Main keypace configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_level: Option<String>,

    /// Identifies this process in lease tokens and completion records
    pub replica_id: Option<String>,

    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub rate: RateConfig,
    pub lock: LockConfig,
    pub scheduler: WorkerConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local: ./keypace.yml
        let local_config = PathBuf::from("keypace.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User: ~/.config/keypace/keypace.yml
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, before logging is set up
    ///
    /// Errors are swallowed; the full [`Config::load`] reports them later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => std::iter::once(PathBuf::from("keypace.yml"))
                .chain(user_config_path())
                .collect(),
        };
        candidates
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Reject settings the coordination logic cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.rate.window_secs == 0 {
            return Err(eyre!("rate.window-secs must be greater than 0"));
        }
        if self.rate.per_window == 0 {
            return Err(eyre!("rate.per-window must be greater than 0"));
        }
        if self.rate.per_second == 0 && self.rate.min_interval_ms.is_none() {
            return Err(eyre!("rate.per-second must be greater than 0"));
        }
        if self.rate.min_interval_ms == Some(0) {
            return Err(eyre!("rate.min-interval-ms must be greater than 0"));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(eyre!("lock.poll-interval-ms must be greater than 0"));
        }
        if self.lock.max_attempts == Some(0) {
            return Err(eyre!("lock.max-attempts must be greater than 0 or unset"));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(eyre!("scheduler.max-concurrent must be greater than 0"));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(eyre!("scheduler.poll-interval-ms must be greater than 0"));
        }
        if self.queue.visibility_timeout_ms == 0 {
            return Err(eyre!("queue.visibility-timeout-ms must be greater than 0"));
        }
        if self.queue.max_attempts == 0 {
            return Err(eyre!("queue.max-attempts must be greater than 0"));
        }
        let min_interval = self.rate.min_interval();
        if self.lock.lease_ttl() <= min_interval {
            return Err(eyre!(
                "lock.lease-ttl-ms ({}) must be larger than the spacing interval ({}ms)",
                self.lock.lease_ttl_ms,
                min_interval.as_millis()
            ));
        }
        if self.store.namespace.is_empty() {
            return Err(eyre!("store.namespace must not be empty"));
        }
        Ok(())
    }

    /// Configured replica id, or `{hostname}-{pid}`
    pub fn replica_id(&self) -> String {
        if let Some(id) = &self.replica_id {
            return id.clone();
        }
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "kp".to_string());
        format!("{}-{}", host, std::process::id())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.scheduler.max_concurrent,
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            shutdown_timeout: Duration::from_secs(self.scheduler.shutdown_timeout_secs),
            visibility_timeout: self.queue.visibility_timeout(),
            lease_ttl: self.lock.lease_ttl(),
            min_interval: self.rate.min_interval(),
            lock_retry: self.lock.retry_policy(),
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("keypace").join("keypace.yml"))
}

fn default_data_path(file: &str) -> String {
    dirs::data_local_dir()
        .map(|d| d.join("keypace"))
        .unwrap_or_else(|| PathBuf::from(".keypace"))
        .join(file)
        .to_string_lossy()
        .into_owned()
}

/// Resolve a leading `~/` against the home directory
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Shared SQLite file; replicas on one host coordinate through it
    #[default]
    Sqlite,
    /// Process-local; only meaningful for single-process runs
    Memory,
}

/// Shared Coordination Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: String,
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_data_path("store.db"),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        expand_path(&self.path)
    }
}

/// Persistent Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    pub path: String,
    pub visibility_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_data_path("queue.db"),
            visibility_timeout_ms: 30_000,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl QueueConfig {
    pub fn path(&self) -> PathBuf {
        expand_path(&self.path)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// Two-tier rate limit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RateConfig {
    pub window_secs: u64,
    pub per_window: u64,
    pub per_second: u32,
    /// Overrides the spacing derived from `per-second`
    pub min_interval_ms: Option<u64>,
    pub delay_jitter_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            per_window: 20,
            per_second: 1,
            min_interval_ms: None,
            delay_jitter_ms: 0,
        }
    }
}

impl RateConfig {
    pub fn policy(&self) -> RatePolicy {
        RatePolicy {
            window: Duration::from_secs(self.window_secs),
            per_window: self.per_window,
        }
    }

    /// Spacing between executions of one key
    pub fn min_interval(&self) -> Duration {
        match self.min_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(1_000u64.div_ceil(u64::from(self.per_second.max(1)))),
        }
    }

    pub fn delay_jitter(&self) -> Duration {
        Duration::from_millis(self.delay_jitter_ms)
    }
}

/// Per-key execution lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LockConfig {
    pub lease_ttl_ms: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: Option<u32>,
    pub release: ReleaseMode,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 10_000,
            poll_interval_ms: 100,
            max_attempts: None,
            release: ReleaseMode::default(),
        }
    }
}

impl LockConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn retry_policy(&self) -> LockRetryPolicy {
        LockRetryPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Worker loop settings (the `scheduler:` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WorkerConfig {
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            poll_interval_ms: 250,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutorConfig {
    pub log_path: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            log_path: default_data_path("completions.jsonl"),
        }
    }
}

impl ExecutorConfig {
    pub fn log_path(&self) -> PathBuf {
        expand_path(&self.log_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.namespace, "keypace");
        assert_eq!(config.rate.policy(), RatePolicy::default());
        assert_eq!(config.rate.min_interval(), Duration::from_secs(1));
        assert_eq!(config.lock.release, ReleaseMode::VerifyToken);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_matches_runtime_defaults() {
        assert_eq!(Config::default().scheduler_config(), SchedulerConfig::default());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
log-level: debug
replica-id: replica-7
store:
  backend: memory
rate:
  per-window: 5
  per-second: 4
lock:
  max-attempts: 3
  release: unconditional
scheduler:
  max-concurrent: 8
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.replica_id(), "replica-7");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.namespace, "keypace");
        assert_eq!(config.rate.per_window, 5);
        assert_eq!(config.rate.window_secs, 60);
        assert_eq!(config.rate.min_interval(), Duration::from_millis(250));
        assert_eq!(config.lock.retry_policy().max_attempts, Some(3));
        assert_eq!(config.lock.release, ReleaseMode::Unconditional);
        assert_eq!(config.scheduler_config().max_concurrent, 8);
    }

    #[test]
    fn test_min_interval_override() {
        let rate = RateConfig {
            per_second: 1,
            min_interval_ms: Some(1_500),
            ..Default::default()
        };
        assert_eq!(rate.min_interval(), Duration::from_millis(1_500));

        let rate = RateConfig {
            per_second: 3,
            ..Default::default()
        };
        assert_eq!(rate.min_interval(), Duration::from_millis(334));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.rate.per_window = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lock.max_attempts = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_lease_must_outlast_spacing() {
        let mut config = Config::default();
        config.lock.lease_ttl_ms = 1_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease-ttl-ms"));
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("keypace.yml");
        fs::write(&path, "log-level: warn\nrate:\n  window-secs: 30\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.rate.window_secs, 30);
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("warn"));
    }

    #[test]
    fn test_load_explicit_path_errors() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("missing.yml");
        assert!(Config::load(Some(&missing)).is_err());
        assert_eq!(Config::load_log_level(Some(&missing)), None);

        let broken = temp.path().join("broken.yml");
        fs::write(&broken, "rate: [not, a, map]").unwrap();
        assert!(Config::load(Some(&broken)).is_err());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/var/lib/kp.db"), PathBuf::from("/var/lib/kp.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/kp.db"), home.join("kp.db"));
        }
    }
}
