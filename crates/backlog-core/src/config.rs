use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_DRIVER: &str = "file";
pub const DEFAULT_MAX_JOB: usize = 10;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WAIT_MS: u64 = 0;
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 600; // a sweep holding a claim longer than this is presumed dead
pub const DEFAULT_JOBS_TABLE: &str = "jobs";
pub const DEFAULT_FAILED_JOBS_TABLE: &str = "failed_jobs";

/// Top-level config (backlog.toml + BACKLOG_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacklogConfig {
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Everything the queue engine reads at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backend name resolved by the driver registry: `"file"` or `"database"`.
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Upper bound on records handled by a single sweep.
    #[serde(default = "default_max_job")]
    pub max_job: usize,
    /// Attempts per record before it is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between attempts, in milliseconds.
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
    /// When false, per-job outcome lines drop from `info` to `debug`.
    #[serde(default = "bool_true")]
    pub logging: bool,
    /// Claims older than this are handed back to the pending set.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    #[serde(default)]
    pub file: FileStoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            max_job: DEFAULT_MAX_JOB,
            max_retries: DEFAULT_MAX_RETRIES,
            wait_ms: DEFAULT_WAIT_MS,
            logging: true,
            claim_ttl_secs: DEFAULT_CLAIM_TTL_SECS,
            file: FileStoreConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreConfig {
    /// Directory holding one file per job. Keep it outside any served root.
    #[serde(default = "default_jobs_dir")]
    pub path: String,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: default_jobs_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_jobs_table")]
    pub jobs_table: String,
    #[serde(default = "default_failed_jobs_table")]
    pub failed_jobs_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            jobs_table: default_jobs_table(),
            failed_jobs_table: default_failed_jobs_table(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_driver() -> String {
    DEFAULT_DRIVER.to_string()
}
fn default_max_job() -> usize {
    DEFAULT_MAX_JOB
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_wait_ms() -> u64 {
    DEFAULT_WAIT_MS
}
fn default_claim_ttl_secs() -> u64 {
    DEFAULT_CLAIM_TTL_SECS
}
fn default_jobs_table() -> String {
    DEFAULT_JOBS_TABLE.to_string()
}
fn default_failed_jobs_table() -> String {
    DEFAULT_FAILED_JOBS_TABLE.to_string()
}
fn default_jobs_dir() -> String {
    format!("{}/.backlog/jobs", home_dir())
}
fn default_db_path() -> String {
    format!("{}/.backlog/backlog.db", home_dir())
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

impl BacklogConfig {
    /// Load config from a TOML file with BACKLOG_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore so snake_case field
    /// names survive, e.g. `BACKLOG_QUEUE__MAX_JOB=25`.
    ///
    /// A missing file is not an error: every key has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading backlog config");

        let config: BacklogConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("BACKLOG_").split("__"))
            .extract()
            .map_err(|e| crate::error::BacklogError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    format!("{}/.backlog/backlog.toml", home_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = BacklogConfig::load(Some(path.to_str().unwrap())).unwrap();

        assert_eq!(cfg.queue.driver, "file");
        assert_eq!(cfg.queue.max_job, DEFAULT_MAX_JOB);
        assert_eq!(cfg.queue.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(cfg.queue.database.jobs_table, "jobs");
        assert_eq!(cfg.queue.database.failed_jobs_table, "failed_jobs");
        assert!(cfg.queue.logging);
    }

    #[test]
    fn toml_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.toml");
        std::fs::write(
            &path,
            r#"
[queue]
driver = "database"
max_job = 3
wait_ms = 250
logging = false

[queue.database]
path = "/tmp/q.db"
jobs_table = "queued_jobs"
"#,
        )
        .unwrap();

        let cfg = BacklogConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.queue.driver, "database");
        assert_eq!(cfg.queue.max_job, 3);
        assert_eq!(cfg.queue.wait_ms, 250);
        assert!(!cfg.queue.logging);
        assert_eq!(cfg.queue.database.jobs_table, "queued_jobs");
        // untouched keys keep their defaults
        assert_eq!(cfg.queue.database.failed_jobs_table, "failed_jobs");
        assert_eq!(cfg.queue.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backlog.toml");
        std::fs::write(&path, "[queue]\nmax_job = \"lots\"\n").unwrap();

        let err = BacklogConfig::load(Some(path.to_str().unwrap())).unwrap_err();
        assert!(matches!(err, crate::error::BacklogError::Config(_)));
    }
}
