//! Runtime configuration – reads/writes `~/.s8r/config.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration.  `S8R_*` environment variables override file values; see
//! [`apply_env_overrides`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use s8r_kernel::KernelConfig;
use s8r_middleware::PublisherConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Tunables for the kernel and the event publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on each termination hook, in milliseconds.
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,
    /// Passes over unfinished children before termination is forced.
    #[serde(default = "default_termination_max_attempts")]
    pub termination_max_attempts: u32,
    #[serde(default = "default_termination_retry_backoff_ms")]
    pub termination_retry_backoff_ms: u64,
    /// Entries kept in each subject's memory log.
    #[serde(default = "default_memory_log_capacity")]
    pub memory_log_capacity: usize,
    /// Knowledge snapshots kept after termination.
    #[serde(default = "default_knowledge_capacity")]
    pub knowledge_capacity: usize,
    /// Bound on each subject's pending-event queue.
    #[serde(default = "default_subject_queue_capacity")]
    pub subject_queue_capacity: usize,
    /// Events handed to subscribers per dispatch.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,
}

fn default_hook_timeout_ms() -> u64 {
    5_000
}
fn default_termination_max_attempts() -> u32 {
    3
}
fn default_termination_retry_backoff_ms() -> u64 {
    10
}
fn default_memory_log_capacity() -> usize {
    256
}
fn default_knowledge_capacity() -> usize {
    1_024
}
fn default_subject_queue_capacity() -> usize {
    128
}
fn default_dispatch_batch_size() -> usize {
    64
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            hook_timeout_ms: default_hook_timeout_ms(),
            termination_max_attempts: default_termination_max_attempts(),
            termination_retry_backoff_ms: default_termination_retry_backoff_ms(),
            memory_log_capacity: default_memory_log_capacity(),
            knowledge_capacity: default_knowledge_capacity(),
            subject_queue_capacity: default_subject_queue_capacity(),
            dispatch_batch_size: default_dispatch_batch_size(),
        }
    }
}

impl RuntimeConfig {
    pub fn kernel_config(&self) -> KernelConfig {
        KernelConfig {
            hook_timeout: Duration::from_millis(self.hook_timeout_ms),
            termination_max_attempts: self.termination_max_attempts,
            termination_retry_backoff: Duration::from_millis(self.termination_retry_backoff_ms),
            memory_log_capacity: self.memory_log_capacity,
            knowledge_capacity: self.knowledge_capacity,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            subject_queue_capacity: self.subject_queue_capacity,
            dispatch_batch_size: self.dispatch_batch_size,
        }
    }
}

/// `$S8R_CONFIG` when set, otherwise `~/.s8r/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("S8R_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".s8r").join("config.toml")
}

/// Load the config from [`config_path`].  `None` if the file does not exist.
pub fn load() -> Result<Option<RuntimeConfig>, ConfigError> {
    load_from(&config_path())
}

/// The file config, or the defaults, with environment overrides applied.
pub fn load_or_default() -> Result<RuntimeConfig, ConfigError> {
    Ok(match load()? {
        Some(cfg) => cfg,
        None => {
            let mut cfg = RuntimeConfig::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    })
}

pub fn load_from(path: &Path) -> Result<Option<RuntimeConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: RuntimeConfig = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `S8R_*` environment variable overrides to `cfg`.  Values that do
/// not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `S8R_HOOK_TIMEOUT_MS` | `hook_timeout_ms` |
/// | `S8R_TERMINATION_MAX_ATTEMPTS` | `termination_max_attempts` |
/// | `S8R_SUBJECT_QUEUE_CAPACITY` | `subject_queue_capacity` |
/// | `S8R_MEMORY_LOG_CAPACITY` | `memory_log_capacity` |
/// | `S8R_KNOWLEDGE_CAPACITY` | `knowledge_capacity` |
pub fn apply_env_overrides(cfg: &mut RuntimeConfig) {
    if let Ok(v) = std::env::var("S8R_HOOK_TIMEOUT_MS")
        && let Ok(ms) = v.parse()
    {
        cfg.hook_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("S8R_TERMINATION_MAX_ATTEMPTS")
        && let Ok(n) = v.parse()
    {
        cfg.termination_max_attempts = n;
    }
    if let Ok(v) = std::env::var("S8R_SUBJECT_QUEUE_CAPACITY")
        && let Ok(n) = v.parse()
    {
        cfg.subject_queue_capacity = n;
    }
    if let Ok(v) = std::env::var("S8R_MEMORY_LOG_CAPACITY")
        && let Ok(n) = v.parse()
    {
        cfg.memory_log_capacity = n;
    }
    if let Ok(v) = std::env::var("S8R_KNOWLEDGE_CAPACITY")
        && let Ok(n) = v.parse()
    {
        cfg.knowledge_capacity = n;
    }
}

/// Save the config to [`config_path`], creating its directory if necessary.
pub fn save(cfg: &RuntimeConfig) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &RuntimeConfig, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&RuntimeConfig::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.termination_retry_backoff_ms, 10);
        assert_eq!(loaded.dispatch_batch_size, 64);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: RuntimeConfig = toml::from_str("dispatch_batch_size = 8").expect("parse");
        assert_eq!(cfg.dispatch_batch_size, 8);
        assert_eq!(cfg.termination_retry_backoff_ms, 10);
    }

    #[test]
    fn config_path_points_to_s8r_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".s8r"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "hook_timeout_ms = \"soon\"").expect("write");
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn kernel_config_converts_units() {
        let cfg = RuntimeConfig {
            hook_timeout_ms: 250,
            ..RuntimeConfig::default()
        };
        assert_eq!(cfg.kernel_config().hook_timeout, Duration::from_millis(250));
        assert_eq!(cfg.kernel_config().knowledge_capacity, 1_024);
        assert_eq!(cfg.publisher_config().subject_queue_capacity, 128);
    }

    #[test]
    fn apply_env_overrides_changes_hook_timeout() {
        // SAFETY: single-threaded test; no other test touches this variable.
        unsafe { std::env::set_var("S8R_HOOK_TIMEOUT_MS", "750") };
        let mut cfg = RuntimeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.hook_timeout_ms, 750);
        unsafe { std::env::remove_var("S8R_HOOK_TIMEOUT_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_queue_capacity() {
        // SAFETY: single-threaded test; no other test touches this variable.
        unsafe { std::env::set_var("S8R_SUBJECT_QUEUE_CAPACITY", "32") };
        let mut cfg = RuntimeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.subject_queue_capacity, 32);
        unsafe { std::env::remove_var("S8R_SUBJECT_QUEUE_CAPACITY") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_attempts() {
        // SAFETY: single-threaded test; no other test touches this variable.
        unsafe { std::env::set_var("S8R_TERMINATION_MAX_ATTEMPTS", "many") };
        let mut cfg = RuntimeConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.termination_max_attempts, 3);
        unsafe { std::env::remove_var("S8R_TERMINATION_MAX_ATTEMPTS") };
    }
}
