//! Engine configuration and graph documents.
//!
//! [`EngineSettings`] holds everything the engine tunes at runtime (queue
//! sizing, worker pool limits, stop protocol limits, working directories and
//! logging). It is stored as TOML, by default under the platform config
//! directory. Graph layouts are stored separately as [`GraphDocument`]s.

pub mod document;

pub use document::{ConnectionDocument, GraphDocument, NodeDocument};

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier used for config directories
pub const APP_ID: &str = "flowgraph-rs";

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "settings.toml";

/// Default length of an input queue in milliseconds of signal
pub const DEFAULT_QUEUE_MS: u32 = 500;

/// Default length of a working buffer (one packet) in milliseconds of signal
pub const DEFAULT_BUFFER_MS: u32 = 100;

/// Default upper bound of the worker pool
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// Default bound on the wait for running work before a snapshot
pub const DEFAULT_QUIESCE_TIMEOUT_MS: u64 = 2000;

/// Default re-check interval of a producer waiting for queue space
pub const DEFAULT_BACKPRESSURE_POLL_MS: u64 = 10;

/// Default limit on flush passes during stop
pub const DEFAULT_MAX_FLUSH_PASSES: usize = 1000;

/// Default working directory name of a run, `%count%` is the run counter
pub const DEFAULT_WORKING_DIR_MASK: &str = "set %count%";

/// Placeholder replaced by the run counter in the working directory mask
pub const COUNT_PLACEHOLDER: &str = "%count%";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path to the default settings file
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(SETTINGS_FILE))
}

/// Base directory for run working directories when none is configured
pub fn default_working_dir_base() -> PathBuf {
    dirs_next::data_dir()
        .map(|p| p.join(APP_ID))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_ID))
}

/// Logging configuration for the binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info,flowgraph_rs=debug".to_string(),
            file: None,
        }
    }
}

/// Runtime settings of the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Input queue length in milliseconds
    pub queue_ms: u32,

    /// Working buffer length in milliseconds
    pub buffer_ms: u32,

    /// Workers kept alive by the scheduler, 0 means available parallelism
    pub min_workers: usize,

    /// Hard limit on scheduler workers
    pub max_workers: usize,

    /// Bound on the wait for quiescence before save/load state
    pub quiesce_timeout_ms: u64,

    /// Re-check interval of a blocked producer
    pub backpressure_poll_ms: u64,

    /// Flush passes before the stop protocol gives up
    pub max_flush_passes: usize,

    /// Directory holding one working directory per run
    pub working_dir_base: PathBuf,

    /// Name of a run's working directory
    pub working_dir_mask: String,

    /// Logging
    pub log: LogSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue_ms: DEFAULT_QUEUE_MS,
            buffer_ms: DEFAULT_BUFFER_MS,
            min_workers: 0,
            max_workers: DEFAULT_MAX_WORKERS,
            quiesce_timeout_ms: DEFAULT_QUIESCE_TIMEOUT_MS,
            backpressure_poll_ms: DEFAULT_BACKPRESSURE_POLL_MS,
            max_flush_passes: DEFAULT_MAX_FLUSH_PASSES,
            working_dir_base: default_working_dir_base(),
            working_dir_mask: DEFAULT_WORKING_DIR_MASK.to_string(),
            log: LogSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read settings {:?}: {}", path, e))
        })?;
        let settings: Self = toml::from_str(&content).map_err(|e| {
            EngineError::Config(format!("Failed to parse settings {:?}: {}", path, e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `path`, or from the default location when `None`,
    /// returning defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(settings_path) {
            Some(p) if p.exists() => p,
            _ => return Self::default(),
        };
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save settings as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create settings directory: {}", e))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize settings: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| EngineError::Config(format!("Failed to write settings {:?}: {}", path, e)))
    }

    /// Reject values the engine can't run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_ms == 0 || self.buffer_ms == 0 {
            return Err(EngineError::Config(
                "queue_ms and buffer_ms must be positive".to_string(),
            ));
        }
        if self.buffer_ms > self.queue_ms {
            return Err(EngineError::Config(format!(
                "buffer_ms ({}) must not exceed queue_ms ({})",
                self.buffer_ms, self.queue_ms
            )));
        }
        if self.max_workers == 0 {
            return Err(EngineError::Config("max_workers must be positive".to_string()));
        }
        if self.max_flush_passes == 0 {
            return Err(EngineError::Config(
                "max_flush_passes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective minimum worker count
    pub fn min_workers(&self) -> usize {
        if self.min_workers > 0 {
            self.min_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
        .min(self.max_workers)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms.max(1))
    }

    /// Same settings with run directories under `base`
    pub fn with_working_dir_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.working_dir_base = base.into();
        self
    }

    /// Defaults with a private, not yet existing working directory base
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let base = std::env::temp_dir().join(format!(
            "{}-test-{}-{}",
            APP_ID,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));
        Self::default().with_working_dir_base(base)
    }

    /// Working directory name for `run`, before disambiguation
    pub fn working_dir_name(&self, run: u32) -> String {
        self.working_dir_mask
            .replace(COUNT_PLACEHOLDER, &run.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.queue_ms, 500);
        assert_eq!(settings.buffer_ms, 100);
        assert_eq!(settings.max_workers, 64);
        assert_eq!(settings.max_flush_passes, 1000);
        assert!(settings.validate().is_ok());
        assert!(settings.min_workers() >= 1);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = EngineSettings {
            queue_ms: 1000,
            working_dir_base: dir.path().to_path_buf(),
            ..Default::default()
        };
        settings.save(&path).unwrap();
        let loaded = EngineSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "buffer_ms = 50\n[log]\nfilter = \"warn\"\n").unwrap();
        let loaded = EngineSettings::load(&path).unwrap();
        assert_eq!(loaded.buffer_ms, 50);
        assert_eq!(loaded.queue_ms, DEFAULT_QUEUE_MS);
        assert_eq!(loaded.log.filter, "warn");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "queue_ms = 10\nbuffer_ms = 100\n").unwrap();
        assert!(EngineSettings::load(&path).is_err());
        assert_eq!(
            EngineSettings::load_or_default(Some(&path)),
            EngineSettings::default()
        );
    }

    #[test]
    fn test_working_dir_name() {
        let settings = EngineSettings::default();
        assert_eq!(settings.working_dir_name(3), "set 3");
    }
}
