//! Engine configuration.
//!
//! Read from `config.toml` under the fleet root. Every field has a default so
//! a missing file, a missing section or a missing key all fall back to the
//! documented values.
//!
//! ```toml
//! [engine]
//! poll_interval_ms = 1000
//! refresh_interval_secs = 5
//!
//! [ranker]
//! stall_idle_secs = 600
//! cost_watch_threshold = 5.0
//! top_k = 5
//!
//! [watchdog]
//! memory_ceiling_bytes = 8589934592
//! grace_secs = 5
//!
//! [worktrees]
//! enabled = true
//! cache_ttl_secs = 30
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{FleetError, Result};

pub const DEFAULT_MEMORY_CEILING_BYTES: u64 = 8 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct FleetConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub reviews: ReviewConfig,
    #[serde(default)]
    pub worktrees: WorktreeConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Metadata poll cadence for the change detector.
    pub poll_interval_ms: u64,
    /// Forced refresh when nothing changed for this long.
    pub refresh_interval_secs: u64,
    /// Sessions untouched for longer than this are not loaded.
    pub activity_window_days: i64,
    /// Consecutive failures of one source before the view shows degraded.
    pub failure_threshold: u32,
    pub comms_max_events: usize,
    pub log_backfill_bytes: u64,
    pub log_read_budget_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            refresh_interval_secs: 5,
            activity_window_days: 7,
            failure_threshold: 3,
            comms_max_events: 50,
            log_backfill_bytes: 8 * 1024,
            log_read_budget_bytes: 256 * 1024,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Executable names whose processes are sampled.
    pub executables: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            executables: vec!["opencode".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankerConfig {
    pub stall_idle_secs: i64,
    pub active_window_secs: i64,
    pub cost_watch_threshold: f64,
    pub top_k: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            stall_idle_secs: 600,
            active_window_secs: 1_800,
            cost_watch_threshold: 5.0,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub memory_ceiling_bytes: u64,
    pub grace_secs: i64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_BYTES,
            grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    pub command: String,
    pub author: String,
    pub cache_ttl_secs: i64,
    pub timeout_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "gh".to_string(),
            author: "@me".to_string(),
            cache_ttl_secs: 60,
            timeout_secs: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    pub enabled: bool,
    pub command: String,
    pub cache_ttl_secs: i64,
    /// Per git invocation.
    pub timeout_secs: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "git".to_string(),
            cache_ttl_secs: 30,
            timeout_secs: 5,
        }
    }
}

/// Loads the config file, returning defaults when it does not exist.
pub fn load_config(path: Option<&Path>) -> Result<FleetConfig> {
    let Some(path) = path else {
        return Ok(FleetConfig::default());
    };
    if !path.exists() {
        return Ok(FleetConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|err| FleetError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })?;
    toml::from_str::<FleetConfig>(&content).map_err(|err| FleetError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.watchdog.memory_ceiling_bytes, 8 * 1024 * 1024 * 1024);
        assert_eq!(config.ranker.top_k, 5);
    }

    #[test]
    fn load_config_merges_partial_sections_with_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[ranker]
top_k = 3
cost_watch_threshold = 12.5

[monitor]
executables = ["opencode", "claude"]

[worktrees]
enabled = false
"#,
        )
        .expect("write config");

        let config = load_config(Some(&path)).expect("load config");
        assert_eq!(config.ranker.top_k, 3);
        assert_eq!(config.ranker.cost_watch_threshold, 12.5);
        assert_eq!(config.ranker.stall_idle_secs, 600);
        assert_eq!(config.monitor.executables.len(), 2);
        assert!(!config.worktrees.enabled);
        assert_eq!(config.worktrees.command, "git");
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn load_config_rejects_malformed_toml() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[engine\npoll_interval_ms = ").expect("write config");

        let err = load_config(Some(&path)).expect_err("malformed");
        assert!(matches!(err, FleetError::ConfigMalformed { .. }));
        assert!(!err.is_transient());
    }
}
