//! Storage configuration and path management.
//!
//! Two roots matter to the engine:
//!
//! - the agent runtime's data directory (default `~/.local/share/opencode`),
//!   which we only ever read: its session database, the database's
//!   write-ahead log, and the `log/` directory of activity logs;
//! - our own root (default `~/.local/share/oc-fleet`), holding the config
//!   file, the project board, the published view-model and daemon logs.
//!
//! Production code uses [`StoragePaths::from_env`]. Tests use
//! [`StoragePaths::with_roots`] with temp directories.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{FleetError, Result};

const FLEET_HOME_ENV: &str = "OC_FLEET_HOME";
const OPENCODE_HOME_ENV: &str = "OPENCODE_DATA_DIR";

/// Central configuration for every path the engine touches.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// Root for fleet data (default: ~/.local/share/oc-fleet)
    root: PathBuf,
    /// Root for agent runtime data (default: ~/.local/share/opencode)
    opencode_root: PathBuf,
}

impl StoragePaths {
    /// Resolves both roots from the environment, falling back to the home
    /// directory defaults.
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir().ok_or(FleetError::HomeDirNotFound)?;
        let data = home.join(".local").join("share");
        let root = env::var_os(FLEET_HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| data.join("oc-fleet"));
        let opencode_root = env::var_os(OPENCODE_HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| data.join("opencode"));
        Ok(Self {
            root,
            opencode_root,
        })
    }

    pub fn with_roots(root: PathBuf, opencode_root: PathBuf) -> Self {
        Self {
            root,
            opencode_root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn opencode_root(&self) -> &Path {
        &self.opencode_root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Runtime Paths (Read-Only)
    // ─────────────────────────────────────────────────────────────────────────────

    /// The agent runtime's session database.
    pub fn db_file(&self) -> PathBuf {
        self.opencode_root.join("opencode.db")
    }

    /// Write-ahead log next to the session database. Its size and mtime are
    /// the cheapest signal that the writer committed something.
    pub fn wal_file(&self) -> PathBuf {
        self.opencode_root.join("opencode.db-wal")
    }

    /// Directory of append-only activity logs.
    pub fn log_dir(&self) -> PathBuf {
        self.opencode_root.join("log")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Fleet Files
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Project board, shared with the board CLI.
    pub fn board_file(&self) -> PathBuf {
        self.root.join("kanban.json")
    }

    /// Latest published view-model, replaced atomically on every publish.
    pub fn view_file(&self) -> PathBuf {
        self.root.join("view.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Fails when neither the session store nor the log directory exists.
    /// A partially present runtime (e.g. logs but no db yet) is tolerated.
    pub fn validate_sources(&self) -> Result<()> {
        let db = self.db_file();
        let log_dir = self.log_dir();
        if !db.exists() && !log_dir.is_dir() {
            return Err(FleetError::SourcesMissing { db, log_dir });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_right_roots() {
        let paths = StoragePaths::with_roots(PathBuf::from("/fleet"), PathBuf::from("/oc"));
        assert_eq!(paths.db_file(), PathBuf::from("/oc/opencode.db"));
        assert_eq!(paths.wal_file(), PathBuf::from("/oc/opencode.db-wal"));
        assert_eq!(paths.log_dir(), PathBuf::from("/oc/log"));
        assert_eq!(paths.board_file(), PathBuf::from("/fleet/kanban.json"));
        assert_eq!(paths.view_file(), PathBuf::from("/fleet/view.json"));
    }

    #[test]
    fn validate_sources_requires_db_or_log_dir() {
        let temp = tempfile::tempdir().expect("temp dir");
        let paths =
            StoragePaths::with_roots(temp.path().join("fleet"), temp.path().join("opencode"));
        assert!(matches!(
            paths.validate_sources(),
            Err(FleetError::SourcesMissing { .. })
        ));

        std::fs::create_dir_all(paths.log_dir()).expect("log dir");
        assert!(paths.validate_sources().is_ok());
    }
}
