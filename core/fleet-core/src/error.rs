//! Error types for fleet-core operations.
//!
//! Only the configuration group is fatal, and only at startup. Everything the
//! engine hits while polling is downgraded to a soft error by the caller.

use std::path::PathBuf;

/// All errors that can occur in fleet-core operations.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("No session store at {db} and no activity log directory at {log_dir}")]
    SourcesMissing { db: PathBuf, log_dir: PathBuf },

    // ─────────────────────────────────────────────────────────────────────
    // Source Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session store error: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Board Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Invalid stage: {0} (valid: pending, in_progress, pr, done)")]
    InvalidStage(String),

    // ─────────────────────────────────────────────────────────────────────
    // External Command Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Command execution failed: {command}: {details}")]
    CommandFailed { command: String, details: String },

    #[error("Command timed out after {secs}s: {command}")]
    CommandTimedOut { command: String, secs: u64 },
}

impl FleetError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FleetError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn sqlite(context: impl Into<String>, source: rusqlite::Error) -> Self {
        FleetError::Sqlite {
            context: context.into(),
            source,
        }
    }

    /// True for failures that are expected to clear on their own (locked
    /// store, a file mid-rewrite, a slow review fetch).
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            FleetError::HomeDirNotFound
                | FleetError::ConfigMalformed { .. }
                | FleetError::SourcesMissing { .. }
        )
    }
}

/// Convenience type alias for Results using FleetError.
pub type Result<T> = std::result::Result<T, FleetError>;

impl From<FleetError> for String {
    fn from(err: FleetError) -> String {
        err.to_string()
    }
}
