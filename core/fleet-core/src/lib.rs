//! # fleet-core
//!
//! Live aggregation and coordination engine for a fleet of long-running agent
//! sessions. It watches the agent runtime's session store, its activity logs,
//! the local process table, code-review status, git worktrees and a local
//! project board, and folds them into one versioned view-model for an
//! external renderer.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The coordination loop runs on its own
//!   thread and publishes by replacing an `Arc`.
//! - **Graceful degradation**: Transient source failures keep the previous data
//!   and surface as soft errors; only startup configuration problems are fatal.
//! - **Read-only toward the agent runtime**: The session store and logs are
//!   never written. The board file is the only thing this crate writes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet_core::{load_config, Engine, StoragePaths};
//!
//! let paths = StoragePaths::from_env()?;
//! let config = load_config(Some(&paths.config_file()))?;
//! let handle = Engine::from_paths(&paths, config)?.spawn();
//! let view = handle.publisher().latest();
//! ```

pub mod aggregator;
pub mod board;
pub mod cache;
pub mod change;
pub(crate) mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod patterns;
pub mod ranker;
pub mod reviews;
pub mod sources;
pub mod storage;
pub mod tree;
pub mod types;
pub mod view;
pub mod watchdog;
pub mod worktrees;

pub use aggregator::Aggregator;
pub use board::{Board, BoardProject, BoardReader, BoardStore, ProjectPatch, Stage};
pub use change::{ChangeDetector, ChangeKind};
pub use config::{load_config, FleetConfig};
pub use engine::{Engine, EngineHandle, ViewPublisher};
pub use error::{FleetError, Result};
pub use ranker::Ranker;
pub use reviews::{GhReviewFetcher, ReviewCache, ReviewFetcher};
pub use storage::StoragePaths;
pub use tree::{RepoGroup, SessionTreeNode, TreeRow};
pub use types::*;
pub use view::ViewModel;
pub use watchdog::{KillAction, ProcessSignaller, Signal, Watchdog};
pub use worktrees::{GitWorktreeLister, WorktreeCache, WorktreeLister};
