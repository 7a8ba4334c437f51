//! The view-model handed to the renderer.
//!
//! Fully populated and read-only: the renderer never reaches back into the
//! engine. One is built per published version.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::board::{BoardProject, Stage};
use crate::change::ChangeKind;
use crate::tree::{self, RepoGroup, TreeRow};
use crate::types::{
    ActionItem, CommsEvent, DailySpend, MonitoredProcess, ReviewStatus, Snapshot, SourceError,
    WorktreeStatus,
};
use crate::watchdog::KillAction;

#[derive(Debug, Clone, Serialize)]
pub struct BoardColumn {
    pub stage: Stage,
    pub label: &'static str,
    pub projects: Vec<BoardProject>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewModel {
    /// Published version; strictly increasing.
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub snapshot_version: u64,
    pub trigger: Option<ChangeKind>,
    pub groups: Vec<RepoGroup>,
    pub rows: Vec<TreeRow>,
    /// Bounded feed, newest last.
    pub comms: Vec<CommsEvent>,
    pub actions: Vec<ActionItem>,
    pub watchdog_actions: Vec<KillAction>,
    pub reviews: Vec<ReviewStatus>,
    pub worktrees: Vec<WorktreeStatus>,
    pub processes: Vec<MonitoredProcess>,
    pub board: Vec<BoardColumn>,
    pub daily_spend: Vec<DailySpend>,
    pub total_cost: f64,
    pub current_branch: Option<String>,
    /// Time of the most recent `session.error` in the activity log.
    pub alert: Option<DateTime<Utc>>,
    pub degraded: bool,
    pub errors: Vec<SourceError>,
}

/// Inputs that live outside the snapshot.
pub struct ViewParts<'a> {
    pub version: u64,
    pub trigger: Option<ChangeKind>,
    pub comms: Vec<CommsEvent>,
    pub actions: Vec<ActionItem>,
    pub watchdog_actions: &'a [KillAction],
}

impl ViewModel {
    /// Placeholder published before the first aggregation completes.
    pub fn empty() -> Self {
        Self {
            version: 0,
            generated_at: Utc::now(),
            snapshot_version: 0,
            trigger: None,
            groups: Vec::new(),
            rows: Vec::new(),
            comms: Vec::new(),
            actions: Vec::new(),
            watchdog_actions: Vec::new(),
            reviews: Vec::new(),
            worktrees: Vec::new(),
            processes: Vec::new(),
            board: Vec::new(),
            daily_spend: Vec::new(),
            total_cost: 0.0,
            current_branch: None,
            alert: None,
            degraded: false,
            errors: Vec::new(),
        }
    }

    pub fn build(snapshot: &Snapshot, parts: ViewParts<'_>) -> Self {
        let groups = tree::build(&snapshot.sessions);
        let rows = tree::flatten(&groups);
        let board = crate::board::Board {
            version: crate::board::BOARD_FILE_VERSION,
            projects: snapshot.board.clone(),
        }
        .columns()
        .into_iter()
        .map(|(stage, projects)| BoardColumn {
            stage,
            label: stage.label(),
            projects,
        })
        .collect();

        Self {
            version: parts.version,
            generated_at: snapshot.created_at,
            snapshot_version: snapshot.version,
            trigger: parts.trigger,
            groups,
            rows,
            comms: parts.comms,
            actions: parts.actions,
            watchdog_actions: parts.watchdog_actions.to_vec(),
            reviews: snapshot.reviews.clone(),
            worktrees: snapshot.worktrees.clone(),
            processes: snapshot.processes.clone(),
            board,
            daily_spend: snapshot.daily_spend.clone(),
            total_cost: snapshot.sessions.iter().map(|session| session.cost).sum(),
            current_branch: snapshot.current_branch.clone(),
            alert: snapshot.last_session_error,
            degraded: snapshot.degraded,
            errors: snapshot.errors.clone(),
        }
    }
}
