//! Data model shared by every engine component.
//!
//! Sessions, reviews and processes are plain owned values. A [`Snapshot`]
//! bundles one consistent reading of all sources and is never mutated after
//! the aggregator hands it out.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::board::BoardProject;

// ═══════════════════════════════════════════════════════════════════════════════
// Sessions
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    /// Unknown values are treated as still pending.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_progress" | "in-progress" => TodoStatus::InProgress,
            "completed" | "done" => TodoStatus::Completed,
            "cancelled" | "canceled" => TodoStatus::Cancelled,
            _ => TodoStatus::Pending,
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, TodoStatus::Completed | TodoStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub status: TodoStatus,
    pub done: bool,
}

impl TodoItem {
    pub fn new(text: impl Into<String>, status: TodoStatus) -> Self {
        Self {
            text: text.into(),
            status,
            done: status.is_done(),
        }
    }
}

/// One recorded unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub repository: String,
    pub directory: String,
    /// Weak back-reference; the parent may be outside the loaded window.
    pub parent_id: Option<String>,
    pub title: String,
    /// Set for subagent sessions (`explore`, `general`, ...).
    pub agent_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub cost: f64,
    pub stalled: bool,
    pub todos: Vec<TodoItem>,
    pub review_ids: Vec<u64>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub status: SessionStatus,
    /// Direct subagent children recorded by the runtime.
    #[serde(default)]
    pub workers: WorkerCounts,
}

impl Session {
    pub fn pending_todos(&self) -> usize {
        self.todos.iter().filter(|todo| !todo.done).count()
    }

    pub fn has_open_todos(&self) -> bool {
        self.todos.iter().any(|todo| !todo.done)
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity).num_seconds().max(0)
    }
}

/// Below this CPU share a live session is waiting on input.
pub const RUNNING_CPU_PERCENT: f32 = 5.0;
/// Finished sessions stay `done` this long before turning `old`.
pub const RECENTLY_DONE_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Waiting,
    Stalled,
    Done,
    #[default]
    Old,
}

impl SessionStatus {
    /// `cpu` is the highest CPU share among the session's live processes,
    /// `None` when it has none.
    pub fn classify(session: &Session, cpu: Option<f32>, now: DateTime<Utc>) -> Self {
        match cpu {
            Some(cpu) if cpu < RUNNING_CPU_PERCENT => SessionStatus::Waiting,
            Some(_) => SessionStatus::Running,
            None if session.has_open_todos() => SessionStatus::Stalled,
            None if now - session.last_activity <= chrono::Duration::days(RECENTLY_DONE_DAYS) => {
                SessionStatus::Done
            }
            None => SessionStatus::Old,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Stalled => "stalled",
            SessionStatus::Done => "done",
            SessionStatus::Old => "old",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub total: usize,
    /// Messages recorded across those workers.
    pub messages: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Worktrees
// ═══════════════════════════════════════════════════════════════════════════════

pub const DETACHED_BRANCH: &str = "(detached)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeStatus {
    pub path: PathBuf,
    pub branch: String,
    /// Uncommitted changes, per `git status --porcelain`.
    pub dirty: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reviews
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewState {
    Pending,
    Approved,
    ChangesRequested,
    CiFailing,
    CiPassing,
    Merged,
}

impl ReviewState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewState::Pending => "pending",
            ReviewState::Approved => "approved",
            ReviewState::ChangesRequested => "changes-requested",
            ReviewState::CiFailing => "ci-failing",
            ReviewState::CiPassing => "ci-passing",
            ReviewState::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatus {
    pub number: u64,
    pub title: String,
    pub state: ReviewState,
    pub repository: String,
    #[serde(default)]
    pub head_ref: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Processes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredProcess {
    pub pid: u32,
    /// Seconds since epoch; together with `pid` identifies one process
    /// incarnation.
    pub start_time: u64,
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    /// Best effort, parsed from the command line.
    pub session_id: Option<String>,
    pub first_observed: DateTime<Utc>,
}

impl MonitoredProcess {
    pub fn fingerprint(&self) -> (u32, u64) {
        (self.pid, self.start_time)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Next Ops
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    FixFailingCi,
    ResumeStalled,
    RequestReview,
    WatchCost,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ActionTarget {
    Session(String),
    Review(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub kind: ActionKind,
    pub target: ActionTarget,
    pub priority: u32,
    pub reason: String,
    /// Tie-breaker: the most recent activity attached to the target.
    pub recency: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMMS Feed
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommsKind {
    #[serde(rename = "session.new")]
    SessionNew,
    #[serde(rename = "session.stalled")]
    SessionStalled,
    #[serde(rename = "vcs.branch")]
    VcsBranch,
    #[serde(rename = "session.error")]
    SessionError,
    #[serde(rename = "session.diff")]
    SessionDiff,
    #[serde(rename = "session.compacted")]
    SessionCompacted,
    #[serde(rename = "command.executed")]
    CommandExecuted,
    #[serde(rename = "ci.failed")]
    CiFailed,
    #[serde(rename = "watchdog.term")]
    WatchdogTerm,
    #[serde(rename = "watchdog.kill")]
    WatchdogKill,
    #[serde(rename = "source.degraded")]
    SourceDegraded,
}

impl CommsKind {
    /// Maps a bus event type from the activity log to a feed kind.
    pub fn from_bus_type(event_type: &str) -> Option<Self> {
        match event_type {
            "session.error" => Some(CommsKind::SessionError),
            "session.diff" => Some(CommsKind::SessionDiff),
            "session.compacted" => Some(CommsKind::SessionCompacted),
            "command.executed" => Some(CommsKind::CommandExecuted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommsEvent {
    pub at: DateTime<Utc>,
    pub kind: CommsKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl CommsEvent {
    pub fn new(at: DateTime<Utc>, kind: CommsKind, detail: impl Into<String>) -> Self {
        Self {
            at,
            kind,
            detail: detail.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySpend {
    pub day: NaiveDate,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SessionStore,
    ActivityLog,
    ProcessTable,
    Board,
    Reviews,
    Worktrees,
}

/// A soft error recorded against one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceError {
    pub source: SourceKind,
    pub message: String,
    pub consecutive_failures: u32,
}

/// One consistent, immutable reading of every source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub sessions: Vec<Session>,
    pub reviews: Vec<ReviewStatus>,
    pub worktrees: Vec<WorktreeStatus>,
    pub processes: Vec<MonitoredProcess>,
    /// Events observed since the previous snapshot.
    pub comms: Vec<CommsEvent>,
    pub daily_spend: Vec<DailySpend>,
    pub project_path: Option<PathBuf>,
    pub board: Vec<BoardProject>,
    pub current_branch: Option<String>,
    pub last_session_error: Option<DateTime<Utc>>,
    pub errors: Vec<SourceError>,
    /// Set once any source has failed `failure_threshold` times in a row.
    pub degraded: bool,
}

impl Snapshot {
    pub fn empty(version: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            version,
            created_at,
            sessions: Vec::new(),
            reviews: Vec::new(),
            worktrees: Vec::new(),
            processes: Vec::new(),
            comms: Vec::new(),
            daily_spend: Vec::new(),
            project_path: None,
            board: Vec::new(),
            current_branch: None,
            last_session_error: None,
            errors: Vec::new(),
            degraded: false,
        }
    }

    /// Equality ignoring the version counter and creation time.
    pub fn content_eq(&self, other: &Snapshot) -> bool {
        self.sessions == other.sessions
            && self.reviews == other.reviews
            && self.worktrees == other.worktrees
            && self.processes == other.processes
            && self.comms == other.comms
            && self.daily_spend == other.daily_spend
            && self.project_path == other.project_path
            && self.board == other.board
            && self.current_branch == other.current_branch
            && self.last_session_error == other.last_session_error
            && self.errors == other.errors
            && self.degraded == other.degraded
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    pub fn review(&self, number: u64) -> Option<&ReviewStatus> {
        self.reviews.iter().find(|review| review.number == number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_status_parse_is_lenient() {
        assert_eq!(TodoStatus::parse("completed"), TodoStatus::Completed);
        assert_eq!(TodoStatus::parse("CANCELLED"), TodoStatus::Cancelled);
        assert_eq!(TodoStatus::parse("in_progress"), TodoStatus::InProgress);
        assert_eq!(TodoStatus::parse("whatever"), TodoStatus::Pending);
        assert!(TodoItem::new("x", TodoStatus::Cancelled).done);
    }

    #[test]
    fn content_eq_ignores_version_and_timestamp() {
        let a = Snapshot::empty(1, Utc::now());
        let mut b = Snapshot::empty(2, Utc::now() + chrono::Duration::seconds(5));
        assert!(a.content_eq(&b));
        b.degraded = true;
        assert!(!a.content_eq(&b));
    }

    fn bare_session(last_activity: DateTime<Utc>) -> Session {
        Session {
            id: "s1".to_string(),
            repository: "x".to_string(),
            directory: "/work/x".to_string(),
            parent_id: None,
            title: "s1".to_string(),
            agent_type: None,
            created_at: last_activity,
            last_activity,
            cost: 0.0,
            stalled: false,
            todos: Vec::new(),
            review_ids: Vec::new(),
            message_count: 0,
            status: SessionStatus::default(),
            workers: WorkerCounts::default(),
        }
    }

    #[test]
    fn status_prefers_live_processes_then_todos_then_age() {
        let now = Utc::now();
        let mut session = bare_session(now - chrono::Duration::days(10));
        session.todos.push(TodoItem::new("ship", TodoStatus::InProgress));

        assert_eq!(SessionStatus::classify(&session, Some(40.0), now), SessionStatus::Running);
        assert_eq!(SessionStatus::classify(&session, Some(4.9), now), SessionStatus::Waiting);
        assert_eq!(SessionStatus::classify(&session, None, now), SessionStatus::Stalled);

        session.todos[0] = TodoItem::new("ship", TodoStatus::Completed);
        assert_eq!(SessionStatus::classify(&session, None, now), SessionStatus::Old);
        session.last_activity = now - chrono::Duration::days(2);
        assert_eq!(SessionStatus::classify(&session, None, now), SessionStatus::Done);
    }

    #[test]
    fn kinds_serialize_to_wire_names() {
        let json = serde_json::to_string(&CommsKind::SessionNew).expect("serialize");
        assert_eq!(json, "\"session.new\"");
        let json = serde_json::to_string(&ReviewState::CiFailing).expect("serialize");
        assert_eq!(json, "\"ci-failing\"");
        let json = serde_json::to_string(&ActionKind::ResumeStalled).expect("serialize");
        assert_eq!(json, "\"resume-stalled\"");
        let json = serde_json::to_string(&SessionStatus::Waiting).expect("serialize");
        assert_eq!(json, "\"waiting\"");
    }
}
