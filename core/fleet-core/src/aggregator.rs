//! Merges every source into one immutable [`Snapshot`].
//!
//! The session store is re-read wholesale each pass; the activity log is
//! tailed from its held offset; the process table is sampled fresh; the board
//! and the review and worktree caches are read from their last good state.
//!
//! A failed store read hands back the previous snapshot untouched, so the
//! log offset does not move and nothing is lost. The process table is still
//! sampled on such a pass and kept in [`Aggregator::last_sample`]. After `failure_threshold`
//! consecutive failures a new snapshot is produced anyway, carrying the last
//! known sessions and a degraded flag.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::board::BoardReader;
use crate::cache::{CacheView, FetchCache};
use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::reviews::ReviewCache;
use crate::sources::{
    ActivityLogTailer, ProcessSource, SessionSource, SqliteSessionStore, StoreRead,
    SysinfoProcessSampler,
};
use crate::storage::StoragePaths;
use crate::types::{
    CommsEvent, CommsKind, MonitoredProcess, ReviewState, Session, SessionStatus, Snapshot,
    SourceError, SourceKind,
};
use crate::worktrees::WorktreeCache;

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub failure_threshold: u32,
    pub stall_idle_secs: i64,
}

impl AggregatorSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            failure_threshold: config.engine.failure_threshold.max(1),
            stall_idle_secs: config.ranker.stall_idle_secs,
        }
    }
}

/// Consecutive-failure bookkeeping per source.
#[derive(Debug, Default)]
struct FailureLog {
    entries: BTreeMap<SourceKind, SourceError>,
}

impl FailureLog {
    fn record(&mut self, source: SourceKind, message: String) -> u32 {
        let entry = self.entries.entry(source).or_insert_with(|| SourceError {
            source,
            message: String::new(),
            consecutive_failures: 0,
        });
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.message = message;
        entry.consecutive_failures
    }

    fn set(&mut self, source: SourceKind, count: u32, message: String) {
        if count == 0 {
            self.entries.remove(&source);
            return;
        }
        self.entries.insert(
            source,
            SourceError {
                source,
                message,
                consecutive_failures: count,
            },
        );
    }

    fn clear(&mut self, source: SourceKind) {
        self.entries.remove(&source);
    }

    fn errors(&self) -> Vec<SourceError> {
        self.entries.values().cloned().collect()
    }

    fn degraded(&self, threshold: u32) -> bool {
        self.entries
            .values()
            .any(|entry| entry.consecutive_failures >= threshold)
    }
}

pub struct Aggregator {
    store: Box<dyn SessionSource>,
    processes: Box<dyn ProcessSource>,
    tailer: ActivityLogTailer,
    board: BoardReader,
    reviews: Arc<ReviewCache>,
    worktrees: Option<Arc<WorktreeCache>>,
    settings: AggregatorSettings,
    failures: FailureLog,
    version: u64,
    last_sample: Vec<MonitoredProcess>,
}

impl Aggregator {
    pub fn new(
        store: Box<dyn SessionSource>,
        processes: Box<dyn ProcessSource>,
        tailer: ActivityLogTailer,
        board: BoardReader,
        reviews: Arc<ReviewCache>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            store,
            processes,
            tailer,
            board,
            reviews,
            worktrees: None,
            settings,
            failures: FailureLog::default(),
            version: 0,
            last_sample: Vec::new(),
        }
    }

    /// Production wiring: SQLite store, sysinfo sampler, real log directory.
    pub fn from_paths(paths: &StoragePaths, config: &FleetConfig, reviews: Arc<ReviewCache>) -> Self {
        Self::new(
            Box::new(SqliteSessionStore::new(
                paths.db_file(),
                config.engine.activity_window_days,
            )),
            Box::new(SysinfoProcessSampler::new(config.monitor.executables.clone())),
            ActivityLogTailer::new(
                paths.log_dir(),
                config.engine.log_backfill_bytes,
                config.engine.log_read_budget_bytes,
            ),
            BoardReader::new(paths.board_file()),
            reviews,
            AggregatorSettings::from_config(config),
        )
    }

    /// Adds worktree status, read from `cache` each pass.
    pub fn with_worktrees(mut self, cache: Arc<WorktreeCache>) -> Self {
        self.worktrees = Some(cache);
        self
    }

    pub fn reviews(&self) -> &Arc<ReviewCache> {
        &self.reviews
    }

    pub fn worktrees(&self) -> Option<&Arc<WorktreeCache>> {
        self.worktrees.as_ref()
    }

    /// Process table from the most recent pass, including passes that
    /// returned the previous snapshot.
    pub fn last_sample(&self) -> &[MonitoredProcess] {
        &self.last_sample
    }

    pub fn aggregate(&mut self, previous: Option<&Arc<Snapshot>>) -> Arc<Snapshot> {
        self.aggregate_at(previous, Utc::now())
    }

    pub fn aggregate_at(
        &mut self,
        previous: Option<&Arc<Snapshot>>,
        now: DateTime<Utc>,
    ) -> Arc<Snapshot> {
        let threshold = self.settings.failure_threshold;
        self.last_sample = self.processes.sample(now);

        let store_read = match self.store.read(now) {
            Ok(read) => {
                self.failures.clear(SourceKind::SessionStore);
                read
            }
            Err(err) => {
                let count = self.record_failure(SourceKind::SessionStore, &err);
                match previous {
                    Some(previous) if count < threshold => return Arc::clone(previous),
                    Some(previous) => StoreRead {
                        sessions: previous.sessions.clone(),
                        daily_spend: previous.daily_spend.clone(),
                        project_path: previous.project_path.clone(),
                    },
                    None => StoreRead::default(),
                }
            }
        };

        let processes = self.last_sample.clone();

        let log_events = match self.tailer.poll() {
            Ok(events) => {
                self.failures.clear(SourceKind::ActivityLog);
                events
            }
            Err(err) => {
                self.record_failure(SourceKind::ActivityLog, &err);
                Vec::new()
            }
        };

        if let Err(err) = self.board.refresh() {
            self.record_failure(SourceKind::Board, &err);
        } else {
            self.failures.clear(SourceKind::Board);
        }
        let board = self.board.board().projects.clone();

        let reviews = Arc::clone(&self.reviews);
        let review_view = self.read_cache(SourceKind::Reviews, &reviews, &store_read);
        let worktrees = match self.worktrees.clone() {
            Some(cache) => self.read_cache(SourceKind::Worktrees, &cache, &store_read).items,
            None => Vec::new(),
        };

        let mut sessions = store_read.sessions;
        link_reviews(&mut sessions, &board);
        let live_cpu = busiest_cpu_by_session(&processes);
        for session in &mut sessions {
            let cpu = live_cpu.get(session.id.as_str()).copied();
            session.stalled = session.has_open_todos()
                && cpu.is_none()
                && session.idle_secs(now) >= self.settings.stall_idle_secs;
            session.status = SessionStatus::classify(session, cpu, now);
        }

        let degraded = self.failures.degraded(threshold);
        let mut comms: Vec<CommsEvent> = log_events.iter().map(|event| event.to_comms()).collect();
        if let Some(previous) = previous {
            comms.extend(derive_comms(previous, &sessions, &review_view.items, now));
            if degraded && !previous.degraded {
                let detail = self
                    .failures
                    .errors()
                    .iter()
                    .filter(|error| error.consecutive_failures >= threshold)
                    .map(|error| format!("{:?}: {}", error.source, error.message))
                    .collect::<Vec<_>>()
                    .join("; ");
                comms.push(CommsEvent::new(now, CommsKind::SourceDegraded, detail));
            }
        }

        self.version += 1;
        let version = match previous {
            Some(previous) => self.version.max(previous.version + 1),
            None => self.version,
        };
        self.version = version;

        Arc::new(Snapshot {
            version,
            created_at: now,
            sessions,
            reviews: review_view.items,
            worktrees,
            processes,
            comms,
            daily_spend: store_read.daily_spend,
            project_path: store_read.project_path,
            board,
            current_branch: self.tailer.current_branch().map(str::to_string),
            last_session_error: self.tailer.last_session_error(),
            errors: self.failures.errors(),
            degraded,
        })
    }

    /// Points `cache` at the current project and records its failure count.
    fn read_cache<T: Clone>(
        &mut self,
        source: SourceKind,
        cache: &FetchCache<T>,
        store_read: &StoreRead,
    ) -> CacheView<T> {
        cache.set_project_path(store_read.project_path.clone());
        let view = cache.view();
        self.failures.set(
            source,
            view.consecutive_failures,
            view.last_error.clone().unwrap_or_default(),
        );
        view
    }

    fn record_failure(&mut self, source: SourceKind, err: &FleetError) -> u32 {
        let count = self.failures.record(source, err.to_string());
        tracing::warn!(
            source = ?source,
            consecutive_failures = count,
            error = %err,
            "Source read failed"
        );
        count
    }
}

/// Highest CPU share per session among its live processes.
fn busiest_cpu_by_session(processes: &[MonitoredProcess]) -> HashMap<&str, f32> {
    let mut busiest: HashMap<&str, f32> = HashMap::new();
    for process in processes {
        if let Some(session_id) = process.session_id.as_deref() {
            let cpu = busiest.entry(session_id).or_insert(process.cpu_percent);
            *cpu = cpu.max(process.cpu_percent);
        }
    }
    busiest
}

/// A session's reviews are the PR numbers of every board project linking it.
fn link_reviews(sessions: &mut [Session], board: &[crate::board::BoardProject]) {
    for session in sessions.iter_mut() {
        let linked: BTreeSet<u64> = board
            .iter()
            .filter(|project| project.links_session(&session.id))
            .flat_map(|project| project.pr_numbers.iter().copied())
            .collect();
        session.review_ids = linked.into_iter().collect();
    }
}

fn derive_comms(
    previous: &Snapshot,
    sessions: &[Session],
    reviews: &[crate::types::ReviewStatus],
    now: DateTime<Utc>,
) -> Vec<CommsEvent> {
    let mut events = Vec::new();
    for session in sessions {
        match previous.session(&session.id) {
            None => events.push(
                CommsEvent::new(now, CommsKind::SessionNew, session.title.clone())
                    .with_field("session", session.id.clone())
                    .with_field("repository", session.repository.clone()),
            ),
            Some(before) if session.stalled && !before.stalled => events.push(
                CommsEvent::new(now, CommsKind::SessionStalled, session.title.clone())
                    .with_field("session", session.id.clone())
                    .with_field("pending", session.pending_todos().to_string()),
            ),
            Some(_) => {}
        }
    }

    let failing_before = count_failing(&previous.reviews);
    let failing_now = count_failing(reviews);
    if failing_now > failing_before {
        let numbers = reviews
            .iter()
            .filter(|review| review.state == ReviewState::CiFailing)
            .map(|review| format!("#{}", review.number))
            .collect::<Vec<_>>()
            .join(", ");
        events.push(
            CommsEvent::new(now, CommsKind::CiFailed, numbers)
                .with_field("count", failing_now.to_string()),
        );
    }
    events
}

fn count_failing(reviews: &[crate::types::ReviewStatus]) -> usize {
    reviews
        .iter()
        .filter(|review| review.state == ReviewState::CiFailing)
        .count()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::Result;
    use crate::types::{SessionStatus, TodoItem, TodoStatus, WorkerCounts};
    use std::sync::Mutex;

    /// Scripted store: pops queued results, repeating the last success.
    pub struct ScriptedStore {
        pub script: Arc<Mutex<Vec<Result<StoreRead>>>>,
        pub last: Option<StoreRead>,
    }

    impl SessionSource for ScriptedStore {
        fn read(&mut self, _now: DateTime<Utc>) -> Result<StoreRead> {
            let next = {
                let mut script = self.script.lock().expect("script lock");
                if script.is_empty() {
                    None
                } else {
                    Some(script.remove(0))
                }
            };
            match next {
                Some(Ok(read)) => {
                    self.last = Some(read.clone());
                    Ok(read)
                }
                Some(Err(err)) => Err(err),
                None => Ok(self.last.clone().unwrap_or_default()),
            }
        }
    }

    pub struct FixedProcesses(pub Vec<MonitoredProcess>);

    impl ProcessSource for FixedProcesses {
        fn sample(&mut self, _now: DateTime<Utc>) -> Vec<MonitoredProcess> {
            self.0.clone()
        }
    }

    pub fn session(id: &str, repo: &str, last_activity: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            repository: repo.to_string(),
            directory: format!("/work/{repo}"),
            parent_id: None,
            title: format!("title {id}"),
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

    pub fn with_open_todo(mut session: Session) -> Session {
        session
            .todos
            .push(TodoItem::new("finish it", TodoStatus::Pending));
        session
    }

    pub fn locked() -> FleetError {
        FleetError::sqlite(
            "read session rows",
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_string()),
            ),
        )
    }
}
