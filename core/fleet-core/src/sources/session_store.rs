//! Read-only reader for the agent runtime's SQLite session store.
//!
//! The runtime owns the database and writes it in WAL mode. We open a fresh
//! read-only connection per pass with a short busy timeout, so a writer
//! holding the lock costs us one failed cycle rather than a stall.

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{SessionSource, StoreRead};
use crate::error::{FleetError, Result};
use crate::patterns::{fork_base_title, parse_subagent_title};
use crate::types::{DailySpend, Session, SessionStatus, TodoItem, TodoStatus, WorkerCounts};

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);
pub const DAILY_SPEND_DAYS: u64 = 14;

pub struct SqliteSessionStore {
    path: PathBuf,
    window_days: i64,
}

impl SqliteSessionStore {
    pub fn new(path: PathBuf, window_days: i64) -> Self {
        Self {
            path,
            window_days: window_days.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.open()?;
        op(&conn)
    }

    fn open(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|err| {
            FleetError::sqlite(format!("open {}", self.path.display()), err)
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| FleetError::sqlite("set busy timeout", err))?;
        Ok(conn)
    }
}

impl SessionSource for SqliteSessionStore {
    fn read(&mut self, now: DateTime<Utc>) -> Result<StoreRead> {
        let cutoff_ms = (now - chrono::Duration::days(self.window_days)).timestamp_millis();
        self.with_connection(|conn| {
            let mut sessions = load_sessions(conn, cutoff_ms)?;
            let todos = load_todos(conn, cutoff_ms)?;
            let costs = load_costs(conn, cutoff_ms)?;
            let messages = load_message_counts(conn, cutoff_ms)?;
            for session in &mut sessions {
                if let Some(items) = todos.get(&session.id) {
                    session.todos = items.clone();
                }
                session.cost = costs.get(&session.id).copied().unwrap_or(0.0);
                session.message_count = messages.get(&session.id).copied().unwrap_or(0);
            }
            // Workers are the runtime's own children; fork links come after.
            count_workers(&mut sessions);
            attach_forks(&mut sessions);

            Ok(StoreRead {
                sessions,
                daily_spend: load_daily_spend(conn, now)?,
                project_path: discover_project_path(conn)?,
            })
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

fn load_sessions(conn: &Connection, cutoff_ms: i64) -> Result<Vec<Session>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, parent_id, directory, time_created, time_updated \
             FROM session \
             WHERE time_archived IS NULL AND time_updated >= ?1 \
             ORDER BY time_updated DESC",
        )
        .map_err(|err| FleetError::sqlite("prepare session query", err))?;

    let rows = stmt
        .query_map(params![cutoff_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })
        .map_err(|err| FleetError::sqlite("read session rows", err))?;

    let mut sessions = Vec::new();
    for row in rows {
        let (id, title, parent_id, directory, created, updated) =
            row.map_err(|err| FleetError::sqlite("decode session row", err))?;
        let directory = directory.unwrap_or_default();
        let updated = millis_to_utc(updated);
        let created = created.map(|ms| millis_to_utc(Some(ms))).unwrap_or(updated);
        let raw_title = title.unwrap_or_default();
        let (title, agent_type) = match parse_subagent_title(&raw_title) {
            Some((agent_type, description)) => (description, Some(agent_type)),
            None => (raw_title, None),
        };

        sessions.push(Session {
            repository: repository_name(&directory),
            directory,
            parent_id: parent_id.filter(|parent| !parent.is_empty()),
            title,
            agent_type,
            created_at: created,
            last_activity: updated,
            cost: 0.0,
            stalled: false,
            todos: Vec::new(),
            review_ids: Vec::new(),
            message_count: 0,
            status: SessionStatus::default(),
            workers: WorkerCounts::default(),
            id,
        });
    }
    Ok(sessions)
}

fn load_todos(conn: &Connection, cutoff_ms: i64) -> Result<HashMap<String, Vec<TodoItem>>> {
    let mut stmt = conn
        .prepare(
            "SELECT t.session_id, t.content, t.status \
             FROM todo t JOIN session s ON s.id = t.session_id \
             WHERE s.time_archived IS NULL AND s.time_updated >= ?1",
        )
        .map_err(|err| FleetError::sqlite("prepare todo query", err))?;

    let rows = stmt
        .query_map(params![cutoff_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })
        .map_err(|err| FleetError::sqlite("read todo rows", err))?;

    let mut todos: HashMap<String, Vec<TodoItem>> = HashMap::new();
    for row in rows {
        let (session_id, content, status) =
            row.map_err(|err| FleetError::sqlite("decode todo row", err))?;
        let status = TodoStatus::parse(status.as_deref().unwrap_or("pending"));
        todos
            .entry(session_id)
            .or_default()
            .push(TodoItem::new(content.unwrap_or_default(), status));
    }
    Ok(todos)
}

fn load_costs(conn: &Connection, cutoff_ms: i64) -> Result<HashMap<String, f64>> {
    let mut stmt = conn
        .prepare(
            "SELECT m.session_id, SUM(json_extract(m.data, '$.cost')) \
             FROM message m JOIN session s ON s.id = m.session_id \
             WHERE json_extract(m.data, '$.role') = 'assistant' \
               AND json_extract(m.data, '$.cost') > 0 \
               AND s.time_updated >= ?1 \
             GROUP BY m.session_id",
        )
        .map_err(|err| FleetError::sqlite("prepare cost query", err))?;

    let rows = stmt
        .query_map(params![cutoff_ms], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
        })
        .map_err(|err| FleetError::sqlite("read cost rows", err))?;

    let mut costs = HashMap::new();
    for row in rows {
        let (session_id, cost) = row.map_err(|err| FleetError::sqlite("decode cost row", err))?;
        costs.insert(session_id, cost.unwrap_or(0.0));
    }
    Ok(costs)
}

fn load_message_counts(conn: &Connection, cutoff_ms: i64) -> Result<HashMap<String, u64>> {
    let mut stmt = conn
        .prepare(
            "SELECT m.session_id, COUNT(*) \
             FROM message m JOIN session s ON s.id = m.session_id \
             WHERE s.time_archived IS NULL AND s.time_updated >= ?1 \
             GROUP BY m.session_id",
        )
        .map_err(|err| FleetError::sqlite("prepare message count query", err))?;

    let rows = stmt
        .query_map(params![cutoff_ms], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|err| FleetError::sqlite("read message count rows", err))?;

    let mut counts = HashMap::new();
    for row in rows {
        let (session_id, count) =
            row.map_err(|err| FleetError::sqlite("decode message count row", err))?;
        counts.insert(session_id, u64::try_from(count).unwrap_or(0));
    }
    Ok(counts)
}

/// Assistant spend per local calendar day, oldest first, zero-filled.
fn load_daily_spend(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<DailySpend>> {
    let today = now.with_timezone(&Local).date_naive();
    let first_day = today
        .checked_sub_days(Days::new(DAILY_SPEND_DAYS - 1))
        .unwrap_or(today);
    let mut buckets: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    let mut day = first_day;
    while day <= today {
        buckets.insert(day, 0.0);
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    let since_ms = first_day
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.timestamp_millis())
        .unwrap_or(0);

    let mut stmt = conn
        .prepare(
            "SELECT m.time_created, json_extract(m.data, '$.cost') \
             FROM message m \
             WHERE json_extract(m.data, '$.role') = 'assistant' \
               AND json_extract(m.data, '$.cost') > 0 \
               AND m.time_created >= ?1",
        )
        .map_err(|err| FleetError::sqlite("prepare daily spend query", err))?;

    let rows = stmt
        .query_map(params![since_ms], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?))
        })
        .map_err(|err| FleetError::sqlite("read daily spend rows", err))?;

    for row in rows {
        let (created_ms, cost) =
            row.map_err(|err| FleetError::sqlite("decode daily spend row", err))?;
        let day = millis_to_utc(Some(created_ms))
            .with_timezone(&Local)
            .date_naive();
        if let Some(total) = buckets.get_mut(&day) {
            *total += cost.unwrap_or(0.0);
        }
    }

    Ok(buckets
        .into_iter()
        .map(|(day, cost)| DailySpend { day, cost })
        .collect())
}

/// Worktree of the project behind the most recently updated root session.
fn discover_project_path(conn: &Connection) -> Result<Option<PathBuf>> {
    let worktree: Option<Option<String>> = conn
        .query_row(
            "SELECT worktree FROM project WHERE id = ( \
               SELECT project_id FROM session \
               WHERE time_archived IS NULL AND parent_id IS NULL \
               ORDER BY time_updated DESC LIMIT 1)",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| FleetError::sqlite("query project worktree", err))?;

    Ok(worktree
        .flatten()
        .filter(|path| !path.is_empty() && path != "/")
        .map(PathBuf::from))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn millis_to_utc(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn repository_name(directory: &str) -> String {
    Path::new(directory.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Tallies each session's direct children and their messages.
fn count_workers(sessions: &mut [Session]) {
    let mut counts: HashMap<String, WorkerCounts> = HashMap::new();
    for session in sessions.iter() {
        if let Some(parent) = &session.parent_id {
            let entry = counts.entry(parent.clone()).or_default();
            entry.total += 1;
            entry.messages += session.message_count;
        }
    }
    for session in sessions.iter_mut() {
        session.workers = counts.remove(&session.id).unwrap_or_default();
    }
}

/// Root sessions titled `<base> (fork #N)` hang under the session titled
/// `<base>` in the same repository, when one is loaded.
fn attach_forks(sessions: &mut [Session]) {
    let mut by_title: HashMap<(String, String), (String, DateTime<Utc>)> = HashMap::new();
    for session in sessions.iter() {
        let key = (session.repository.clone(), session.title.clone());
        let candidate = (session.id.clone(), session.created_at);
        by_title
            .entry(key)
            .and_modify(|existing| {
                if candidate.1 < existing.1 {
                    *existing = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    for session in sessions.iter_mut() {
        if session.parent_id.is_some() {
            continue;
        }
        let Some(base) = fork_base_title(&session.title) else {
            continue;
        };
        let key = (session.repository.clone(), base.to_string());
        if let Some((parent_id, _)) = by_title.get(&key) {
            if parent_id != &session.id {
                session.parent_id = Some(parent_id.clone());
            }
        }
    }
}
