//! End-to-end checks across the source readers, aggregator and derivations.

use chrono::{DateTime, Duration, Utc};
use fleet_core::aggregator::AggregatorSettings;
use fleet_core::config::RankerConfig;
use fleet_core::sources::{ActivityLogTailer, ProcessSource, SqliteSessionStore};
use fleet_core::{
    tree, ActionKind, Aggregator, BoardReader, BoardStore, MonitoredProcess, ProcessSignaller,
    Ranker, ReviewCache, ReviewState, ReviewStatus, Session, SessionStatus, Signal, Snapshot,
    Stage, TodoItem, TodoStatus, Watchdog, WorkerCounts,
};
use rusqlite::{params, Connection};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

const GIB: u64 = 1024 * 1024 * 1024;

fn session(id: &str, parent: Option<&str>, at: DateTime<Utc>) -> Session {
    Session {
        id: id.to_string(),
        repository: "x".to_string(),
        directory: "/work/x".to_string(),
        parent_id: parent.map(str::to_string),
        title: id.to_string(),
        agent_type: None,
        created_at: at,
        last_activity: at,
        cost: 0.5,
        stalled: false,
        todos: Vec::new(),
        review_ids: Vec::new(),
        message_count: 0,
        status: SessionStatus::default(),
        workers: WorkerCounts::default(),
    }
}

#[test]
fn fork_child_activity_lifts_parent() {
    let now = Utc::now();
    let sessions = vec![
        session("s1", None, now - Duration::days(2)),
        session("s2", Some("s1"), now),
    ];

    let groups = tree::build(&sessions);
    assert_eq!(groups.len(), 1);
    let root = &groups[0].roots[0];
    assert_eq!(root.session.id, "s1");
    assert_eq!(root.effective_recency, now);
    assert_eq!(root.children[0].session.id, "s2");
    assert_eq!(root.children[0].depth, 1);
    assert!((root.subtree_cost - 1.0).abs() < 1e-9);
}

#[test]
fn active_root_keeps_older_fork_beneath_it() {
    let now = Utc::now();
    let sessions = vec![
        session("s2", Some("s1"), now - Duration::days(2)),
        session("s1", None, now),
    ];

    let groups = tree::build(&sessions);
    assert_eq!(groups[0].roots.len(), 1);
    let root = &groups[0].roots[0];
    assert_eq!(root.session.id, "s1");
    assert_eq!(root.effective_recency, now);
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].session.id, "s2");
}

#[test]
fn parent_cycle_renders_both_as_roots() {
    let now = Utc::now();
    let sessions = vec![
        session("a", Some("b"), now),
        session("b", Some("a"), now - Duration::minutes(5)),
    ];

    let groups = tree::build(&sessions);
    let roots: Vec<&str> = groups[0]
        .roots
        .iter()
        .map(|root| root.session.id.as_str())
        .collect();
    assert_eq!(roots, vec!["a", "b"]);
    assert!(groups[0].roots.iter().all(|root| root.children.is_empty()));
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregation against a real store
// ─────────────────────────────────────────────────────────────────────────────

struct NoProcesses;

impl ProcessSource for NoProcesses {
    fn sample(&mut self, _now: DateTime<Utc>) -> Vec<MonitoredProcess> {
        Vec::new()
    }
}

fn seed_store(path: &Path, now: DateTime<Utc>) {
    let conn = Connection::open(path).expect("open store");
    conn.execute_batch(
        "CREATE TABLE project (id TEXT PRIMARY KEY, worktree TEXT);
         CREATE TABLE session (
             id TEXT PRIMARY KEY, project_id TEXT, parent_id TEXT, title TEXT,
             directory TEXT, version TEXT, time_created INTEGER, time_updated INTEGER,
             time_archived INTEGER
         );
         CREATE TABLE todo (session_id TEXT, content TEXT, status TEXT, priority TEXT);
         CREATE TABLE message (id TEXT PRIMARY KEY, session_id TEXT, time_created INTEGER, data TEXT);
         INSERT INTO project (id, worktree) VALUES ('prj_1', '/work/alpha');",
    )
    .expect("create schema");

    let now_ms = now.timestamp_millis();
    for (id, parent, title, at) in [
        ("ses_root", None, "Refactor tailer", now_ms - 3_600_000),
        ("ses_fork", Some("ses_root"), "Refactor tailer (fork #1)", now_ms),
    ] {
        conn.execute(
            "INSERT INTO session (id, project_id, parent_id, title, directory, time_created, time_updated) \
             VALUES (?1, 'prj_1', ?2, ?3, '/work/alpha', ?4, ?4)",
            params![id, parent, title, at],
        )
        .expect("insert session");
    }
    conn.execute(
        "INSERT INTO todo (session_id, content, status) VALUES ('ses_root', 'write tests', 'pending')",
        [],
    )
    .expect("insert todo");
    conn.execute(
        "INSERT INTO message (id, session_id, time_created, data) VALUES ('msg_1', 'ses_fork', ?1, ?2)",
        params![now_ms, r#"{"role":"assistant","cost":0.75}"#],
    )
    .expect("insert message");
}

fn aggregator(dir: &Path) -> Aggregator {
    Aggregator::new(
        Box::new(SqliteSessionStore::new(dir.join("opencode.db"), 7)),
        Box::new(NoProcesses),
        ActivityLogTailer::new(dir.join("log"), 8192, 65536),
        BoardReader::new(dir.join("kanban.json")),
        Arc::new(ReviewCache::new(60)),
        AggregatorSettings {
            failure_threshold: 3,
            stall_idle_secs: 600,
        },
    )
}

#[test]
fn aggregating_unchanged_sources_is_idempotent() {
    let temp = tempfile::tempdir().expect("temp dir");
    let now = Utc::now();
    seed_store(&temp.path().join("opencode.db"), now);

    let mut aggregator = aggregator(temp.path());
    let first = aggregator.aggregate_at(None, now);
    let second = aggregator.aggregate_at(Some(&first), now);
    let third = aggregator.aggregate_at(Some(&second), now);

    assert_eq!(first.sessions.len(), 2);
    assert!(second.version > first.version);
    assert!(second.comms.is_empty());
    assert!(second.content_eq(&third));

    let fork = second.session("ses_fork").expect("fork session");
    assert_eq!(fork.parent_id.as_deref(), Some("ses_root"));
    assert!((fork.cost - 0.75).abs() < 1e-9);
    let root = second.session("ses_root").expect("root session");
    assert!(root.stalled);
}

#[test]
fn board_links_feed_into_session_reviews() {
    let temp = tempfile::tempdir().expect("temp dir");
    let now = Utc::now();
    seed_store(&temp.path().join("opencode.db"), now);

    let store = BoardStore::new(temp.path().join("kanban.json"));
    let project = store
        .create("Tailer", "", Stage::InProgress, Vec::new())
        .expect("create project");
    store
        .link_session(&project.id, "ses_root")
        .expect("link session");
    store.link_review(&project.id, 42).expect("link review");

    let snapshot = aggregator(temp.path()).aggregate_at(None, now);
    let root = snapshot.session("ses_root").expect("root session");
    assert_eq!(root.review_ids, vec![42]);
    assert_eq!(snapshot.board.len(), 1);

    // A linked review suppresses the stalled-session nudge.
    let items = Ranker::new(RankerConfig::default()).rank(&snapshot);
    assert!(items.iter().all(|item| item.kind != ActionKind::ResumeStalled));
}

// ─────────────────────────────────────────────────────────────────────────────
// Board writers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_board_writers_never_expose_partial_files() {
    let temp = tempfile::tempdir().expect("temp dir");
    let path = temp.path().join("kanban.json");
    BoardStore::new(path.clone())
        .create("seed", "", Stage::Pending, Vec::new())
        .expect("seed board");

    let writers: Vec<_> = (0..2)
        .map(|writer| {
            let path = path.clone();
            thread::spawn(move || {
                let store = BoardStore::new(path);
                for n in 0..15 {
                    store
                        .create(&format!("writer {writer} item {n}"), "", Stage::Pending, Vec::new())
                        .expect("create project");
                }
            })
        })
        .collect();

    let store = BoardStore::new(path.clone());
    for _ in 0..200 {
        let board = store.load().expect("reader always sees a complete file");
        assert!(!board.projects.is_empty());
    }
    for writer in writers {
        writer.join().expect("writer thread");
    }

    let board = store.load().expect("final board");
    assert!(board.projects.len() >= 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Watchdog and ranking
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(u32, Signal)>>>);

impl ProcessSignaller for Recorder {
    fn signal(&self, pid: u32, _start_time: u64, signal: Signal) -> io::Result<()> {
        self.0.lock().expect("recorder lock").push((pid, signal));
        Ok(())
    }
}

#[test]
fn runaway_process_gets_term_then_kill() {
    let recorder = Recorder::default();
    let mut watchdog = Watchdog::new(8 * GIB, Duration::seconds(5), Box::new(recorder.clone()));
    let t0 = Utc::now();
    let runaway = |at| MonitoredProcess {
        pid: 900,
        start_time: 77,
        rss_bytes: 9 * GIB,
        cpu_percent: 12.0,
        session_id: None,
        first_observed: at,
    };

    watchdog.enforce(&[runaway(t0)], t0);
    let t1 = t0 + Duration::seconds(6);
    watchdog.enforce(&[runaway(t1)], t1);

    let sent = recorder.0.lock().expect("recorder lock").clone();
    assert_eq!(sent, vec![(900, Signal::Terminate), (900, Signal::Kill)]);
}

#[test]
fn failing_ci_ranks_above_stalled_session() {
    let now = Utc::now();
    let mut snapshot = Snapshot::empty(1, now);
    let mut stalled = session("s1", None, now - Duration::hours(3));
    stalled.stalled = true;
    stalled.todos = vec![TodoItem::new("finish", TodoStatus::InProgress)];
    snapshot.sessions.push(stalled);
    snapshot.reviews.push(ReviewStatus {
        number: 5,
        title: "Fix flake".to_string(),
        state: ReviewState::CiFailing,
        repository: "me/x".to_string(),
        head_ref: "flake".to_string(),
        url: String::new(),
        updated_at: Some(now - Duration::days(1)),
    });

    let items = Ranker::new(RankerConfig::default()).rank(&snapshot);
    let priorities: Vec<u32> = items.iter().map(|item| item.priority).collect();
    assert_eq!(priorities, vec![100, 70]);
}
