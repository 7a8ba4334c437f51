//! Stat-only change detection for the session store and activity logs.
//!
//! The detector never opens the watched files. It compares size and mtime of
//! the database, its write-ahead log and the newest activity log against the
//! previous poll. A change seen on poll N is reported on poll N+1, so the
//! writer gets one poll interval to finish committing before we read.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::sources::activity_log::find_latest_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    DbChanged,
    LogAppended,
    TimerElapsed,
    Manual,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::DbChanged => "db_changed",
            ChangeKind::LogAppended => "log_appended",
            ChangeKind::TimerElapsed => "timer_elapsed",
            ChangeKind::Manual => "manual",
        }
    }

    /// When two changes coalesce, the one implying more work wins.
    fn merge(self, other: ChangeKind) -> ChangeKind {
        use ChangeKind::*;
        match (self, other) {
            (Manual, _) | (_, Manual) => Manual,
            (DbChanged, _) | (_, DbChanged) => DbChanged,
            (LogAppended, _) | (_, LogAppended) => LogAppended,
            _ => TimerElapsed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs_err::metadata(path).ok()?;
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

type DbStamp = (Option<FileStamp>, Option<FileStamp>);
type LogStamp = (Option<PathBuf>, Option<FileStamp>);

pub struct ChangeDetector {
    db_file: PathBuf,
    wal_file: PathBuf,
    log_dir: PathBuf,
    refresh_interval: Duration,
    db_baseline: Option<DbStamp>,
    log_baseline: Option<LogStamp>,
    pending: Option<ChangeKind>,
    last_refresh: Option<Instant>,
}

impl ChangeDetector {
    pub fn new(
        db_file: PathBuf,
        wal_file: PathBuf,
        log_dir: PathBuf,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            db_file,
            wal_file,
            log_dir,
            refresh_interval,
            db_baseline: None,
            log_baseline: None,
            pending: None,
            last_refresh: None,
        }
    }

    pub fn poll(&mut self) -> Option<ChangeKind> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Option<ChangeKind> {
        let detected = self.stat_changes();

        if let Some(settled) = self.pending.take() {
            self.pending = detected;
            return Some(settled);
        }
        self.pending = detected;
        if self.pending.is_some() {
            // A fresh change settles first; the timer waits for the next poll.
            return None;
        }

        let due = match self.last_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh_interval,
        };
        if due {
            self.last_refresh = Some(now);
            return Some(ChangeKind::TimerElapsed);
        }
        None
    }

    /// Restarts the timer after a refresh triggered by anything else.
    pub fn note_refreshed(&mut self, now: Instant) {
        self.last_refresh = Some(now);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn stat_changes(&mut self) -> Option<ChangeKind> {
        let db_now = (FileStamp::of(&self.db_file), FileStamp::of(&self.wal_file));
        let db_changed = self
            .db_baseline
            .replace(db_now)
            .is_some_and(|previous| previous != db_now);

        let latest = find_latest_log(&self.log_dir);
        let log_stamp = latest.as_deref().and_then(FileStamp::of);
        let log_now = (latest, log_stamp);
        let log_changed = match self.log_baseline.replace(log_now.clone()) {
            Some(previous) => previous != log_now,
            None => false,
        };

        match (db_changed, log_changed) {
            (true, true) => Some(ChangeKind::DbChanged.merge(ChangeKind::LogAppended)),
            (true, false) => Some(ChangeKind::DbChanged),
            (false, true) => Some(ChangeKind::LogAppended),
            (false, false) => None,
        }
    }
}

/// Merges a new trigger into an already queued one.
pub fn coalesce(queued: Option<ChangeKind>, incoming: ChangeKind) -> ChangeKind {
    match queued {
        Some(existing) => existing.merge(incoming),
        None => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn detector(dir: &Path) -> ChangeDetector {
        ChangeDetector::new(
            dir.join("opencode.db"),
            dir.join("opencode.db-wal"),
            dir.join("log"),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn first_poll_fires_timer_then_goes_quiet() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut detector = detector(temp.path());
        let t0 = Instant::now();

        assert_eq!(detector.poll_at(t0), Some(ChangeKind::TimerElapsed));
        assert_eq!(detector.poll_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(
            detector.poll_at(t0 + Duration::from_secs(6)),
            Some(ChangeKind::TimerElapsed)
        );
    }

    #[test]
    fn wal_change_is_reported_one_poll_later() {
        let temp = tempfile::tempdir().expect("temp dir");
        let wal = temp.path().join("opencode.db-wal");
        std::fs::write(&wal, b"a").expect("write wal");
        let mut detector = detector(temp.path());
        let t0 = Instant::now();

        detector.poll_at(t0);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&wal)
            .expect("open wal")
            .write_all(b"more")
            .expect("append wal");

        assert_eq!(detector.poll_at(t0 + Duration::from_secs(1)), None);
        assert!(detector.has_pending());
        assert_eq!(
            detector.poll_at(t0 + Duration::from_secs(2)),
            Some(ChangeKind::DbChanged)
        );
        assert_eq!(detector.poll_at(t0 + Duration::from_secs(3)), None);
    }

    #[test]
    fn timer_waits_while_a_fresh_change_settles() {
        let temp = tempfile::tempdir().expect("temp dir");
        let wal = temp.path().join("opencode.db-wal");
        std::fs::write(&wal, b"a").expect("write wal");
        let mut detector = detector(temp.path());
        let t0 = Instant::now();

        assert_eq!(detector.poll_at(t0), Some(ChangeKind::TimerElapsed));
        std::fs::write(&wal, b"grown wal").expect("grow wal");

        // The interval has elapsed, but the change was only just seen.
        assert_eq!(detector.poll_at(t0 + Duration::from_secs(6)), None);
        assert!(detector.has_pending());
        assert_eq!(
            detector.poll_at(t0 + Duration::from_secs(7)),
            Some(ChangeKind::DbChanged)
        );
    }

    #[test]
    fn new_log_file_counts_as_append() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log_dir = temp.path().join("log");
        std::fs::create_dir_all(&log_dir).expect("log dir");
        let mut detector = detector(temp.path());
        let t0 = Instant::now();

        detector.poll_at(t0);
        std::fs::write(log_dir.join("run.log"), b"INFO line\n").expect("write log");
        assert_eq!(detector.poll_at(t0 + Duration::from_secs(1)), None);
        assert_eq!(
            detector.poll_at(t0 + Duration::from_secs(2)),
            Some(ChangeKind::LogAppended)
        );
    }

    #[test]
    fn coalesce_prefers_the_heavier_trigger() {
        assert_eq!(
            coalesce(Some(ChangeKind::TimerElapsed), ChangeKind::DbChanged),
            ChangeKind::DbChanged
        );
        assert_eq!(
            coalesce(Some(ChangeKind::LogAppended), ChangeKind::Manual),
            ChangeKind::Manual
        );
        assert_eq!(coalesce(None, ChangeKind::LogAppended), ChangeKind::LogAppended);
    }
}
