//! Incremental tailer for the agent runtime's activity logs.
//!
//! The runtime writes one append-only `*.log` per process start. We follow
//! the most recently modified one from a held byte offset, consuming only
//! complete lines; a partial trailing line stays on disk until its newline
//! arrives.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{FleetError, Result};
use crate::patterns::{
    RE_CMD_BARE, RE_CMD_QUOTED, RE_COMMAND_BARE, RE_COMMAND_QUOTED, RE_LOG_LINE,
};
use crate::types::{CommsEvent, CommsKind};

/// Bus event types that fire many times per second and never reach the feed.
const NOISY_BUS_EVENTS: &[&str] = &[
    "file.watcher.updated",
    "message.part.delta",
    "message.part.updated",
];

/// One recognised log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: String,
    pub at: DateTime<Utc>,
    pub kind: CommsKind,
    pub fields: BTreeMap<String, String>,
}

impl LogEvent {
    pub fn to_comms(&self) -> CommsEvent {
        let detail = match self.kind {
            CommsKind::VcsBranch => format!(
                "{} -> {}",
                self.field("from").unwrap_or("?"),
                self.field("to").unwrap_or("?")
            ),
            CommsKind::CommandExecuted => self.field("command").unwrap_or("").to_string(),
            _ => self
                .field("sessionID")
                .or_else(|| self.field("session"))
                .unwrap_or("")
                .to_string(),
        };
        CommsEvent {
            at: self.at,
            kind: self.kind,
            detail,
            fields: self.fields.clone(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Parses one log line, returning `None` for anything not worth surfacing.
pub fn parse_log_line(line: &str) -> Option<LogEvent> {
    let caps = RE_LOG_LINE.captures(line.trim_end())?;
    let level = caps.get(1)?.as_str().to_string();
    let at = NaiveDateTime::parse_from_str(caps.get(2)?.as_str(), "%Y-%m-%dT%H:%M:%S")
        .ok()?
        .and_utc();
    let rest = caps.get(4)?.as_str();

    let mut fields = BTreeMap::new();
    for token in rest.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            fields.insert(key.to_string(), value.to_string());
        }
    }

    let service = fields.get("service").map(String::as_str).unwrap_or("");
    match service {
        "vcs" => {
            let from = fields.get("from").filter(|v| !v.is_empty())?.clone();
            let to = fields.get("to").filter(|v| !v.is_empty())?.clone();
            let mut branch_fields = BTreeMap::new();
            branch_fields.insert("from".to_string(), from);
            branch_fields.insert("to".to_string(), to);
            Some(LogEvent {
                level,
                at,
                kind: CommsKind::VcsBranch,
                fields: branch_fields,
            })
        }
        "bus" if rest.contains("publishing") => {
            let event_type = fields.get("type")?.as_str();
            if NOISY_BUS_EVENTS.contains(&event_type) {
                return None;
            }
            let kind = CommsKind::from_bus_type(event_type)?;
            if kind == CommsKind::CommandExecuted {
                if let Some(command) = extract_command(rest) {
                    fields.insert("command".to_string(), command);
                }
            }
            Some(LogEvent {
                level,
                at,
                kind,
                fields,
            })
        }
        _ => None,
    }
}

fn extract_command(rest: &str) -> Option<String> {
    [&*RE_COMMAND_QUOTED, &*RE_COMMAND_BARE, &*RE_CMD_QUOTED, &*RE_CMD_BARE]
        .iter()
        .find_map(|re| re.captures(rest).and_then(|caps| caps.get(1)))
        .map(|m| m.as_str().to_string())
        .filter(|command| !command.is_empty())
}

/// Most recently modified `*.log` directly inside `dir`.
pub fn find_latest_log(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.into_path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, path)| path)
}

/// True when `offset` falls after the first byte of a line.
fn starts_mid_line(path: &Path, offset: u64) -> Result<bool> {
    if offset == 0 {
        return Ok(false);
    }
    let mut file =
        fs_err::File::open(path).map_err(|err| FleetError::io("open activity log", err))?;
    file.seek(SeekFrom::Start(offset - 1))
        .map_err(|err| FleetError::io("seek activity log", err))?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte)
        .map_err(|err| FleetError::io("read activity log", err))?;
    Ok(byte[0] != b'\n')
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tailer
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ActivityLogTailer {
    dir: PathBuf,
    current: Option<PathBuf>,
    offset: u64,
    /// Set while the offset sits inside a line whose head was skipped.
    skip_partial: bool,
    backfill_bytes: u64,
    read_budget: u64,
    current_branch: Option<String>,
    last_session_error: Option<DateTime<Utc>>,
}

impl ActivityLogTailer {
    pub fn new(dir: PathBuf, backfill_bytes: u64, read_budget: u64) -> Self {
        Self {
            dir,
            current: None,
            offset: 0,
            skip_partial: false,
            backfill_bytes,
            read_budget: read_budget.max(4096),
            current_branch: None,
            last_session_error: None,
        }
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn current_branch(&self) -> Option<&str> {
        self.current_branch.as_deref()
    }

    pub fn last_session_error(&self) -> Option<DateTime<Utc>> {
        self.last_session_error
    }

    /// Reads and parses every complete line appended since the last poll.
    pub fn poll(&mut self) -> Result<Vec<LogEvent>> {
        let Some(latest) = find_latest_log(&self.dir) else {
            return Ok(Vec::new());
        };

        let len = fs_err::metadata(&latest)
            .map_err(|err| FleetError::io("stat activity log", err))?
            .len();

        if self.current.as_deref() != Some(latest.as_path()) {
            tracing::debug!(path = %latest.display(), "Following activity log");
            self.current = Some(latest.clone());
            self.offset = len.saturating_sub(self.backfill_bytes);
            self.skip_partial = starts_mid_line(&latest, self.offset)?;
        } else if len < self.offset {
            tracing::debug!(
                path = %latest.display(),
                previous_offset = self.offset,
                len,
                "Activity log truncated; rereading from start"
            );
            self.offset = 0;
            self.skip_partial = false;
        }

        if len == self.offset {
            return Ok(Vec::new());
        }

        let chunk = self.read_chunk(&latest, len)?;
        let mut body = chunk.as_slice();
        if self.skip_partial {
            let Some(newline) = body.iter().position(|byte| *byte == b'\n') else {
                if body.len() as u64 >= self.read_budget {
                    self.offset += body.len() as u64;
                }
                return Ok(Vec::new());
            };
            self.offset += newline as u64 + 1;
            self.skip_partial = false;
            body = &body[newline + 1..];
        }

        let Some(last_newline) = body.iter().rposition(|byte| *byte == b'\n') else {
            if chunk.len() as u64 >= self.read_budget && body.len() == chunk.len() {
                // A single line longer than the budget; drop it.
                self.offset += body.len() as u64;
            }
            return Ok(Vec::new());
        };

        let complete = &body[..=last_newline];
        self.offset += complete.len() as u64;

        let text = String::from_utf8_lossy(complete);
        let mut events = Vec::new();
        for line in text.lines() {
            let Some(event) = parse_log_line(line) else {
                continue;
            };
            self.track(&event);
            events.push(event);
        }
        Ok(events)
    }

    fn read_chunk(&self, path: &Path, len: u64) -> Result<Vec<u8>> {
        let mut file =
            fs_err::File::open(path).map_err(|err| FleetError::io("open activity log", err))?;
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|err| FleetError::io("seek activity log", err))?;
        let want = (len - self.offset).min(self.read_budget);
        let mut buf = Vec::with_capacity(want as usize);
        file.take(want)
            .read_to_end(&mut buf)
            .map_err(|err| FleetError::io("read activity log", err))?;
        Ok(buf)
    }

    fn track(&mut self, event: &LogEvent) {
        match event.kind {
            CommsKind::VcsBranch => {
                if let Some(to) = event.field("to").filter(|to| *to != "HEAD") {
                    self.current_branch = Some(to.to_string());
                }
            }
            CommsKind::SessionError => {
                self.last_session_error = Some(event.at);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const BRANCH_LINE: &str =
        "INFO  2026-02-24T20:34:51 +12ms service=vcs from=main to=feature/x branch changed\n";
    const ERROR_LINE: &str =
        "ERROR 2026-02-24T20:35:00 +3ms service=bus type=session.error sessionID=ses_1 publishing\n";
    const NOISE_LINE: &str =
        "INFO  2026-02-24T20:35:01 +1ms service=bus type=message.part.delta publishing\n";

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        file.write_all(text.as_bytes()).expect("append");
    }

    #[test]
    fn parses_branch_and_bus_events() {
        let branch = parse_log_line(BRANCH_LINE).expect("branch");
        assert_eq!(branch.kind, CommsKind::VcsBranch);
        assert_eq!(branch.field("to"), Some("feature/x"));

        let error = parse_log_line(ERROR_LINE).expect("error");
        assert_eq!(error.kind, CommsKind::SessionError);
        assert_eq!(error.to_comms().detail, "ses_1");

        assert!(parse_log_line(NOISE_LINE).is_none());
        assert!(parse_log_line("garbage").is_none());
    }

    #[test]
    fn extracts_quoted_and_bare_commands() {
        let quoted = parse_log_line(
            "INFO  2026-02-24T20:35:01 +1ms service=bus type=command.executed command=\"git status\" publishing",
        )
        .expect("quoted");
        assert_eq!(quoted.field("command"), Some("git status"));

        let bare = parse_log_line(
            "INFO  2026-02-24T20:35:01 +1ms service=bus type=command.executed cmd=ls publishing",
        )
        .expect("bare");
        assert_eq!(bare.to_comms().detail, "ls");
    }

    #[test]
    fn consumes_only_complete_lines() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("2026-02-24.log");
        append(&log, BRANCH_LINE);
        append(&log, "ERROR 2026-02-24T20:35:00 +3ms service=bus type=sess");

        let mut tailer = ActivityLogTailer::new(temp.path().to_path_buf(), 8192, 65536);
        let events = tailer.poll().expect("poll");
        assert_eq!(events.len(), 1);
        assert_eq!(tailer.current_branch(), Some("feature/x"));
        assert_eq!(tailer.offset(), BRANCH_LINE.len() as u64);

        append(&log, "ion.error sessionID=ses_1 publishing\n");
        let events = tailer.poll().expect("poll");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CommsKind::SessionError);
        assert!(tailer.last_session_error().is_some());

        assert!(tailer.poll().expect("poll").is_empty());
    }

    #[test]
    fn backfill_drops_leading_partial_line() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("run.log");
        for _ in 0..20 {
            append(&log, BRANCH_LINE);
        }
        let backfill = (BRANCH_LINE.len() * 2 + 10) as u64;

        let mut tailer = ActivityLogTailer::new(temp.path().to_path_buf(), backfill, 65536);
        let events = tailer.poll().expect("poll");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn backfill_on_a_line_boundary_keeps_that_line() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("run.log");
        for _ in 0..20 {
            append(&log, BRANCH_LINE);
        }
        let backfill = (BRANCH_LINE.len() * 2) as u64;

        let mut tailer = ActivityLogTailer::new(temp.path().to_path_buf(), backfill, 65536);
        assert_eq!(tailer.poll().expect("poll").len(), 2);
    }

    #[test]
    fn partial_head_is_skipped_even_when_its_newline_arrives_later() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("run.log");
        let error = ERROR_LINE.trim_end();
        append(&log, "leading noise ");
        append(&log, error);

        // The backfill window opens on what looks like a whole error record.
        let mut tailer =
            ActivityLogTailer::new(temp.path().to_path_buf(), error.len() as u64, 65536);
        assert!(tailer.poll().expect("poll").is_empty());

        append(&log, "\n");
        append(&log, BRANCH_LINE);
        let events = tailer.poll().expect("poll");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CommsKind::VcsBranch);
        assert!(tailer.last_session_error().is_none());
        assert_eq!(
            tailer.offset(),
            ("leading noise ".len() + error.len() + 1 + BRANCH_LINE.len()) as u64
        );
    }

    #[test]
    fn truncation_resets_offset() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("run.log");
        append(&log, BRANCH_LINE);
        append(&log, BRANCH_LINE);

        let mut tailer = ActivityLogTailer::new(temp.path().to_path_buf(), 8192, 65536);
        assert_eq!(tailer.poll().expect("poll").len(), 2);

        std::fs::write(&log, ERROR_LINE).expect("truncate");
        let events = tailer.poll().expect("poll");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CommsKind::SessionError);
    }

    #[test]
    fn missing_directory_yields_nothing() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut tailer = ActivityLogTailer::new(temp.path().join("nope"), 8192, 65536);
        assert!(tailer.poll().expect("poll").is_empty());
        assert!(tailer.current_file().is_none());
    }
}
