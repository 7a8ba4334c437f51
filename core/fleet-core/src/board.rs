//! Project board backed by a single JSON file.
//!
//! The file is shared between the engine (reader), the board CLI and any
//! interactive client (writers). There is no lock: every mutation re-reads
//! the file, applies one change and replaces the file with a temp file +
//! rename, so a concurrent reader sees either the old or the new board,
//! never a torn write. Two writers racing can still lose one update.
//!
//! ```json
//! { "version": 1, "projects": [ { "id": "k3v9x2ma", "stage": "pr", ... } ] }
//! ```

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;
use tempfile::NamedTempFile;

use crate::error::{FleetError, Result};

pub const BOARD_FILE_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════════════
// Stage
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Stage {
    Pending,
    InProgress,
    Pr,
    Done,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Pending, Stage::InProgress, Stage::Pr, Stage::Done];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::InProgress => "in_progress",
            Stage::Pr => "pr",
            Stage::Done => "done",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Pending => "Pending",
            Stage::InProgress => "In Progress",
            Stage::Pr => "PR",
            Stage::Done => "Done",
        }
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self as usize + 1).copied()
    }

    pub fn prev(self) -> Option<Stage> {
        (self as usize).checked_sub(1).map(|idx| Stage::ALL[idx])
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = FleetError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Stage::Pending),
            "in_progress" => Ok(Stage::InProgress),
            "pr" => Ok(Stage::Pr),
            "done" => Ok(Stage::Done),
            _ => Err(FleetError::InvalidStage(raw.to_string())),
        }
    }
}

/// Unknown stages written by older or foreign tools land in `pending`.
impl From<String> for Stage {
    fn from(raw: String) -> Self {
        raw.parse().unwrap_or(Stage::Pending)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardProject {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_stage")]
    pub stage: Stage,
    #[serde(default)]
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub pr_numbers: Vec<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(alias = "created_at", default = "epoch", deserialize_with = "lenient_time")]
    pub created: DateTime<Utc>,
    #[serde(alias = "updated_at", default = "epoch", deserialize_with = "lenient_time")]
    pub updated: DateTime<Utc>,
}

impl BoardProject {
    pub fn links_session(&self, session_id: &str) -> bool {
        self.session_ids.iter().any(|id| id == session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    #[serde(default = "board_version")]
    pub version: u32,
    #[serde(default)]
    pub projects: Vec<BoardProject>,
}

impl Default for Board {
    fn default() -> Self {
        Self {
            version: BOARD_FILE_VERSION,
            projects: Vec::new(),
        }
    }
}

impl Board {
    pub fn get(&self, id: &str) -> Option<&BoardProject> {
        self.projects.iter().find(|project| project.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut BoardProject> {
        self.projects
            .iter_mut()
            .find(|project| project.id == id)
            .ok_or_else(|| FleetError::ProjectNotFound(id.to_string()))
    }

    /// Projects grouped by stage in board order, each column newest first.
    pub fn columns(&self) -> Vec<(Stage, Vec<BoardProject>)> {
        Stage::ALL
            .iter()
            .map(|stage| {
                let mut column: Vec<BoardProject> = self
                    .projects
                    .iter()
                    .filter(|project| project.stage == *stage)
                    .cloned()
                    .collect();
                column.sort_by(|a, b| b.updated.cmp(&a.updated).then_with(|| a.id.cmp(&b.id)));
                (*stage, column)
            })
            .collect()
    }
}

/// Optional field changes for [`BoardStore::update`].
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub stage: Option<Stage>,
    pub tags: Option<Vec<String>>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.stage.is_none()
            && self.tags.is_none()
    }
}

fn default_stage() -> Stage {
    Stage::Pending
}

fn board_version() -> u32 {
    BOARD_FILE_VERSION
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Accepts RFC 3339, or the naive local `YYYY-MM-DDTHH:MM:SS` form older
/// boards were written with. Anything else reads as the epoch.
fn lenient_time<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    Ok(parse_time(&raw).unwrap_or_else(epoch))
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    chrono::Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn sanitize_title(title: &str) -> String {
    let sanitized = title.replace(['\n', '\r'], " ").trim().to_string();
    if sanitized.is_empty() {
        return "Untitled".to_string();
    }
    sanitized
}

fn new_project_id(board: &Board) -> String {
    loop {
        let ulid = ulid::Ulid::new().to_string().to_ascii_lowercase();
        let id = ulid[ulid.len() - 8..].to_string();
        if board.get(&id).is_none() {
            return id;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

pub struct BoardStore {
    path: PathBuf,
}

impl BoardStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the board. A missing file is an empty board.
    pub fn load(&self) -> Result<Board> {
        read_board(&self.path)
    }

    pub fn save(&self, board: &Board) -> Result<()> {
        let content = serde_json::to_string_pretty(board).map_err(|source| FleetError::Json {
            context: "serializing board".to_string(),
            source,
        })?;
        atomic_write(&self.path, &content)
    }

    /// Re-reads, applies `op`, writes back atomically.
    fn modify<T>(&self, op: impl FnOnce(&mut Board) -> Result<T>) -> Result<T> {
        let mut board = self.load()?;
        let out = op(&mut board)?;
        board.version = BOARD_FILE_VERSION;
        self.save(&board)?;
        Ok(out)
    }

    fn modify_project(
        &self,
        id: &str,
        op: impl FnOnce(&mut BoardProject),
    ) -> Result<BoardProject> {
        self.modify(|board| {
            let project = board.get_mut(id)?;
            op(project);
            project.updated = Utc::now();
            Ok(project.clone())
        })
    }

    pub fn list(&self, stage: Option<Stage>) -> Result<Vec<BoardProject>> {
        let board = self.load()?;
        Ok(board
            .projects
            .into_iter()
            .filter(|project| stage.map_or(true, |stage| project.stage == stage))
            .collect())
    }

    pub fn get(&self, id: &str) -> Result<BoardProject> {
        self.load()?
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::ProjectNotFound(id.to_string()))
    }

    pub fn create(
        &self,
        title: &str,
        description: &str,
        stage: Stage,
        tags: Vec<String>,
    ) -> Result<BoardProject> {
        self.modify(|board| {
            let now = Utc::now();
            let project = BoardProject {
                id: new_project_id(board),
                title: sanitize_title(title),
                description: description.trim().to_string(),
                stage,
                session_ids: Vec::new(),
                pr_numbers: Vec::new(),
                tags,
                created: now,
                updated: now,
            };
            board.projects.push(project.clone());
            Ok(project)
        })
    }

    pub fn update(&self, id: &str, patch: ProjectPatch) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            if let Some(title) = patch.title {
                project.title = sanitize_title(&title);
            }
            if let Some(description) = patch.description {
                project.description = description.trim().to_string();
            }
            if let Some(stage) = patch.stage {
                project.stage = stage;
            }
            if let Some(tags) = patch.tags {
                project.tags = tags;
            }
        })
    }

    /// Any stage may be set directly; transitions are not validated.
    pub fn move_to(&self, id: &str, stage: Stage) -> Result<BoardProject> {
        self.modify_project(id, |project| project.stage = stage)
    }

    /// Moves one stage right. A project already in `done` is left as is.
    pub fn advance(&self, id: &str) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            if let Some(next) = project.stage.next() {
                project.stage = next;
            }
        })
    }

    pub fn retreat(&self, id: &str) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            if let Some(prev) = project.stage.prev() {
                project.stage = prev;
            }
        })
    }

    pub fn delete(&self, id: &str) -> Result<BoardProject> {
        self.modify(|board| {
            let idx = board
                .projects
                .iter()
                .position(|project| project.id == id)
                .ok_or_else(|| FleetError::ProjectNotFound(id.to_string()))?;
            Ok(board.projects.remove(idx))
        })
    }

    pub fn link_session(&self, id: &str, session_id: &str) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            if !project.links_session(session_id) {
                project.session_ids.push(session_id.to_string());
            }
        })
    }

    pub fn unlink_session(&self, id: &str, session_id: &str) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            project.session_ids.retain(|linked| linked != session_id);
        })
    }

    pub fn link_review(&self, id: &str, number: u64) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            if !project.pr_numbers.contains(&number) {
                project.pr_numbers.push(number);
            }
        })
    }

    pub fn unlink_review(&self, id: &str, number: u64) -> Result<BoardProject> {
        self.modify_project(id, |project| {
            project.pr_numbers.retain(|linked| *linked != number);
        })
    }
}

fn read_board(path: &Path) -> Result<Board> {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Board::default()),
        Err(err) => return Err(FleetError::io("reading board", err)),
    };
    if content.trim().is_empty() {
        return Ok(Board::default());
    }
    serde_json::from_str(&content).map_err(|source| FleetError::Json {
        context: format!("parsing board {}", path.display()),
        source,
    })
}

/// Writes `contents` to `path` via a temp file in the same directory + rename.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir)
        .map_err(|err| FleetError::io(format!("creating {}", dir.display()), err))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| FleetError::io(format!("creating temp file in {}", dir.display()), err))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|err| FleetError::io(format!("writing temp file for {}", path.display()), err))?;
    tmp.flush()
        .map_err(|err| FleetError::io(format!("flushing temp file for {}", path.display()), err))?;
    tmp.persist(path).map_err(|err| {
        FleetError::io(format!("persisting temp file to {}", path.display()), err.error)
    })?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reader
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine-side reader that keeps the last board it parsed successfully.
pub struct BoardReader {
    path: PathBuf,
    last_good: Board,
    stamp: Option<(u64, Option<SystemTime>)>,
}

impl BoardReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_good: Board::default(),
            stamp: None,
        }
    }

    pub fn board(&self) -> &Board {
        &self.last_good
    }

    /// Re-reads the file when its size or mtime moved. On a parse failure the
    /// previous board is kept and the error returned for soft reporting.
    pub fn refresh(&mut self) -> Result<&Board> {
        let stamp = fs_err::metadata(&self.path)
            .ok()
            .map(|meta| (meta.len(), meta.modified().ok()));
        if stamp.is_some() && stamp == self.stamp {
            return Ok(&self.last_good);
        }

        match read_board(&self.path) {
            Ok(board) => {
                self.last_good = board;
                self.stamp = stamp;
                Ok(&self.last_good)
            }
            Err(err) => {
                tracing::debug!(error = %err, "Board unreadable; keeping previous");
                Err(err)
            }
        }
    }
}
