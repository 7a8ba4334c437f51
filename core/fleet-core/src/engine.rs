//! Coordination loop.
//!
//! One thread owns every mutable component and runs the cycle
//! `detect -> aggregate -> {tree, rank, watchdog} -> publish`. Readers only
//! ever see a complete [`ViewModel`] behind an `Arc` that is swapped on
//! publish, so nothing the loop does can stall them.
//!
//! Manual refreshes arrive over a channel and cut the poll wait short. Any
//! refreshes queued while a cycle is running are drained into a single
//! follow-up cycle, so at most one aggregation is ever in flight.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::aggregator::Aggregator;
use crate::change::{coalesce, ChangeDetector, ChangeKind};
use crate::config::FleetConfig;
use crate::error::Result;
use crate::ranker::Ranker;
use crate::cache::spawn_refresher;
use crate::reviews::{GhReviewFetcher, ReviewCache, ReviewFetcher};
use crate::storage::StoragePaths;
use crate::types::{CommsEvent, CommsKind, Snapshot};
use crate::view::{ViewModel, ViewParts};
use crate::watchdog::{KillAction, OsSignaller, Signal, Watchdog};
use crate::worktrees::{fetch_worktrees, GitWorktreeLister, WorktreeCache, WorktreeLister};

const WATCHDOG_HISTORY: usize = 20;
const CACHE_REFRESH_TICK: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════════════════════
// Publisher
// ═══════════════════════════════════════════════════════════════════════════════

/// Holds the latest view-model and notifies subscribers of new versions.
pub struct ViewPublisher {
    current: RwLock<Arc<ViewModel>>,
    version: AtomicU64,
    subscribers: Mutex<Vec<Sender<u64>>>,
}

impl Default for ViewPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewPublisher {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ViewModel::empty())),
            version: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn latest(&self) -> Arc<ViewModel> {
        let current = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&current)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Receives the version number of every publish from now on.
    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Swaps in `view` and wakes subscribers. Versions must strictly increase.
    fn publish(&self, view: ViewModel) -> Option<Arc<ViewModel>> {
        let version = view.version;
        if version <= self.version() {
            tracing::warn!(version, current = self.version(), "Refusing non-monotonic publish");
            return None;
        }
        let view = Arc::new(view);
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = Arc::clone(&view);
        }
        self.version.store(version, Ordering::Release);

        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(version).is_ok());
        Some(view)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub comms_max_events: usize,
}

impl EngineSettings {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            poll_interval: config.engine.poll_interval(),
            comms_max_events: config.engine.comms_max_events.max(1),
        }
    }
}

pub struct Engine {
    detector: ChangeDetector,
    aggregator: Aggregator,
    ranker: Ranker,
    watchdog: Option<Watchdog>,
    settings: EngineSettings,
    publisher: Arc<ViewPublisher>,
    snapshot: Option<Arc<Snapshot>>,
    comms: VecDeque<CommsEvent>,
    watchdog_history: VecDeque<KillAction>,
    review_fetcher: Option<Box<dyn ReviewFetcher>>,
    worktree_lister: Option<Box<dyn WorktreeLister>>,
}

enum EngineCommand {
    Refresh,
    Shutdown,
}

impl Engine {
    pub fn new(
        detector: ChangeDetector,
        aggregator: Aggregator,
        ranker: Ranker,
        watchdog: Option<Watchdog>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            detector,
            aggregator,
            ranker,
            watchdog,
            settings,
            publisher: Arc::new(ViewPublisher::new()),
            snapshot: None,
            comms: VecDeque::new(),
            watchdog_history: VecDeque::new(),
            review_fetcher: None,
            worktree_lister: None,
        }
    }

    /// Production wiring. Fails only when the agent runtime's data is
    /// entirely absent.
    pub fn from_paths(paths: &StoragePaths, config: FleetConfig) -> Result<Self> {
        paths.validate_sources()?;

        let reviews = Arc::new(ReviewCache::new(config.reviews.cache_ttl_secs));
        let detector = ChangeDetector::new(
            paths.db_file(),
            paths.wal_file(),
            paths.log_dir(),
            config.engine.refresh_interval(),
        );
        let aggregator = Aggregator::from_paths(paths, &config, reviews);
        let watchdog = config
            .watchdog
            .enabled
            .then(|| Watchdog::from_config(&config.watchdog, Box::new(OsSignaller)));

        let mut engine = Self::new(
            detector,
            aggregator,
            Ranker::new(config.ranker.clone()),
            watchdog,
            EngineSettings::from_config(&config),
        );
        if config.reviews.enabled {
            engine = engine.with_review_fetcher(Box::new(GhReviewFetcher::from_config(
                &config.reviews,
            )));
        }
        if config.worktrees.enabled {
            engine = engine.with_worktrees(
                Arc::new(WorktreeCache::new(config.worktrees.cache_ttl_secs)),
                Box::new(GitWorktreeLister::from_config(&config.worktrees)),
            );
        }
        Ok(engine)
    }

    /// Review fetching runs on its own thread once the engine is spawned.
    pub fn with_review_fetcher(mut self, fetcher: Box<dyn ReviewFetcher>) -> Self {
        self.review_fetcher = Some(fetcher);
        self
    }

    /// Worktree status, listed by `lister` on its own thread once spawned.
    pub fn with_worktrees(mut self, cache: Arc<WorktreeCache>, lister: Box<dyn WorktreeLister>) -> Self {
        self.aggregator = self.aggregator.with_worktrees(cache);
        self.worktree_lister = Some(lister);
        self
    }

    pub fn publisher(&self) -> Arc<ViewPublisher> {
        Arc::clone(&self.publisher)
    }

    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    /// Fills the review and worktree caches on the calling thread.
    pub fn refresh_caches_blocking(&self) {
        let now = Utc::now();
        if let Some(fetcher) = self.review_fetcher.as_deref() {
            let fetch = |path: Option<&std::path::Path>| fetcher.fetch(path);
            if let Err(err) = self.aggregator.reviews().refresh_with(fetch, now) {
                tracing::warn!(error = %err, "Review fetch failed");
            }
        }
        if let (Some(lister), Some(cache)) =
            (self.worktree_lister.as_deref(), self.aggregator.worktrees())
        {
            if let Err(err) = cache.refresh_with(|path| fetch_worktrees(lister, path), now) {
                tracing::warn!(error = %err, "Worktree listing failed");
            }
        }
    }

    /// One-shot pass without refresher threads: a first cycle learns the
    /// project path, the caches are filled, and a second cycle publishes.
    pub fn run_once(&mut self) -> Arc<ViewModel> {
        self.run_cycle(ChangeKind::Manual);
        self.refresh_caches_blocking();
        self.run_cycle(ChangeKind::Manual)
            .unwrap_or_else(|| self.publisher.latest())
    }

    pub fn run_cycle(&mut self, trigger: ChangeKind) -> Option<Arc<ViewModel>> {
        self.run_cycle_at(trigger, Utc::now())
    }

    /// One full pass. Returns `None` when the aggregator handed back the
    /// previous snapshot and the watchdog had nothing to send.
    ///
    /// The watchdog runs on every pass. While the store is failing it works
    /// from the aggregator's fresh process sample.
    pub fn run_cycle_at(&mut self, trigger: ChangeKind, now: DateTime<Utc>) -> Option<Arc<ViewModel>> {
        let started = Instant::now();
        let snapshot = self.aggregator.aggregate_at(self.snapshot.as_ref(), now);
        self.detector.note_refreshed(Instant::now());

        let unchanged = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| Arc::ptr_eq(previous, &snapshot));

        let processes = if unchanged {
            self.aggregator.last_sample()
        } else {
            snapshot.processes.as_slice()
        };
        let kills = match self.watchdog.as_mut() {
            Some(watchdog) => watchdog.enforce(processes, now),
            None => Vec::new(),
        };
        if unchanged && kills.is_empty() {
            tracing::debug!(trigger = trigger.as_str(), "Snapshot unchanged; skipping publish");
            return None;
        }
        self.snapshot = Some(Arc::clone(&snapshot));

        let watchdog_comms: Vec<CommsEvent> = kills.iter().map(kill_event).collect();
        for kill in kills {
            push_bounded(&mut self.watchdog_history, kill, WATCHDOG_HISTORY);
        }

        let fresh_comms = if unchanged { &[][..] } else { snapshot.comms.as_slice() };
        for event in fresh_comms.iter().cloned().chain(watchdog_comms) {
            push_bounded(&mut self.comms, event, self.settings.comms_max_events);
        }

        let actions = self.ranker.rank(&snapshot);
        let history: Vec<KillAction> = self.watchdog_history.iter().cloned().collect();
        let view = ViewModel::build(
            &snapshot,
            ViewParts {
                version: self.publisher.version() + 1,
                trigger: Some(trigger),
                comms: self.comms.iter().cloned().collect(),
                actions,
                watchdog_actions: &history,
            },
        );

        let published = self.publisher.publish(view);
        tracing::debug!(
            trigger = trigger.as_str(),
            snapshot_version = snapshot.version,
            sessions = snapshot.sessions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cycle complete"
        );
        published
    }

    pub fn spawn(mut self) -> EngineHandle {
        let (commands, rx) = mpsc::channel();
        let publisher = Arc::clone(&self.publisher);
        let stop = Arc::new(AtomicBool::new(false));

        let mut refreshers = Vec::new();
        if let Some(fetcher) = self.review_fetcher.take() {
            refreshers.push(spawn_refresher(
                "reviews",
                Arc::clone(self.aggregator.reviews()),
                move |path| fetcher.fetch(path),
                Arc::clone(&stop),
                CACHE_REFRESH_TICK,
            ));
        }
        if let (Some(lister), Some(cache)) = (self.worktree_lister.take(), self.aggregator.worktrees()) {
            refreshers.push(spawn_refresher(
                "worktrees",
                Arc::clone(cache),
                move |path| fetch_worktrees(lister.as_ref(), path),
                Arc::clone(&stop),
                CACHE_REFRESH_TICK,
            ));
        }

        let worker = thread::spawn(move || self.run(rx));

        EngineHandle {
            commands,
            publisher,
            stop,
            worker: Some(worker),
            refreshers,
        }
    }

    fn run(mut self, commands: Receiver<EngineCommand>) {
        tracing::info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Coordination loop started"
        );
        loop {
            match commands.recv_timeout(self.settings.poll_interval) {
                Ok(EngineCommand::Refresh) => {
                    if drain_refreshes(&commands) {
                        break;
                    }
                    self.run_cycle(ChangeKind::Manual);
                    continue;
                }
                Ok(EngineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some(kind) = self.detector.poll() {
                // A manual request that landed during this poll rides along.
                let mut kind = kind;
                loop {
                    match commands.try_recv() {
                        Ok(EngineCommand::Refresh) => kind = coalesce(Some(kind), ChangeKind::Manual),
                        Ok(EngineCommand::Shutdown) | Err(TryRecvError::Disconnected) => return,
                        Err(TryRecvError::Empty) => break,
                    }
                }
                self.run_cycle(kind);
            }
        }
        tracing::info!("Coordination loop stopped");
    }
}

/// Swallows queued refreshes. Returns true if a shutdown was among them.
fn drain_refreshes(commands: &Receiver<EngineCommand>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(EngineCommand::Refresh) => continue,
            Ok(EngineCommand::Shutdown) | Err(TryRecvError::Disconnected) => return true,
            Err(TryRecvError::Empty) => return false,
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, max: usize) {
    queue.push_back(item);
    while queue.len() > max {
        queue.pop_front();
    }
}

fn kill_event(action: &KillAction) -> CommsEvent {
    let kind = match action.signal {
        Signal::Terminate => CommsKind::WatchdogTerm,
        Signal::Kill => CommsKind::WatchdogKill,
    };
    let mib = action.rss_bytes / (1024 * 1024);
    let mut event = CommsEvent::new(action.at, kind, format!("pid {} at {} MiB", action.pid, mib))
        .with_field("pid", action.pid.to_string());
    if let Some(session_id) = &action.session_id {
        event = event.with_field("session", session_id.clone());
    }
    event
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handle
// ═══════════════════════════════════════════════════════════════════════════════

pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    publisher: Arc<ViewPublisher>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    refreshers: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn publisher(&self) -> Arc<ViewPublisher> {
        Arc::clone(&self.publisher)
    }

    /// Requests an immediate cycle. Coalesces with any cycle already queued.
    pub fn refresh(&self) {
        let _ = self.commands.send(EngineCommand::Refresh);
    }

    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.commands.send(EngineCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        for refresher in self.refreshers.drain(..) {
            let _ = refresher.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
