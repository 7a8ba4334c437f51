//! Last-good cache for results produced by slow external commands.
//!
//! A refresher thread keeps each cache warm; the aggregator only reads
//! [`FetchCache::view`], which never waits on the command. A failed fetch
//! keeps the previous items and bumps a failure counter.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;

#[derive(Debug)]
struct CacheState<T> {
    items: Vec<T>,
    fetched_at: Option<DateTime<Utc>>,
    project_path: Option<PathBuf>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl<T> Default for CacheState<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            fetched_at: None,
            project_path: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// What the aggregator sees of a cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheView<T> {
    pub items: Vec<T>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

pub struct FetchCache<T> {
    state: Mutex<CacheState<T>>,
    ttl: chrono::Duration,
}

impl<T: Clone> FetchCache<T> {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl: chrono::Duration::seconds(ttl_secs.max(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn view(&self) -> CacheView<T> {
        let state = self.lock();
        CacheView {
            items: state.items.clone(),
            fetched_at: state.fetched_at,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
        }
    }

    /// A new project path makes the cache stale immediately.
    pub fn set_project_path(&self, path: Option<PathBuf>) {
        let mut state = self.lock();
        if state.project_path != path {
            state.project_path = path;
            state.fetched_at = None;
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.lock().fetched_at {
            Some(fetched_at) => now - fetched_at >= self.ttl,
            None => true,
        }
    }

    /// Fetches outside the lock. On failure the previous items stay.
    pub fn refresh_with(
        &self,
        fetch: impl FnOnce(Option<&Path>) -> Result<Vec<T>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let project_path = self.lock().project_path.clone();
        match fetch(project_path.as_deref()) {
            Ok(items) => {
                self.replace(items, now);
                Ok(())
            }
            Err(err) => {
                let mut state = self.lock();
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.last_error = Some(err.to_string());
                // Back off a full TTL before the next attempt.
                state.fetched_at = Some(now);
                Err(err)
            }
        }
    }

    pub fn replace(&self, items: Vec<T>, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.items = items;
        state.fetched_at = Some(now);
        state.consecutive_failures = 0;
        state.last_error = None;
    }
}

/// Keeps `cache` fresh until `stop` is raised.
pub fn spawn_refresher<T, F>(
    name: &'static str,
    cache: Arc<FetchCache<T>>,
    fetch: F,
    stop: Arc<AtomicBool>,
    tick: Duration,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(Option<&Path>) -> Result<Vec<T>> + Send + 'static,
{
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let now = Utc::now();
            if cache.is_stale(now) {
                match cache.refresh_with(&fetch, now) {
                    Ok(()) => tracing::debug!(cache = name, "Cache refreshed"),
                    Err(err) => {
                        tracing::warn!(cache = name, error = %err, "Fetch failed; keeping cached")
                    }
                }
            }
            thread::sleep(tick);
        }
    })
}
