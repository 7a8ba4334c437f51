//! Source readers.
//!
//! Each reader owns the I/O against one external source. The session store
//! and the process table sit behind traits so the aggregator can be driven by
//! in-memory fakes in tests; the activity log tailer is concrete because its
//! only state is a file offset.

pub mod activity_log;
pub mod process_table;
pub mod session_store;

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::error::Result;
use crate::types::{DailySpend, MonitoredProcess, Session};

pub use activity_log::{ActivityLogTailer, LogEvent};
pub use process_table::SysinfoProcessSampler;
pub use session_store::SqliteSessionStore;

/// Everything one pass over the session store yields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreRead {
    pub sessions: Vec<Session>,
    pub daily_spend: Vec<DailySpend>,
    pub project_path: Option<PathBuf>,
}

/// Wholesale reader of session, todo and cost rows.
pub trait SessionSource: Send {
    fn read(&mut self, now: DateTime<Utc>) -> Result<StoreRead>;
}

/// Point-in-time sampler of monitored processes.
pub trait ProcessSource: Send {
    fn sample(&mut self, now: DateTime<Utc>) -> Vec<MonitoredProcess>;
}
