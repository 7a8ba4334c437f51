//! Next Ops: ranked operator actions derived from a snapshot.
//!
//! | priority | kind            | when                                                  |
//! |----------|-----------------|-------------------------------------------------------|
//! | 100      | fix-failing-ci  | a review's CI is failing                              |
//! | 70       | resume-stalled  | stalled, idle past threshold, no linked review        |
//! | 50       | request-review  | review approved, not merged                           |
//! | 30       | watch-cost      | active, no linked review, cost above watch threshold  |
//!
//! Ties break on most recent activity. The output is truncated to `top_k`
//! after sorting, so the excess dropped is always the lowest scoring.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::config::RankerConfig;
use crate::types::{
    ActionItem, ActionKind, ActionTarget, ReviewState, ReviewStatus, Session, Snapshot,
};

pub const PRIORITY_FIX_FAILING_CI: u32 = 100;
pub const PRIORITY_RESUME_STALLED: u32 = 70;
pub const PRIORITY_REQUEST_REVIEW: u32 = 50;
pub const PRIORITY_WATCH_COST: u32 = 30;

pub struct Ranker {
    config: RankerConfig,
}

impl Ranker {
    pub fn new(config: RankerConfig) -> Self {
        Self { config }
    }

    pub fn rank(&self, snapshot: &Snapshot) -> Vec<ActionItem> {
        let now = snapshot.created_at;
        let live: HashSet<&str> = snapshot
            .processes
            .iter()
            .filter_map(|process| process.session_id.as_deref())
            .collect();

        let mut items: Vec<ActionItem> = Vec::new();
        for review in &snapshot.reviews {
            if let Some(item) = self.review_action(review, snapshot) {
                items.push(item);
            }
        }
        for session in &snapshot.sessions {
            if let Some(item) = self.session_action(session, live.contains(session.id.as_str()), now)
            {
                items.push(item);
            }
        }

        items.sort_by(compare_items);
        items.truncate(self.config.top_k);
        items
    }

    fn review_action(&self, review: &ReviewStatus, snapshot: &Snapshot) -> Option<ActionItem> {
        let (kind, priority, reason) = match review.state {
            ReviewState::CiFailing => (
                ActionKind::FixFailingCi,
                PRIORITY_FIX_FAILING_CI,
                format!("Fix failing CI on #{}: {}", review.number, review.title),
            ),
            ReviewState::Approved => (
                ActionKind::RequestReview,
                PRIORITY_REQUEST_REVIEW,
                format!("Merge approved #{}: {}", review.number, review.title),
            ),
            _ => return None,
        };
        Some(ActionItem {
            kind,
            target: ActionTarget::Review(review.number),
            priority,
            reason,
            recency: review_recency(review, snapshot),
        })
    }

    fn session_action(&self, session: &Session, live: bool, now: DateTime<Utc>) -> Option<ActionItem> {
        if !session.review_ids.is_empty() {
            return None;
        }
        let idle = session.idle_secs(now);

        if session.stalled && idle >= self.config.stall_idle_secs {
            return Some(ActionItem {
                kind: ActionKind::ResumeStalled,
                target: ActionTarget::Session(session.id.clone()),
                priority: PRIORITY_RESUME_STALLED,
                reason: format!(
                    "Resume: {} ({} pending)",
                    session.title,
                    session.pending_todos()
                ),
                recency: Some(session.last_activity),
            });
        }

        let active = !session.stalled && (live || idle < self.config.active_window_secs);
        if active && session.cost > self.config.cost_watch_threshold {
            return Some(ActionItem {
                kind: ActionKind::WatchCost,
                target: ActionTarget::Session(session.id.clone()),
                priority: PRIORITY_WATCH_COST,
                reason: format!("Cost ${:.2} on {} with no review", session.cost, session.title),
                recency: Some(session.last_activity),
            });
        }
        None
    }
}

/// A review is as recent as its own update or the latest linked session.
fn review_recency(review: &ReviewStatus, snapshot: &Snapshot) -> Option<DateTime<Utc>> {
    snapshot
        .sessions
        .iter()
        .filter(|session| session.review_ids.contains(&review.number))
        .map(|session| session.last_activity)
        .chain(review.updated_at)
        .max()
}

fn compare_items(a: &ActionItem, b: &ActionItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.recency.cmp(&a.recency))
        .then_with(|| a.target.cmp(&b.target))
}
