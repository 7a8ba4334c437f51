//! Fork-aware session hierarchy, rebuilt from scratch every cycle.
//!
//! Sessions are partitioned by repository and linked to their parent when
//! the parent is in the same batch. `effective_recency` bubbles child
//! activity up to every ancestor, and siblings are ordered by it, so the most
//! recently active subtree renders first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::types::{Session, SessionStatus, WorkerCounts};

#[derive(Debug, Clone, Serialize)]
pub struct SessionTreeNode {
    pub session: Session,
    pub children: Vec<SessionTreeNode>,
    /// Max of own last activity and every descendant's.
    pub effective_recency: DateTime<Utc>,
    /// Own cost plus every descendant's.
    pub subtree_cost: f64,
    pub depth: usize,
}

impl SessionTreeNode {
    /// Number of nodes in this subtree, self included.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(SessionTreeNode::len).sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoGroup {
    pub repository: String,
    pub roots: Vec<SessionTreeNode>,
    pub effective_recency: DateTime<Utc>,
}

/// One line of the flattened render order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "row", rename_all = "snake_case")]
pub enum TreeRow {
    Repository {
        name: String,
        sessions: usize,
        effective_recency: DateTime<Utc>,
    },
    Session {
        id: String,
        title: String,
        depth: usize,
        is_last_sibling: bool,
        effective_recency: DateTime<Utc>,
        subtree_cost: f64,
        stalled: bool,
        status: SessionStatus,
        agent_type: Option<String>,
        message_count: u64,
        workers: WorkerCounts,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Build
// ═══════════════════════════════════════════════════════════════════════════════

pub fn build(sessions: &[Session]) -> Vec<RepoGroup> {
    let mut by_repo: BTreeMap<&str, Vec<&Session>> = BTreeMap::new();
    for session in sessions {
        by_repo
            .entry(session.repository.as_str())
            .or_default()
            .push(session);
    }

    let mut groups: Vec<RepoGroup> = by_repo
        .into_iter()
        .filter_map(|(repository, batch)| {
            let roots = build_repository(&batch);
            let effective_recency = roots.first()?.effective_recency;
            Some(RepoGroup {
                repository: repository.to_string(),
                roots,
                effective_recency,
            })
        })
        .collect();

    groups.sort_by(|a, b| {
        b.effective_recency
            .cmp(&a.effective_recency)
            .then_with(|| a.repository.cmp(&b.repository))
    });
    groups
}

fn build_repository(batch: &[&Session]) -> Vec<SessionTreeNode> {
    let index: HashMap<&str, usize> = batch
        .iter()
        .enumerate()
        .map(|(idx, session)| (session.id.as_str(), idx))
        .collect();

    // Parents outside the batch have aged out of the window: treat as root.
    let mut parent_of: Vec<Option<usize>> = batch
        .iter()
        .enumerate()
        .map(|(idx, session)| {
            session
                .parent_id
                .as_deref()
                .and_then(|parent| index.get(parent).copied())
                .filter(|parent| *parent != idx)
        })
        .collect();

    break_cycles(&mut parent_of);

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); batch.len()];
    let mut roots = Vec::new();
    for (idx, parent) in parent_of.iter().enumerate() {
        match parent {
            Some(parent) => children[*parent].push(idx),
            None => roots.push(idx),
        }
    }

    let mut nodes: Vec<SessionTreeNode> = roots
        .into_iter()
        .map(|root| build_node(root, 0, batch, &children))
        .collect();
    sort_by_recency(&mut nodes);
    nodes
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unseen,
    OnPath,
    Done,
}

/// Every session on a parent-reference cycle becomes a root.
fn break_cycles(parent_of: &mut [Option<usize>]) {
    let mut state = vec![Visit::Unseen; parent_of.len()];
    for start in 0..parent_of.len() {
        if state[start] != Visit::Unseen {
            continue;
        }
        let mut path = Vec::new();
        let mut cursor = Some(start);
        while let Some(node) = cursor {
            match state[node] {
                Visit::Done => break,
                Visit::OnPath => {
                    if let Some(pos) = path.iter().position(|member| *member == node) {
                        for member in &path[pos..] {
                            parent_of[*member] = None;
                        }
                    }
                    break;
                }
                Visit::Unseen => {
                    state[node] = Visit::OnPath;
                    path.push(node);
                    cursor = parent_of[node];
                }
            }
        }
        for member in path {
            state[member] = Visit::Done;
        }
    }
}

/// Post-order: children first, then the derived fields of `idx`.
fn build_node(
    idx: usize,
    depth: usize,
    batch: &[&Session],
    children: &[Vec<usize>],
) -> SessionTreeNode {
    let mut child_nodes: Vec<SessionTreeNode> = children[idx]
        .iter()
        .map(|child| build_node(*child, depth + 1, batch, children))
        .collect();
    sort_by_recency(&mut child_nodes);

    let session = batch[idx].clone();
    let effective_recency = child_nodes
        .iter()
        .map(|child| child.effective_recency)
        .fold(session.last_activity, DateTime::max);
    let subtree_cost = session.cost + child_nodes.iter().map(|c| c.subtree_cost).sum::<f64>();

    SessionTreeNode {
        session,
        children: child_nodes,
        effective_recency,
        subtree_cost,
        depth,
    }
}

fn sort_by_recency(nodes: &mut [SessionTreeNode]) {
    nodes.sort_by(|a, b| {
        b.effective_recency
            .cmp(&a.effective_recency)
            .then_with(|| a.session.id.cmp(&b.session.id))
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// Flatten
// ═══════════════════════════════════════════════════════════════════════════════

/// Repository header, then each root followed depth-first by its children.
pub fn flatten(groups: &[RepoGroup]) -> Vec<TreeRow> {
    let mut rows = Vec::new();
    for group in groups {
        rows.push(TreeRow::Repository {
            name: group.repository.clone(),
            sessions: group.roots.iter().map(SessionTreeNode::len).sum(),
            effective_recency: group.effective_recency,
        });
        let count = group.roots.len();
        for (pos, root) in group.roots.iter().enumerate() {
            push_rows(root, pos + 1 == count, &mut rows);
        }
    }
    rows
}

fn push_rows(node: &SessionTreeNode, is_last_sibling: bool, rows: &mut Vec<TreeRow>) {
    rows.push(TreeRow::Session {
        id: node.session.id.clone(),
        title: node.session.title.clone(),
        depth: node.depth,
        is_last_sibling,
        effective_recency: node.effective_recency,
        subtree_cost: node.subtree_cost,
        stalled: node.session.stalled,
        status: node.session.status,
        agent_type: node.session.agent_type.clone(),
        message_count: node.session.message_count,
        workers: node.session.workers,
    });
    let count = node.children.len();
    for (pos, child) in node.children.iter().enumerate() {
        push_rows(child, pos + 1 == count, rows);
    }
}
