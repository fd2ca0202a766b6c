use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::approvals::{ApprovalRequest, ApprovalResolution};

pub(crate) type SessionId = String;

pub(crate) const SESSION_KEY_PREFIX: &str = "sess:";
pub(crate) const WORKSPACE_KEY_PREFIX: &str = "ws:";
pub(crate) const WORKTREE_KEY_PREFIX: &str = "wt:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum BlockKind {
    User,
    Agent,
    Reasoning,
    Tool,
    System,
    Error,
    Approval,
}

/// One transcript entry as handed to the presentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Block {
    pub(crate) kind: BlockKind,
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) session_id: Option<SessionId>,
    #[serde(default)]
    pub(crate) request_id: Option<u64>,
}

impl Block {
    pub(crate) fn new(kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            session_id: None,
            request_id: None,
        }
    }

    pub(crate) fn is_approval(&self) -> bool {
        matches!(self.kind, BlockKind::Approval)
    }
}

/// Session metadata as reported by the backend listing call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct SessionMeta {
    pub(crate) id: SessionId,
    pub(crate) title: String,
    pub(crate) workspace: String,
    #[serde(default)]
    pub(crate) worktree: Option<String>,
    /// Stable client-side key; falls back to the id when absent.
    #[serde(default)]
    pub(crate) key: Option<String>,
    #[serde(default)]
    pub(crate) provider: Option<String>,
    /// Opaque marker identifying the latest exchange in the session.
    #[serde(default)]
    pub(crate) turn_id: Option<String>,
    #[serde(default)]
    pub(crate) busy: bool,
}

impl SessionMeta {
    pub(crate) fn projection_key(&self) -> String {
        self.key.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// A raw activity record fetched from history/tail calls or a live stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ActivityRecord {
    pub(crate) session_id: SessionId,
    #[serde(default)]
    pub(crate) kind: Option<String>,
    #[serde(default)]
    pub(crate) payload: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RowKind {
    Workspace,
    Worktree,
    Session,
}

/// Run-status marker shown beside a session row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum RecentsBadge {
    #[default]
    None,
    Running,
    Ready,
}

/// One selectable sidebar row.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RowEntry {
    pub(crate) key: String,
    pub(crate) kind: RowKind,
    pub(crate) label: String,
    pub(crate) session_id: Option<SessionId>,
    pub(crate) workspace: Option<String>,
    pub(crate) worktree: Option<String>,
    pub(crate) badge: RecentsBadge,
}

impl RowEntry {
    pub(crate) fn workspace(name: &str) -> Self {
        Self {
            key: format!("{WORKSPACE_KEY_PREFIX}{name}"),
            kind: RowKind::Workspace,
            label: name.to_string(),
            session_id: None,
            workspace: Some(name.to_string()),
            worktree: None,
            badge: RecentsBadge::None,
        }
    }

    pub(crate) fn worktree(workspace: &str, name: &str) -> Self {
        Self {
            key: format!("{WORKTREE_KEY_PREFIX}{workspace}/{name}"),
            kind: RowKind::Worktree,
            label: name.to_string(),
            session_id: None,
            workspace: Some(workspace.to_string()),
            worktree: Some(name.to_string()),
            badge: RecentsBadge::None,
        }
    }

    pub(crate) fn session(meta: &SessionMeta, label: String) -> Self {
        Self {
            key: session_row_key(&meta.id),
            kind: RowKind::Session,
            label,
            session_id: Some(meta.id.clone()),
            workspace: Some(meta.workspace.clone()),
            worktree: meta.worktree.clone(),
            badge: RecentsBadge::None,
        }
    }
}

pub(crate) fn session_row_key(id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

pub(crate) fn session_id_from_row_key(key: &str) -> Option<&str> {
    key.strip_prefix(SESSION_KEY_PREFIX)
}

/// Run lifecycle signal carried by a stream event or metadata observation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RunSignal {
    Started {
        baseline_turn: String,
    },
    Completed {
        expected_turn: Option<String>,
        completion_turn: Option<String>,
    },
    /// Seen only through periodic metadata polling; lower confidence.
    TurnAdvanced {
        turn: String,
    },
}

/// Messages produced by background units of work. The controller is the
/// only consumer; no background unit touches shared state directly.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    SessionsListed(Vec<SessionMeta>),
    ApprovalsListed {
        session_id: SessionId,
        requests: Vec<ApprovalRequest>,
        resolutions: Vec<ApprovalResolution>,
    },
    HistoryFetched {
        key: String,
        seq: u64,
        records: Vec<ActivityRecord>,
    },
    Projected {
        key: String,
        seq: u64,
        blocks: Vec<Block>,
    },
    StreamItem {
        key: String,
        record: ActivityRecord,
    },
    StreamClosed {
        key: String,
    },
    Run {
        session_id: SessionId,
        signal: RunSignal,
    },
    ReplyPollFetched {
        key: String,
        records: Vec<ActivityRecord>,
        attempt: u32,
    },
    ApprovalDecided {
        session_id: SessionId,
        request_id: u64,
        approved: bool,
    },
    TransportError {
        context: String,
        message: String,
    },
    NotFound {
        session_id: SessionId,
        context: String,
    },
}
