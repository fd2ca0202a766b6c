use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::backend::{
    spawn_approvals_refresh, spawn_decision, spawn_history_fetch, spawn_interrupt,
    spawn_reply_poll, spawn_send, spawn_session_refresh, Backend, CancelHandle, CompletionPolicy,
};
use crate::store::StateStore;

pub(crate) mod approvals;
mod input;
mod projection;
mod recents;
mod runtime;
mod selection;
mod session;
pub(crate) mod types;
pub(crate) mod ui;
mod worker;

use approvals::{ApprovalRequest, ApprovalResolution};
use projection::Projector;
use recents::{RecentsEvent, RecentsTracker};
pub(crate) use runtime::run_app;
use selection::{reconcile, SelectionContext};
use types::{
    session_row_key, Block, RecentsBadge, RowEntry, SessionId, SessionMeta, WorkerEvent,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Normal,
    Compose,
}

#[derive(Debug, Default)]
struct ApprovalSet {
    requests: Vec<ApprovalRequest>,
    resolutions: Vec<ApprovalResolution>,
}

/// Single writer over all dashboard state. Background work never mutates
/// anything here; it reports through `WorkerEvent`s drained by `poll_worker`.
pub(crate) struct App {
    backend: Arc<dyn Backend>,
    policy: Box<dyn CompletionPolicy>,
    tx: Sender<WorkerEvent>,
    rx: Receiver<WorkerEvent>,

    sessions: Vec<SessionMeta>,
    rows: Vec<RowEntry>,
    selected: Option<usize>,

    projector: Projector,
    recents: RecentsTracker,
    approvals: HashMap<SessionId, ApprovalSet>,

    /// Live stream handle per projection key; replacing one cancels it.
    streams: HashMap<String, CancelHandle>,
    /// Bounded reply polls per projection key, cancelled once a reply lands.
    reply_polls: HashMap<String, CancelHandle>,

    mode: Mode,
    input: String,
    scroll: u16,
    autoscroll: bool,
    /// True while the terminal has lost focus; selection reconciliation
    /// then avoids jumping off a transcript.
    background: bool,
    status: String,
    should_quit: bool,

    store: Option<StateStore>,
    /// Selection key restored from the snapshot, applied once rows exist.
    restored_selection: Option<String>,
    last_sessions_refresh: Instant,
}

impl App {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        policy: Box<dyn CompletionPolicy>,
        store: Option<StateStore>,
    ) -> Self {
        let (tx, rx) = unbounded();
        let mut app = Self {
            backend,
            policy,
            tx,
            rx,
            sessions: Vec::new(),
            rows: Vec::new(),
            selected: None,
            projector: Projector::default(),
            recents: RecentsTracker::default(),
            approvals: HashMap::new(),
            streams: HashMap::new(),
            reply_polls: HashMap::new(),
            mode: Mode::Normal,
            input: String::new(),
            scroll: 0,
            autoscroll: true,
            background: false,
            status: "ready".to_string(),
            should_quit: false,
            store,
            restored_selection: None,
            last_sessions_refresh: Instant::now(),
        };
        app.restore_snapshot();
        app
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    fn selected_row(&self) -> Option<&RowEntry> {
        self.selected.and_then(|idx| self.rows.get(idx))
    }

    fn selected_session(&self) -> Option<&SessionMeta> {
        let id = self.selected_row()?.session_id.as_deref()?;
        self.session_by_id(id)
    }

    fn session_by_id(&self, session_id: &str) -> Option<&SessionMeta> {
        self.sessions.iter().find(|meta| meta.id == session_id)
    }

    fn selected_projection_key(&self) -> Option<String> {
        self.selected_session().map(SessionMeta::projection_key)
    }

    fn row_index_of(&self, key: &str) -> Option<usize> {
        self.rows.iter().position(|row| row.key == key)
    }

    pub(super) fn visible_blocks(&self) -> &[Block] {
        match self.selected_projection_key() {
            Some(key) => self.projector.cached(&key).unwrap_or_default(),
            None => &[],
        }
    }

    fn badge_for(&self, session_id: &str) -> RecentsBadge {
        if self.recents.is_running(session_id) {
            RecentsBadge::Running
        } else if self.recents.is_ready(session_id) {
            RecentsBadge::Ready
        } else {
            RecentsBadge::None
        }
    }

    /// Rebuilds the sidebar rows from the session list: workspaces, their
    /// worktrees, then sessions in listing order under each container.
    fn rebuild_rows(&mut self) {
        let mut rows = Vec::new();
        let mut workspaces: Vec<String> = Vec::new();
        for meta in &self.sessions {
            if !workspaces.contains(&meta.workspace) {
                workspaces.push(meta.workspace.clone());
            }
        }
        for workspace in &workspaces {
            rows.push(RowEntry::workspace(workspace));
            let mut worktrees: Vec<Option<String>> = Vec::new();
            for meta in self.sessions.iter().filter(|m| &m.workspace == workspace) {
                if !worktrees.contains(&meta.worktree) {
                    worktrees.push(meta.worktree.clone());
                }
            }
            for worktree in worktrees {
                if let Some(tree) = &worktree {
                    rows.push(RowEntry::worktree(workspace, tree));
                }
                for meta in self
                    .sessions
                    .iter()
                    .filter(|m| &m.workspace == workspace && m.worktree == worktree)
                {
                    let mut row = RowEntry::session(meta, meta.title.clone());
                    row.badge = self.badge_for(&meta.id);
                    rows.push(row);
                }
            }
        }
        self.rows = rows;
    }

    /// Applies a fresh session listing: derives run lifecycle events from
    /// metadata deltas, prunes vanished sessions, then rebuilds rows and
    /// reconciles the selection.
    fn apply_sessions(&mut self, metas: Vec<SessionMeta>) {
        let now = crate::now_ms();
        let events = detect_run_events(&self.sessions, &metas, self.policy.as_ref(), now);
        self.sessions = metas;
        let mut changed = false;
        for event in events {
            changed |= self.recents.apply(event);
        }
        let present: Vec<SessionId> = self.sessions.iter().map(|m| m.id.clone()).collect();
        changed |= self.recents.apply(RecentsEvent::SessionsPruned { present });

        // Retire streams and approval state for sessions that disappeared.
        self.streams
            .retain(|key, _| self.sessions.iter().any(|m| &m.projection_key() == key));
        self.reply_polls
            .retain(|key, _| self.sessions.iter().any(|m| &m.projection_key() == key));
        self.approvals
            .retain(|id, _| self.sessions.iter().any(|m| &m.id == id));

        self.rebuild_and_reconcile();
        if changed {
            self.persist_snapshot();
        }
    }

    /// Captures the selected row before the row list is replaced, so the
    /// reconciler sees what was actually selected rather than whatever now
    /// sits at the stale index.
    pub(super) fn rebuild_and_reconcile(&mut self) {
        let previous = self.selected_row().cloned();
        self.rebuild_rows();
        self.reconcile_selection(previous);
    }

    fn reconcile_selection(&mut self, previous: Option<RowEntry>) {
        let restored = if self.rows.is_empty() {
            None
        } else {
            self.restored_selection.take()
        };
        let ctx = SelectionContext {
            previous_key: previous
                .as_ref()
                .map(|row| row.key.clone())
                .or(restored),
            active_workspace: previous.as_ref().and_then(|row| row.workspace.clone()),
            active_worktree: previous.as_ref().and_then(|row| row.worktree.clone()),
            background: self.background,
        };
        let sessions = &self.sessions;
        let lookup = |session_id: &str| {
            sessions
                .iter()
                .find(|meta| meta.id == session_id || meta.key.as_deref() == Some(session_id))
                .map(|meta| session_row_key(&meta.id))
        };
        let decision = reconcile(&self.rows, &ctx, &lookup);
        if let Some(winner) = decision.winner() {
            debug!(%winner, reason = ?decision.reason, "selection reconciled");
        }
        // The winner may name a row currently filtered out of view; fall
        // through the ranked candidates to the first visible one.
        let next = decision
            .candidates
            .iter()
            .find_map(|key| self.rows.iter().position(|row| &row.key == key));
        let prev_key = previous.map(|row| row.key);
        let next_key = next
            .and_then(|idx| self.rows.get(idx))
            .map(|row| row.key.clone());
        self.selected = next;
        if next_key != prev_key {
            self.on_selection_changed();
        }
    }

    /// Cancels background work attached to the previously selected session,
    /// then opens the live stream and kicks off transcript/approval
    /// refreshes for the new one. Dropping a handle cancels its thread; the
    /// old key also stops counting as live so a later snapshot refresh can
    /// apply if the user comes back.
    fn on_selection_changed(&mut self) {
        self.scroll = 0;
        self.autoscroll = true;
        let active = self.selected_projection_key();
        let stale: Vec<String> = self
            .streams
            .keys()
            .filter(|key| Some(key.as_str()) != active.as_deref())
            .cloned()
            .collect();
        for key in stale {
            self.streams.remove(&key);
            self.projector.clear_live(&key);
        }
        self.reply_polls
            .retain(|key, _| Some(key.as_str()) == active.as_deref());

        let Some(meta) = self.selected_session().cloned() else {
            self.persist_snapshot();
            return;
        };
        let key = meta.projection_key();
        if !self.streams.contains_key(&key) {
            let handle = CancelHandle::new();
            if self
                .backend
                .open_stream(&meta.id, key.clone(), handle.token(), self.tx.clone())
                .is_ok()
            {
                self.streams.insert(key.clone(), handle);
            }
        }
        self.refresh_transcript(&key, &meta.id);
        spawn_approvals_refresh(self.backend.clone(), meta.id.clone(), self.tx.clone());
        self.persist_snapshot();
    }

    fn refresh_transcript(&mut self, key: &str, session_id: &str) {
        let seq = self.projector.issue(key);
        spawn_history_fetch(
            self.backend.clone(),
            key.to_string(),
            session_id.to_string(),
            seq,
            self.tx.clone(),
        );
    }

    fn approval_set(&mut self, session_id: &str) -> &mut ApprovalSet {
        self.approvals.entry(session_id.to_string()).or_default()
    }

    /// First still-pending approval in the visible transcript, if any.
    fn first_pending_approval(&self) -> Option<(SessionId, u64)> {
        let meta = self.selected_session()?;
        let set = self.approvals.get(&meta.id)?;
        let pending = set
            .requests
            .iter()
            .find(|req| !set.resolutions.iter().any(|res| res.id == req.id))?;
        Some((meta.id.clone(), pending.id))
    }

    fn decide_first_pending(&mut self, approved: bool) {
        let Some((session_id, request_id)) = self.first_pending_approval() else {
            self.set_status("no pending approval");
            return;
        };
        let verb = if approved { "approving" } else { "declining" };
        self.set_status(format!("{verb} request {request_id}"));
        spawn_decision(
            self.backend.clone(),
            session_id,
            request_id,
            approved,
            self.tx.clone(),
        );
    }

    fn dismiss_ready_selected(&mut self) {
        let Some(meta) = self.selected_session() else {
            return;
        };
        let session_id = meta.id.clone();
        if !self.recents.is_ready(&session_id) {
            self.set_status("nothing to dismiss");
            return;
        }
        self.recents
            .apply(RecentsEvent::ReadyDismissed { session_id });
        self.rebuild_and_reconcile();
        self.persist_snapshot();
        self.set_status("dismissed");
    }

    /// Sends the composed input and starts a bounded reply poll so the
    /// answer appears even when no stream delivers it.
    fn send_current_input(&mut self) {
        let text = self.input.trim().to_string();
        if text.is_empty() {
            return;
        }
        let Some(meta) = self.selected_session().cloned() else {
            self.set_status("no session selected");
            return;
        };
        self.input.clear();
        self.mode = Mode::Normal;
        let key = meta.projection_key();
        spawn_send(
            self.backend.clone(),
            meta.id.clone(),
            text,
            self.tx.clone(),
        );
        let handle = CancelHandle::new();
        spawn_reply_poll(
            self.backend.clone(),
            key.clone(),
            meta.id.clone(),
            handle.token(),
            self.tx.clone(),
        );
        self.reply_polls.insert(key, handle);
        self.set_status("sent");
        info!(session_id = %meta.id, "message sent");
    }

    fn interrupt_selected(&mut self) {
        let Some(meta) = self.selected_session() else {
            return;
        };
        spawn_interrupt(self.backend.clone(), meta.id.clone(), self.tx.clone());
        self.set_status("interrupt requested");
    }

    /// Manual refresh: session listing plus the selected transcript and its
    /// approvals, all through the normal background paths.
    fn request_refresh(&mut self) {
        spawn_session_refresh(self.backend.clone(), self.tx.clone());
        if let Some(meta) = self.selected_session().cloned() {
            let key = meta.projection_key();
            self.refresh_transcript(&key, &meta.id);
            spawn_approvals_refresh(self.backend.clone(), meta.id, self.tx.clone());
        }
        self.last_sessions_refresh = Instant::now();
        self.set_status("refreshing");
    }

    fn scroll_up(&mut self, n: u16) {
        self.autoscroll = false;
        self.scroll = self.scroll.saturating_sub(n);
    }

    fn scroll_down(&mut self, n: u16) {
        self.scroll = self.scroll.saturating_add(n);
    }

    fn move_selection(&mut self, delta: isize) {
        if self.rows.is_empty() {
            return;
        }
        let current = self.selected.unwrap_or(0) as isize;
        let next = (current + delta).clamp(0, self.rows.len() as isize - 1) as usize;
        if Some(next) != self.selected {
            self.selected = Some(next);
            self.on_selection_changed();
        }
    }
}

/// Derives run lifecycle events from two consecutive session listings.
/// A busy flag rising starts a run; falling completes it. A turn marker
/// that advanced without a busy transition is the metadata fallback and
/// only counts for providers the policy trusts.
fn detect_run_events(
    old: &[SessionMeta],
    new: &[SessionMeta],
    policy: &dyn CompletionPolicy,
    now: u64,
) -> Vec<RecentsEvent> {
    let mut events = Vec::new();
    for meta in new {
        let Some(prev) = old.iter().find(|m| m.id == meta.id) else {
            if meta.busy {
                events.push(RecentsEvent::RunStarted {
                    session_id: meta.id.clone(),
                    baseline_turn: meta.turn_id.clone().unwrap_or_default(),
                    at: now,
                });
            }
            continue;
        };
        match (prev.busy, meta.busy) {
            (false, true) => events.push(RecentsEvent::RunStarted {
                session_id: meta.id.clone(),
                // The baseline is the turn before the run mutated anything.
                baseline_turn: prev.turn_id.clone().unwrap_or_default(),
                at: now,
            }),
            (true, false) => events.push(RecentsEvent::RunCompleted {
                session_id: meta.id.clone(),
                expected_turn: None,
                completion_turn: meta.turn_id.clone(),
                at: now,
            }),
            _ => {
                if meta.turn_id != prev.turn_id {
                    if let Some(turn) = &meta.turn_id {
                        if policy.trust_metadata_completion(meta.provider.as_deref()) {
                            events.push(RecentsEvent::MetaObserved {
                                session_id: meta.id.clone(),
                                observed_turn: turn.clone(),
                                at: now,
                            });
                        }
                    }
                }
            }
        }
    }
    events
}
