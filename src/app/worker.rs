use tracing::{debug, warn};

use super::*;

use super::projection::{project_records, spawn_projection, RefreshOutcome, INLINE_PROJECTION_MAX};
use super::types::{ActivityRecord, BlockKind, RunSignal};
use crate::backend::spawn_session_refresh;

impl App {
    /// Drains every pending background message. Called once per UI tick;
    /// the channel is unbounded so nothing blocks the draw loop.
    pub(super) fn poll_worker(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.handle_worker_event(event);
        }
    }

    pub(super) fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::SessionsListed(metas) => {
                self.apply_sessions(metas);
            }
            WorkerEvent::ApprovalsListed {
                session_id,
                requests,
                resolutions,
            } => {
                let set = self.approval_set(&session_id);
                set.requests = requests;
                set.resolutions = resolutions;
                self.remerge_for_session(&session_id);
            }
            WorkerEvent::HistoryFetched { key, seq, records } => {
                if records.len() <= INLINE_PROJECTION_MAX {
                    let blocks = project_records(&records);
                    self.apply_projected(key, seq, blocks);
                } else {
                    spawn_projection(key, seq, records, self.tx.clone());
                }
            }
            WorkerEvent::Projected { key, seq, blocks } => {
                self.apply_projected(key, seq, blocks);
            }
            WorkerEvent::StreamItem { key, record } => {
                self.apply_stream_item(key, record);
            }
            WorkerEvent::StreamClosed { key } => {
                self.projector.clear_live(&key);
                self.streams.remove(&key);
                // One snapshot refresh so anything the stream missed lands.
                if let Some(meta) = self
                    .sessions
                    .iter()
                    .find(|m| m.projection_key() == key)
                    .cloned()
                {
                    self.refresh_transcript(&key, &meta.id);
                }
            }
            WorkerEvent::Run { session_id, signal } => {
                self.apply_run_signal(session_id, signal);
            }
            WorkerEvent::ReplyPollFetched {
                key,
                records,
                attempt,
            } => {
                self.apply_reply_poll(key, records, attempt);
            }
            WorkerEvent::ApprovalDecided {
                session_id,
                request_id,
                approved,
            } => {
                let set = self.approval_set(&session_id);
                approvals::remove(&mut set.requests, request_id);
                self.remerge_for_session(&session_id);
                // Authoritative resolution text comes from the backend.
                spawn_approvals_refresh(self.backend.clone(), session_id, self.tx.clone());
                let verdict = if approved { "approved" } else { "declined" };
                self.set_status(format!("request {request_id} {verdict}"));
            }
            WorkerEvent::TransportError { context, message } => {
                warn!(%context, "background failure: {message}");
                self.set_status(format!("{context} failed: {message}"));
            }
            WorkerEvent::NotFound {
                session_id,
                context,
            } => {
                self.compensate_not_found(&session_id, &context);
            }
        }
    }

    fn apply_projected(&mut self, key: String, seq: u64, blocks: Vec<Block>) {
        let set = self
            .sessions
            .iter()
            .find(|m| m.projection_key() == key)
            .and_then(|m| self.approvals.get(&m.id));
        let requests = set.map(|s| s.requests.clone()).unwrap_or_default();
        let resolutions = set.map(|s| s.resolutions.clone()).unwrap_or_default();
        match self
            .projector
            .apply_refresh(&key, seq, blocks, &requests, &resolutions)
        {
            RefreshOutcome::Applied => {
                if self.autoscroll {
                    self.scroll = u16::MAX;
                }
            }
            RefreshOutcome::Stale => debug!(%key, seq, "dropped stale projection"),
            RefreshOutcome::LivePreserved => debug!(%key, seq, "stream holds the transcript"),
        }
    }

    fn apply_stream_item(&mut self, key: String, record: ActivityRecord) {
        if let Some(signal) = crate::backend::run_signal_from_record(&record) {
            self.apply_run_signal(record.session_id, signal);
            return;
        }
        let blocks = project_records(std::slice::from_ref(&record));
        for block in blocks {
            if block.kind == BlockKind::Agent {
                // The reply arrived; retire any pending reply poll.
                self.reply_polls.remove(&key);
            }
            self.projector.append_stream_block(&key, block);
        }
        if self.autoscroll {
            self.scroll = u16::MAX;
        }
    }

    fn apply_run_signal(&mut self, session_id: SessionId, signal: RunSignal) {
        let now = crate::now_ms();
        let event = match signal {
            RunSignal::Started { baseline_turn } => RecentsEvent::RunStarted {
                session_id,
                baseline_turn,
                at: now,
            },
            RunSignal::Completed {
                expected_turn,
                completion_turn,
            } => RecentsEvent::RunCompleted {
                session_id,
                expected_turn,
                completion_turn,
                at: now,
            },
            RunSignal::TurnAdvanced { turn } => {
                let provider = self
                    .session_by_id(&session_id)
                    .and_then(|m| m.provider.clone());
                if !self.policy.trust_metadata_completion(provider.as_deref()) {
                    debug!(%session_id, "untrusted metadata completion ignored");
                    return;
                }
                RecentsEvent::MetaObserved {
                    session_id,
                    observed_turn: turn,
                    at: now,
                }
            }
        };
        if self.recents.apply(event) {
            self.rebuild_and_reconcile();
            self.persist_snapshot();
        }
    }

    fn apply_reply_poll(&mut self, key: String, records: Vec<ActivityRecord>, attempt: u32) {
        // The poll only serves the session the operator is looking at.
        if self.selected_projection_key().as_deref() != Some(key.as_str()) {
            self.reply_polls.remove(&key);
            return;
        }
        // Live streams already deliver the reply as it happens.
        if self.projector.stream_live(&key) {
            self.reply_polls.remove(&key);
            return;
        }
        let replied = records
            .iter()
            .any(|r| matches!(r.kind.as_deref(), Some("agent") | Some("assistant")));
        if replied {
            self.reply_polls.remove(&key);
            if let Some(meta) = self
                .sessions
                .iter()
                .find(|m| m.projection_key() == key)
                .cloned()
            {
                self.refresh_transcript(&key, &meta.id);
            }
            self.set_status("reply received");
        } else {
            self.set_status(format!("waiting for reply ({attempt})"));
        }
    }

    fn remerge_for_session(&mut self, session_id: &str) {
        let Some(key) = self
            .sessions
            .iter()
            .find(|m| m.id == session_id)
            .map(SessionMeta::projection_key)
        else {
            return;
        };
        let Some(set) = self.approvals.get(session_id) else {
            return;
        };
        let requests = set.requests.clone();
        let resolutions = set.resolutions.clone();
        self.projector
            .remerge_approvals(&key, &requests, &resolutions);
    }

    /// The backend no longer knows the session: clear local run/approval
    /// state for it and ask for a fresh listing rather than erroring.
    fn compensate_not_found(&mut self, session_id: &str, context: &str) {
        warn!(%session_id, %context, "session vanished under an operation");
        self.recents.apply(RecentsEvent::ReadyDismissed {
            session_id: session_id.to_string(),
        });
        self.approvals.remove(session_id);
        self.sessions.retain(|m| m.id != session_id);
        let present: Vec<SessionId> = self.sessions.iter().map(|m| m.id.clone()).collect();
        self.recents.apply(RecentsEvent::SessionsPruned { present });
        self.rebuild_and_reconcile();
        self.persist_snapshot();
        self.set_status(format!("session gone: {context}"));
        spawn_session_refresh(self.backend.clone(), self.tx.clone());
    }
}
