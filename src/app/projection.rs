use std::collections::{HashMap, HashSet};

use crossbeam_channel::Sender;
use serde_json::Value;
use tracing::debug;

use super::approvals::{self, ApprovalRequest, ApprovalResolution};
use super::types::{ActivityRecord, Block, BlockKind, WorkerEvent};

/// Batches at or below this size project synchronously on the owner thread.
pub(crate) const INLINE_PROJECTION_MAX: usize = 64;
/// Cap on the per-key sequence table; oldest-by-sequence keys are evicted.
pub(crate) const SEQ_TABLE_CAP: usize = 256;

/// Monotonic per-key sequence tokens enforcing last-writer-wins ordering:
/// only the highest-issued token for a key may be applied, all lower
/// arrivals are stale by definition.
#[derive(Debug, Default)]
pub(crate) struct SeqTracker {
    next: u64,
    latest: HashMap<String, u64>,
    cap: usize,
}

impl SeqTracker {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            next: 0,
            latest: HashMap::new(),
            cap: cap.max(1),
        }
    }

    /// Issues the next token and records it as the latest for `key`.
    pub(crate) fn issue(&mut self, key: &str) -> u64 {
        self.next += 1;
        let seq = self.next;
        self.latest.insert(key.to_string(), seq);
        if self.latest.len() > self.cap {
            if let Some(oldest) = self
                .latest
                .iter()
                .min_by_key(|(_, seq)| **seq)
                .map(|(key, _)| key.clone())
            {
                self.latest.remove(&oldest);
            }
        }
        seq
    }

    /// True only when `seq` is still the latest issued token for `key`;
    /// the token is consumed on success.
    pub(crate) fn try_apply(&mut self, key: &str, seq: u64) -> bool {
        match self.latest.get(key) {
            Some(current) if *current == seq => {
                self.latest.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn latest(&self, key: &str) -> Option<u64> {
        self.latest.get(key).copied()
    }
}

fn payload_text(payload: &Value) -> Option<String> {
    match payload {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("message"))
            .or_else(|| map.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn block_from_record(record: &ActivityRecord) -> Block {
    let text = payload_text(&record.payload);
    let kind = match record.kind.as_deref() {
        Some("user") => BlockKind::User,
        Some("agent") | Some("assistant") => BlockKind::Agent,
        Some("reasoning") | Some("thinking") => BlockKind::Reasoning,
        Some("tool") | Some("tool_call") => BlockKind::Tool,
        Some("system") => BlockKind::System,
        Some("error") => BlockKind::Error,
        // Unknown or missing kind: fall back to a generic rendering of the
        // raw record rather than failing.
        _ => BlockKind::System,
    };
    let text = text.unwrap_or_else(|| generic_text(record));
    Block {
        kind,
        text,
        session_id: Some(record.session_id.clone()),
        request_id: None,
    }
}

fn generic_text(record: &ActivityRecord) -> String {
    if record.payload.is_null() {
        return record.kind.clone().unwrap_or_else(|| "event".to_string());
    }
    serde_json::to_string(&record.payload).unwrap_or_else(|_| "event".to_string())
}

/// Coalesces adjacent reasoning fragments of the same session into one
/// block, joined with a blank line; duplicate fragment text is suppressed.
pub(crate) fn coalesce_reasoning(blocks: Vec<Block>) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.kind == BlockKind::Reasoning {
            if let Some(last) = out.last_mut() {
                if last.kind == BlockKind::Reasoning && last.session_id == block.session_id {
                    let trimmed = block.text.trim();
                    if !trimmed.is_empty() && !last.text.contains(trimmed) {
                        last.text.push_str("\n\n");
                        last.text.push_str(trimmed);
                    }
                    continue;
                }
            }
        }
        out.push(block);
    }
    out
}

/// Raw records to display blocks, with provider normalization applied.
pub(crate) fn project_records(records: &[ActivityRecord]) -> Vec<Block> {
    coalesce_reasoning(records.iter().map(block_from_record).collect())
}

/// Dispatches a large batch to an independent unit of work; its outcome
/// comes back as a `Projected` message carrying the issued token.
pub(crate) fn spawn_projection(
    key: String,
    seq: u64,
    records: Vec<ActivityRecord>,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || {
        let blocks = project_records(&records);
        let _ = tx.send(WorkerEvent::Projected { key, seq, blocks });
    });
}

/// Outcome of applying a refreshed projection for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RefreshOutcome {
    Applied,
    /// A newer request was issued after this one; result discarded.
    Stale,
    /// A live stream already delivered events for this key; the snapshot
    /// is ignored so the transcript cannot visibly regress.
    LivePreserved,
}

/// Owner-side projection state: sequence tokens, the per-key block cache,
/// and which keys are currently fed by a live stream.
#[derive(Debug)]
pub(crate) struct Projector {
    seq: SeqTracker,
    cache: HashMap<String, Vec<Block>>,
    live: HashSet<String>,
}

impl Default for Projector {
    fn default() -> Self {
        Self {
            seq: SeqTracker::new(SEQ_TABLE_CAP),
            cache: HashMap::new(),
            live: HashSet::new(),
        }
    }
}

impl Projector {
    pub(crate) fn issue(&mut self, key: &str) -> u64 {
        self.seq.issue(key)
    }

    pub(crate) fn cached(&self, key: &str) -> Option<&[Block]> {
        self.cache.get(key).map(Vec::as_slice)
    }

    pub(crate) fn stream_live(&self, key: &str) -> bool {
        self.live.contains(key)
    }

    pub(crate) fn clear_live(&mut self, key: &str) {
        self.live.remove(key);
    }

    /// Appends one stream-delivered block, marking the key live so later
    /// snapshot refreshes cannot clobber the stream's view.
    pub(crate) fn append_stream_block(&mut self, key: &str, block: Block) {
        self.live.insert(key.to_string());
        let entry = self.cache.entry(key.to_string()).or_default();
        entry.push(block);
        let coalesced = coalesce_reasoning(std::mem::take(entry));
        *entry = coalesced;
    }

    /// Re-runs the approval merge over the cached blocks for a key, seeded
    /// with the currently visible blocks so approvals do not reorder.
    pub(crate) fn remerge_approvals(
        &mut self,
        key: &str,
        requests: &[ApprovalRequest],
        resolutions: &[ApprovalResolution],
    ) {
        let previous = self.cache.get(key).cloned().unwrap_or_default();
        let merged = approvals::merge_into_blocks(previous.clone(), requests, resolutions);
        let placed = approvals::preserve_positions(&previous, merged);
        self.cache.insert(key.to_string(), placed);
    }

    /// Applies a refreshed snapshot projection if (and only if) its token
    /// is still the latest issued for the key.
    pub(crate) fn apply_refresh(
        &mut self,
        key: &str,
        seq: u64,
        blocks: Vec<Block>,
        requests: &[ApprovalRequest],
        resolutions: &[ApprovalResolution],
    ) -> RefreshOutcome {
        if !self.seq.try_apply(key, seq) {
            debug!(key, seq, latest = ?self.seq.latest(key), "stale projection dropped");
            return RefreshOutcome::Stale;
        }
        if self.live.contains(key) {
            // Keep the live transcript; re-cache it as-is for re-display.
            if let Some(existing) = self.cache.get(key).cloned() {
                self.cache.insert(key.to_string(), existing);
            }
            return RefreshOutcome::LivePreserved;
        }
        let previous = self.cache.get(key).cloned().unwrap_or_default();
        let merged = approvals::merge_into_blocks(blocks, requests, resolutions);
        let placed = approvals::preserve_positions(&previous, merged);
        self.cache.insert(key.to_string(), placed);
        RefreshOutcome::Applied
    }
}
