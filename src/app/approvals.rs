use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Block, BlockKind, SessionId};

/// A pending human-in-the-loop permission prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ApprovalRequest {
    pub(crate) id: u64,
    pub(crate) session_id: SessionId,
    pub(crate) method: String,
    pub(crate) summary: String,
    pub(crate) detail: String,
    pub(crate) context: Vec<String>,
    pub(crate) created_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Decision {
    Approved,
    Declined,
    Other,
}

impl Decision {
    pub(crate) fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "accept" | "accepted" | "allow" => Decision::Approved,
            "decline" | "declined" | "deny" | "denied" | "reject" => Decision::Declined,
            _ => Decision::Other,
        }
    }

    fn verdict(self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Declined => "declined",
            Decision::Other => "resolved",
        }
    }
}

/// The settled outcome of an approval request. Once a resolution exists
/// for a request id it supersedes the request in any rendered view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ApprovalResolution {
    pub(crate) id: u64,
    pub(crate) session_id: SessionId,
    pub(crate) method: String,
    pub(crate) summary: String,
    pub(crate) detail: String,
    pub(crate) decision: Decision,
    pub(crate) resolved_at: u64,
}

impl ApprovalRequest {
    pub(crate) fn from_params(
        id: u64,
        session_id: &str,
        method: &str,
        params: Option<&Value>,
        created_at: u64,
    ) -> Self {
        let presentation = presentation_from_params(method, params);
        Self {
            id,
            session_id: session_id.to_string(),
            method: method.to_string(),
            summary: presentation.summary,
            detail: presentation.detail,
            context: presentation.context,
            created_at,
        }
    }
}

impl ApprovalResolution {
    pub(crate) fn from_params(
        id: u64,
        session_id: &str,
        method: &str,
        params: Option<&Value>,
        decision: Decision,
        resolved_at: u64,
    ) -> Self {
        let presentation = presentation_from_params(method, params);
        Self {
            id,
            session_id: session_id.to_string(),
            method: method.to_string(),
            summary: presentation.summary,
            detail: presentation.detail,
            decision,
            resolved_at,
        }
    }
}

/// Drops duplicate request ids keeping the most recently created entry,
/// then sorts ascending by (created_at, id) for stable display order.
pub(crate) fn normalize_requests(items: Vec<ApprovalRequest>) -> Vec<ApprovalRequest> {
    let mut by_id: HashMap<u64, ApprovalRequest> = HashMap::new();
    for item in items {
        match by_id.get(&item.id) {
            Some(existing) if existing.created_at > item.created_at => {}
            _ => {
                by_id.insert(item.id, item);
            }
        }
    }
    let mut out: Vec<ApprovalRequest> = by_id.into_values().collect();
    out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    out
}

/// Same as `normalize_requests` but keyed on resolved_at.
pub(crate) fn normalize_resolutions(items: Vec<ApprovalResolution>) -> Vec<ApprovalResolution> {
    let mut by_id: HashMap<u64, ApprovalResolution> = HashMap::new();
    for item in items {
        match by_id.get(&item.id) {
            Some(existing) if existing.resolved_at > item.resolved_at => {}
            _ => {
                by_id.insert(item.id, item);
            }
        }
    }
    let mut out: Vec<ApprovalResolution> = by_id.into_values().collect();
    out.sort_by(|a, b| (a.resolved_at, a.id).cmp(&(b.resolved_at, b.id)));
    out
}

/// Replace-or-insert by request id. Returns false when the stored entry is
/// already structurally identical, so idempotent re-delivery does not churn
/// the UI.
pub(crate) fn upsert(list: &mut Vec<ApprovalRequest>, item: ApprovalRequest) -> bool {
    if let Some(existing) = list.iter_mut().find(|req| req.id == item.id) {
        if *existing == item {
            return false;
        }
        *existing = item;
        return true;
    }
    list.push(item);
    true
}

pub(crate) fn remove(list: &mut Vec<ApprovalRequest>, request_id: u64) -> bool {
    let before = list.len();
    list.retain(|req| req.id != request_id);
    list.len() != before
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Presentation {
    pub(crate) summary: String,
    pub(crate) detail: String,
    pub(crate) context: Vec<String>,
}

enum MethodShape {
    Command,
    FileChange,
    UserInput,
    Other,
}

fn method_shape(method: &str) -> MethodShape {
    let method = method.to_ascii_lowercase();
    if method.contains("command") || method.contains("exec") {
        MethodShape::Command
    } else if method.contains("patch")
        || method.contains("file")
        || method.contains("write")
        || method.contains("edit")
    {
        MethodShape::FileChange
    } else if method.contains("input") || method.contains("question") || method.contains("prompt")
    {
        MethodShape::UserInput
    } else {
        MethodShape::Other
    }
}

/// Builds the human-readable presentation for an approval prompt from its
/// raw provider-specific parameters. Malformed or missing parameters
/// degrade to a generic "approval" summary; this never fails.
pub(crate) fn presentation_from_params(method: &str, params: Option<&Value>) -> Presentation {
    let empty = Value::Null;
    let params = match params {
        Some(value) if value.is_object() => value,
        _ => &empty,
    };

    let mut presentation = match method_shape(method) {
        MethodShape::Command => command_presentation(params),
        MethodShape::FileChange => file_change_presentation(params),
        MethodShape::UserInput => user_input_presentation(params),
        MethodShape::Other => permission_presentation(params).unwrap_or_default(),
    };

    if presentation.summary.is_empty() {
        presentation = generic_presentation(params);
    }
    presentation.context = finish_context(&presentation.detail, presentation.context);
    presentation
}

fn command_presentation(params: &Value) -> Presentation {
    let command = first_string(params, &["command", "parsed_command", "raw_command", "cmd"])
        .unwrap_or_default();
    if command.is_empty() {
        return Presentation::default();
    }
    Presentation {
        summary: "command".to_string(),
        detail: command,
        context: metadata_context(params),
    }
}

fn file_change_presentation(params: &Value) -> Presentation {
    let paths = string_list(params, &["files", "paths", "changes"]);
    let reason = first_string(params, &["reason", "description"]);
    let detail = reason
        .clone()
        .or_else(|| paths.first().cloned())
        .unwrap_or_default();
    if detail.is_empty() {
        return Presentation::default();
    }
    let mut context = Vec::new();
    for (idx, path) in paths.iter().enumerate() {
        // Skip the path already promoted to Detail.
        if reason.is_none() && idx == 0 {
            continue;
        }
        context.push(path.clone());
    }
    context.extend(metadata_context(params));
    Presentation {
        summary: "file change".to_string(),
        detail,
        context,
    }
}

fn user_input_presentation(params: &Value) -> Presentation {
    let mut questions = Vec::new();
    let mut options = Vec::new();
    if let Some(items) = params.get("questions").and_then(Value::as_array) {
        for item in items {
            match item {
                Value::String(text) => questions.push(text.clone()),
                Value::Object(map) => {
                    if let Some(text) = map.get("question").and_then(Value::as_str) {
                        questions.push(text.to_string());
                    }
                    if let Some(opts) = map.get("options").and_then(Value::as_array) {
                        let names: Vec<&str> = opts.iter().filter_map(Value::as_str).collect();
                        if !names.is_empty() {
                            options.push(format!("Options: {}", names.join(", ")));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if let Some(prompt) = first_string(params, &["prompt", "question"]) {
        if questions.is_empty() {
            questions.push(prompt);
        }
    }
    let Some(first) = questions.first().cloned() else {
        return Presentation::default();
    };
    let mut context: Vec<String> = questions.into_iter().skip(1).collect();
    context.extend(options);
    Presentation {
        summary: "input requested".to_string(),
        detail: first,
        context,
    }
}

const PERMISSION_KINDS: &[&str] = &["directory", "file", "network", "command"];

/// A permission-shaped payload requests access to directories, files,
/// network targets or commands without a recognized method name.
fn permission_presentation(params: &Value) -> Option<Presentation> {
    let kind = first_string(params, &["kind", "type", "access"])?;
    let kind = kind.to_ascii_lowercase();
    if !PERMISSION_KINDS.contains(&kind.as_str()) {
        return None;
    }
    let mut targets = string_list(params, &["paths", "targets", "urls"]);
    if targets.is_empty() {
        if let Some(single) = first_string(params, &["path", "target", "url"]) {
            targets.push(single);
        }
    }
    let detail = targets.first().cloned().unwrap_or_default();
    let context = targets
        .into_iter()
        .skip(1)
        .map(|target| format!("Target: {target}"))
        .collect();
    Some(Presentation {
        summary: format!("{kind} access"),
        detail,
        context,
    })
}

fn generic_presentation(params: &Value) -> Presentation {
    Presentation {
        summary: "approval".to_string(),
        detail: first_string(params, &["reason", "description", "summary"]).unwrap_or_default(),
        context: metadata_context(params),
    }
}

fn first_string(params: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match params.get(key) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                return Some(text.trim().to_string());
            }
            Some(Value::Array(items)) => {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                if !parts.is_empty() {
                    return Some(parts.join(" "));
                }
            }
            _ => {}
        }
    }
    None
}

fn string_list(params: &Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        let Some(items) = params.get(key).and_then(Value::as_array) else {
            continue;
        };
        let mut out = Vec::new();
        for item in items {
            match item {
                Value::String(text) if !text.trim().is_empty() => {
                    out.push(text.trim().to_string());
                }
                Value::Object(map) => {
                    if let Some(path) = map.get("path").and_then(Value::as_str) {
                        out.push(path.to_string());
                    }
                }
                _ => {}
            }
        }
        if !out.is_empty() {
            return out;
        }
    }
    Vec::new()
}

/// Exposes scalar metadata fields as "Key: value" context lines.
fn metadata_context(params: &Value) -> Vec<String> {
    let Some(map) = params.get("metadata").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut out = Vec::new();
    for key in keys {
        let rendered = match &map[key] {
            Value::String(text) if !text.trim().is_empty() => text.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        out.push(format!("{}: {}", title_case(key), rendered));
    }
    out
}

fn title_case(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Session and permission identifiers must never reach the operator.
fn is_identifier_line(line: &str) -> bool {
    let Some((key, _)) = line.split_once(':') else {
        return false;
    };
    let key = key.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    key == "id"
        || key.ends_with("_id")
        || (key.contains("session") && key.contains("id"))
        || (key.contains("permission") && key.contains("id"))
}

/// Shared context rules: identifier redaction, suppression of lines whose
/// value repeats the detail, and case-insensitive dedup.
fn finish_context(detail: &str, lines: Vec<String>) -> Vec<String> {
    let detail_norm = detail.trim().to_ascii_lowercase();
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || is_identifier_line(trimmed) {
            continue;
        }
        let value = trimmed
            .split_once(':')
            .map(|(_, value)| value.trim())
            .unwrap_or(trimmed);
        if !detail_norm.is_empty() && value.to_ascii_lowercase() == detail_norm {
            continue;
        }
        if !seen.insert(trimmed.to_ascii_lowercase()) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

pub(crate) fn request_block(req: &ApprovalRequest) -> Block {
    let mut text = format!("[approval] {}", req.summary);
    if !req.detail.is_empty() {
        text.push_str(": ");
        text.push_str(&req.detail);
    }
    for line in &req.context {
        text.push('\n');
        text.push_str(line);
    }
    Block {
        kind: BlockKind::Approval,
        text,
        session_id: Some(req.session_id.clone()),
        request_id: Some(req.id),
    }
}

pub(crate) fn resolution_block(res: &ApprovalResolution) -> Block {
    let mut text = format!("[{}] {}", res.decision.verdict(), res.summary);
    if !res.detail.is_empty() {
        text.push_str(": ");
        text.push_str(&res.detail);
    }
    Block {
        kind: BlockKind::Approval,
        text,
        session_id: Some(res.session_id.clone()),
        request_id: Some(res.id),
    }
}

/// Re-renders approval-tagged entries from the current request/resolution
/// sets. A resolution always wins over a pending request with the same id;
/// unmatched new requests and resolutions are appended at the end.
pub(crate) fn merge_into_blocks(
    blocks: Vec<Block>,
    requests: &[ApprovalRequest],
    resolutions: &[ApprovalResolution],
) -> Vec<Block> {
    let mut seen: HashSet<u64> = HashSet::new();
    let mut out = Vec::with_capacity(blocks.len());
    for block in blocks {
        if !block.is_approval() {
            out.push(block);
            continue;
        }
        let Some(id) = block.request_id else {
            out.push(block);
            continue;
        };
        seen.insert(id);
        if let Some(res) = resolutions.iter().find(|res| res.id == id) {
            out.push(resolution_block(res));
        } else if let Some(req) = requests.iter().find(|req| req.id == id) {
            out.push(request_block(req));
        } else {
            // Neither side knows this id anymore; keep the old rendering.
            out.push(block);
        }
    }
    for req in requests {
        if seen.contains(&req.id) || resolutions.iter().any(|res| res.id == req.id) {
            continue;
        }
        seen.insert(req.id);
        out.push(request_block(req));
    }
    for res in resolutions {
        if seen.insert(res.id) {
            out.push(resolution_block(res));
        }
    }
    out
}

/// Keeps approval prompts visually anchored across refreshes: each request
/// id remembers how many non-approval entries preceded it in `previous`,
/// and is re-inserted at the same gap index in `next` (clamped to bounds).
/// Entries without an anchor are appended in arrival order.
pub(crate) fn preserve_positions(previous: &[Block], next: Vec<Block>) -> Vec<Block> {
    let mut anchors: HashMap<u64, usize> = HashMap::new();
    let mut gap = 0usize;
    for block in previous {
        if block.is_approval() {
            if let Some(id) = block.request_id {
                anchors.entry(id).or_insert(gap);
            }
        } else {
            gap += 1;
        }
    }

    let mut plain = Vec::new();
    let mut approvals = Vec::new();
    for block in next {
        if block.is_approval() {
            approvals.push(block);
        } else {
            plain.push(block);
        }
    }

    let mut anchored: Vec<(usize, usize, Block)> = Vec::new();
    let mut tail = Vec::new();
    for (arrival, block) in approvals.into_iter().enumerate() {
        match block.request_id.and_then(|id| anchors.get(&id).copied()) {
            Some(anchor) => anchored.push((anchor.min(plain.len()), arrival, block)),
            None => tail.push(block),
        }
    }
    anchored.sort_by_key(|(anchor, arrival, _)| (*anchor, *arrival));

    let mut out = Vec::with_capacity(plain.len() + anchored.len() + tail.len());
    let mut pending = anchored.into_iter().peekable();
    for (idx, block) in plain.into_iter().enumerate() {
        while let Some((_, _, approval)) = pending.next_if(|(anchor, _, _)| *anchor <= idx) {
            out.push(approval);
        }
        out.push(block);
    }
    for (_, _, approval) in pending {
        out.push(approval);
    }
    out.extend(tail);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn req(id: u64, detail: &str, created_at: u64) -> ApprovalRequest {
        ApprovalRequest {
            id,
            session_id: "s1".to_string(),
            method: "command_execution".to_string(),
            summary: "command".to_string(),
            detail: detail.to_string(),
            context: Vec::new(),
            created_at,
        }
    }

    fn res(id: u64, decision: Decision, resolved_at: u64) -> ApprovalResolution {
        ApprovalResolution {
            id,
            session_id: "s1".to_string(),
            method: "command_execution".to_string(),
            summary: "command".to_string(),
            detail: format!("cmd {id}"),
            decision,
            resolved_at,
        }
    }

    #[test]
    fn normalize_keeps_latest_created_duplicate() {
        let items = vec![req(1, "x", 10), req(1, "y", 20)];
        let out = normalize_requests(items);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].detail, "y");
    }

    #[test]
    fn normalize_sorts_by_created_then_id() {
        let items = vec![req(3, "c", 30), req(1, "a", 10), req(2, "b", 10)];
        let ids: Vec<u64> = normalize_requests(items).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn upsert_reports_unchanged_for_identical_entry() {
        let mut list = vec![req(1, "x", 10)];
        assert!(!upsert(&mut list, req(1, "x", 10)));
        assert!(upsert(&mut list, req(1, "y", 11)));
        assert!(upsert(&mut list, req(2, "z", 12)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_reports_whether_entry_existed() {
        let mut list = vec![req(1, "x", 10)];
        assert!(remove(&mut list, 1));
        assert!(!remove(&mut list, 1));
        assert!(list.is_empty());
    }

    #[test]
    fn command_presentation_prefers_command_field() {
        let params = json!({ "command": "go test ./...", "metadata": { "cwd": "/repo" } });
        let p = presentation_from_params("command_execution", Some(&params));
        assert_eq!(p.summary, "command");
        assert_eq!(p.detail, "go test ./...");
        assert_eq!(p.context, vec!["Cwd: /repo".to_string()]);
    }

    #[test]
    fn command_reason_matching_command_is_suppressed() {
        let params = json!({
            "command": "go test ./...",
            "metadata": { "reason": "GO TEST ./..." }
        });
        let p = presentation_from_params("command_execution", Some(&params));
        assert_eq!(p.detail, "go test ./...");
        assert!(!p.context.iter().any(|line| line.starts_with("Reason:")));
    }

    #[test]
    fn identifier_fields_never_reach_context() {
        let params = json!({
            "command": "ls",
            "metadata": {
                "session_id": "sess-123",
                "permission id": "perm-9",
                "reason": "list files"
            }
        });
        let p = presentation_from_params("command_execution", Some(&params));
        assert_eq!(p.context, vec!["Reason: list files".to_string()]);
    }

    #[test]
    fn duplicate_context_lines_are_deduped_case_insensitively() {
        let params = json!({
            "kind": "directory",
            "paths": ["/a", "/B", "/b"]
        });
        let p = presentation_from_params("session/request_permission", Some(&params));
        assert_eq!(p.summary, "directory access");
        assert_eq!(p.detail, "/a");
        assert_eq!(p.context, vec!["Target: /B".to_string()]);
    }

    #[test]
    fn file_change_prefers_reason_and_lists_paths() {
        let params = json!({
            "reason": "apply refactor",
            "files": ["src/a.rs", "src/b.rs"]
        });
        let p = presentation_from_params("file_edit", Some(&params));
        assert_eq!(p.summary, "file change");
        assert_eq!(p.detail, "apply refactor");
        assert_eq!(p.context, vec!["src/a.rs".to_string(), "src/b.rs".to_string()]);
    }

    #[test]
    fn user_input_uses_first_question_and_appends_rest() {
        let params = json!({
            "questions": [
                { "question": "Pick a color", "options": ["red", "blue"] },
                "Anything else?"
            ]
        });
        let p = presentation_from_params("request_user_input", Some(&params));
        assert_eq!(p.summary, "input requested");
        assert_eq!(p.detail, "Pick a color");
        assert_eq!(
            p.context,
            vec!["Anything else?".to_string(), "Options: red, blue".to_string()]
        );
    }

    #[test]
    fn malformed_params_degrade_to_generic_approval() {
        let p = presentation_from_params("mystery_method", None);
        assert_eq!(p.summary, "approval");
        assert_eq!(p.detail, "");
        assert!(p.context.is_empty());

        let not_an_object = json!("oops");
        let p = presentation_from_params("mystery_method", Some(&not_an_object));
        assert_eq!(p.summary, "approval");
    }

    #[test]
    fn merge_replaces_pending_request_with_resolution() {
        let blocks = vec![
            Block::new(BlockKind::User, "hello"),
            request_block(&req(7, "rm -rf target", 10)),
        ];
        let resolution = res(7, Decision::Approved, 20);
        let merged = merge_into_blocks(blocks, &[], &[resolution]);
        assert_eq!(merged.len(), 2);
        assert!(merged[1].text.starts_with("[approved]"));
        assert_eq!(merged[1].request_id, Some(7));
    }

    #[test]
    fn merge_appends_unmatched_requests_and_resolutions() {
        let blocks = vec![Block::new(BlockKind::User, "hello")];
        let merged = merge_into_blocks(
            blocks,
            &[req(1, "ls", 10), req(2, "pwd", 11)],
            &[res(2, Decision::Declined, 12)],
        );
        // Request 2 has a resolution, so only the resolution appears for it.
        assert_eq!(merged.len(), 3);
        assert!(merged[1].text.contains("ls"));
        assert!(merged[2].text.starts_with("[declined]"));
    }

    #[test]
    fn merge_maps_other_decision_to_resolved() {
        let merged = merge_into_blocks(Vec::new(), &[], &[res(3, Decision::Other, 5)]);
        assert!(merged[0].text.starts_with("[resolved]"));
    }

    #[test]
    fn preserve_positions_keeps_gap_anchors() {
        let approval_1 = request_block(&req(1, "a", 10));
        let approval_2 = request_block(&req(2, "b", 11));
        let previous = vec![
            Block::new(BlockKind::User, "User"),
            Block::new(BlockKind::Agent, "Agent"),
            approval_1.clone(),
            approval_2.clone(),
            Block::new(BlockKind::User, "User2"),
        ];
        let next = vec![
            Block::new(BlockKind::User, "User"),
            Block::new(BlockKind::Agent, "Agent"),
            Block::new(BlockKind::User, "User2"),
            approval_1.clone(),
            approval_2.clone(),
        ];
        let out = preserve_positions(&previous, next);
        let texts: Vec<&str> = out.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "User",
                "Agent",
                approval_1.text.as_str(),
                approval_2.text.as_str(),
                "User2"
            ]
        );
    }

    #[test]
    fn preserve_positions_clamps_out_of_range_anchor() {
        let approval = request_block(&req(5, "x", 10));
        let previous = vec![
            Block::new(BlockKind::User, "a"),
            Block::new(BlockKind::User, "b"),
            Block::new(BlockKind::User, "c"),
            approval.clone(),
        ];
        let next = vec![Block::new(BlockKind::User, "a"), approval.clone()];
        let out = preserve_positions(&previous, next);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].request_id, Some(5));
    }

    #[test]
    fn preserve_positions_appends_unanchored_in_arrival_order() {
        let a = request_block(&req(1, "a", 10));
        let b = request_block(&req(2, "b", 11));
        let next = vec![Block::new(BlockKind::User, "u"), b.clone(), a.clone()];
        let out = preserve_positions(&[], next);
        let ids: Vec<Option<u64>> = out.iter().map(|blk| blk.request_id).collect();
        assert_eq!(ids, vec![None, Some(2), Some(1)]);
    }
}
