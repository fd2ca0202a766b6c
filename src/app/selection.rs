use super::types::{session_id_from_row_key, RowEntry, RowKind};

/// Resolves a session identity to its current row key when the previously
/// selected key is gone from the rebuilt list. Implemented over the full
/// session set, not the visible rows, so a session that was renamed or
/// resumed under a new id still counts as the same selection.
pub(crate) trait SessionLookup {
    fn row_key(&self, session_id: &str) -> Option<String>;
}

impl<F> SessionLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn row_key(&self, session_id: &str) -> Option<String> {
        self(session_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SelectReason {
    SameKey,
    SameSession,
    ActiveContext,
    FirstSession,
    FirstRow,
    Empty,
}

/// Ranked candidate keys, one per strategy that produced a hit, duplicates
/// filtered. The first candidate wins; the rest remain for fallback and for
/// asserting why a selection moved.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SelectionDecision {
    pub(crate) candidates: Vec<String>,
    pub(crate) reason: SelectReason,
}

impl SelectionDecision {
    fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            reason: SelectReason::Empty,
        }
    }

    pub(crate) fn winner(&self) -> Option<&str> {
        self.candidates.first().map(String::as_str)
    }
}

/// What the controller knew before the row list was rebuilt.
#[derive(Clone, Debug, Default)]
pub(crate) struct SelectionContext {
    pub(crate) previous_key: Option<String>,
    pub(crate) active_workspace: Option<String>,
    pub(crate) active_worktree: Option<String>,
    /// True when the dashboard is not the focused surface; selection then
    /// prefers stability over context-following.
    pub(crate) background: bool,
}

fn context_row_key(workspace: &str, worktree: Option<&str>) -> String {
    match worktree {
        Some(tree) => format!("wt:{workspace}/{tree}"),
        None => format!("ws:{workspace}"),
    }
}

fn find_key<'a>(rows: &'a [RowEntry], key: &str) -> Option<&'a RowEntry> {
    rows.iter().find(|row| row.key == key)
}

fn first_session(rows: &[RowEntry]) -> Option<&RowEntry> {
    rows.iter().find(|row| row.kind == RowKind::Session)
}

/// Picks the row to select after a rebuild. Strategies are tried in order;
/// every hit becomes a ranked candidate and the first one wins.
pub(crate) fn reconcile(
    rows: &[RowEntry],
    ctx: &SelectionContext,
    lookup: &dyn SessionLookup,
) -> SelectionDecision {
    if rows.is_empty() {
        return SelectionDecision::empty();
    }

    let mut candidates: Vec<String> = Vec::new();
    let mut reason = None;
    let mut push = |candidates: &mut Vec<String>, key: String, why: SelectReason| {
        if !candidates.contains(&key) {
            candidates.push(key);
            if reason.is_none() {
                reason = Some(why);
            }
        }
    };

    if let Some(prev) = ctx.previous_key.as_deref() {
        // 1. The exact previous key survived the rebuild.
        if find_key(rows, prev).is_some() {
            push(&mut candidates, prev.to_string(), SelectReason::SameKey);
        }

        // 2. Same session identity under a different row key. The lookup
        // answers existence beyond the visible rows, so the candidate is
        // kept even when its row is currently filtered out of view.
        if let Some(session_id) = session_id_from_row_key(prev) {
            if let Some(key) = lookup.row_key(session_id) {
                push(&mut candidates, key, SelectReason::SameSession);
            }
        }
    }

    // 3. Fall back to the active workspace/worktree context row. While in
    // the background a vanished session row must not jump to a container
    // row; land on the first session instead so a transcript stays up.
    if let Some(workspace) = ctx.active_workspace.as_deref() {
        let was_session = ctx
            .previous_key
            .as_deref()
            .is_some_and(|prev| session_id_from_row_key(prev).is_some());
        if ctx.background && was_session {
            if let Some(row) = first_session(rows) {
                push(&mut candidates, row.key.clone(), SelectReason::FirstSession);
            }
        }
        let key = context_row_key(workspace, ctx.active_worktree.as_deref());
        if find_key(rows, &key).is_some() {
            push(&mut candidates, key, SelectReason::ActiveContext);
        }
    }

    // 4. First session row, 5. first row of any kind.
    if let Some(row) = first_session(rows) {
        push(&mut candidates, row.key.clone(), SelectReason::FirstSession);
    }
    push(&mut candidates, rows[0].key.clone(), SelectReason::FirstRow);

    SelectionDecision {
        candidates,
        reason: reason.unwrap_or(SelectReason::FirstRow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::app::types::SessionMeta;

    fn meta(id: &str, workspace: &str) -> SessionMeta {
        SessionMeta {
            id: id.to_string(),
            title: id.to_string(),
            workspace: workspace.to_string(),
            worktree: None,
            key: None,
            provider: None,
            turn_id: None,
            busy: false,
        }
    }

    fn rows() -> Vec<RowEntry> {
        vec![
            RowEntry::workspace("alpha"),
            RowEntry::session(&meta("s1", "alpha"), "s1".to_string()),
            RowEntry::session(&meta("s2", "alpha"), "s2".to_string()),
            RowEntry::worktree("alpha", "feature"),
        ]
    }

    fn no_sessions(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn previous_key_wins_when_still_present() {
        let ctx = SelectionContext {
            previous_key: Some("sess:s2".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &no_sessions);
        assert_eq!(decision.reason, SelectReason::SameKey);
        assert_eq!(decision.winner(), Some("sess:s2"));
    }

    #[test]
    fn same_session_resolves_through_lookup() {
        // The session was resumed under a new id; the lookup maps the old
        // identity to the row it now occupies.
        let lookup = |id: &str| (id == "s1-old").then(|| "sess:s1".to_string());
        let ctx = SelectionContext {
            previous_key: Some("sess:s1-old".to_string()),
            active_workspace: Some("alpha".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &lookup);
        assert_eq!(decision.reason, SelectReason::SameSession);
        assert_eq!(decision.winner(), Some("sess:s1"));
    }

    #[test]
    fn identity_candidate_survives_row_filtering() {
        // The session still exists but its row is filtered out of view; it
        // stays the preferred candidate, visible fallbacks ranked behind.
        let lookup = |id: &str| (id == "hidden").then(|| "sess:hidden".to_string());
        let ctx = SelectionContext {
            previous_key: Some("sess:hidden".to_string()),
            active_workspace: Some("alpha".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &lookup);
        assert_eq!(decision.reason, SelectReason::SameSession);
        assert_eq!(decision.winner(), Some("sess:hidden"));
        assert_eq!(
            decision.candidates,
            vec!["sess:hidden", "ws:alpha", "sess:s1"]
        );
    }

    #[test]
    fn vanished_session_falls_back_to_active_context() {
        let ctx = SelectionContext {
            previous_key: Some("sess:gone".to_string()),
            active_workspace: Some("alpha".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &no_sessions);
        assert_eq!(decision.reason, SelectReason::ActiveContext);
        assert_eq!(decision.winner(), Some("ws:alpha"));
    }

    #[test]
    fn active_worktree_context_is_preferred_over_workspace() {
        let ctx = SelectionContext {
            previous_key: Some("sess:gone".to_string()),
            active_workspace: Some("alpha".to_string()),
            active_worktree: Some("feature".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &no_sessions);
        assert_eq!(decision.reason, SelectReason::ActiveContext);
        assert_eq!(decision.winner(), Some("wt:alpha/feature"));
    }

    #[test]
    fn background_session_loss_lands_on_first_session_not_container() {
        let ctx = SelectionContext {
            previous_key: Some("sess:gone".to_string()),
            active_workspace: Some("alpha".to_string()),
            background: true,
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &no_sessions);
        assert_eq!(decision.reason, SelectReason::FirstSession);
        assert_eq!(decision.winner(), Some("sess:s1"));
    }

    #[test]
    fn background_container_loss_still_uses_context() {
        let ctx = SelectionContext {
            previous_key: Some("wt:alpha/gone".to_string()),
            active_workspace: Some("alpha".to_string()),
            background: true,
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &no_sessions);
        assert_eq!(decision.reason, SelectReason::ActiveContext);
        assert_eq!(decision.winner(), Some("ws:alpha"));
    }

    #[test]
    fn no_context_falls_back_to_first_session() {
        let ctx = SelectionContext {
            previous_key: Some("sess:gone".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &no_sessions);
        assert_eq!(decision.reason, SelectReason::FirstSession);
        assert_eq!(decision.winner(), Some("sess:s1"));
    }

    #[test]
    fn container_only_rows_select_first_row() {
        let rows = vec![RowEntry::workspace("alpha"), RowEntry::workspace("beta")];
        let decision = reconcile(&rows, &SelectionContext::default(), &no_sessions);
        assert_eq!(decision.reason, SelectReason::FirstRow);
        assert_eq!(decision.winner(), Some("ws:alpha"));
    }

    #[test]
    fn decision_retains_ranked_fallback_candidates() {
        let lookup = |id: &str| (id == "s1").then(|| "sess:s1".to_string());
        let ctx = SelectionContext {
            previous_key: Some("sess:s1".to_string()),
            active_workspace: Some("alpha".to_string()),
            ..SelectionContext::default()
        };
        let decision = reconcile(&rows(), &ctx, &lookup);
        assert_eq!(decision.reason, SelectReason::SameKey);
        // The same-session and first-session hits duplicate the winner and
        // are filtered; the context fallback stays ranked behind it.
        assert_eq!(decision.candidates, vec!["sess:s1", "ws:alpha"]);
    }

    #[test]
    fn empty_rows_yield_empty_decision() {
        let decision = reconcile(&[], &SelectionContext::default(), &no_sessions);
        assert_eq!(decision.reason, SelectReason::Empty);
        assert_eq!(decision.winner(), None);
    }
}
