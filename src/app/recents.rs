use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::SessionId;

/// Sentinel completion turn used when neither the completion signal nor the
/// running baseline carried a turn marker.
pub(crate) const UNKNOWN_TURN: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct RunningRun {
    pub(crate) session_id: SessionId,
    /// Turn marker observed when the run started; used to reject completion
    /// signals belonging to a superseded run.
    pub(crate) baseline_turn: String,
    pub(crate) started_at: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ReadyItem {
    pub(crate) session_id: SessionId,
    pub(crate) completion_turn: String,
    pub(crate) completed_at: u64,
    pub(crate) last_known_turn: String,
    seq: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RecentsEvent {
    RunStarted {
        session_id: SessionId,
        baseline_turn: String,
        at: u64,
    },
    RunCompleted {
        session_id: SessionId,
        /// When present, must match the running baseline or the event is
        /// dropped (a completion racing a newer start).
        expected_turn: Option<String>,
        completion_turn: Option<String>,
        at: u64,
    },
    /// Lower-confidence completion path for providers that only expose
    /// periodic metadata polling.
    MetaObserved {
        session_id: SessionId,
        observed_turn: String,
        at: u64,
    },
    ReadyDismissed {
        session_id: SessionId,
    },
    SessionsPruned {
        present: Vec<SessionId>,
    },
}

/// Event-sourced tracker of per-session run/ready/dismissed status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct RecentsTracker {
    running: HashMap<SessionId, RunningRun>,
    ready: HashMap<SessionId, ReadyItem>,
    /// Completion order for display, distinct from the lookup map.
    ready_order: Vec<(SessionId, u64)>,
    /// Last completion turn the user explicitly dismissed, per session.
    dismissed: HashMap<SessionId, String>,
    next_seq: u64,
}

impl RecentsTracker {
    /// Applies one event; returns whether any tracked state changed.
    pub(crate) fn apply(&mut self, event: RecentsEvent) -> bool {
        match event {
            RecentsEvent::RunStarted {
                session_id,
                baseline_turn,
                at,
            } => {
                if let Some(run) = self.running.get(&session_id) {
                    if run.baseline_turn == baseline_turn {
                        return false;
                    }
                }
                // A fresh run supersedes stale completion memory.
                self.drop_ready(&session_id);
                self.dismissed.remove(&session_id);
                self.running.insert(
                    session_id.clone(),
                    RunningRun {
                        session_id,
                        baseline_turn,
                        started_at: at,
                    },
                );
                true
            }
            RecentsEvent::RunCompleted {
                session_id,
                expected_turn,
                completion_turn,
                at,
            } => {
                let Some(run) = self.running.get(&session_id) else {
                    return false;
                };
                if let Some(expected) = &expected_turn {
                    if *expected != run.baseline_turn {
                        debug!(
                            session = %session_id,
                            expected = %expected,
                            baseline = %run.baseline_turn,
                            "completion for superseded run dropped"
                        );
                        return false;
                    }
                }
                let baseline = run.baseline_turn.clone();
                let completion = completion_turn
                    .filter(|turn| !turn.is_empty())
                    .unwrap_or_else(|| {
                        if baseline.is_empty() {
                            UNKNOWN_TURN.to_string()
                        } else {
                            baseline.clone()
                        }
                    });
                self.running.remove(&session_id);
                if self.dismissed.get(&session_id) == Some(&completion) {
                    // Duplicate completion after an explicit dismissal.
                    return true;
                }
                self.next_seq += 1;
                let seq = self.next_seq;
                self.ready.insert(
                    session_id.clone(),
                    ReadyItem {
                        session_id: session_id.clone(),
                        completion_turn: completion,
                        completed_at: at,
                        last_known_turn: baseline,
                        seq,
                    },
                );
                self.ready_order.push((session_id, seq));
                true
            }
            RecentsEvent::MetaObserved {
                session_id,
                observed_turn,
                at,
            } => {
                let Some(run) = self.running.get(&session_id) else {
                    return false;
                };
                if run.baseline_turn == observed_turn {
                    return false;
                }
                self.apply(RecentsEvent::RunCompleted {
                    session_id,
                    expected_turn: None,
                    completion_turn: Some(observed_turn),
                    at,
                })
            }
            RecentsEvent::ReadyDismissed { session_id } => {
                let Some(item) = self.ready.remove(&session_id) else {
                    return false;
                };
                self.ready_order
                    .retain(|(id, seq)| !(*id == session_id && *seq == item.seq));
                self.dismissed.insert(session_id, item.completion_turn);
                true
            }
            RecentsEvent::SessionsPruned { present } => {
                let keep: HashSet<&SessionId> = present.iter().collect();
                let before =
                    self.running.len() + self.ready.len() + self.dismissed.len();
                self.running.retain(|id, _| keep.contains(id));
                self.ready.retain(|id, _| keep.contains(id));
                self.dismissed.retain(|id, _| keep.contains(id));
                self.ready_order.retain(|(id, _)| keep.contains(id));
                before != self.running.len() + self.ready.len() + self.dismissed.len()
            }
        }
    }

    fn drop_ready(&mut self, session_id: &str) {
        if self.ready.remove(session_id).is_some() {
            self.ready_order.retain(|(id, _)| id != session_id);
        }
    }

    /// Running sessions ordered by start time, then id for determinism.
    pub(crate) fn running_ids(&self) -> Vec<SessionId> {
        let mut runs: Vec<&RunningRun> = self.running.values().collect();
        runs.sort_by(|a, b| {
            (a.started_at, &a.session_id).cmp(&(b.started_at, &b.session_id))
        });
        runs.into_iter().map(|run| run.session_id.clone()).collect()
    }

    /// Ready sessions in completion order, filtered to currently-valid
    /// entries so a dismissed or pruned session never resurfaces from a
    /// stale order slot.
    pub(crate) fn ready_ids(&self) -> Vec<SessionId> {
        self.ready_order
            .iter()
            .filter(|(id, seq)| self.ready.get(id).is_some_and(|item| item.seq == *seq))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn is_running(&self, session_id: &str) -> bool {
        self.running.contains_key(session_id)
    }

    pub(crate) fn is_ready(&self, session_id: &str) -> bool {
        self.ready.contains_key(session_id)
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn baseline_turn(&self, session_id: &str) -> Option<&str> {
        self.running
            .get(session_id)
            .map(|run| run.baseline_turn.as_str())
    }

    pub(crate) fn ready_item(&self, session_id: &str) -> Option<&ReadyItem> {
        self.ready.get(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str, baseline: &str, at: u64) -> RecentsEvent {
        RecentsEvent::RunStarted {
            session_id: id.to_string(),
            baseline_turn: baseline.to_string(),
            at,
        }
    }

    fn completed(id: &str, completion: Option<&str>, at: u64) -> RecentsEvent {
        RecentsEvent::RunCompleted {
            session_id: id.to_string(),
            expected_turn: None,
            completion_turn: completion.map(str::to_string),
            at,
        }
    }

    #[test]
    fn start_then_complete_moves_session_to_ready() {
        let mut tracker = RecentsTracker::default();
        assert!(tracker.apply(started("s1", "t0", 1)));
        assert!(tracker.apply(completed("s1", Some("t1"), 2)));

        assert_eq!(tracker.ready_ids(), vec!["s1".to_string()]);
        assert!(tracker.running_ids().is_empty());
        assert_eq!(tracker.ready_item("s1").unwrap().completion_turn, "t1");
        assert_eq!(tracker.ready_item("s1").unwrap().last_known_turn, "t0");
    }

    #[test]
    fn restart_with_same_baseline_is_noop() {
        let mut tracker = RecentsTracker::default();
        assert!(tracker.apply(started("s1", "t0", 1)));
        assert!(!tracker.apply(started("s1", "t0", 9)));
        assert_eq!(tracker.running_ids(), vec!["s1".to_string()]);
    }

    #[test]
    fn restart_clears_ready_and_dismissed_memory() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t0", 1));
        tracker.apply(completed("s1", Some("t1"), 2));
        tracker.apply(RecentsEvent::ReadyDismissed {
            session_id: "s1".to_string(),
        });

        tracker.apply(started("s1", "t1", 3));
        tracker.apply(completed("s1", Some("t1"), 4));

        // The dismissal of t1 was forgotten by the fresh run.
        assert_eq!(tracker.ready_ids(), vec!["s1".to_string()]);
    }

    #[test]
    fn completion_without_running_entry_is_ignored() {
        let mut tracker = RecentsTracker::default();
        assert!(!tracker.apply(completed("s1", Some("t1"), 2)));
        assert!(tracker.ready_ids().is_empty());
    }

    #[test]
    fn duplicate_completion_is_idempotent() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t0", 1));
        tracker.apply(completed("s1", Some("t1"), 2));
        let snapshot = tracker.clone();

        tracker.apply(completed("s1", Some("t1"), 3));
        assert_eq!(tracker, snapshot);
    }

    #[test]
    fn expected_turn_guard_drops_stale_completion() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t5", 1));
        let stale = RecentsEvent::RunCompleted {
            session_id: "s1".to_string(),
            expected_turn: Some("t4".to_string()),
            completion_turn: Some("t5".to_string()),
            at: 2,
        };
        assert!(!tracker.apply(stale));
        assert!(tracker.is_running("s1"));
    }

    #[test]
    fn completion_turn_falls_back_to_baseline_then_sentinel() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t0", 1));
        tracker.apply(completed("s1", None, 2));
        assert_eq!(tracker.ready_item("s1").unwrap().completion_turn, "t0");

        tracker.apply(started("s2", "", 3));
        tracker.apply(completed("s2", None, 4));
        assert_eq!(
            tracker.ready_item("s2").unwrap().completion_turn,
            UNKNOWN_TURN
        );
    }

    #[test]
    fn meta_observed_forwards_only_on_turn_advance() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t0", 1));

        assert!(!tracker.apply(RecentsEvent::MetaObserved {
            session_id: "s1".to_string(),
            observed_turn: "t0".to_string(),
            at: 2,
        }));
        assert!(tracker.is_running("s1"));

        assert!(tracker.apply(RecentsEvent::MetaObserved {
            session_id: "s1".to_string(),
            observed_turn: "t1".to_string(),
            at: 3,
        }));
        assert_eq!(tracker.ready_ids(), vec!["s1".to_string()]);
    }

    #[test]
    fn dismiss_then_meta_observed_same_turn_does_not_re_enqueue() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t0", 1));
        tracker.apply(completed("s1", Some("t1"), 2));
        tracker.apply(RecentsEvent::ReadyDismissed {
            session_id: "s1".to_string(),
        });

        assert!(!tracker.apply(RecentsEvent::MetaObserved {
            session_id: "s1".to_string(),
            observed_turn: "t1".to_string(),
            at: 3,
        }));
        assert!(tracker.ready_ids().is_empty());
    }

    #[test]
    fn duplicate_completion_after_dismiss_is_suppressed() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "t0", 1));
        tracker.apply(completed("s1", Some("t1"), 2));
        tracker.apply(RecentsEvent::ReadyDismissed {
            session_id: "s1".to_string(),
        });

        // A straggling duplicate of the same completion for a run the
        // backend still reports as in flight.
        tracker.running.insert(
            "s1".to_string(),
            RunningRun {
                session_id: "s1".to_string(),
                baseline_turn: "t0".to_string(),
                started_at: 1,
            },
        );
        tracker.apply(RecentsEvent::MetaObserved {
            session_id: "s1".to_string(),
            observed_turn: "t1".to_string(),
            at: 3,
        });

        assert!(!tracker.is_ready("s1"));
        assert!(tracker.ready_ids().is_empty());
    }

    #[test]
    fn ready_queue_preserves_completion_order() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "a", 1));
        tracker.apply(started("s2", "b", 2));
        tracker.apply(started("s3", "c", 3));
        tracker.apply(completed("s2", Some("b2"), 4));
        tracker.apply(completed("s1", Some("a2"), 5));
        tracker.apply(completed("s3", Some("c2"), 6));

        assert_eq!(
            tracker.ready_ids(),
            vec!["s2".to_string(), "s1".to_string(), "s3".to_string()]
        );
    }

    #[test]
    fn running_ids_order_by_start_then_id() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s2", "a", 5));
        tracker.apply(started("s3", "b", 1));
        tracker.apply(started("s1", "c", 5));

        assert_eq!(
            tracker.running_ids(),
            vec!["s3".to_string(), "s1".to_string(), "s2".to_string()]
        );
    }

    #[test]
    fn prune_drops_absent_sessions_only() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "a", 1));
        tracker.apply(started("s2", "b", 2));
        tracker.apply(completed("s2", Some("b2"), 3));

        assert!(tracker.apply(RecentsEvent::SessionsPruned {
            present: vec!["s2".to_string()],
        }));

        assert!(!tracker.is_running("s1"));
        assert!(tracker.is_ready("s2"));
        assert_eq!(tracker.ready_ids(), vec!["s2".to_string()]);
        assert_eq!(tracker.running_count(), 0);
    }

    #[test]
    fn prune_with_empty_list_clears_everything() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "a", 1));
        tracker.apply(started("s2", "b", 2));
        tracker.apply(completed("s2", Some("b2"), 3));

        tracker.apply(RecentsEvent::SessionsPruned { present: Vec::new() });
        assert_eq!(tracker.running_count() + tracker.ready_count(), 0);
        assert!(tracker.ready_ids().is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_serde() {
        let mut tracker = RecentsTracker::default();
        tracker.apply(started("s1", "a", 1));
        tracker.apply(started("s2", "b", 2));
        tracker.apply(completed("s2", Some("b2"), 3));

        let raw = serde_json::to_string(&tracker).expect("serialize tracker");
        let restored: RecentsTracker = serde_json::from_str(&raw).expect("restore tracker");
        assert_eq!(restored, tracker);
    }
}
