use serde::{Deserialize, Serialize};
use tracing::warn;

use super::*;

const SNAPSHOT_KEY: &str = "dashboard";

/// What survives a restart: run/ready/dismissed status and the selection.
/// Transcripts are not persisted; they re-project from the backend.
#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    recents: RecentsTracker,
    #[serde(default)]
    selected_key: Option<String>,
}

impl App {
    pub(super) fn persist_snapshot(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = StateSnapshot {
            recents: self.recents.clone(),
            selected_key: self.selected_row().map(|row| row.key.clone()),
        };
        match serde_json::to_string(&snapshot) {
            Ok(raw) => {
                if let Err(err) = store.put_blob(SNAPSHOT_KEY, &raw) {
                    warn!("persist snapshot failed: {err:#}");
                }
            }
            Err(err) => warn!("serialize snapshot failed: {err}"),
        }
    }

    pub(super) fn restore_snapshot(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let raw = match store.get_blob(SNAPSHOT_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(err) => {
                warn!("read snapshot failed: {err:#}");
                return;
            }
        };
        match serde_json::from_str::<StateSnapshot>(&raw) {
            Ok(snapshot) => {
                self.recents = snapshot.recents;
                self.restored_selection = snapshot.selected_key;
            }
            // A snapshot from an incompatible build starts fresh.
            Err(err) => warn!("parse snapshot failed: {err}"),
        }
    }
}
