use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::app::approvals::{
    normalize_requests, normalize_resolutions, ApprovalRequest, ApprovalResolution, Decision,
};
use crate::app::types::{ActivityRecord, RunSignal, SessionMeta, WorkerEvent};

pub(crate) const REPLY_POLL_ATTEMPTS: u32 = 10;
pub(crate) const REPLY_POLL_DELAY_MS: u64 = 600;
const REPLY_POLL_TAIL: usize = 32;
const STREAM_POLL_MS: u64 = 300;

/// Marker error for operations that target a session the backend no longer
/// knows about. The owner compensates locally instead of surfacing it as a
/// transport failure.
#[derive(Debug)]
pub(crate) struct NotFound {
    pub(crate) session_id: String,
}

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {} not found", self.session_id)
    }
}

impl std::error::Error for NotFound {}

/// Maps a background failure onto the message the owner consumes.
pub(crate) fn failure_event(err: anyhow::Error, context: &str) -> WorkerEvent {
    if let Some(not_found) = err.root_cause().downcast_ref::<NotFound>() {
        return WorkerEvent::NotFound {
            session_id: not_found.session_id.clone(),
            context: context.to_string(),
        };
    }
    WorkerEvent::TransportError {
        context: context.to_string(),
        message: format!("{err:#}"),
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Owner-held handle to a background unit of work. Dropping the handle
/// cancels the work, so replacing a handle in a map retires its predecessor.
#[derive(Debug)]
pub(crate) struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn token(&self) -> CancelToken {
        CancelToken(self.flag.clone())
    }

    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub(crate) trait SessionLister {
    fn list_sessions(&self) -> Result<Vec<SessionMeta>>;
}

pub(crate) trait ApprovalGateway {
    fn list_approvals(
        &self,
        session_id: &str,
    ) -> Result<(Vec<ApprovalRequest>, Vec<ApprovalResolution>)>;
    fn decide(&self, session_id: &str, request_id: u64, approved: bool) -> Result<()>;
}

pub(crate) trait Transcripts {
    fn fetch_history(&self, session_id: &str) -> Result<Vec<ActivityRecord>>;
    fn fetch_tail(&self, session_id: &str, limit: usize) -> Result<Vec<ActivityRecord>>;
}

pub(crate) trait SessionControl {
    fn send_message(&self, session_id: &str, text: &str) -> Result<()>;
    fn interrupt(&self, session_id: &str) -> Result<()>;
}

pub(crate) trait EventStreams {
    /// Starts delivering live events for a session until the token cancels.
    /// Items arrive as `WorkerEvent`s on `tx`; the implementation owns its
    /// own thread and must exit promptly once cancelled.
    fn open_stream(
        &self,
        session_id: &str,
        key: String,
        token: CancelToken,
        tx: Sender<WorkerEvent>,
    ) -> Result<()>;
}

pub(crate) trait Backend:
    SessionLister + ApprovalGateway + Transcripts + SessionControl + EventStreams + Send + Sync
{
}

impl<T> Backend for T where
    T: SessionLister + ApprovalGateway + Transcripts + SessionControl + EventStreams + Send + Sync
{
}

/// Decides whether a turn advance observed only through metadata polling
/// counts as a completed run. Stream-delivered completions always count;
/// this only gates the lower-confidence fallback path.
pub(crate) trait CompletionPolicy: Send + Sync {
    fn trust_metadata_completion(&self, provider: Option<&str>) -> bool;
}

pub(crate) struct DefaultCompletionPolicy {
    trusted: Vec<String>,
}

impl DefaultCompletionPolicy {
    pub(crate) fn from_env() -> Self {
        let trusted = match std::env::var("AGENTDECK_TRUSTED_PROVIDERS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => vec!["codex".to_string(), "claude".to_string()],
        };
        Self { trusted }
    }
}

impl CompletionPolicy for DefaultCompletionPolicy {
    fn trust_metadata_completion(&self, provider: Option<&str>) -> bool {
        match provider {
            Some(name) => self.trusted.iter().any(|t| t == &name.to_ascii_lowercase()),
            None => false,
        }
    }
}

pub(crate) fn spawn_session_refresh(backend: Arc<dyn Backend>, tx: Sender<WorkerEvent>) {
    std::thread::spawn(move || match backend.list_sessions() {
        Ok(sessions) => {
            let _ = tx.send(WorkerEvent::SessionsListed(sessions));
        }
        Err(err) => {
            let _ = tx.send(failure_event(err, "list sessions"));
        }
    });
}

pub(crate) fn spawn_approvals_refresh(
    backend: Arc<dyn Backend>,
    session_id: String,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || match backend.list_approvals(&session_id) {
        Ok((requests, resolutions)) => {
            let _ = tx.send(WorkerEvent::ApprovalsListed {
                session_id,
                requests: normalize_requests(requests),
                resolutions: normalize_resolutions(resolutions),
            });
        }
        Err(err) => {
            let _ = tx.send(failure_event(err, "list approvals"));
        }
    });
}

pub(crate) fn spawn_history_fetch(
    backend: Arc<dyn Backend>,
    key: String,
    session_id: String,
    seq: u64,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || match backend.fetch_history(&session_id) {
        Ok(records) => {
            let _ = tx.send(WorkerEvent::HistoryFetched { key, seq, records });
        }
        Err(err) => {
            let _ = tx.send(failure_event(err, "fetch history"));
        }
    });
}

pub(crate) fn spawn_decision(
    backend: Arc<dyn Backend>,
    session_id: String,
    request_id: u64,
    approved: bool,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(
        move || match backend.decide(&session_id, request_id, approved) {
            Ok(()) => {
                let _ = tx.send(WorkerEvent::ApprovalDecided {
                    session_id,
                    request_id,
                    approved,
                });
            }
            Err(err) => {
                let _ = tx.send(failure_event(err, "decide approval"));
            }
        },
    );
}

pub(crate) fn spawn_send(
    backend: Arc<dyn Backend>,
    session_id: String,
    text: String,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || {
        if let Err(err) = backend.send_message(&session_id, &text) {
            let _ = tx.send(failure_event(err, "send message"));
        }
    });
}

pub(crate) fn spawn_interrupt(
    backend: Arc<dyn Backend>,
    session_id: String,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || {
        if let Err(err) = backend.interrupt(&session_id) {
            let _ = tx.send(failure_event(err, "interrupt session"));
        }
    });
}

fn is_agent_reply(record: &ActivityRecord) -> bool {
    matches!(record.kind.as_deref(), Some("agent") | Some("assistant"))
}

/// Polls the session tail a bounded number of times after a message is sent,
/// so a reply shows up even when no live stream is attached. Stops early
/// once an agent reply appears or the owner cancels the handle.
pub(crate) fn spawn_reply_poll(
    backend: Arc<dyn Backend>,
    key: String,
    session_id: String,
    token: CancelToken,
    tx: Sender<WorkerEvent>,
) {
    std::thread::spawn(move || {
        for attempt in 1..=REPLY_POLL_ATTEMPTS {
            std::thread::sleep(Duration::from_millis(REPLY_POLL_DELAY_MS));
            if token.is_cancelled() {
                return;
            }
            let records = match backend.fetch_tail(&session_id, REPLY_POLL_TAIL) {
                Ok(records) => records,
                Err(err) => {
                    warn!(%session_id, attempt, "reply poll failed: {err:#}");
                    continue;
                }
            };
            let done = records.iter().any(is_agent_reply);
            if tx
                .send(WorkerEvent::ReplyPollFetched {
                    key: key.clone(),
                    records,
                    attempt,
                })
                .is_err()
            {
                return;
            }
            if done {
                return;
            }
        }
    });
}

/// Run lifecycle markers carried in the record stream rather than the
/// transcript payload.
pub(crate) fn run_signal_from_record(record: &ActivityRecord) -> Option<RunSignal> {
    let turn = |field: &str| {
        record
            .payload
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match record.kind.as_deref() {
        Some("run_started") => Some(RunSignal::Started {
            baseline_turn: turn("baseline_turn").unwrap_or_default(),
        }),
        Some("run_completed") => Some(RunSignal::Completed {
            expected_turn: turn("expected_turn"),
            completion_turn: turn("completion_turn"),
        }),
        _ => None,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawApproval {
    id: u64,
    session_id: String,
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    created_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawResolution {
    id: u64,
    session_id: String,
    method: String,
    #[serde(default)]
    params: Option<Value>,
    decision: String,
    #[serde(default)]
    resolved_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackendFile {
    #[serde(default)]
    sessions: Vec<SessionMeta>,
    #[serde(default)]
    records: std::collections::HashMap<String, Vec<RawRecord>>,
    #[serde(default)]
    approvals: Vec<RawApproval>,
    #[serde(default)]
    resolutions: Vec<RawResolution>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawRecord {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// JSON-file backend: sessions, transcripts and approvals all live in one
/// document that external agent wrappers append to. Good enough for local
/// supervision; the traits keep the door open for a socket transport.
pub(crate) struct FileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub(crate) fn open_default() -> Result<Self> {
        let path = backend_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create backend dir {}", parent.display()))?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    #[cfg(test)]
    pub(crate) fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BackendFile> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BackendFile::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read backend file {}", self.path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("parse backend file {}", self.path.display()))
    }

    fn save(&self, file: &BackendFile) -> Result<()> {
        let raw = serde_json::to_string_pretty(file).context("serialize backend file")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("write backend file {}", self.path.display()))
    }

    fn with_file<T>(&self, apply: impl FnOnce(&mut BackendFile) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("backend lock poisoned"))?;
        let mut file = self.load()?;
        let out = apply(&mut file)?;
        self.save(&file)?;
        Ok(out)
    }

    fn session_records(&self, session_id: &str) -> Result<Vec<ActivityRecord>> {
        let file = self.load()?;
        if !file.sessions.iter().any(|s| s.id == session_id) {
            return Err(NotFound {
                session_id: session_id.to_string(),
            }
            .into());
        }
        let records = file
            .records
            .get(session_id)
            .map(|raws| {
                raws.iter()
                    .map(|raw| ActivityRecord {
                        session_id: session_id.to_string(),
                        kind: raw.kind.clone(),
                        payload: raw.payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }
}

impl SessionLister for FileBackend {
    fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        Ok(self.load()?.sessions)
    }
}

impl ApprovalGateway for FileBackend {
    fn list_approvals(
        &self,
        session_id: &str,
    ) -> Result<(Vec<ApprovalRequest>, Vec<ApprovalResolution>)> {
        let file = self.load()?;
        let requests = file
            .approvals
            .iter()
            .filter(|raw| raw.session_id == session_id)
            .map(|raw| {
                ApprovalRequest::from_params(
                    raw.id,
                    &raw.session_id,
                    &raw.method,
                    raw.params.as_ref(),
                    raw.created_at,
                )
            })
            .collect();
        let resolutions = file
            .resolutions
            .iter()
            .filter(|raw| raw.session_id == session_id)
            .map(|raw| {
                ApprovalResolution::from_params(
                    raw.id,
                    &raw.session_id,
                    &raw.method,
                    raw.params.as_ref(),
                    Decision::parse(&raw.decision),
                    raw.resolved_at,
                )
            })
            .collect();
        Ok((requests, resolutions))
    }

    fn decide(&self, session_id: &str, request_id: u64, approved: bool) -> Result<()> {
        self.with_file(|file| {
            if !file.sessions.iter().any(|s| s.id == session_id) {
                return Err(NotFound {
                    session_id: session_id.to_string(),
                }
                .into());
            }
            let idx = file
                .approvals
                .iter()
                .position(|raw| raw.session_id == session_id && raw.id == request_id)
                .ok_or_else(|| anyhow!("approval {request_id} not pending"))?;
            let raw = file.approvals.remove(idx);
            file.resolutions.push(RawResolution {
                id: raw.id,
                session_id: raw.session_id,
                method: raw.method,
                params: raw.params,
                decision: if approved { "approved" } else { "declined" }.to_string(),
                resolved_at: crate::now_ms(),
            });
            Ok(())
        })
    }
}

impl Transcripts for FileBackend {
    fn fetch_history(&self, session_id: &str) -> Result<Vec<ActivityRecord>> {
        self.session_records(session_id)
    }

    fn fetch_tail(&self, session_id: &str, limit: usize) -> Result<Vec<ActivityRecord>> {
        let mut records = self.session_records(session_id)?;
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }
}

impl SessionControl for FileBackend {
    fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        self.with_file(|file| {
            if !file.sessions.iter().any(|s| s.id == session_id) {
                return Err(NotFound {
                    session_id: session_id.to_string(),
                }
                .into());
            }
            file.records
                .entry(session_id.to_string())
                .or_default()
                .push(RawRecord {
                    kind: Some("user".to_string()),
                    payload: serde_json::json!({ "text": text }),
                });
            Ok(())
        })
    }

    fn interrupt(&self, session_id: &str) -> Result<()> {
        self.with_file(|file| {
            let session = file
                .sessions
                .iter_mut()
                .find(|s| s.id == session_id)
                .ok_or_else(|| NotFound {
                    session_id: session_id.to_string(),
                })?;
            session.busy = false;
            Ok(())
        })
    }
}

impl EventStreams for FileBackend {
    fn open_stream(
        &self,
        session_id: &str,
        key: String,
        token: CancelToken,
        tx: Sender<WorkerEvent>,
    ) -> Result<()> {
        let path = self.path.clone();
        let session_id = session_id.to_string();
        std::thread::spawn(move || {
            let backend = FileBackend {
                path,
                lock: Mutex::new(()),
            };
            let mut seen = match backend.session_records(&session_id) {
                Ok(records) => records.len(),
                Err(_) => 0,
            };
            loop {
                std::thread::sleep(Duration::from_millis(STREAM_POLL_MS));
                if token.is_cancelled() {
                    return;
                }
                let records = match backend.session_records(&session_id) {
                    Ok(records) => records,
                    Err(_) => {
                        let _ = tx.send(WorkerEvent::StreamClosed { key });
                        return;
                    }
                };
                if records.len() < seen {
                    seen = 0;
                }
                for record in &records[seen..] {
                    if let Some(signal) = run_signal_from_record(record) {
                        if tx
                            .send(WorkerEvent::Run {
                                session_id: session_id.clone(),
                                signal,
                            })
                            .is_err()
                        {
                            return;
                        }
                        continue;
                    }
                    if tx
                        .send(WorkerEvent::StreamItem {
                            key: key.clone(),
                            record: record.clone(),
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                seen = records.len();
            }
        });
        Ok(())
    }
}

fn backend_file_path() -> PathBuf {
    if let Some(custom) = std::env::var_os("AGENTDECK_BACKEND") {
        return PathBuf::from(custom);
    }
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".agentdeck").join("backend.json")
    } else {
        PathBuf::from(".agentdeck").join("backend.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_backend(name: &str) -> FileBackend {
        let path = std::env::temp_dir().join(format!("agentdeck-backend-{name}-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        FileBackend::at_path(path)
    }

    fn seed_session(backend: &FileBackend, id: &str) {
        backend
            .with_file(|file| {
                file.sessions.push(SessionMeta {
                    id: id.to_string(),
                    title: id.to_string(),
                    workspace: "alpha".to_string(),
                    worktree: None,
                    key: None,
                    provider: Some("codex".to_string()),
                    turn_id: Some("t0".to_string()),
                    busy: false,
                });
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn missing_file_lists_no_sessions() {
        let backend = temp_backend("empty");
        assert!(backend.list_sessions().unwrap().is_empty());
    }

    #[test]
    fn send_appends_a_user_record() {
        let backend = temp_backend("send");
        seed_session(&backend, "s1");
        backend.send_message("s1", "hello").unwrap();
        let records = backend.fetch_history("s1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind.as_deref(), Some("user"));
    }

    #[test]
    fn send_to_unknown_session_is_not_found() {
        let backend = temp_backend("send-missing");
        let err = backend.send_message("ghost", "hello").unwrap_err();
        assert!(err.root_cause().downcast_ref::<NotFound>().is_some());
    }

    #[test]
    fn decide_moves_approval_to_resolutions() {
        let backend = temp_backend("decide");
        seed_session(&backend, "s1");
        backend
            .with_file(|file| {
                file.approvals.push(RawApproval {
                    id: 7,
                    session_id: "s1".to_string(),
                    method: "command_execution".to_string(),
                    params: Some(json!({ "command": "ls" })),
                    created_at: 1,
                });
                Ok(())
            })
            .unwrap();

        backend.decide("s1", 7, true).unwrap();
        let (requests, resolutions) = backend.list_approvals("s1").unwrap();
        assert!(requests.is_empty());
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].decision, Decision::Approved);
    }

    #[test]
    fn fetch_tail_limits_to_newest_records() {
        let backend = temp_backend("tail");
        seed_session(&backend, "s1");
        for i in 0..5 {
            backend.send_message("s1", &format!("m{i}")).unwrap();
        }
        let tail = backend.fetch_tail("s1", 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].payload["text"], "m4");
    }

    #[test]
    fn run_signals_parse_from_records() {
        let started = ActivityRecord {
            session_id: "s1".to_string(),
            kind: Some("run_started".to_string()),
            payload: json!({ "baseline_turn": "t1" }),
        };
        assert_eq!(
            run_signal_from_record(&started),
            Some(RunSignal::Started {
                baseline_turn: "t1".to_string()
            })
        );
        let completed = ActivityRecord {
            session_id: "s1".to_string(),
            kind: Some("run_completed".to_string()),
            payload: json!({ "expected_turn": "t1", "completion_turn": "t2" }),
        };
        assert_eq!(
            run_signal_from_record(&completed),
            Some(RunSignal::Completed {
                expected_turn: Some("t1".to_string()),
                completion_turn: Some("t2".to_string()),
            })
        );
    }

    #[test]
    fn default_policy_trusts_known_providers_only() {
        let policy = DefaultCompletionPolicy {
            trusted: vec!["codex".to_string()],
        };
        assert!(policy.trust_metadata_completion(Some("codex")));
        assert!(policy.trust_metadata_completion(Some("Codex")));
        assert!(!policy.trust_metadata_completion(Some("other")));
        assert!(!policy.trust_metadata_completion(None));
    }

    #[test]
    fn dropping_handle_cancels_token() {
        let handle = CancelHandle::new();
        let token = handle.token();
        assert!(!token.is_cancelled());
        drop(handle);
        assert!(token.is_cancelled());
    }
}
