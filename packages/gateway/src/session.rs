//! Per-turn streaming sessions and the registry that supervises them.
//!
//! Each session runs the blocking engine generator on its own OS thread and
//! relays its chunks through a bounded channel into the async side, where
//! they are translated and, for buffering transports, sentence-coalesced.
//! Cancellation is cooperative: a superseded or disconnected session stops
//! forwarding output, but the worker thread is left to finish on its own
//! because the engine call is not preemptible and its post-turn persistence
//! work should complete either way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::chunk::Chunk;
use crate::engine::{EngineRequest, MemoryEngine};
use crate::sentence::{SentenceBoundaryBuffer, IDLE_FLUSH_TIMEOUT};
use crate::translator::{error_envelope, text_envelope, translate, Envelope};

/// Worker-to-relay channel capacity; a full queue blocks the worker thread.
pub const QUEUE_CAPACITY: usize = 64;

/// How often the relay wakes up to check cancellation and idle flushing.
const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// A worker that produces nothing for this long is considered dead and the
/// session is force-completed with an error envelope.
const STALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Failed,
    Cancelled,
    Superseded,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Failed => "failed",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Superseded => "superseded",
        }
    }
}

const TOKEN_ACTIVE: u8 = 0;
const TOKEN_SUPERSEDED: u8 = 1;
const TOKEN_CANCELLED: u8 = 2;

/// Cooperative cancellation flag, checked by the relay each loop iteration.
/// Only the first cause sticks.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicU8>);

impl CancelToken {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TOKEN_ACTIVE)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst) == TOKEN_ACTIVE
    }

    pub fn supersede(&self) {
        let _ = self.0.compare_exchange(
            TOKEN_ACTIVE,
            TOKEN_SUPERSEDED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn cancel(&self) {
        let _ = self.0.compare_exchange(
            TOKEN_ACTIVE,
            TOKEN_CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn cause(&self) -> SessionOutcome {
        match self.0.load(Ordering::SeqCst) {
            TOKEN_SUPERSEDED => SessionOutcome::Superseded,
            _ => SessionOutcome::Cancelled,
        }
    }

    fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct SessionEntry {
    connection_id: String,
    token: CancelToken,
}

/// Tracks live sessions so duplicates supersede and disconnects cancel.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session id, superseding any still-active session that
    /// already holds it. At most one active session per id.
    pub async fn register(&self, session_id: &str, connection_id: &str) -> CancelToken {
        let mut sessions = self.sessions.lock().await;
        if let Some(old) = sessions.get(session_id) {
            if old.token.is_active() {
                info!(session_id = %session_id, "superseding active session");
                old.token.supersede();
            }
        }
        let token = CancelToken::new();
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                connection_id: connection_id.to_string(),
                token: token.clone(),
            },
        );
        token
    }

    /// Removes the entry, but only if it still belongs to the caller; a
    /// superseding session may have replaced it in the meantime.
    pub async fn unregister(&self, session_id: &str, token: &CancelToken) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(session_id) {
            if entry.token.same_as(token) {
                sessions.remove(session_id);
            }
        }
    }

    /// Cancels every session owned by a dropped transport connection.
    pub async fn cancel_all_for_connection(&self, connection_id: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|session_id, entry| {
            if entry.connection_id == connection_id {
                debug!(session_id = %session_id, "cancelling session for dropped connection");
                entry.token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Drops bookkeeping for sessions that are no longer active.
    pub async fn purge_inactive(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.token.is_active());
        before - sessions.len()
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Runs one conversational turn: spawns the engine worker, relays its output
/// to `outbound`, and unregisters on any exit path. The returned outcome is
/// terminal; `outbound` is dropped when it is reached.
pub async fn run_session(
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn MemoryEngine>,
    request: EngineRequest,
    session_id: String,
    connection_id: String,
    buffering: bool,
    outbound: mpsc::Sender<Envelope>,
) -> SessionOutcome {
    let token = registry.register(&session_id, &connection_id).await;
    let (tx, mut rx) = mpsc::channel::<Option<String>>(QUEUE_CAPACITY);

    let spawn_result = std::thread::Builder::new()
        .name(format!("engine-{session_id}"))
        .spawn({
            let engine = engine.clone();
            move || run_worker(engine, request, tx)
        });

    // The worker handle is dropped, not joined: the thread may still be
    // persisting memory after the client-visible turn is over.
    let outcome = match spawn_result {
        Ok(_handle) => {
            relay(
                &session_id,
                &token,
                &mut rx,
                &outbound,
                buffering,
                IDLE_FLUSH_TIMEOUT,
                STALL_TIMEOUT,
            )
            .await
        }
        Err(err) => {
            error!(session_id = %session_id, error = %err, "failed to spawn engine worker");
            let _ = outbound
                .send(error_envelope(&session_id, "failed to start response worker"))
                .await;
            SessionOutcome::Failed
        }
    };

    registry.unregister(&session_id, &token).await;
    info!(
        session_id = %session_id,
        connection_id = %connection_id,
        outcome = outcome.as_str(),
        "session finished"
    );
    outcome
}

/// Worker-thread loop. Streams the engine generator into the channel,
/// stopping after the first terminal chunk, and always sends the completion
/// sentinel last so the relay never waits forever.
fn run_worker(
    engine: Arc<dyn MemoryEngine>,
    request: EngineRequest,
    tx: mpsc::Sender<Option<String>>,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        for raw in engine.chat_stream(request) {
            let terminal = Chunk::parse(&raw)
                .map(|chunk| chunk.is_terminal())
                .unwrap_or(false);
            if tx.blocking_send(Some(raw)).is_err() {
                // Relay exited early; remaining output is unwanted.
                return;
            }
            if terminal {
                return;
            }
        }
    }));
    if result.is_err() {
        let raw = serde_json::json!({ "type": "error", "data": "response worker crashed" })
            .to_string();
        let _ = tx.blocking_send(Some(raw));
    }
    let _ = tx.blocking_send(None);
}

async fn relay(
    session_id: &str,
    token: &CancelToken,
    rx: &mut mpsc::Receiver<Option<String>>,
    outbound: &mpsc::Sender<Envelope>,
    buffering: bool,
    idle_flush: Duration,
    stall_timeout: Duration,
) -> SessionOutcome {
    let mut buffer = SentenceBoundaryBuffer::new();
    let mut last_chunk = Instant::now();

    loop {
        if !token.is_active() {
            // Drain whatever the stale worker already queued; none of it may
            // reach the transport.
            while rx.try_recv().is_ok() {}
            return token.cause();
        }

        match timeout(POP_TIMEOUT, rx.recv()).await {
            Err(_) => {
                if buffering && buffer.idle_expired(idle_flush) {
                    if let Some(text) = buffer.force_flush() {
                        if send(outbound, text_envelope(session_id, &text)).await.is_err() {
                            return SessionOutcome::Cancelled;
                        }
                    }
                }
                if last_chunk.elapsed() >= stall_timeout {
                    warn!(session_id = %session_id, "engine worker stalled, force completing");
                    let _ = outbound
                        .send(error_envelope(session_id, "response stream stalled"))
                        .await;
                    return SessionOutcome::Failed;
                }
            }
            // Completion sentinel, or the worker dropped its sender.
            Ok(None) | Ok(Some(None)) => {
                if buffering {
                    if let Some(text) = buffer.force_flush() {
                        if send(outbound, text_envelope(session_id, &text)).await.is_err() {
                            return SessionOutcome::Cancelled;
                        }
                    }
                }
                return SessionOutcome::Completed;
            }
            Ok(Some(Some(raw))) => {
                last_chunk = Instant::now();
                let Some(chunk) = Chunk::parse(&raw) else {
                    debug!(session_id = %session_id, "skipping malformed upstream chunk");
                    continue;
                };
                match chunk {
                    Chunk::Text { fragment } if buffering => {
                        if let Some(flushed) = buffer.push(&fragment) {
                            if send(outbound, text_envelope(session_id, &flushed))
                                .await
                                .is_err()
                            {
                                return SessionOutcome::Cancelled;
                            }
                        }
                    }
                    chunk => {
                        let terminal = chunk.is_terminal();
                        let failed = matches!(chunk, Chunk::Error { .. });
                        if terminal && buffering {
                            if let Some(text) = buffer.force_flush() {
                                if send(outbound, text_envelope(session_id, &text))
                                    .await
                                    .is_err()
                                {
                                    return SessionOutcome::Cancelled;
                                }
                            }
                        }
                        if send(outbound, translate(&chunk, session_id)).await.is_err() {
                            return SessionOutcome::Cancelled;
                        }
                        if terminal {
                            // Early exit: the worker's post-End persistence
                            // work must not hold up the client response.
                            return if failed {
                                SessionOutcome::Failed
                            } else {
                                SessionOutcome::Completed
                            };
                        }
                    }
                }
            }
        }
    }
}

async fn send(outbound: &mpsc::Sender<Envelope>, envelope: Envelope) -> Result<(), ()> {
    outbound.send(envelope).await.map_err(|_| {
        debug!("transport receiver dropped mid-stream");
    })
}
