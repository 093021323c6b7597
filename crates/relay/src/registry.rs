//! The session registry.
//!
//! Process-wide map of live sessions, owned by the composition root and
//! shared by cloning. Each session's state and process handle live behind
//! a per-session `tokio::sync::Mutex`; cross-session operations never
//! share a lock. Closed session ids are remembered in a tombstone set so
//! an id is never reused and late operations against it fail with a
//! closed-session error rather than not-found.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use protocol::{Message, SessionExit, SessionOutput, SessionSuperseded};

use crate::config::SessionConfig;
use crate::grace::GraceTimer;
use crate::process::{OutputChunk, ProcessEvent, ProcessHandle, ProcessSpawner};
use crate::session::{ClientSink, Session, SessionError, SessionId, SessionState};

/// Tuning limits for the registry, derived from [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Command history cap per session.
    pub history_limit: usize,
    /// Output buffer cap per session, in chunks.
    pub output_buffer_chunks: usize,
    /// How long a detached session survives before being closed.
    pub grace_period: Duration,
    /// How long to wait for a closing session's exit event before
    /// force-removing the entry.
    pub remove_timeout: Duration,
}

impl RegistryLimits {
    /// Derives limits from the session configuration section.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            max_sessions: config.max_sessions,
            history_limit: config.history_limit,
            output_buffer_chunks: config.output_buffer_chunks,
            grace_period: Duration::from_secs(config.grace_period_secs),
            remove_timeout: Duration::from_secs(config.kill_timeout_secs + 5),
        }
    }
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// One registry entry: session state plus its process handle and, while
/// detached, the running grace timer.
struct Slot<H> {
    session: Session,
    handle: H,
    grace: Option<GraceTimer>,
}

struct Inner<S: ProcessSpawner> {
    sessions: DashMap<SessionId, Arc<Mutex<Slot<S::Handle>>>>,
    /// Ids of sessions that have been closed. Never pruned; closed ids
    /// must keep reporting closed for the lifetime of the process.
    closed: DashSet<SessionId>,
    spawner: S,
    limits: RegistryLimits,
    expired_tx: mpsc::UnboundedSender<SessionId>,
    /// Serializes session creation so the limit check and the insert
    /// cannot interleave across concurrent creates.
    create_lock: Mutex<()>,
}

/// Thread-safe session registry. Cheap to clone.
pub struct SessionRegistry<S: ProcessSpawner> {
    inner: Arc<Inner<S>>,
}

impl<S: ProcessSpawner> Clone for SessionRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ProcessSpawner> SessionRegistry<S> {
    /// Creates a registry and starts its grace-expiry reaper task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(spawner: S, limits: RegistryLimits) -> Self {
        let (expired_tx, mut expired_rx) = mpsc::unbounded_channel();

        let registry = Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                closed: DashSet::new(),
                spawner,
                limits,
                expired_tx,
                create_lock: Mutex::new(()),
            }),
        };

        let reaper = registry.clone();
        tokio::spawn(async move {
            while let Some(id) = expired_rx.recv().await {
                if let Err(e) = reaper.close(&id).await {
                    tracing::debug!(session_id = %id, error = %e, "Expired session already gone");
                }
            }
        });

        registry
    }

    /// Creates a new session, spawning its process synchronously.
    ///
    /// With a sink the session starts attached (`Active`); without one it
    /// starts `Detached` with the grace timer already running.
    pub async fn create(
        &self,
        cwd: Option<String>,
        env: Vec<(String, String)>,
        sink: Option<ClientSink>,
    ) -> Result<SessionId, SessionError> {
        let _create_guard = self.inner.create_lock.lock().await;
        if self.inner.sessions.len() >= self.inner.limits.max_sessions {
            return Err(SessionError::TooManySessions(
                self.inner.limits.max_sessions,
            ));
        }

        let (handle, events) = self.inner.spawner.spawn(cwd.as_deref(), &env)?;

        let id = Uuid::new_v4().to_string();
        let mut session = Session::new(
            id.clone(),
            cwd,
            env,
            self.inner.limits.history_limit,
            self.inner.limits.output_buffer_chunks,
        );

        let attached = sink.is_some();
        let mut grace = None;
        if let Some(sink) = sink {
            session.state = SessionState::Active;
            session.attached = Some(sink);
        } else {
            grace = Some(GraceTimer::start(
                id.clone(),
                self.inner.limits.grace_period,
                self.inner.expired_tx.clone(),
            ));
        }

        let pid = handle.pid();
        let slot = Arc::new(Mutex::new(Slot {
            session,
            handle,
            grace,
        }));
        self.inner.sessions.insert(id.clone(), slot);

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            attached,
            "Created session"
        );

        let pump = self.clone();
        let pump_id = id.clone();
        tokio::spawn(async move { pump.run_pump(pump_id, events).await });

        Ok(id)
    }

    /// Attaches a connection to an existing session.
    ///
    /// Cancels any running grace timer, evicts and notifies a previously
    /// attached connection, replays buffered output in original order,
    /// then delivers a pending exit if the process already died.
    pub async fn attach(&self, id: &str, sink: ClientSink) -> Result<(), SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::Closed(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let mut slot = slot_arc.lock().await;

        if slot.session.state == SessionState::Closed {
            return Err(SessionError::Closed(id.to_string()));
        }

        slot.grace = None;

        if let Some(old) = slot.session.attached.take() {
            if old.conn_id != sink.conn_id {
                let _ = old
                    .tx
                    .send(Message::SessionSuperseded(SessionSuperseded {
                        session_id: id.to_string(),
                    }))
                    .await;
                tracing::info!(
                    session_id = %id,
                    old_conn = old.conn_id,
                    new_conn = sink.conn_id,
                    "Attachment superseded"
                );
            }
        }

        for chunk in slot.session.drain_buffer() {
            let msg = Message::SessionOutput(SessionOutput {
                session_id: id.to_string(),
                stream: chunk.stream,
                data: chunk.data,
            });
            if sink.tx.send(msg).await.is_err() {
                // The new connection died mid-replay; back to detached
                slot.session.state = SessionState::Detached;
                slot.grace = Some(GraceTimer::start(
                    id.to_string(),
                    self.inner.limits.grace_period,
                    self.inner.expired_tx.clone(),
                ));
                return Err(SessionError::Io(
                    "connection closed during output replay".to_string(),
                ));
            }
        }

        if let Some(code) = slot.session.pending_exit.take() {
            let _ = sink
                .tx
                .send(Message::SessionExit(SessionExit {
                    session_id: id.to_string(),
                    code,
                }))
                .await;
            self.retire(&mut slot, id);
            return Ok(());
        }

        tracing::debug!(session_id = %id, conn_id = sink.conn_id, "Connection attached");
        slot.session.state = SessionState::Active;
        slot.session.attached = Some(sink);
        slot.session.touch();
        Ok(())
    }

    /// Detaches a connection from a session, starting the grace timer.
    ///
    /// A detach from a connection that is no longer the attached one
    /// (stale after a supersede) is a no-op.
    pub async fn detach(&self, id: &str, conn_id: u64) -> Result<(), SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::Closed(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let mut slot = slot_arc.lock().await;

        match &slot.session.attached {
            Some(sink) if sink.conn_id == conn_id => {
                slot.session.attached = None;
                slot.session.state = SessionState::Detached;
                slot.grace = Some(GraceTimer::start(
                    id.to_string(),
                    self.inner.limits.grace_period,
                    self.inner.expired_tx.clone(),
                ));
                tracing::info!(
                    session_id = %id,
                    conn_id,
                    grace_secs = self.inner.limits.grace_period.as_secs(),
                    "Connection detached, grace period started"
                );
            }
            _ => {
                tracing::debug!(session_id = %id, conn_id, "Stale detach ignored");
            }
        }
        Ok(())
    }

    /// Writes input bytes to a session's process, recording completed
    /// lines into the session history.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::NotWritable(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let mut slot = slot_arc.lock().await;

        if slot.session.state == SessionState::Closed || slot.session.pending_exit.is_some() {
            return Err(SessionError::NotWritable(id.to_string()));
        }

        slot.handle.write(data)?;
        slot.session.record_input(data);
        slot.session.touch();
        Ok(())
    }

    /// Applies a terminal size change to a session's process. Best-effort.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::Closed(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let slot = slot_arc.lock().await;
        slot.handle.resize(cols, rows)
    }

    /// Closes a session: graceful stop request, forced kill after the
    /// process timeout, entry removed once the exit event is delivered or
    /// the removal timeout fires.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::Closed(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let mut slot = slot_arc.lock().await;

        if slot.session.state == SessionState::Closed {
            return Ok(());
        }

        slot.grace = None;

        // Process already exited while detached: nothing left to stop
        if slot.session.pending_exit.is_some() {
            self.retire(&mut slot, id);
            return Ok(());
        }

        slot.session.state = SessionState::Closed;
        slot.handle.terminate();
        tracing::info!(session_id = %id, "Closing session");
        drop(slot);

        // Removal watchdog in case the exit event is never observed
        let registry = self.clone();
        let watch_id = id.to_string();
        let timeout = self.inner.limits.remove_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if registry.inner.sessions.contains_key(&watch_id) {
                tracing::warn!(
                    session_id = %watch_id,
                    "Exit event not observed, force-removing session"
                );
                registry.inner.closed.insert(watch_id.clone());
                registry.inner.sessions.remove(&watch_id);
            }
        });

        Ok(())
    }

    /// Returns the session's command history, oldest first.
    pub async fn history(&self, id: &str) -> Result<Vec<String>, SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::Closed(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let slot = slot_arc.lock().await;
        Ok(slot.session.history())
    }

    /// Updates a session's last-activity timestamp.
    pub async fn touch(&self, id: &str) -> Result<(), SessionError> {
        if self.inner.closed.contains(id) {
            return Err(SessionError::Closed(id.to_string()));
        }
        let slot_arc = self.slot(id)?;
        let mut slot = slot_arc.lock().await;
        slot.session.touch();
        Ok(())
    }

    /// Current lifecycle state of a session, if it is still registered.
    pub async fn state(&self, id: &str) -> Option<SessionState> {
        let slot_arc = self.slot(id).ok()?;
        let slot = slot_arc.lock().await;
        Some(slot.session.state)
    }

    /// Ids of all registered sessions.
    pub fn list(&self) -> Vec<SessionId> {
        self.inner.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether the id belongs to a closed session.
    pub fn is_closed(&self, id: &str) -> bool {
        self.inner.closed.contains(id)
    }

    /// Closes every registered session. Used for daemon shutdown.
    pub async fn shutdown(&self) {
        let ids = self.list();
        tracing::info!(sessions = ids.len(), "Closing all sessions");
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::debug!(session_id = %id, error = %e, "Session already closed");
            }
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<Mutex<Slot<S::Handle>>>, SessionError> {
        self.inner
            .sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Consumes process events for one session until exit.
    async fn run_pump(&self, id: SessionId, mut events: mpsc::Receiver<ProcessEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output(chunk) => self.deliver_output(&id, chunk).await,
                ProcessEvent::Exit(code) => {
                    self.handle_exit(&id, code).await;
                    break;
                }
            }
        }
    }

    /// Delivers one output chunk: live to the attached connection, or
    /// into the bounded buffer. A slow consumer never blocks the pump;
    /// overflow falls back to the buffer.
    ///
    /// Buffered chunks always go out before newer ones. While a backlog
    /// exists, every new chunk queues behind it; the backlog drains to
    /// the live sink as capacity frees, so per-session order is kept
    /// even across an overflow.
    async fn deliver_output(&self, id: &str, chunk: OutputChunk) {
        let Ok(slot_arc) = self.slot(id) else {
            return;
        };
        let mut slot = slot_arc.lock().await;
        slot.session.touch();

        let Some(sink) = slot.session.attached.clone() else {
            slot.session.push_chunk(chunk);
            return;
        };

        while let Some(buffered) = slot.session.pop_chunk() {
            let msg = Message::SessionOutput(SessionOutput {
                session_id: id.to_string(),
                stream: buffered.stream,
                data: buffered.data,
            });
            if let Err(e) = sink.tx.try_send(msg) {
                if let Message::SessionOutput(out) = e.into_inner() {
                    slot.session.requeue_chunk(OutputChunk {
                        stream: out.stream,
                        data: out.data,
                    });
                }
                slot.session.push_chunk(chunk);
                return;
            }
        }

        let msg = Message::SessionOutput(SessionOutput {
            session_id: id.to_string(),
            stream: chunk.stream,
            data: chunk.data,
        });
        if let Err(e) = sink.tx.try_send(msg) {
            if let Message::SessionOutput(out) = e.into_inner() {
                slot.session.push_chunk(OutputChunk {
                    stream: out.stream,
                    data: out.data,
                });
            }
        }
    }

    /// Handles the process exit event: deliver to the attached connection
    /// and retire, or hold as a pending exit for the next attach.
    async fn handle_exit(&self, id: &str, code: i32) {
        let Ok(slot_arc) = self.slot(id) else {
            return;
        };
        let mut slot = slot_arc.lock().await;
        let explicit_close = slot.session.state == SessionState::Closed;

        if let Some(sink) = slot.session.attached.take() {
            let _ = sink
                .tx
                .send(Message::SessionExit(SessionExit {
                    session_id: id.to_string(),
                    code,
                }))
                .await;
            self.retire(&mut slot, id);
            tracing::info!(session_id = %id, code, "Process exited");
        } else if explicit_close {
            self.retire(&mut slot, id);
            tracing::info!(session_id = %id, code, "Process exited after close");
        } else {
            // Exit while detached: held until the next attach or expiry
            slot.session.pending_exit = Some(code);
            tracing::info!(session_id = %id, code, "Process exited while detached");
        }
    }

    /// Marks a session closed, tombstones its id, and removes the entry.
    fn retire(&self, slot: &mut Slot<S::Handle>, id: &str) {
        slot.session.state = SessionState::Closed;
        slot.grace = None;
        self.inner.closed.insert(id.to_string());
        self.inner.sessions.remove(id);
        tracing::info!(session_id = %id, "Session retired");
    }
}
