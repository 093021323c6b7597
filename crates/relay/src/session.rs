//! Per-session state for the relay.
//!
//! A session owns the metadata around one shell process: its lifecycle
//! state, launch parameters, command history, and the bounded output
//! buffer used to replay chunks on (re)attach. The process handle itself
//! and the map of sessions live in the registry.

use std::collections::VecDeque;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use protocol::Message;

use crate::process::OutputChunk;

/// Unique session identifier (UUID v4 string).
pub type SessionId = String;

/// Session operation errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The shell process could not be launched.
    #[error("failed to spawn shell process: {0}")]
    SpawnFailed(String),

    /// The session id was never created or has been reaped.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has been closed; its id is never reused.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// Write attempted against a closed or exited process.
    #[error("session not writable: {0}")]
    NotWritable(SessionId),

    /// The process rejected input.
    #[error("write to process failed: {0}")]
    WriteFailed(String),

    /// The terminal size change could not be applied.
    #[error("resize failed: {0}")]
    ResizeFailed(String),

    /// The configured session limit was reached.
    #[error("session limit reached ({0})")]
    TooManySessions(usize),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Lifecycle state of a session.
///
/// ```text
/// Active --(transport lost)--> Detached --(grace expires)--> Closed
/// Detached --(attach)--> Active
/// Active|Detached --(close)--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A connection is attached and receives output live.
    Active,
    /// No connection attached; output buffers, the grace timer runs.
    Detached,
    /// The process has been terminated; the id is retired.
    Closed,
}

/// The connection currently attached to a session.
///
/// Holds the outbound message channel of one client connection. The
/// connection id disambiguates stale detach requests after a supersede.
#[derive(Debug, Clone)]
pub struct ClientSink {
    /// Identifier of the owning connection.
    pub conn_id: u64,
    /// Outbound message channel of the connection.
    pub tx: mpsc::Sender<Message>,
}

/// State for a single relay session.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier, stable for the session's lifetime.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: SessionState,
    /// When the session was created.
    pub created_at: Instant,
    /// Last time input, output, or a pseudo-command touched the session.
    pub last_activity: Instant,
    /// Working directory the process was launched with.
    pub cwd: Option<String>,
    /// Extra environment variables the process was launched with.
    pub env: Vec<(String, String)>,
    /// Connection currently attached, if any.
    pub attached: Option<ClientSink>,
    /// Exit code observed while no connection was attached, delivered on
    /// the next attach.
    pub pending_exit: Option<i32>,

    /// Completed command lines, oldest first, capped at `history_limit`.
    history: VecDeque<String>,
    history_limit: usize,
    /// Bytes of the current, not yet newline-terminated input line.
    partial_line: Vec<u8>,

    /// Output chunks awaiting replay, oldest first, capped at `buffer_limit`.
    buffer: VecDeque<OutputChunk>,
    buffer_limit: usize,
    /// Count of chunks dropped from the buffer since the last attach.
    dropped_chunks: u64,
}

impl Session {
    /// Creates session state for a freshly spawned process.
    pub fn new(
        id: SessionId,
        cwd: Option<String>,
        env: Vec<(String, String)>,
        history_limit: usize,
        buffer_limit: usize,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: SessionState::Detached,
            created_at: now,
            last_activity: now,
            cwd,
            env,
            attached: None,
            pending_exit: None,
            history: VecDeque::new(),
            history_limit,
            partial_line: Vec::new(),
            buffer: VecDeque::new(),
            buffer_limit,
            dropped_chunks: 0,
        }
    }

    /// Updates the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Records input bytes, pushing each completed line into history.
    ///
    /// Input arrives in arbitrary chunks; a line enters history only once
    /// its terminating newline is seen. Blank lines are skipped.
    pub fn record_input(&mut self, data: &[u8]) {
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial_line)
                    .trim_end_matches('\r')
                    .trim()
                    .to_string();
                self.partial_line.clear();
                if !line.is_empty() {
                    if self.history.len() >= self.history_limit {
                        self.history.pop_front();
                    }
                    self.history.push_back(line);
                }
            } else {
                self.partial_line.push(byte);
            }
        }
    }

    /// Returns the recorded command history, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.iter().cloned().collect()
    }

    /// Buffers an output chunk for later replay, dropping the oldest
    /// chunk when the buffer is full. The newest chunk is never dropped.
    pub fn push_chunk(&mut self, chunk: OutputChunk) {
        if self.buffer.len() >= self.buffer_limit {
            self.buffer.pop_front();
            self.dropped_chunks += 1;
        }
        self.buffer.push_back(chunk);
    }

    /// Removes the oldest buffered chunk.
    pub fn pop_chunk(&mut self) -> Option<OutputChunk> {
        self.buffer.pop_front()
    }

    /// Returns a chunk taken by [`pop_chunk`](Self::pop_chunk) to the
    /// front of the buffer.
    pub fn requeue_chunk(&mut self, chunk: OutputChunk) {
        self.buffer.push_front(chunk);
    }

    /// Drains all buffered output in original order.
    pub fn drain_buffer(&mut self) -> Vec<OutputChunk> {
        if self.dropped_chunks > 0 {
            tracing::warn!(
                session_id = %self.id,
                dropped = self.dropped_chunks,
                "Output chunks were dropped while detached"
            );
            self.dropped_chunks = 0;
        }
        self.buffer.drain(..).collect()
    }

    /// Number of buffered output chunks.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::OutputStream;

    fn session() -> Session {
        Session::new("sess-test".to_string(), None, vec![], 3, 2)
    }

    fn chunk(data: &[u8]) -> OutputChunk {
        OutputChunk {
            stream: OutputStream::Stdout,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_new_session_is_detached() {
        let s = session();
        assert_eq!(s.state, SessionState::Detached);
        assert!(s.attached.is_none());
        assert!(s.pending_exit.is_none());
        assert!(s.history().is_empty());
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_record_input_complete_line() {
        let mut s = session();
        s.record_input(b"ls -la\n");
        assert_eq!(s.history(), vec!["ls -la".to_string()]);
    }

    #[test]
    fn test_record_input_partial_then_completed() {
        let mut s = session();
        s.record_input(b"git sta");
        assert!(s.history().is_empty());
        s.record_input(b"tus\n");
        assert_eq!(s.history(), vec!["git status".to_string()]);
    }

    #[test]
    fn test_record_input_multiple_lines_one_chunk() {
        let mut s = session();
        s.record_input(b"pwd\nwhoami\n");
        assert_eq!(s.history(), vec!["pwd".to_string(), "whoami".to_string()]);
    }

    #[test]
    fn test_record_input_skips_blank_lines() {
        let mut s = session();
        s.record_input(b"\n\n  \nls\n");
        assert_eq!(s.history(), vec!["ls".to_string()]);
    }

    #[test]
    fn test_record_input_strips_carriage_return() {
        let mut s = session();
        s.record_input(b"echo hi\r\n");
        assert_eq!(s.history(), vec!["echo hi".to_string()]);
    }

    #[test]
    fn test_history_capped_oldest_dropped() {
        let mut s = session(); // limit 3
        s.record_input(b"one\ntwo\nthree\nfour\n");
        assert_eq!(
            s.history(),
            vec!["two".to_string(), "three".to_string(), "four".to_string()]
        );
    }

    #[test]
    fn test_buffer_drop_oldest() {
        let mut s = session(); // limit 2
        s.push_chunk(chunk(b"a"));
        s.push_chunk(chunk(b"b"));
        s.push_chunk(chunk(b"c"));

        let drained = s.drain_buffer();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data, b"b");
        assert_eq!(drained[1].data, b"c");
    }

    #[test]
    fn test_pop_and_requeue_front() {
        let mut s = session();
        s.push_chunk(chunk(b"x"));
        s.push_chunk(chunk(b"y"));

        let first = s.pop_chunk().unwrap();
        assert_eq!(first.data, b"x");
        s.requeue_chunk(first);

        let drained = s.drain_buffer();
        assert_eq!(drained[0].data, b"x");
        assert_eq!(drained[1].data, b"y");
    }

    #[test]
    fn test_drain_buffer_preserves_order() {
        let mut s = session();
        s.push_chunk(chunk(b"first"));
        s.push_chunk(chunk(b"second"));

        let drained = s.drain_buffer();
        assert_eq!(drained[0].data, b"first");
        assert_eq!(drained[1].data, b"second");
        assert_eq!(s.buffered(), 0);
    }

    #[test]
    fn test_touch_advances_last_activity() {
        let mut s = session();
        let before = s.last_activity;
        std::thread::sleep(std::time::Duration::from_millis(2));
        s.touch();
        assert!(s.last_activity > before);
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::NotFound("sess-x".to_string());
        assert_eq!(err.to_string(), "session not found: sess-x");

        let err = SessionError::TooManySessions(10);
        assert_eq!(err.to_string(), "session limit reached (10)");
    }
}
