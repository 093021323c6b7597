//! Protocol message definitions for ShellMux.
//!
//! This module defines the message set exchanged between the relay and its
//! clients over one multiplexed connection. Every message that concerns a
//! session carries the session id, so a single connection can interleave
//! traffic for any number of sessions. All messages are serialized using
//! MessagePack.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
///
/// The envelope provides versioning and sequence numbers for message ordering
/// and compatibility checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number, monotonically increasing per sender.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    ///
    /// Rejects envelopes carrying an unsupported protocol version.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                got: envelope.version,
                supported: PROTOCOL_VERSION,
            });
        }
        Ok(envelope)
    }
}

/// Top-level message enum containing all message types.
///
/// Client-to-relay: `SessionCreate`, `SessionAttach`, `SessionInput`,
/// `SessionResize`, `SessionClose`.
/// Relay-to-client: `SessionCreated`, `SessionOutput`, `SessionExit`,
/// `SessionSuperseded`, `SessionClear`, `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// Request to create a new session.
    SessionCreate(SessionCreate),
    /// Response confirming session creation.
    SessionCreated(SessionCreated),
    /// Request to attach this connection to an existing session.
    SessionAttach(SessionAttach),
    /// Input bytes for a session's stdin.
    SessionInput(SessionInput),
    /// Terminal resize notification.
    SessionResize(SessionResize),
    /// Request to close a session and terminate its process.
    SessionClose(SessionClose),
    /// Output chunk from a session's process.
    SessionOutput(SessionOutput),
    /// Session process exited.
    SessionExit(SessionExit),
    /// This connection's attachment was taken over by another connection.
    SessionSuperseded(SessionSuperseded),
    /// Instructs the client to clear its rendered scrollback.
    SessionClear(SessionClear),
    /// Error report, scoped to a session when one is involved.
    Error(ErrorMessage),
}

/// Request to create a new shell session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionCreate {
    /// Working directory for the session.
    pub cwd: Option<String>,
    /// Additional environment variables to set.
    pub env: Vec<(String, String)>,
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    /// Unique session identifier.
    pub session_id: String,
}

/// Request to attach to an existing session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttach {
    /// Session ID to attach to.
    pub session_id: String,
}

/// Input bytes destined for a session's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    /// Session ID this input belongs to.
    pub session_id: String,
    /// The input bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Terminal resize notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResize {
    /// Session ID to resize.
    pub session_id: String,
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

/// Request to close a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClose {
    /// Session ID to close.
    pub session_id: String,
}

/// Which process stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Output chunk from a session's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    /// Session ID this output belongs to.
    pub session_id: String,
    /// The stream the chunk was read from.
    pub stream: OutputStream,
    /// The output bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Session process exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExit {
    /// Session ID that exited.
    pub session_id: String,
    /// Process exit code. -1 when the process was killed by a signal.
    pub code: i32,
}

/// Notification that another connection attached to this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSuperseded {
    /// Session ID whose attachment was taken over.
    pub session_id: String,
}

/// Instructs the client to clear its rendered scrollback for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClear {
    /// Session ID to clear.
    pub session_id: String,
}

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Session the error concerns, when one is involved.
    pub session_id: Option<String>,
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The shell process could not be launched.
    SpawnFailed,
    /// Referenced session id was never created or already reaped.
    SessionNotFound,
    /// Operation on a terminated session.
    SessionClosed,
    /// Write attempted against a closed or exited process.
    SessionNotWritable,
    /// Inbound message could not be decoded.
    Malformed,
    /// Session limit reached.
    TooManySessions,
    /// Relay-side failure not covered by a more specific code.
    Internal,
}
