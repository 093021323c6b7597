//! ShellMux wire protocol.
//!
//! This crate defines the message types, envelope format, and frame codec
//! shared between the relay daemon and its clients. A single connection
//! multiplexes traffic for any number of terminal sessions; every
//! session-scoped message carries the session id it belongs to.
//!
//! # Architecture
//!
//! - [`messages`]: Message type definitions and the versioned envelope
//! - [`framing`]: Length-prefixed frame codec for streaming transports
//! - [`error`]: Error types for protocol operations

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{Frame, FrameCodec, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};
pub use messages::{
    Envelope, ErrorCode, ErrorMessage, Message, OutputStream, SessionAttach, SessionClear,
    SessionClose, SessionCreate, SessionCreated, SessionExit, SessionInput, SessionOutput,
    SessionResize, SessionSuperseded, PROTOCOL_VERSION,
};
