//! Per-connection message dispatch.
//!
//! One [`Connection`] exists per client transport connection. It routes
//! inbound control messages to the session registry, intercepts
//! pseudo-commands before they reach process stdin, and tracks which
//! sessions the connection is attached to so they can all be detached
//! when the transport drops. Session output flows to the client through
//! the connection's outbound channel, which the registry holds as the
//! session's attached sink.

use std::collections::HashSet;

use tokio::sync::mpsc;

use protocol::{
    ErrorCode, ErrorMessage, Message, OutputStream, SessionAttach, SessionClear, SessionClose,
    SessionCreate, SessionCreated, SessionInput, SessionOutput, SessionResize,
};

use crate::commands::{self, PseudoCommand};
use crate::process::ProcessSpawner;
use crate::registry::SessionRegistry;
use crate::session::{ClientSink, SessionError, SessionId};

/// State for one client connection.
pub struct Connection<S: ProcessSpawner> {
    conn_id: u64,
    registry: SessionRegistry<S>,
    outbound: mpsc::Sender<Message>,
    /// Sessions this connection is (or was) attached to.
    attached: HashSet<SessionId>,
}

impl<S: ProcessSpawner> Connection<S> {
    /// Creates dispatch state for a new connection.
    pub fn new(conn_id: u64, registry: SessionRegistry<S>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            registry,
            outbound,
            attached: HashSet::new(),
        }
    }

    fn sink(&self) -> ClientSink {
        ClientSink {
            conn_id: self.conn_id,
            tx: self.outbound.clone(),
        }
    }

    /// Dispatches one inbound message.
    ///
    /// Errors never tear down the connection; they are reported back as
    /// `Error` messages scoped to the session involved.
    pub async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::SessionCreate(req) => self.on_create(req).await,
            Message::SessionAttach(req) => self.on_attach(req).await,
            Message::SessionInput(req) => self.on_input(req).await,
            Message::SessionResize(req) => self.on_resize(req).await,
            Message::SessionClose(req) => self.on_close(req).await,
            other => {
                tracing::warn!(
                    conn_id = self.conn_id,
                    message = ?other,
                    "Client sent a relay-to-client message"
                );
                self.send_error(None, ErrorCode::Malformed, "message type is relay-to-client only")
                    .await;
            }
        }
    }

    /// Detaches every session this connection held. Called when the
    /// transport is lost or closed.
    pub async fn on_disconnect(&mut self) {
        let sessions = std::mem::take(&mut self.attached);
        let count = sessions.len();
        for id in sessions {
            if let Err(e) = self.registry.detach(&id, self.conn_id).await {
                tracing::debug!(
                    conn_id = self.conn_id,
                    session_id = %id,
                    error = %e,
                    "Detach on disconnect skipped"
                );
            }
        }
        tracing::info!(conn_id = self.conn_id, sessions = count, "Connection closed");
    }

    async fn on_create(&mut self, req: SessionCreate) {
        match self.registry.create(req.cwd, req.env, Some(self.sink())).await {
            Ok(id) => {
                self.attached.insert(id.clone());
                self.send(Message::SessionCreated(SessionCreated { session_id: id }))
                    .await;
            }
            Err(e) => self.send_session_error(None, e).await,
        }
    }

    async fn on_attach(&mut self, req: SessionAttach) {
        match self.registry.attach(&req.session_id, self.sink()).await {
            Ok(()) => {
                self.attached.insert(req.session_id);
            }
            Err(e) => self.send_session_error(Some(req.session_id), e).await,
        }
    }

    async fn on_input(&mut self, req: SessionInput) {
        if let Some(cmd) = commands::classify(&req.data) {
            self.on_pseudo_command(req.session_id, cmd).await;
            return;
        }

        if let Err(e) = self.registry.write(&req.session_id, &req.data).await {
            self.send_session_error(Some(req.session_id), e).await;
        }
    }

    /// Handles a pseudo-command. These never reach process stdin and are
    /// never recorded in history; they only refresh the activity clock.
    async fn on_pseudo_command(&mut self, session_id: SessionId, cmd: PseudoCommand) {
        if let Err(e) = self.registry.touch(&session_id).await {
            self.send_session_error(Some(session_id), e).await;
            return;
        }

        match cmd {
            PseudoCommand::Clear => {
                self.send(Message::SessionClear(SessionClear { session_id }))
                    .await;
            }
            PseudoCommand::Help => {
                self.send(Message::SessionOutput(SessionOutput {
                    session_id,
                    stream: OutputStream::Stdout,
                    data: commands::HELP_TEXT.as_bytes().to_vec(),
                }))
                .await;
            }
            PseudoCommand::History => match self.registry.history(&session_id).await {
                Ok(history) => {
                    self.send(Message::SessionOutput(SessionOutput {
                        session_id,
                        stream: OutputStream::Stdout,
                        data: commands::format_history(&history).into_bytes(),
                    }))
                    .await;
                }
                Err(e) => self.send_session_error(Some(session_id), e).await,
            },
        }
    }

    async fn on_resize(&mut self, req: SessionResize) {
        if let Err(e) = self
            .registry
            .resize(&req.session_id, req.cols, req.rows)
            .await
        {
            self.send_session_error(Some(req.session_id), e).await;
        }
    }

    async fn on_close(&mut self, req: SessionClose) {
        self.attached.remove(&req.session_id);
        if let Err(e) = self.registry.close(&req.session_id).await {
            self.send_session_error(Some(req.session_id), e).await;
        }
    }

    async fn send(&self, msg: Message) {
        if self.outbound.send(msg).await.is_err() {
            tracing::debug!(conn_id = self.conn_id, "Outbound channel closed");
        }
    }

    async fn send_session_error(&self, session_id: Option<SessionId>, err: SessionError) {
        tracing::debug!(
            conn_id = self.conn_id,
            session_id = ?session_id,
            error = %err,
            "Operation failed"
        );
        self.send(Message::Error(ErrorMessage {
            session_id,
            code: error_code(&err),
            message: err.to_string(),
        }))
        .await;
    }

    async fn send_error(&self, session_id: Option<SessionId>, code: ErrorCode, message: &str) {
        self.send(Message::Error(ErrorMessage {
            session_id,
            code,
            message: message.to_string(),
        }))
        .await;
    }
}

/// Maps a session error to its wire error code.
fn error_code(err: &SessionError) -> ErrorCode {
    match err {
        SessionError::SpawnFailed(_) => ErrorCode::SpawnFailed,
        SessionError::NotFound(_) => ErrorCode::SessionNotFound,
        SessionError::Closed(_) => ErrorCode::SessionClosed,
        SessionError::NotWritable(_) => ErrorCode::SessionNotWritable,
        SessionError::TooManySessions(_) => ErrorCode::TooManySessions,
        SessionError::WriteFailed(_) | SessionError::ResizeFailed(_) | SessionError::Io(_) => {
            ErrorCode::Internal
        }
    }
}
