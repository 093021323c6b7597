//! Shell process management.
//!
//! This module abstracts the shell process behind a pair of traits: a
//! [`ProcessSpawner`] launches processes, a [`ProcessHandle`] feeds them
//! input and requests termination. Output and the final exit code arrive
//! as [`ProcessEvent`]s on a single channel, which guarantees that every
//! output chunk is delivered before the exit event.
//!
//! [`ShellSpawner`] is the production implementation backed by
//! `tokio::process` pipes. [`fake::FakeSpawner`] is a scripted
//! implementation for deterministic tests.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use protocol::OutputStream;

use crate::session::SessionError;

/// Capacity of the process event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the stdin write channel.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Read size for stdout/stderr pipes.
const READ_CHUNK_SIZE: usize = 4096;

/// One chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Which stream the chunk was read from.
    pub stream: OutputStream,
    /// The raw bytes.
    pub data: Vec<u8>,
}

/// Event emitted by a running process.
///
/// `Exit` is always the last event on the channel; every output chunk
/// the process produced is delivered before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Output read from stdout or stderr.
    Output(OutputChunk),
    /// The process exited with the given code (-1 when killed by signal).
    Exit(i32),
}

/// Handle to a running process.
///
/// Exactly one handle exists per process; the session registry owns it.
pub trait ProcessHandle: Send + 'static {
    /// Queues input bytes for the process's stdin.
    fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Applies a terminal size change.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Requests termination. The process is asked to stop gracefully
    /// first and force-killed after a bounded timeout; the final
    /// [`ProcessEvent::Exit`] reports the outcome.
    fn terminate(&self);

    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;
}

/// Launches processes for new sessions.
pub trait ProcessSpawner: Send + Sync + 'static {
    /// Handle type produced by this spawner.
    type Handle: ProcessHandle;

    /// Spawns a process with the given working directory and extra
    /// environment. Must be called from within a tokio runtime.
    fn spawn(
        &self,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> Result<(Self::Handle, mpsc::Receiver<ProcessEvent>), SessionError>;
}

/// Production spawner running a real shell over pipes.
#[derive(Debug, Clone)]
pub struct ShellSpawner {
    /// Shell binary to launch.
    shell: String,
    /// How long to wait after SIGTERM before force-killing.
    kill_timeout: Duration,
}

impl ShellSpawner {
    /// Creates a spawner for the given shell binary.
    pub fn new(shell: impl Into<String>, kill_timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            kill_timeout,
        }
    }
}

/// Handle to a shell process spawned by [`ShellSpawner`].
#[derive(Debug)]
pub struct ShellHandle {
    input_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    pid: Option<u32>,
}

impl ProcessHandle for ShellHandle {
    fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.input_tx.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SessionError::WriteFailed("stdin write backlog is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                SessionError::WriteFailed("process stdin is closed".to_string())
            }
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        // Pipe-backed processes have no terminal to resize.
        tracing::debug!(pid = ?self.pid, cols, rows, "Resize ignored for pipe-backed session");
        Ok(())
    }

    fn terminate(&self) {
        self.cancel.cancel();
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl ProcessSpawner for ShellSpawner {
    type Handle = ShellHandle;

    fn spawn(
        &self,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> Result<(Self::Handle, mpsc::Receiver<ProcessEvent>), SessionError> {
        let mut cmd = Command::new(&self.shell);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", self.shell, e)))?;

        let pid = child.id();

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::SpawnFailed("stderr not captured".to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        // Stdin writer: consumes queued input until the handle is dropped
        // or the pipe breaks. Dropping the sender closes the shell's stdin.
        tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let stdout_task = tokio::spawn(read_stream(stdout, OutputStream::Stdout, event_tx.clone()));
        let stderr_task = tokio::spawn(read_stream(stderr, OutputStream::Stderr, event_tx.clone()));

        // Supervisor: owns the child, handles the SIGTERM-then-kill
        // escalation, and emits the exit event after both readers finish
        // so output is never reordered behind the exit.
        let token = cancel.clone();
        let kill_timeout = self.kill_timeout;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };

            let code = match status {
                Some(Ok(status)) => status.code().unwrap_or(-1),
                Some(Err(e)) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
                    -1
                }
                None => {
                    if let Some(pid) = pid {
                        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                    match tokio::time::timeout(kill_timeout, child.wait()).await {
                        Ok(Ok(status)) => status.code().unwrap_or(-1),
                        Ok(Err(e)) => {
                            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
                            -1
                        }
                        Err(_) => {
                            tracing::warn!(pid = ?pid, "Process ignored SIGTERM, force-killing");
                            let _ = child.kill().await;
                            -1
                        }
                    }
                }
            };

            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = event_tx.send(ProcessEvent::Exit(code)).await;
        });

        Ok((
            ShellHandle {
                input_tx,
                cancel,
                pid,
            },
            event_rx,
        ))
    }
}

/// Reads a process output stream to EOF, forwarding chunks as events.
async fn read_stream<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if tx.send(ProcessEvent::Output(chunk)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Scripted process implementation for tests.
///
/// The fake echoes input back as stdout and reacts to termination
/// requests the way a real process would, including one that ignores
/// the graceful stop signal and must be force-killed.
pub mod fake {
    use super::*;

    /// Spawner producing scripted fake processes.
    #[derive(Debug, Clone)]
    pub struct FakeSpawner {
        /// Echo every input chunk back as stdout.
        pub echo: bool,
        /// Simulate a process that ignores the graceful stop signal and
        /// only dies to the forced kill after `kill_timeout`.
        pub ignore_terminate: bool,
        /// Simulated SIGTERM-to-kill escalation delay.
        pub kill_timeout: Duration,
    }

    impl Default for FakeSpawner {
        fn default() -> Self {
            Self {
                echo: true,
                ignore_terminate: false,
                kill_timeout: Duration::from_secs(5),
            }
        }
    }

    /// Handle to a fake process.
    #[derive(Debug)]
    pub struct FakeHandle {
        input_tx: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    }

    impl ProcessHandle for FakeHandle {
        fn write(&self, data: &[u8]) -> Result<(), SessionError> {
            self.input_tx.try_send(data.to_vec()).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    SessionError::WriteFailed("stdin write backlog is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    SessionError::WriteFailed("process stdin is closed".to_string())
                }
            })
        }

        fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
            Ok(())
        }

        fn terminate(&self) {
            self.cancel.cancel();
        }

        fn pid(&self) -> Option<u32> {
            None
        }
    }

    impl ProcessSpawner for FakeSpawner {
        type Handle = FakeHandle;

        fn spawn(
            &self,
            _cwd: Option<&str>,
            _env: &[(String, String)],
        ) -> Result<(Self::Handle, mpsc::Receiver<ProcessEvent>), SessionError> {
            let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_CHANNEL_CAPACITY);
            let cancel = CancellationToken::new();

            let echo = self.echo;
            let ignore_terminate = self.ignore_terminate;
            let kill_timeout = self.kill_timeout;
            let token = cancel.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        data = input_rx.recv() => match data {
                            Some(data) => {
                                if echo {
                                    let chunk = OutputChunk {
                                        stream: OutputStream::Stdout,
                                        data,
                                    };
                                    if event_tx.send(ProcessEvent::Output(chunk)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            // stdin closed: the process exits cleanly
                            None => {
                                let _ = event_tx.send(ProcessEvent::Exit(0)).await;
                                break;
                            }
                        },
                        _ = token.cancelled() => {
                            let code = if ignore_terminate {
                                tokio::time::sleep(kill_timeout).await;
                                -1
                            } else {
                                0
                            };
                            let _ = event_tx.send(ProcessEvent::Exit(code)).await;
                            break;
                        }
                    }
                }
            });

            Ok((FakeHandle { input_tx, cancel }, event_rx))
        }
    }
}
