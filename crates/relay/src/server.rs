//! TCP server wiring framed envelopes to the multiplexer.
//!
//! Each accepted connection gets a reader loop and an outbound writer
//! task. The reader accumulates bytes, decodes length-prefixed frames,
//! and hands decoded messages to the connection's dispatcher. The writer
//! drains the connection's outbound channel, wrapping each message in a
//! sequenced envelope. Undecodable envelopes produce an error reply and
//! leave the connection (and every session) intact; a framing failure
//! desynchronizes the byte stream and drops the connection.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use protocol::{Envelope, ErrorCode, ErrorMessage, Frame, FrameCodec, Message};

use crate::mux::Connection;
use crate::process::ProcessSpawner;
use crate::registry::SessionRegistry;

/// Capacity of each connection's outbound message channel.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Transport read size.
const READ_BUFFER_SIZE: usize = 8192;

/// Binds the listen address and serves until shutdown.
pub async fn run<S: ProcessSpawner>(
    addr: SocketAddr,
    registry: SessionRegistry<S>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    serve(listener, registry, shutdown).await
}

/// Accept loop over an already-bound listener.
pub async fn serve<S: ProcessSpawner>(
    listener: TcpListener,
    registry: SessionRegistry<S>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("No local address")?;
    tracing::info!(%addr, "Relay listening");

    let mut next_conn_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Accept loop stopped");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Accept failed")?;
                next_conn_id += 1;
                let conn_id = next_conn_id;
                tracing::info!(conn_id, %peer, "Client connected");

                let registry = registry.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, conn_id, registry, shutdown).await {
                        tracing::debug!(conn_id, error = %e, "Connection ended with error");
                    }
                });
            }
        }
    }
    Ok(())
}

/// Runs one connection to completion: reader loop here, writer task
/// alongside, detach-all once the transport is gone.
async fn handle_connection<S: ProcessSpawner>(
    stream: TcpStream,
    conn_id: u64,
    registry: SessionRegistry<S>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);
    let writer = tokio::spawn(write_outbound(write_half, out_rx));

    let mut conn = Connection::new(conn_id, registry, out_tx.clone());
    let codec = FrameCodec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut read_buf = [0u8; READ_BUFFER_SIZE];

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            read = read_half.read(&mut read_buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        pending.extend_from_slice(&read_buf[..n]);
                        if let Err(e) = process_frames(&codec, &mut pending, &mut conn, &out_tx).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(anyhow::Error::from(e)),
                }
            }
        }
    };

    // Detach drops the registry's sink clones, which lets the writer
    // task drain and finish once out_tx goes out of scope.
    conn.on_disconnect().await;
    drop(conn);
    drop(out_tx);
    let _ = writer.await;

    result
}

/// Decodes and dispatches every complete frame in the pending buffer.
async fn process_frames<S: ProcessSpawner>(
    codec: &FrameCodec,
    pending: &mut Vec<u8>,
    conn: &mut Connection<S>,
    out_tx: &mpsc::Sender<Message>,
) -> Result<()> {
    loop {
        match codec.try_decode(pending) {
            Ok(None) => return Ok(()),
            Ok(Some((frame, consumed))) => {
                pending.drain(..consumed);
                match Envelope::from_msgpack(&frame.payload) {
                    Ok(envelope) => conn.handle_message(envelope.payload).await,
                    Err(e) => {
                        // Frame boundaries are intact, so the connection
                        // survives an undecodable envelope
                        tracing::warn!(error = %e, "Undecodable envelope");
                        let _ = out_tx
                            .send(Message::Error(ErrorMessage {
                                session_id: None,
                                code: ErrorCode::Malformed,
                                message: e.to_string(),
                            }))
                            .await;
                    }
                }
            }
            Err(e) => {
                let _ = out_tx
                    .send(Message::Error(ErrorMessage {
                        session_id: None,
                        code: ErrorCode::Malformed,
                        message: e.to_string(),
                    }))
                    .await;
                return Err(anyhow::anyhow!("frame stream desynchronized: {}", e));
            }
        }
    }
}

/// Writer task: wraps outbound messages in sequenced envelopes and
/// writes them as frames until the channel closes or the peer is gone.
async fn write_outbound(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    let codec = FrameCodec::new();
    let mut sequence: u64 = 0;

    while let Some(msg) = rx.recv().await {
        let envelope = Envelope::new(sequence, msg);
        sequence += 1;

        let bytes = match envelope
            .to_msgpack()
            .and_then(|payload| codec.encode(&Frame::new(payload)))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode outbound message");
                continue;
            }
        };

        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
}
