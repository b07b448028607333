//! One connected stream: the outbound writer and the read loop.
//!
//! Both endpoint roles share this module. The read loop decodes one
//! envelope per line and dispatches it on the same task, so callbacks see
//! envelopes in stream order. It ends on the `Bye` sentinel, end of
//! stream, a read or decode failure, or the endpoint's shutdown signal.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, watch, Mutex};

use tether_core::config::{TetherConfig, DEFAULT_CHUNK_SIZE};
use tether_core::wire::{self, DEFAULT_MAX_LINE_BYTES};
use tether_core::{Body, Envelope, Kind};

use crate::callback::Callbacks;
use crate::error::SessionError;
use crate::transfer::{ChunkOutcome, FileReceiver, FileSender};

// ── Config ────────────────────────────────────────────────────────────────────

/// Runtime knobs for one endpoint.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each dial attempt.
    pub connect_timeout: Duration,
    /// Deadline for each line read. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub max_line_bytes: usize,
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&TetherConfig> for SessionConfig {
    /// Chunks too large to fit one line are clamped, since the peer would
    /// otherwise reject every File envelope.
    fn from(config: &TetherConfig) -> Self {
        let max_line_bytes = config.network.max_line_bytes;
        let mut chunk_size = config.transfer.chunk_size;
        let limit = wire::max_chunk_for_line(max_line_bytes);
        if chunk_size > limit {
            tracing::warn!(chunk_size, max_line_bytes, limit, "chunk size does not fit a line, clamping");
            chunk_size = limit;
        }
        Self {
            connect_timeout: config.network.connect_timeout(),
            idle_timeout: config.network.idle_timeout(),
            max_line_bytes,
            chunk_size,
        }
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Endpoint state. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Listening,
    Dialing,
    Connected,
    Closed,
}

/// Shared, observable lifecycle state.
#[derive(Clone)]
pub(crate) struct LifecycleCell(Arc<watch::Sender<Lifecycle>>);

impl LifecycleCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(watch::Sender::new(Lifecycle::Idle)))
    }

    /// Move to `next` unless already closed.
    pub(crate) fn set(&self, next: Lifecycle) {
        self.0.send_if_modified(|state| {
            if *state == Lifecycle::Closed || *state == next {
                return false;
            }
            tracing::debug!(from = ?state, to = ?next, "lifecycle");
            *state = next;
            true
        });
    }

    pub(crate) fn get(&self) -> Lifecycle {
        *self.0.borrow()
    }

    pub(crate) async fn wait_for(&self, target: Lifecycle) -> Lifecycle {
        let mut rx = self.0.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let state = match rx.wait_for(|s| *s == target || *s == Lifecycle::Closed).await {
            Ok(state) => *state,
            Err(_) => Lifecycle::Closed,
        };
        state
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of the current stream. Whole envelopes are written under a
/// lock, so concurrent senders never interleave within a line.
///
/// A write blocked on a peer that stopped reading is aborted by
/// [`Outbound::detach`], so tearing down a session never waits on the peer.
#[derive(Clone)]
pub struct Outbound {
    slot: Arc<Mutex<Option<Writer>>>,
    /// Bumped on every detach; in-flight writes watch it.
    detached: Arc<watch::Sender<u64>>,
    lifecycle: LifecycleCell,
    callbacks: Callbacks,
    chunk_size: usize,
}

impl Outbound {
    pub(crate) fn new(callbacks: Callbacks, chunk_size: usize, lifecycle: LifecycleCell) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            detached: Arc::new(watch::Sender::new(0)),
            lifecycle,
            callbacks,
            chunk_size,
        }
    }

    pub(crate) async fn attach(&self, writer: impl AsyncWrite + Send + Unpin + 'static) {
        *self.slot.lock().await = Some(Box::new(writer));
    }

    /// Abort any in-flight write, then drop the writer, shutting down our
    /// direction of the stream.
    pub(crate) async fn detach(&self) {
        self.detached.send_modify(|generation| *generation += 1);
        if let Some(mut writer) = self.slot.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "writer shutdown failed");
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Encode and write one envelope. Errors are returned, not reported.
    pub async fn write(&self, envelope: &Envelope) -> Result<(), SessionError> {
        if self.lifecycle.get() == Lifecycle::Closed {
            return Err(SessionError::Closed);
        }
        let line = wire::encode_line(envelope)?;
        let mut detached = self.detached.subscribe();
        let mut slot = self.slot.lock().await;
        let writer = slot.as_mut().ok_or(SessionError::NotConnected)?;
        let send = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        tokio::select! {
            written = send => written.map_err(SessionError::Send),
            _ = detached.changed() => Err(SessionError::Send(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "stream detached during write",
            ))),
        }
    }

    /// Write one envelope; on failure the message is dropped and the
    /// error reported.
    pub async fn send(&self, envelope: &Envelope, context: &str) -> Result<(), SessionError> {
        let result = self.write(envelope).await;
        if let Err(e) = &result {
            self.callbacks.error(e, context);
        }
        result
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.send(&Envelope::text(text), "send text").await
    }

    pub async fn send_log(&self, msg: &str) -> Result<(), SessionError> {
        self.send(&Envelope::log(msg), "send log").await
    }

    pub async fn send_command(&self, cmd: &str) -> Result<(), SessionError> {
        self.send(&Envelope::command(cmd), "send command").await
    }

    /// Stream a file as File envelopes, reporting progress after each chunk.
    pub async fn send_file(&self, path: &Path, save_hint: Option<&str>) -> Result<(), SessionError> {
        let result = self.stream_file(path, save_hint).await;
        if let Err(e) = &result {
            self.callbacks.error(e, "send file");
        }
        result
    }

    async fn stream_file(&self, path: &Path, save_hint: Option<&str>) -> Result<(), SessionError> {
        let mut sender = FileSender::open(path, self.chunk_size, save_hint.map(String::from))?;
        tracing::info!(
            file = sender.file_name(),
            bytes = sender.file_size(),
            digest = sender.digest(),
            "sending file"
        );
        let mut chunks = 0usize;
        while let Some(chunk) = sender.next_chunk()? {
            let percent = chunk.percent();
            self.write(&Envelope::file(chunk)).await?;
            self.callbacks.hooks.progress(percent);
            chunks += 1;
        }
        tracing::info!(file = sender.file_name(), chunks, "file sent");
        Ok(())
    }
}

// ── Read loop ─────────────────────────────────────────────────────────────────

/// Everything a read loop needs, owned by the endpoint's worker task.
pub(crate) struct SessionContext {
    pub(crate) role: Role,
    pub(crate) callbacks: Callbacks,
    pub(crate) config: SessionConfig,
    pub(crate) receive_dir: PathBuf,
    pub(crate) outbound: Outbound,
}

/// Why a read loop stopped.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Peer sent the `Bye` sentinel.
    Bye,
    /// Peer closed its side of the stream.
    PeerClosed,
    /// Local shutdown signal.
    Shutdown,
    Failed(SessionError),
}

/// Run the read loop until it ends, then release the writer.
///
/// The caller has already attached the write half to `ctx.outbound`.
pub(crate) async fn run_session<R>(
    reader: R,
    peer: SocketAddr,
    ctx: &SessionContext,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut receiver = FileReceiver::new(ctx.receive_dir.clone());
    let mut line = String::new();

    let end = loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.recv() => break SessionEnd::Shutdown,
            r = read_line(&mut reader, &mut line, &ctx.config) => r,
        };
        match read {
            Ok(0) => break SessionEnd::PeerClosed,
            Ok(_) => {}
            Err(e) => break SessionEnd::Failed(e),
        }
        let envelope = match wire::decode_line(&line) {
            Ok(env) => env,
            Err(e) => break SessionEnd::Failed(e.into()),
        };
        if let Some(end) = dispatch(envelope, ctx, &mut receiver) {
            break end;
        }
    };

    ctx.outbound.detach().await;

    let pending = receiver.in_progress();
    if !pending.is_empty() {
        tracing::warn!(%peer, files = ?pending, "session ended with incomplete transfers");
    }

    match &end {
        SessionEnd::Bye => {}
        SessionEnd::PeerClosed => {
            tracing::info!(%peer, role = ?ctx.role, "peer closed stream");
            ctx.callbacks.hooks.disconnected();
        }
        SessionEnd::Shutdown => {
            tracing::info!(%peer, role = ?ctx.role, "session stopped");
        }
        SessionEnd::Failed(e) => {
            tracing::error!(%peer, role = ?ctx.role, error = %e, "read loop failed");
            ctx.callbacks.error(e, "read loop");
            ctx.callbacks.hooks.disconnected();
        }
    }
    end
}

/// Read one line, bounded in length and optionally in time.
async fn read_line<R>(
    reader: &mut R,
    buf: &mut String,
    config: &SessionConfig,
) -> Result<usize, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let limit = config.max_line_bytes as u64 + 1;
    let mut bounded = (&mut *reader).take(limit);
    let read = bounded.read_line(buf);
    let n = match config.idle_timeout {
        Some(t) => tokio::time::timeout(t, read)
            .await
            .map_err(|_| SessionError::IdleTimeout(t))?,
        None => read.await,
    }
    .map_err(SessionError::Read)?;

    if n as u64 >= limit && !buf.ends_with('\n') {
        wire::check_line_len(n, config.max_line_bytes)?;
    }
    Ok(n)
}

/// Route one envelope. Returns `Some` when the loop should stop.
fn dispatch(
    envelope: Envelope,
    ctx: &SessionContext,
    receiver: &mut FileReceiver,
) -> Option<SessionEnd> {
    let callbacks = &ctx.callbacks;
    if envelope.is_bye() {
        tracing::info!(role = ?ctx.role, "peer said bye");
        callbacks.hooks.disconnected();
        return Some(SessionEnd::Bye);
    }

    match envelope.body {
        Body::Text(text) => callbacks.handler.on_text_received(&text),
        Body::Log(msg) => callbacks.hooks.log(Kind::Log, &msg),
        Body::Command(cmd) => callbacks.hooks.log(Kind::Command, &cmd),
        Body::File(chunk) => match receiver.handle_chunk(&chunk) {
            Ok(ChunkOutcome::Appended { percent, .. }) => callbacks.hooks.progress(percent),
            Ok(ChunkOutcome::Completed { path }) => {
                callbacks.hooks.progress(100);
                callbacks.hooks.file_received(&path);
            }
            Ok(ChunkOutcome::AlreadyPresent { path, first_notice }) => {
                if first_notice {
                    tracing::info!(path = %path.display(), "file already present, not rewriting");
                    callbacks.hooks.progress(100);
                    callbacks.hooks.file_received(&path);
                }
            }
            Err(e) => callbacks.error(&SessionError::Transfer(e), "receive file"),
        },
    }
    None
}
