//! Dialing endpoint.
//!
//! Candidates are tried in order, each bounded by the connect timeout.
//! The first stream that comes up wins; the client then greets the server
//! with a handshake Text envelope and hands the read half to its worker.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use tether_core::envelope::HANDSHAKE_TEXT;
use tether_core::{Envelope, Kind};

use crate::callback::Callbacks;
use crate::error::SessionError;
use crate::session::{
    run_session, Lifecycle, LifecycleCell, Outbound, Role, SessionConfig, SessionContext,
};

pub struct ClientEndpoint {
    peer_addr: SocketAddr,
    lifecycle: LifecycleCell,
    outbound: Outbound,
    shutdown: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientEndpoint {
    /// Dial `host:port` candidates in order.
    ///
    /// When every candidate fails the failure is logged and passed to the
    /// `on_log` hook; the error callbacks stay silent.
    pub async fn connect<S: AsRef<str>>(
        candidates: &[S],
        receive_dir: impl Into<PathBuf>,
        callbacks: Callbacks,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let candidates: Vec<String> = candidates.iter().map(|c| c.as_ref().to_string()).collect();
        Self::establish(candidates, receive_dir.into(), callbacks, config, false).await
    }

    /// Dial a single address. Failure also reaches the error callback and
    /// the `on_connect_failure` hook.
    pub async fn connect_addr(
        host: &str,
        port: u16,
        receive_dir: impl Into<PathBuf>,
        callbacks: Callbacks,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let candidates = vec![format!("{host}:{port}")];
        Self::establish(candidates, receive_dir.into(), callbacks, config, true).await
    }

    async fn establish(
        candidates: Vec<String>,
        receive_dir: PathBuf,
        callbacks: Callbacks,
        config: SessionConfig,
        single: bool,
    ) -> Result<Self, SessionError> {
        let lifecycle = LifecycleCell::new();
        lifecycle.set(Lifecycle::Dialing);

        let Some((stream, peer_addr)) = dial(&candidates, &config).await else {
            let err = SessionError::ConnectFailed { candidates };
            tracing::warn!(error = %err, "connection failed");
            callbacks.hooks.log(Kind::Log, &format!("connection failed: {err}"));
            if single {
                callbacks.error(&err, "connect");
                callbacks.hooks.connect_failure(&err);
            }
            lifecycle.set(Lifecycle::Closed);
            return Err(err);
        };

        tracing::info!(peer = %peer_addr, "connected");
        lifecycle.set(Lifecycle::Connected);
        callbacks.hooks.connect_success();

        let (reader, writer) = stream.into_split();
        let outbound = Outbound::new(callbacks.clone(), config.chunk_size, lifecycle.clone());
        outbound.attach(writer).await;
        // A failed greeting is reported; the read loop notices the dead stream.
        outbound.send_text(HANDSHAKE_TEXT).await.ok();

        let ctx = SessionContext {
            role: Role::Client,
            callbacks,
            config,
            receive_dir,
            outbound: outbound.clone(),
        };
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let worker_lifecycle = lifecycle.clone();
        let worker = tokio::spawn(async move {
            let end = run_session(reader, peer_addr, &ctx, &mut shutdown_rx).await;
            tracing::debug!(peer = %peer_addr, ?end, "client read loop exited");
            worker_lifecycle.set(Lifecycle::Closed);
        });

        Ok(Self {
            peer_addr,
            lifecycle,
            outbound,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    /// Wait until the endpoint reaches `state`, or `Closed`.
    pub async fn wait_for(&self, state: Lifecycle) -> Lifecycle {
        self.lifecycle.wait_for(state).await
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.outbound.send_text(text).await
    }

    pub async fn send_log(&self, msg: &str) -> Result<(), SessionError> {
        self.outbound.send_log(msg).await
    }

    pub async fn send_command(&self, cmd: &str) -> Result<(), SessionError> {
        self.outbound.send_command(cmd).await
    }

    pub async fn send_file(&self, path: &Path, save_hint: Option<&str>) -> Result<(), SessionError> {
        self.outbound.send_file(path, save_hint).await
    }

    /// Say `Bye`, then stop.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let result = if self.outbound.is_connected().await {
            self.outbound.send(&Envelope::bye(), "disconnect").await
        } else {
            Ok(())
        };
        self.stop().await;
        result
    }

    /// End the read loop and release the stream.
    pub async fn stop(&self) {
        self.shutdown.send(()).ok();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "client worker panicked");
            }
        }
        self.outbound.detach().await;
        self.lifecycle.set(Lifecycle::Closed);
        tracing::info!(peer = %self.peer_addr, "client stopped");
    }
}

/// Try each candidate in turn. Resolution, refusal and timeouts all just
/// move on to the next one.
async fn dial(candidates: &[String], config: &SessionConfig) -> Option<(TcpStream, SocketAddr)> {
    for candidate in candidates {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect(candidate.as_str())).await {
            Ok(Ok(stream)) => match stream.peer_addr() {
                Ok(peer) => return Some((stream, peer)),
                Err(e) => tracing::debug!(candidate = %candidate, error = %e, "connected stream has no peer"),
            },
            Ok(Err(e)) => tracing::debug!(candidate = %candidate, error = %e, "candidate refused"),
            Err(_) => tracing::debug!(candidate = %candidate, "candidate timed out"),
        }
    }
    None
}
