//! Listening endpoint.
//!
//! One worker task owns the listener. It accepts a peer, serves that
//! peer's read loop to completion, then goes back to accepting. A second
//! peer waits in the backlog until the first one leaves.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use tether_core::Envelope;

use crate::callback::Callbacks;
use crate::error::SessionError;
use crate::session::{
    run_session, Lifecycle, LifecycleCell, Outbound, Role, SessionConfig, SessionContext,
    SessionEnd,
};

pub struct ServerEndpoint {
    local_addr: SocketAddr,
    lifecycle: LifecycleCell,
    outbound: Outbound,
    shutdown: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServerEndpoint {
    /// Prepare `receive_dir`, bind `0.0.0.0:port` and start accepting.
    ///
    /// Port 0 binds an ephemeral port; see [`ServerEndpoint::local_addr`].
    /// Failures are reported through the error callback and returned.
    pub async fn start(
        port: u16,
        receive_dir: impl Into<PathBuf>,
        callbacks: Callbacks,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let receive_dir = receive_dir.into();
        if let Err(source) = tokio::fs::create_dir_all(&receive_dir).await {
            let err = SessionError::ReceiveDir {
                path: receive_dir,
                source,
            };
            callbacks.error(&err, "start server");
            return Err(err);
        }

        let bound = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                let err = SessionError::Bind { port, source };
                callbacks.error(&err, "start server");
                return Err(err);
            }
        };

        let lifecycle = LifecycleCell::new();
        lifecycle.set(Lifecycle::Listening);
        tracing::info!(addr = %local_addr, receive_dir = %receive_dir.display(), "server listening");
        callbacks
            .handler
            .on_start_success(&format!("listening on {local_addr}"));

        let outbound = Outbound::new(callbacks.clone(), config.chunk_size, lifecycle.clone());
        let ctx = SessionContext {
            role: Role::Server,
            callbacks,
            config,
            receive_dir,
            outbound: outbound.clone(),
        };
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(accept_loop(listener, ctx, lifecycle.clone(), shutdown_rx));

        Ok(Self {
            local_addr,
            lifecycle,
            outbound,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    /// Wait until the endpoint reaches `state`, or `Closed`.
    pub async fn wait_for(&self, state: Lifecycle) -> Lifecycle {
        self.lifecycle.wait_for(state).await
    }

    /// Sending handle for the current peer, usable from other tasks.
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

    /// Say `Bye` to the current peer, if any, then stop.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let result = if self.outbound.is_connected().await {
            self.outbound.send(&Envelope::bye(), "disconnect").await
        } else {
            Ok(())
        };
        self.stop().await;
        result
    }

    /// Stop accepting, end any live session and wait for the worker.
    pub async fn stop(&self) {
        // No receiver means the worker already exited.
        self.shutdown.send(()).ok();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "server worker panicked");
            }
        }
        self.outbound.detach().await;
        self.lifecycle.set(Lifecycle::Closed);
        tracing::info!(addr = %self.local_addr, "server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: SessionContext,
    lifecycle: LifecycleCell,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    ctx.callbacks.error(&SessionError::Accept(e), "accept");
                    break;
                }
            },
        };

        tracing::info!(%peer, "peer connected");
        let (reader, writer) = stream.into_split();
        ctx.outbound.attach(writer).await;
        lifecycle.set(Lifecycle::Connected);

        match run_session(reader, peer, &ctx, &mut shutdown).await {
            SessionEnd::Shutdown => break,
            end => {
                tracing::debug!(%peer, ?end, "session over, accepting again");
                lifecycle.set(Lifecycle::Listening);
            }
        }
    }
    lifecycle.set(Lifecycle::Closed);
    tracing::debug!("accept loop exited");
}
