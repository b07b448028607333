//! tetherd — point-to-point messaging and file-transfer daemon.
//!
//!   tetherd serve [PORT]
//!   tetherd connect ADDR...
//!
//! Each stdin line is sent as text. `/send PATH [HINT]` streams a file,
//! `/log MSG` and `/cmd CMD` send the other message kinds, `/quit` says
//! goodbye and exits. ctrl-c stops without a goodbye.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use tether_core::config::TetherConfig;
use tether_services::{
    Callbacks, ClientEndpoint, Lifecycle, Outbound, ServerEndpoint, SessionConfig, SessionError,
    SessionHandler, SessionHooks,
};

const USAGE: &str = "usage: tetherd serve [PORT] | tetherd connect ADDR...";

struct Console;

impl SessionHandler for Console {
    fn on_text_received(&self, text: &str) {
        println!("< {text}");
    }

    fn on_start_success(&self, msg: &str) {
        println!("* {msg}");
    }
}

fn callbacks() -> Callbacks {
    let hooks = SessionHooks::new()
        .on_log(|kind, msg| println!("[{kind}] {msg}"))
        .on_progress(|percent| tracing::debug!(percent, "transfer progress"))
        .on_connect_success(|| println!("* connected"))
        .on_file_received(|path| println!("* file ready: {}", path.display()))
        .on_disconnected(|| println!("* peer disconnected"));
    Callbacks::new(Arc::new(Console)).with_hooks(hooks)
}

// ── Endpoint ──────────────────────────────────────────────────────────────────

enum Endpoint {
    Server(ServerEndpoint),
    Client(ClientEndpoint),
}

impl Endpoint {
    fn outbound(&self) -> Outbound {
        match self {
            Endpoint::Server(s) => s.outbound(),
            Endpoint::Client(c) => c.outbound(),
        }
    }

    async fn wait_closed(&self) {
        match self {
            Endpoint::Server(s) => s.wait_for(Lifecycle::Closed).await,
            Endpoint::Client(c) => c.wait_for(Lifecycle::Closed).await,
        };
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        match self {
            Endpoint::Server(s) => s.disconnect().await,
            Endpoint::Client(c) => c.disconnect().await,
        }
    }

    async fn stop(&self) {
        match self {
            Endpoint::Server(s) => s.stop().await,
            Endpoint::Client(c) => c.stop().await,
        }
    }
}

// ── Console input ─────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Text(&'a str),
    Log(&'a str),
    Command(&'a str),
    Send { path: &'a str, hint: Option<&'a str> },
    Quit,
    Usage(&'static str),
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "/quit" {
        return Input::Quit;
    }
    if line == "/send" || line.starts_with("/send ") {
        let mut parts = line["/send".len()..].split_whitespace();
        return match (parts.next(), parts.next(), parts.next()) {
            (Some(path), hint, None) => Input::Send { path, hint },
            _ => Input::Usage("/send PATH [HINT]"),
        };
    }
    if let Some(msg) = line.strip_prefix("/log ") {
        return Input::Log(msg);
    }
    if let Some(cmd) = line.strip_prefix("/cmd ") {
        return Input::Command(cmd);
    }
    Input::Text(line)
}

/// Act on one console line. Returns false once the user asked to quit.
async fn handle_input(endpoint: &Endpoint, outbound: &Outbound, line: &str) -> bool {
    // Send failures are already reported through the error callback.
    match parse_input(line) {
        Input::Quit => {
            endpoint.disconnect().await.ok();
            return false;
        }
        Input::Usage(usage) => eprintln!("usage: {usage}"),
        Input::Send { path, hint } => {
            outbound.send_file(Path::new(path), hint).await.ok();
        }
        Input::Log(msg) => {
            outbound.send_log(msg).await.ok();
        }
        Input::Command(cmd) => {
            outbound.send_command(cmd).await.ok();
        }
        Input::Text(text) => {
            outbound.send_text(text).await.ok();
        }
    }
    true
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let mode = args.next().context(USAGE)?;
    let rest: Vec<String> = args.collect();
    let session_config = SessionConfig::from(&config);
    let receive_dir: PathBuf = config.transfer.receive_dir.clone();

    let endpoint = match mode.as_str() {
        "serve" => {
            let port = match rest.first() {
                Some(p) => p.parse().with_context(|| format!("invalid port {p:?}"))?,
                None => config.network.port,
            };
            tracing::info!(port, "tetherd serving");
            let server = ServerEndpoint::start(port, receive_dir, callbacks(), session_config)
                .await
                .context("failed to start server")?;
            Endpoint::Server(server)
        }
        "connect" => {
            let candidates = if rest.is_empty() {
                config.network.candidates.clone()
            } else {
                rest
            };
            if candidates.is_empty() {
                bail!("no addresses to dial\n{USAGE}");
            }
            tracing::info!(?candidates, "tetherd connecting");
            let client = ClientEndpoint::connect(&candidates, receive_dir, callbacks(), session_config)
                .await
                .context("failed to connect")?;
            Endpoint::Client(client)
        }
        other => bail!("unknown mode {other:?}\n{USAGE}"),
    };

    let outbound = endpoint.outbound();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                endpoint.stop().await;
                break;
            }
            _ = endpoint.wait_closed() => {
                tracing::info!("endpoint closed");
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if !handle_input(&endpoint, &outbound, &line).await {
                        break;
                    }
                }
                // Keep serving without a console until ctrl-c.
                None => stdin_open = false,
            },
        }
    }

    Ok(())
}
