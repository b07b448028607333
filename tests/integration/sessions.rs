use crate::*;

use tether_core::Envelope;
use tether_services::{ClientEndpoint, Lifecycle, ServerEndpoint, SessionConfig};

async fn start(scratch: &Scratch, rec: &Arc<Recorder>) -> Result<ServerEndpoint> {
    Ok(ServerEndpoint::start(0, scratch.path(), rec.callbacks(), SessionConfig::default()).await?)
}

async fn dial(server: &ServerEndpoint, scratch: &Scratch, rec: &Arc<Recorder>) -> Result<ClientEndpoint> {
    Ok(ClientEndpoint::connect(
        &[loopback(server)],
        scratch.path(),
        rec.callbacks(),
        SessionConfig::default(),
    )
    .await?)
}

/// Stopping a server that is blocked in accept returns promptly.
#[tokio::test]
async fn test_stop_while_accepting() -> Result<()> {
    let scratch = Scratch::new("stop-accept");
    let rec = Recorder::new();
    let server = start(&scratch, &rec).await?;
    assert_eq!(rec.count(|e| matches!(e, Event::Started(_))), 1);

    tokio::time::timeout(WAIT, server.stop()).await?;
    assert_eq!(server.lifecycle(), Lifecycle::Closed);

    // The listener is gone with the worker.
    let addr = loopback(&server);
    assert!(tokio::net::TcpStream::connect(addr.as_str()).await.is_err());
    Ok(())
}

/// `Bye` ends the peer's read loop after exactly one disconnect, and
/// nothing that follows it on the stream is processed.
#[tokio::test]
async fn test_bye_ends_session_once() -> Result<()> {
    let scratch = Scratch::new("bye");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();
    let server = start(&scratch, &server_rec).await?;
    let client = dial(&server, &scratch, &client_rec).await?;
    server_rec.wait_for_text("client connected").await?;

    let outbound = client.outbound();
    outbound.write(&Envelope::bye()).await?;
    // The server may already have closed; only what it processes matters.
    outbound.write(&Envelope::text("after bye")).await.ok();

    server_rec
        .wait_for("disconnect", |e| *e == Event::Disconnected)
        .await?;
    assert_eq!(server.wait_for(Lifecycle::Listening).await, Lifecycle::Listening);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server_rec.count(|e| *e == Event::Disconnected), 1);
    assert_eq!(server_rec.count(|e| *e == Event::Text("after bye".into())), 0);
    assert!(server_rec.errors().is_empty(), "{:?}", server_rec.errors());

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// One peer at a time: the server returns to accepting once a peer leaves.
#[tokio::test]
async fn test_sequential_peers() -> Result<()> {
    let scratch = Scratch::new("sequential");
    let server_rec = Recorder::new();
    let server = start(&scratch, &server_rec).await?;

    for round in 0..2 {
        let client_rec = Recorder::new();
        let client = dial(&server, &scratch, &client_rec).await?;
        client.send_text(&format!("round {round}")).await?;
        server_rec.wait_for_text(&format!("round {round}")).await?;
        client.disconnect().await?;
        assert_eq!(client.lifecycle(), Lifecycle::Closed);
        server_rec
            .wait_for("disconnects", |_| {
                server_rec.count(|e| *e == Event::Disconnected) > round
            })
            .await?;
    }

    assert_eq!(
        server_rec.count(|e| *e == Event::Text("client connected".into())),
        2
    );

    server.stop().await;
    Ok(())
}

/// A server stopping mid-session closes the client's stream.
#[tokio::test]
async fn test_server_stop_disconnects_client() -> Result<()> {
    let scratch = Scratch::new("server-stop");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();
    let server = start(&scratch, &server_rec).await?;
    let client = dial(&server, &scratch, &client_rec).await?;
    server_rec.wait_for_text("client connected").await?;

    server.stop().await;

    let state = tokio::time::timeout(WAIT, client.wait_for(Lifecycle::Closed)).await?;
    assert_eq!(state, Lifecycle::Closed);
    client_rec
        .wait_for("disconnect", |e| *e == Event::Disconnected)
        .await?;
    assert!(matches!(
        client.send_text("anyone?").await,
        Err(SessionError::Closed)
    ));
    Ok(())
}

/// `Bye` from the server ends the client's read loop after exactly one
/// disconnect, and nothing after it is processed.
#[tokio::test]
async fn test_server_bye_ends_client_once() -> Result<()> {
    let scratch = Scratch::new("server-bye");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();
    let server = start(&scratch, &server_rec).await?;
    let client = dial(&server, &scratch, &client_rec).await?;
    server_rec.wait_for_text("client connected").await?;

    let outbound = server.outbound();
    outbound.write(&Envelope::bye()).await?;
    // The client may already have closed; only what it processes matters.
    outbound.write(&Envelope::text("after bye")).await.ok();

    let state = tokio::time::timeout(WAIT, client.wait_for(Lifecycle::Closed)).await?;
    assert_eq!(state, Lifecycle::Closed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client_rec.count(|e| *e == Event::Disconnected), 1);
    assert_eq!(client_rec.count(|e| *e == Event::Text("after bye".into())), 0);
    assert!(client_rec.errors().is_empty(), "{:?}", client_rec.errors());

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// `ServerEndpoint::disconnect` says goodbye to the peer and stops.
#[tokio::test]
async fn test_server_disconnect_says_bye() -> Result<()> {
    let scratch = Scratch::new("server-disconnect");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();
    let server = start(&scratch, &server_rec).await?;
    let client = dial(&server, &scratch, &client_rec).await?;
    server_rec.wait_for_text("client connected").await?;

    server.disconnect().await?;
    assert_eq!(server.lifecycle(), Lifecycle::Closed);

    let state = tokio::time::timeout(WAIT, client.wait_for(Lifecycle::Closed)).await?;
    assert_eq!(state, Lifecycle::Closed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client_rec.count(|e| *e == Event::Disconnected), 1);
    Ok(())
}

/// A peer that never reads cannot hold `stop()` hostage: the blocked send
/// fails and the server shuts down.
#[tokio::test]
async fn test_stop_with_send_blocked_on_stalled_peer() -> Result<()> {
    let scratch = Scratch::new("stalled");
    let rec = Recorder::new();
    let server = start(&scratch, &rec).await?;
    let _peer = tokio::net::TcpStream::connect(loopback(&server).as_str()).await?;
    assert_eq!(server.wait_for(Lifecycle::Connected).await, Lifecycle::Connected);

    let outbound = server.outbound();
    let sender = tokio::spawn(async move {
        let block = "x".repeat(1024 * 1024);
        loop {
            if let Err(e) = outbound.send_text(&block).await {
                return e;
            }
        }
    });
    // Long enough for the socket buffers to fill.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!sender.is_finished(), "send should be stuck on the stalled peer");

    tokio::time::timeout(WAIT, server.stop()).await?;
    assert_eq!(server.lifecycle(), Lifecycle::Closed);

    let err = tokio::time::timeout(WAIT, sender).await??;
    assert!(matches!(
            err,
            SessionError::Send(_) | SessionError::Closed | SessionError::NotConnected
        ), "{err}");
    Ok(())
}
