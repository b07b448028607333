use crate::*;

use tether_services::{ClientEndpoint, Lifecycle, ServerEndpoint, SessionConfig};

/// Text `"ping"` then a 5 MiB file, end to end.
#[tokio::test]
async fn test_ping_then_large_file() -> Result<()> {
    let scratch = Scratch::new("ping");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();

    let server = ServerEndpoint::start(
        0,
        scratch.join("inbox"),
        server_rec.callbacks(),
        SessionConfig::default(),
    )
    .await?;
    let client = ClientEndpoint::connect(
        &[loopback(&server)],
        scratch.join("client-inbox"),
        client_rec.callbacks(),
        SessionConfig::default(),
    )
    .await?;

    server_rec.wait_for_text("client connected").await?;
    client.send_text("ping").await?;
    server_rec.wait_for_text("ping").await?;

    let source = scratch.file("big.bin", 5 * 1024 * 1024);
    client.send_file(&source, None).await?;
    server_rec
        .wait_for("file received", |e| matches!(e, Event::FileReceived(_)))
        .await?;

    let received = scratch.join("inbox/big.bin");
    assert_eq!(std::fs::read(&received)?, std::fs::read(&source)?);
    assert_eq!(
        tether_core::digest::file_digest(&received)?,
        tether_core::digest::file_digest(&source)?
    );
    // 2 MiB chunks: 2 + 2 + 1.
    assert_eq!(client_rec.progress(), vec![40, 80, 100]);
    assert_eq!(server_rec.progress().last(), Some(&100));
    assert!(server_rec.errors().is_empty(), "{:?}", server_rec.errors());

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// Both directions carry every message kind.
#[tokio::test]
async fn test_duplex_message_kinds() -> Result<()> {
    let scratch = Scratch::new("duplex");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();

    let server = ServerEndpoint::start(
        0,
        scratch.path(),
        server_rec.callbacks(),
        SessionConfig::default(),
    )
    .await?;
    let client = ClientEndpoint::connect(
        &[loopback(&server)],
        scratch.path(),
        client_rec.callbacks(),
        SessionConfig::default(),
    )
    .await?;
    assert_eq!(server.wait_for(Lifecycle::Connected).await, Lifecycle::Connected);

    client.send_log("disk low").await?;
    client.send_command("rescan").await?;
    server.send_text("pong").await?;

    client_rec.wait_for_text("pong").await?;
    server_rec
        .wait_for("command", |e| matches!(e, Event::Log(Kind::Command, _)))
        .await?;

    let logs: Vec<Event> = server_rec
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Log(..)))
        .collect();
    assert_eq!(
        logs,
        vec![
            Event::Log(Kind::Log, "disk low".into()),
            Event::Log(Kind::Command, "rescan".into()),
        ]
    );
    assert_eq!(client_rec.count(|e| *e == Event::ConnectSuccess), 1);

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// A dead first candidate falls through to the live one without any
/// failure callback.
#[tokio::test]
async fn test_candidate_fallback() -> Result<()> {
    let scratch = Scratch::new("fallback");
    let server_rec = Recorder::new();
    let client_rec = Recorder::new();

    let server = ServerEndpoint::start(
        0,
        scratch.path(),
        server_rec.callbacks(),
        SessionConfig::default(),
    )
    .await?;
    let client = ClientEndpoint::connect(
        &["127.0.0.1:1".to_string(), loopback(&server)],
        scratch.path(),
        client_rec.callbacks(),
        SessionConfig::default(),
    )
    .await?;

    assert_eq!(client.peer_addr().port(), server.local_addr().port());
    server_rec.wait_for_text("client connected").await?;
    assert_eq!(client_rec.count(|e| *e == Event::ConnectSuccess), 1);
    assert_eq!(client_rec.count(|e| *e == Event::ConnectFailure), 0);
    assert!(client_rec.errors().is_empty());

    client.stop().await;
    server.stop().await;
    Ok(())
}

/// A single-address dial that fails reaches every failure channel.
#[tokio::test]
async fn test_single_address_failure() -> Result<()> {
    let scratch = Scratch::new("refused");
    let rec = Recorder::new();

    let result = ClientEndpoint::connect_addr(
        "127.0.0.1",
        1,
        scratch.path(),
        rec.callbacks(),
        SessionConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(SessionError::ConnectFailed { .. })));
    assert_eq!(rec.count(|e| *e == Event::ConnectFailure), 1);
    assert_eq!(rec.count(|e| matches!(e, Event::Log(Kind::Log, _))), 1);
    assert_eq!(rec.errors().len(), 1);
    assert!(rec.errors()[0].starts_with("connect: could not connect"));
    Ok(())
}
