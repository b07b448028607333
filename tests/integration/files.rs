use crate::*;

use tether_services::{ClientEndpoint, ServerEndpoint, SessionConfig};

/// Small chunks so a few KiB already span several envelopes.
fn small_chunks() -> SessionConfig {
    SessionConfig {
        chunk_size: 1024,
        ..SessionConfig::default()
    }
}

struct Pair {
    server: ServerEndpoint,
    client: ClientEndpoint,
    server_rec: Arc<Recorder>,
}

impl Pair {
    async fn up(scratch: &Scratch) -> Result<Self> {
        let server_rec = Recorder::new();
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
            Recorder::new().callbacks(),
            small_chunks(),
        )
        .await?;
        server_rec.wait_for_text("client connected").await?;
        Ok(Self {
            server,
            client,
            server_rec,
        })
    }

    /// Send a marker and wait for it, so everything sent earlier is handled.
    async fn settle(&self, marker: &str) -> Result<()> {
        self.client.send_text(marker).await?;
        self.server_rec.wait_for_text(marker).await
    }

    async fn down(self) {
        self.client.stop().await;
        self.server.stop().await;
    }
}

/// A matching file already on disk is never rewritten and completes once.
#[tokio::test]
async fn test_existing_file_completes_once() -> Result<()> {
    let scratch = Scratch::new("idempotent");
    let pair = Pair::up(&scratch).await?;

    let source = scratch.file("report.bin", 4000);
    let target = scratch.join("inbox/report.bin");
    std::fs::copy(&source, &target)?;
    let before = std::fs::metadata(&target)?.modified()?;

    pair.client.send_file(&source, None).await?;
    pair.settle("after first").await?;

    assert_eq!(std::fs::read(&target)?, std::fs::read(&source)?);
    assert_eq!(std::fs::metadata(&target)?.modified()?, before);
    assert_eq!(
        pair.server_rec.events().iter().filter(|e| matches!(e, Event::FileReceived(_))).count(),
        1
    );

    // A second send of the same file is its own completion.
    pair.client.send_file(&source, None).await?;
    pair.settle("after second").await?;
    assert_eq!(
        pair.server_rec.count(|e| matches!(e, Event::FileReceived(_))),
        2
    );
    assert!(pair.server_rec.errors().is_empty());

    pair.down().await;
    Ok(())
}

/// Multi-chunk files reassemble exactly under the save hint.
#[tokio::test]
async fn test_save_hint_places_file() -> Result<()> {
    let scratch = Scratch::new("hint");
    let pair = Pair::up(&scratch).await?;

    let source = scratch.file("notes.txt", 5000);
    pair.client.send_file(&source, Some("docs/today")).await?;
    pair.settle("sent").await?;

    let target = scratch.join("inbox/docs/today/notes.txt");
    assert_eq!(std::fs::read(&target)?, std::fs::read(&source)?);
    assert_eq!(
        pair.server_rec.count(|e| *e == Event::FileReceived(target.clone())),
        1
    );
    // 1024-byte chunks: five appended, the last completes.
    assert_eq!(pair.server_rec.progress(), vec![20, 40, 61, 81, 100]);

    pair.down().await;
    Ok(())
}

/// An escaping save hint is refused per chunk and the session survives.
#[tokio::test]
async fn test_escaping_save_hint_is_refused() -> Result<()> {
    let scratch = Scratch::new("escape");
    let pair = Pair::up(&scratch).await?;

    let source = scratch.file("evil.txt", 100);
    pair.client.send_file(&source, Some("../outside")).await?;
    pair.settle("still here").await?;

    assert!(!scratch.join("outside/evil.txt").exists());
    let errors = pair.server_rec.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("receive file: save path"), "{errors:?}");

    pair.down().await;
    Ok(())
}

/// An empty file still materializes on the receiver.
#[tokio::test]
async fn test_empty_file_arrives() -> Result<()> {
    let scratch = Scratch::new("empty");
    let pair = Pair::up(&scratch).await?;

    let source = scratch.file("empty.dat", 0);
    pair.client.send_file(&source, None).await?;
    pair.settle("done").await?;

    let target = scratch.join("inbox/empty.dat");
    assert_eq!(std::fs::metadata(&target)?.len(), 0);
    assert_eq!(pair.server_rec.progress(), vec![100]);

    pair.down().await;
    Ok(())
}
