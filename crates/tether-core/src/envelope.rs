//! Envelope model: one message unit on the stream.
//!
//! Envelopes are built immediately before a write and dropped once the
//! write completes; nothing here is persisted. The wire representation
//! lives in [`crate::wire`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Text content that asks the peer to end its read loop.
pub const BYE: &str = "Bye";

/// Text a dialing endpoint sends once its connection is up.
pub const HANDSHAKE_TEXT: &str = "client connected";

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Text = 0,
    File = 1,
    Log = 2,
    Command = 3,
}

impl Kind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Text),
            1 => Some(Self::File),
            2 => Some(Self::Log),
            3 => Some(Self::Command),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Text => "text",
            Kind::File => "file",
            Kind::Log => "log",
            Kind::Command => "command",
        };
        f.write_str(name)
    }
}

/// One bounded slice of a file.
///
/// `file_size` and `content_digest` describe the whole file and are the
/// same on every chunk; `progress` counts bytes sent so far, this chunk
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub file_name: String,
    pub file_size: u64,
    /// Hex BLAKE3 digest of the entire file.
    pub content_digest: String,
    pub payload: Vec<u8>,
    pub progress: u64,
    /// Relative directory under the receiver's root, if the sender has a preference.
    pub save_path: Option<String>,
}

impl FileChunk {
    /// First chunk of a file: nothing was sent before it.
    pub fn is_first(&self) -> bool {
        self.progress == self.payload.len() as u64
    }

    /// Last chunk of a file: cumulative progress has reached the file size.
    pub fn is_last(&self) -> bool {
        self.progress >= self.file_size
    }

    /// Progress as a whole percentage, clamped to 100.
    pub fn percent(&self) -> u8 {
        if self.file_size == 0 {
            return 100;
        }
        let done = u128::from(self.progress.min(self.file_size));
        (done * 100 / u128::from(self.file_size)) as u8
    }
}

/// Kind-specific content of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    File(FileChunk),
    Log(String),
    Command(String),
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::Text(_) => Kind::Text,
            Body::File(_) => Kind::File,
            Body::Log(_) => Kind::Log,
            Body::Command(_) => Kind::Command,
        }
    }
}

/// Process-local attachment. Never serialized.
pub type ExtraObj = Arc<dyn Any + Send + Sync>;

/// A single message unit.
#[derive(Clone)]
pub struct Envelope {
    /// Time-based, strictly increasing within this process.
    pub id: u64,
    pub body: Body,
    pub extra: Option<String>,
    pub extra_obj: Option<ExtraObj>,
}

impl Envelope {
    pub fn new(body: Body) -> Self {
        Self {
            id: next_id(),
            body,
            extra: None,
            extra_obj: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(Body::Text(content.into()))
    }

    pub fn log(content: impl Into<String>) -> Self {
        Self::new(Body::Log(content.into()))
    }

    pub fn command(content: impl Into<String>) -> Self {
        Self::new(Body::Command(content.into()))
    }

    pub fn file(chunk: FileChunk) -> Self {
        Self::new(Body::File(chunk))
    }

    /// The in-band shutdown sentinel.
    pub fn bye() -> Self {
        Self::text(BYE)
    }

    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    pub fn with_extra_obj(mut self, obj: ExtraObj) -> Self {
        self.extra_obj = Some(obj);
        self
    }

    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    pub fn is_bye(&self) -> bool {
        matches!(&self.body, Body::Text(t) if t == BYE)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("body", &self.body)
            .field("extra", &self.extra)
            .field("extra_obj", &self.extra_obj.is_some())
            .finish()
    }
}

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Next envelope id: microseconds since the Unix epoch, bumped past the
/// previous id when the clock has not advanced.
pub fn next_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let mut prev = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_ID.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}
