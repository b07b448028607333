//! tether-services — the duplex messaging and file-transfer engine.
//!
//! A process either listens ([`ServerEndpoint`]) or dials
//! ([`ClientEndpoint`]). Once a stream is up, both sides exchange
//! newline-delimited envelopes: text, log and command messages go straight
//! to the application's [`Callbacks`]; file chunks go through the
//! [`transfer`] engine and land under the receive directory.

pub mod callback;
pub mod client;
pub mod error;
pub mod server;
pub mod session;
pub mod transfer;

pub use callback::{Callbacks, ErrorNotify, LoggingErrorNotify, SessionHandler, SessionHooks};
pub use client::ClientEndpoint;
pub use error::{SessionError, TransferError};
pub use server::ServerEndpoint;
pub use session::{Lifecycle, Outbound, Role, SessionConfig};
pub use transfer::{ChunkOutcome, FileReceiver, FileSender};
