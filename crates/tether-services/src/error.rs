//! Error taxonomy for endpoints and transfers.
//!
//! Nothing here escapes a worker task: every error is logged and handed
//! to the application's [`crate::ErrorNotify`] where it occurs.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tether_core::wire::{DecodeError, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("could not connect to any of {candidates:?}")]
    ConnectFailed { candidates: Vec<String> },
    #[error("failed to prepare receive directory {path}: {source}")]
    ReceiveDir { path: PathBuf, source: io::Error },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("no data for {}s, session presumed dead", .0.as_secs())]
    IdleTimeout(Duration),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("not connected")]
    NotConnected,
    #[error("endpoint is closed")]
    Closed,
}

/// Filesystem and integrity failures on either side of a file transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("save path {0:?} must be a relative path without `..`")]
    InvalidSavePath(String),
    #[error("{path} ended after {read} of {expected} bytes")]
    Truncated { path: PathBuf, read: u64, expected: u64 },
    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}
