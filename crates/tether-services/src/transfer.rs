//! File transfer: chunking on send, append-and-verify on receive.
//!
//! The sender hashes the whole file once, then streams it in fixed-size
//! chunks. Every chunk carries the file's total size and whole-file
//! digest, plus the cumulative byte count so far.
//!
//! The receiver appends each chunk to `receive_dir/[save_path/]file_name`,
//! keeping the handle open until the last chunk. Before writing, every
//! chunk checks whether a file with the same digest already sits at the
//! target; if so nothing is written and completion is reported once.
//!
//! Chunks are trusted to arrive in order, exactly once. A leftover partial
//! file from an earlier session never matches the final digest, so new
//! chunks are appended after it and the post-transfer digest check
//! reports the mismatch.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tether_core::config::DEFAULT_CHUNK_SIZE;
use tether_core::digest;
use tether_core::FileChunk;

use crate::error::TransferError;

// ── Send ──────────────────────────────────────────────────────────────────────

/// Reads a file as a sequence of [`FileChunk`]s.
///
/// An empty file yields exactly one chunk with an empty payload, so the
/// receiver still creates it.
pub struct FileSender {
    file: File,
    path: PathBuf,
    file_name: String,
    file_size: u64,
    digest: String,
    chunk_size: usize,
    save_path: Option<String>,
    sent: u64,
    done: bool,
}

impl FileSender {
    /// Hash `path` and open it for chunked reading. A `chunk_size` of 0
    /// means [`DEFAULT_CHUNK_SIZE`].
    pub fn open(
        path: &Path,
        chunk_size: usize,
        save_path: Option<String>,
    ) -> Result<Self, TransferError> {
        let read_err = |source| TransferError::Read {
            path: path.to_path_buf(),
            source,
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?
            .to_string();

        let digest = digest::file_digest(path).map_err(read_err)?;
        let file = File::open(path).map_err(read_err)?;
        let file_size = file.metadata().map_err(read_err)?.len();

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_name,
            file_size,
            digest,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            save_path,
            sent: 0,
            done: false,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Next chunk, or `None` once `file_size` bytes have been produced.
    pub fn next_chunk(&mut self) -> Result<Option<FileChunk>, TransferError> {
        if self.done {
            return Ok(None);
        }
        let remaining = self.file_size - self.sent;
        let want = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; want];
        let n = read_full(&mut self.file, &mut buf).map_err(|source| TransferError::Read {
            path: self.path.clone(),
            source,
        })?;
        if n < want {
            self.done = true;
            return Err(TransferError::Truncated {
                path: self.path.clone(),
                read: self.sent + n as u64,
                expected: self.file_size,
            });
        }
        self.sent += n as u64;
        self.done = self.sent >= self.file_size;

        Ok(Some(FileChunk {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            content_digest: self.digest.clone(),
            payload: buf,
            progress: self.sent,
            save_path: self.save_path.clone(),
        }))
    }
}

impl Iterator for FileSender {
    type Item = Result<FileChunk, TransferError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Fill `buf` unless EOF comes first. Returns the bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Receive ───────────────────────────────────────────────────────────────────

/// What happened to one received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Payload appended; more chunks expected.
    Appended { path: PathBuf, percent: u8 },
    /// Last chunk appended and the file verified against its digest.
    Completed { path: PathBuf },
    /// A file with the expected digest already exists; nothing written.
    /// `first_notice` is true only for the first such chunk of a file.
    AlreadyPresent { path: PathBuf, first_notice: bool },
}

struct ActiveFile {
    file: File,
    written: u64,
}

/// Receive-side state for one stream.
pub struct FileReceiver {
    root: PathBuf,
    /// Open append handles, by target path.
    active: HashMap<PathBuf, ActiveFile>,
    /// Files already reported as present, until their last chunk passes.
    reported: HashSet<PathBuf>,
}

impl FileReceiver {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            active: HashMap::new(),
            reported: HashSet::new(),
        }
    }

    /// Where a chunk's file lands. Only the last component of the file name
    /// is used; a save path must stay inside the root.
    pub fn target_path(&self, chunk: &FileChunk) -> Result<PathBuf, TransferError> {
        let name = Path::new(&chunk.file_name)
            .file_name()
            .ok_or_else(|| TransferError::InvalidName(chunk.file_name.clone()))?;

        let mut dir = self.root.clone();
        if let Some(hint) = chunk.save_path.as_deref().filter(|h| !h.is_empty()) {
            for component in Path::new(hint).components() {
                match component {
                    Component::Normal(part) => dir.push(part),
                    Component::CurDir => {}
                    _ => return Err(TransferError::InvalidSavePath(hint.to_string())),
                }
            }
        }
        Ok(dir.join(name))
    }

    /// Apply one File envelope's chunk.
    pub fn handle_chunk(&mut self, chunk: &FileChunk) -> Result<ChunkOutcome, TransferError> {
        let path = self.target_path(chunk)?;

        let present = digest::file_matches(&path, chunk.file_size, &chunk.content_digest)
            .map_err(|source| TransferError::Read {
                path: path.clone(),
                source,
            })?;
        if present && !self.active.contains_key(&path) {
            // A new send of the file starts over, even if the last one was cut short.
            if chunk.is_first() {
                self.reported.remove(&path);
            }
            let first_notice = self.reported.insert(path.clone());
            if chunk.is_last() {
                self.reported.remove(&path);
            }
            tracing::debug!(path = %path.display(), first_notice, "file already present, skipping chunk");
            return Ok(ChunkOutcome::AlreadyPresent { path, first_notice });
        }

        let write_err = |source| TransferError::Write {
            path: path.clone(),
            source,
        };
        let active = match self.active.entry(path.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(write_err)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(write_err)?;
                tracing::info!(
                    path = %path.display(),
                    bytes = chunk.file_size,
                    digest = %chunk.content_digest,
                    "receiving file"
                );
                v.insert(ActiveFile { file, written: 0 })
            }
        };
        active.file.write_all(&chunk.payload).map_err(write_err)?;
        active.written += chunk.payload.len() as u64;
        tracing::debug!(
            path = %path.display(),
            written = active.written,
            progress = chunk.progress,
            total = chunk.file_size,
            "chunk appended"
        );

        if !chunk.is_last() {
            return Ok(ChunkOutcome::Appended {
                path,
                percent: chunk.percent(),
            });
        }

        // Dropping the handle closes the file.
        self.active.remove(&path);
        let actual = digest::file_digest(&path).map_err(|source| TransferError::Read {
            path: path.clone(),
            source,
        })?;
        if !actual.eq_ignore_ascii_case(&chunk.content_digest) {
            return Err(TransferError::DigestMismatch {
                path,
                expected: chunk.content_digest.clone(),
                actual,
            });
        }
        tracing::info!(path = %path.display(), bytes = chunk.file_size, "file received");
        Ok(ChunkOutcome::Completed { path })
    }

    /// Files with an open handle, i.e. still waiting for their last chunk.
    pub fn in_progress(&self) -> Vec<PathBuf> {
        self.active.keys().cloned().collect()
    }
}
