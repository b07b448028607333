//! Content digests for file identity.
//!
//! A file is identified by the BLAKE3 digest of its entire content,
//! hex-encoded on the wire. Digests are computed once per file on the
//! sending side and compared against files already on disk on the
//! receiving side.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read size used when streaming a file through the hasher.
const READ_BUF_SIZE: usize = 64 * 1024;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex form of [`hash`], the representation carried in envelopes.
pub fn hash_hex(data: &[u8]) -> String {
    hex::encode(hash(data))
}

/// Incremental BLAKE3 hasher for content that arrives in pieces.
///
/// # Example
/// ```
/// use tether_core::digest::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// assert_eq!(h.finalize_hex(), tether_core::digest::hash_hex(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Files ─────────────────────────────────────────────────────────────────────

/// Digest of a whole file, streamed in fixed-size reads.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Whether `path` is a regular file of exactly `expected_len` bytes whose
/// digest equals `expected`.
///
/// The length is checked first so partially written files never pay for a
/// full hash. A missing file is simply "no match".
pub fn file_matches(path: &Path, expected_len: u64, expected: &str) -> io::Result<bool> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !meta.is_file() || meta.len() != expected_len {
        return Ok(false);
    }
    Ok(file_digest(path)?.eq_ignore_ascii_case(expected))
}
