//! tether wire format: one JSON record per line.
//!
//! Every envelope is a flat JSON object terminated by `\n`. Field names
//! are camelCase; only the fields of the active kind are present. The
//! `kind` field is numeric: Text=0, File=1, Log=2, Command=3.
//!
//! File payloads are standard base64 strings. JSON escapes every control
//! character inside strings, so an encoded record never contains a raw
//! newline and line framing holds for arbitrary file content.
//!
//! There is no resynchronization: a line that fails to decode ends the
//! session that read it.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::envelope::{Body, Envelope, FileChunk, Kind};

/// Default upper bound on a single encoded line, newline included.
///
/// A 2 MiB chunk encodes to roughly 2.8 MB of base64, so this leaves
/// ample room for the default chunk size.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

// ── Records ───────────────────────────────────────────────────────────────────

/// Borrowed view used for encoding, so chunk payloads are not copied.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutRecord<'a> {
    id: u64,
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_digest: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    save_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InRecord {
    id: u64,
    kind: u8,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    content_digest: Option<String>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    progress: Option<u64>,
    #[serde(default)]
    save_path: Option<String>,
    #[serde(default)]
    extra: Option<String>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Error encoding an envelope into a line.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error decoding a line into an envelope. Always fatal to the read loop.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),
    #[error("{kind} envelope missing field `{field}`")]
    MissingField { kind: Kind, field: &'static str },
    #[error("payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("line of {len} bytes exceeds limit of {max}")]
    LineTooLong { len: usize, max: usize },
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encode an envelope as one line, trailing `\n` included.
pub fn encode_line(envelope: &Envelope) -> Result<String, EncodeError> {
    let mut record = OutRecord {
        id: envelope.id,
        kind: envelope.kind().as_u8(),
        content: None,
        file_name: None,
        file_size: None,
        content_digest: None,
        payload: None,
        progress: None,
        save_path: None,
        extra: envelope.extra.as_deref(),
    };
    match &envelope.body {
        Body::Text(s) | Body::Log(s) | Body::Command(s) => record.content = Some(s.as_str()),
        Body::File(chunk) => {
            record.file_name = Some(chunk.file_name.as_str());
            record.file_size = Some(chunk.file_size);
            record.content_digest = Some(chunk.content_digest.as_str());
            record.payload = Some(STANDARD.encode(&chunk.payload));
            record.progress = Some(chunk.progress);
            record.save_path = chunk.save_path.as_deref();
        }
    }
    let mut line = serde_json::to_string(&record)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (with or without its terminator) into an envelope.
pub fn decode_line(line: &str) -> Result<Envelope, DecodeError> {
    let line = line.trim_end_matches(['\n', '\r']);
    let record: InRecord = serde_json::from_str(line)?;
    let kind = Kind::from_u8(record.kind).ok_or(DecodeError::UnknownKind(record.kind))?;
    let missing = |field| DecodeError::MissingField { kind, field };

    let body = match kind {
        Kind::Text => Body::Text(record.content.ok_or_else(|| missing("content"))?),
        Kind::Log => Body::Log(record.content.ok_or_else(|| missing("content"))?),
        Kind::Command => Body::Command(record.content.ok_or_else(|| missing("content"))?),
        Kind::File => {
            let payload = record.payload.ok_or_else(|| missing("payload"))?;
            Body::File(FileChunk {
                file_name: record.file_name.ok_or_else(|| missing("fileName"))?,
                file_size: record.file_size.ok_or_else(|| missing("fileSize"))?,
                content_digest: record
                    .content_digest
                    .ok_or_else(|| missing("contentDigest"))?,
                payload: STANDARD.decode(payload)?,
                progress: record.progress.ok_or_else(|| missing("progress"))?,
                save_path: record.save_path,
            })
        }
    };

    Ok(Envelope {
        id: record.id,
        body,
        extra: record.extra,
        extra_obj: None,
    })
}

/// Room kept for the non-payload fields of a File record.
const FILE_RECORD_OVERHEAD: usize = 64 * 1024;

/// Largest chunk whose File record still fits in `max_line_bytes`.
pub fn max_chunk_for_line(max_line_bytes: usize) -> usize {
    max_line_bytes.saturating_sub(FILE_RECORD_OVERHEAD) / 4 * 3
}

/// Reject a raw line longer than `max` bytes before it is parsed.
pub fn check_line_len(len: usize, max: usize) -> Result<(), DecodeError> {
    if len > max {
        return Err(DecodeError::LineTooLong { len, max });
    }
    Ok(())
}
