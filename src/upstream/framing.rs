//! Length-delimited JSON-RPC framing.
//!
//! Every message on a process channel is a `Content-Length: N` header, a
//! blank line, and exactly N bytes of UTF-8 JSON. Nothing else may share the
//! channel; a single stray byte desynchronizes the session, so any deviation
//! is reported as malformed and the reader stops.

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on header lines before the blank separator.
const MAX_HEADER_LINES: usize = 16;

/// Upper bound on one header line, terminator included.
const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Framing failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The byte stream does not follow the framing rules.
    #[error("malformed frame: {reason}")]
    Malformed { reason: String },

    /// The underlying channel failed.
    #[error("channel i/o error: {reason}")]
    Io { reason: String },
}

fn malformed(reason: impl Into<String>) -> FrameError {
    FrameError::Malformed {
        reason: reason.into(),
    }
}

fn map_io(e: std::io::Error) -> FrameError {
    match e.kind() {
        std::io::ErrorKind::InvalidData => malformed("header is not valid UTF-8"),
        std::io::ErrorKind::UnexpectedEof => malformed("channel closed inside a frame body"),
        _ => FrameError::Io {
            reason: e.to_string(),
        },
    }
}

// ─── Writing ─────────────────────────────────────────────────────────────────

/// Encode one message as a complete frame.
pub fn encode_frame(message: &Value) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message).map_err(|e| malformed(format!("serialize: {e}")))?;
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, message: &Value) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await.map_err(map_io)?;
    writer.flush().await.map_err(map_io)?;
    Ok(())
}

// ─── Reading ─────────────────────────────────────────────────────────────────

/// Reads frames from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::with_capacity(128),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut header_lines = 0usize;

        loop {
            self.line.clear();
            let n = (&mut self.reader)
                .take(MAX_HEADER_LINE_BYTES as u64)
                .read_until(b'\n', &mut self.line)
                .await
                .map_err(map_io)?;
            if n == 0 {
                if header_lines == 0 {
                    return Ok(None);
                }
                return Err(malformed("channel closed inside a frame header"));
            }
            if self.line.last() != Some(&b'\n') {
                if n >= MAX_HEADER_LINE_BYTES {
                    return Err(malformed("header line too long"));
                }
                return Err(malformed("channel closed inside a frame header"));
            }

            let line = std::str::from_utf8(&self.line).map_err(|_| malformed("header is not valid UTF-8"))?;
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                if header_lines == 0 {
                    // Separator left over from a previous frame.
                    continue;
                }
                break;
            }

            header_lines += 1;
            if header_lines > MAX_HEADER_LINES {
                return Err(malformed("too many header lines"));
            }

            let (name, value) = trimmed
                .split_once(':')
                .ok_or_else(|| malformed(format!("invalid header line: {trimmed:.80}")))?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| malformed(format!("invalid Content-Length: {}", value.trim())))?;
                content_length = Some(len);
            }
        }

        let len = content_length.ok_or_else(|| malformed("missing Content-Length header"))?;
        if len > MAX_FRAME_BYTES {
            return Err(malformed(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await.map_err(map_io)?;

        let text = std::str::from_utf8(&body).map_err(|_| malformed("body is not valid UTF-8"))?;
        let value = serde_json::from_str(text).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
        Ok(Some(value))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
