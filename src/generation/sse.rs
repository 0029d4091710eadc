//! Incremental Server-Sent Events parsing for the generation stream.
//!
//! The generation service streams one JSON chunk per `data:` line and ends
//! with a `[DONE]` sentinel. Network reads split lines arbitrarily, so the
//! parser buffers partial lines across [`SseLineParser::push`] calls and
//! yields each complete data payload exactly once.

/// Sentinel payload marking the end of a stream.
pub const DONE_MARKER: &str = "[DONE]";

/// Whether a data payload is the end-of-stream sentinel.
pub fn is_done(data: &str) -> bool {
    data.trim() == DONE_MARKER
}

/// Line-buffering SSE parser; feed raw bytes, collect `data:` payloads.
///
/// Lines are buffered as bytes so a multi-byte UTF-8 character split across
/// two reads decodes intact once its line completes.
#[derive(Debug, Default)]
pub struct SseLineParser {
    line: Vec<u8>,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk of bytes; returns the data payloads completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                let line = String::from_utf8_lossy(&line);
                if let Some(data) = data_payload(&line) {
                    out.push(data.to_owned());
                }
            } else {
                self.line.push(byte);
            }
        }
        out
    }

    /// Emit a trailing payload left in the buffer when the stream ends
    /// without a final newline.
    pub fn flush(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.line);
        let line = String::from_utf8_lossy(&line);
        data_payload(&line).map(str::to_owned)
    }
}

/// Extract the payload of a `data:` line; comments, blank lines, and other
/// SSE fields (`event:`, `id:`, `retry:`) yield nothing.
fn data_payload(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let value = line.strip_prefix("data:")?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}
