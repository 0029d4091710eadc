//! Clause-level batching of streamed response text.
//!
//! Generation produces fragments at token granularity; synthesizing each one
//! separately fragments the audio, while waiting for the full response wastes
//! the streaming latency win. The batcher accumulates fragments and releases
//! batches at natural speech boundaries.

/// Accumulates text fragments and splits them into speakable batches.
#[derive(Debug)]
pub struct ClauseBatcher {
    buffer: String,
    min_clause_len: usize,
}

impl ClauseBatcher {
    pub fn new(min_clause_len: usize) -> Self {
        Self {
            buffer: String::new(),
            min_clause_len,
        }
    }

    /// Append a fragment and return every completed batch, oldest first.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        if fragment.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(fragment);

        let mut batches = Vec::new();
        while let Some(pos) = find_clause_boundary(&self.buffer, self.min_clause_len) {
            let batch = self.buffer[..=pos].trim().to_owned();
            if !batch.is_empty() {
                batches.push(batch);
            }
            self.buffer = self.buffer[pos + 1..].to_owned();
        }
        batches
    }

    /// Drain whatever remains, boundary or not. Called on the response
    /// terminal so trailing text without closing punctuation still speaks.
    pub fn flush(&mut self) -> Option<String> {
        let remainder = std::mem::take(&mut self.buffer);
        let remainder = remainder.trim();
        if remainder.is_empty() {
            None
        } else {
            Some(remainder.to_owned())
        }
    }
}

/// Find the byte index of a sentence-ending character (`.`, `!`, `?`, `\n`).
///
/// Only positions followed by whitespace or end of text count, so decimal
/// points and version numbers do not split.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\n') {
                return Some(i);
            }
        }
    }
    None
}

/// Find a batch boundary: sentence punctuation always splits; clause
/// punctuation (`,`, `;`, `:`) splits only once the buffer has accumulated
/// `min_clause_len` characters, and then at the last such mark so batches stay
/// as long as possible.
fn find_clause_boundary(text: &str, min_clause_len: usize) -> Option<usize> {
    if let Some(pos) = find_sentence_boundary(text) {
        return Some(pos);
    }

    if text.len() < min_clause_len {
        return None;
    }

    let mut last_clause: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if matches!(c, ',' | ';' | ':') {
            let rest = &text[i + c.len_utf8()..];
            if rest.is_empty() || rest.starts_with(' ') {
                last_clause = Some(i);
            }
        }
    }
    last_clause
}
