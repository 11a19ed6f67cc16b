//! Newline-delimited message framing.
//!
//! A single read from a pipe may carry several messages or stop in the middle
//! of one. Bytes are accumulated here and complete lines are handed out; the
//! trailing partial line stays buffered until the next chunk arrives.

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete, non-blank line it finished.
    ///
    /// Lines are returned without the terminator (a trailing `\r` is stripped
    /// too). Invalid UTF-8 is replaced rather than rejected; the JSON parser
    /// downstream reports such lines as malformed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let text = String::from_utf8_lossy(line);
            if !text.trim().is_empty() {
                lines.push(text.into_owned());
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Bytes waiting for their terminating newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
