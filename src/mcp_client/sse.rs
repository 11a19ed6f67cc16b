//! Server-Sent Events decoding.
//!
//! Reads a `reqwest::Response` as a byte stream, splits it on SSE event
//! boundaries (a blank line) and yields one [`SseEvent`] per complete event.
//! Partial events stay buffered across chunk boundaries.

use futures::stream::{self, Stream, StreamExt};

use super::errors::McpError;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `"message"` when the server did not name one.
    pub event: String,
    /// All `data:` lines of the event joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// The previous chunk ended in `\r`; a leading `\n` completes that CRLF.
    trailing_cr: bool,
    /// Incomplete UTF-8 sequence carried over from the previous byte chunk.
    utf8_tail: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text and return every event it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        let chunk = match chunk.strip_prefix('\n') {
            Some(rest) if self.trailing_cr => rest,
            _ => chunk,
        };
        self.trailing_cr = chunk.ends_with('\r');
        if chunk.contains('\r') {
            self.buffer
                .push_str(&chunk.replace("\r\n", "\n").replace('\r', "\n"));
        } else {
            self.buffer.push_str(chunk);
        }

        let mut events = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let raw: String = self.buffer[..event_end].to_string();
            self.buffer.drain(..event_end + 2);
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }
        events
    }

    /// Feed raw body bytes. A character split across chunks is held back
    /// until its remaining bytes arrive.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.utf8_tail.extend_from_slice(bytes);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.utf8_tail) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.utf8_tail.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.utf8_tail[..valid]));
                    match e.error_len() {
                        // Truncated sequence at the end: wait for more bytes.
                        None => {
                            self.utf8_tail.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.utf8_tail.drain(..valid + bad);
                        }
                    }
                }
            }
        }

        self.push(&text)
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        let raw = std::mem::take(&mut self.buffer);
        if raw.trim().is_empty() {
            None
        } else {
            parse_event(raw.trim_end())
        }
    }
}

/// Parse the lines of one event. Comment-only events (keep-alives) yield `None`.
fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut id = None;

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            // `retry` and unknown fields are ignored.
            _ => {}
        }
    }

    if data.is_empty() && event.is_none() {
        return None;
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
        id,
    })
}

/// Turn an HTTP response body into a stream of SSE events.
pub fn sse_events(response: reqwest::Response) -> impl Stream<Item = Result<SseEvent, McpError>> {
    let byte_stream = response.bytes_stream();

    stream::unfold(
        (byte_stream, SseDecoder::new(), std::collections::VecDeque::new(), false),
        |(mut byte_stream, mut decoder, mut ready, mut done)| async move {
            loop {
                if let Some(event) = ready.pop_front() {
                    return Some((Ok(event), (byte_stream, decoder, ready, done)));
                }
                if done {
                    return None;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => ready.extend(decoder.push_bytes(&bytes)),
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(McpError::Http {
                                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                                body: format!("event stream read error: {e}"),
                            }),
                            (byte_stream, decoder, ready, done),
                        ));
                    }
                    None => {
                        done = true;
                        ready.extend(decoder.finish());
                    }
                }
            }
        },
    )
}
