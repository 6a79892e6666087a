//! Decoder for OpenAI-style server-sent event streams.
//!
//! Bytes are split into lines (a line may arrive across any number of chunks), the
//! `data:` prefix is stripped, and each frame's `choices[0].delta.content` is appended
//! to the accumulated text. A frame that fails to parse is held and joined with the
//! following line before retrying; the held fragment is bounded by
//! [`MAX_PENDING_FRAME_BYTES`].

use serde::Deserialize;

/// Largest unparsable fragment kept while waiting for the rest of a split frame.
pub const MAX_PENDING_FRAME_BYTES: usize = 16 * 1024;

const DONE_MARKER: &str = "[DONE]";

/// One decoder event: the text accumulated so far and whether the stream is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub text: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unparsable stream frame grew past {limit} bytes")]
    FrameTooLarge { limit: usize },
}

/// Incremental SSE decoder. Feed chunks with [`push`](Self::push) and call
/// [`finish`](Self::finish) on EOF or timeout; exactly one final event is produced.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buf: Vec<u8>,
    pending: String,
    text: String,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// True once the final event has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a chunk of bytes; returns the events completed by it. Bytes after `[DONE]` are ignored.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<DecodedEvent>, DecodeError> {
        let mut events = Vec::new();
        if self.finished {
            return Ok(events);
        }
        self.line_buf.extend_from_slice(chunk);
        while let Some(i) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.line_buf.drain(..i).collect();
            self.line_buf.drain(..1);
            let line = String::from_utf8_lossy(&line_bytes);
            self.handle_line(&line, &mut events)?;
            if self.finished {
                self.line_buf.clear();
                break;
            }
        }
        Ok(events)
    }

    /// End of input (EOF, idle timeout, or cancellation). Processes a trailing unterminated
    /// line, then returns the final event, or None if it was already produced.
    pub fn finish(&mut self) -> Option<DecodedEvent> {
        if self.finished {
            return None;
        }
        if !self.line_buf.is_empty() {
            let rest = std::mem::take(&mut self.line_buf);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let mut events = Vec::new();
            if let Err(e) = self.handle_line(&line, &mut events) {
                log::warn!("stream: dropping trailing frame: {}", e);
            }
            if self.finished {
                return events.into_iter().find(|e| e.done);
            }
        }
        Some(self.finalize())
    }

    fn finalize(&mut self) -> DecodedEvent {
        self.finished = true;
        if !self.pending.is_empty() {
            log::warn!(
                "stream: discarding {} bytes of unparsable frame at end of stream",
                self.pending.len()
            );
            self.pending.clear();
        }
        DecodedEvent {
            text: self.text.clone(),
            done: true,
        }
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<DecodedEvent>) -> Result<(), DecodeError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return Ok(());
        }
        let payload = match line.strip_prefix("data:") {
            Some(rest) => rest.trim_start(),
            None if is_sse_field(line) => return Ok(()),
            None => line,
        };
        if payload == DONE_MARKER {
            events.push(self.finalize());
            return Ok(());
        }

        if !self.pending.is_empty() {
            let joined = format!("{}{}", self.pending, payload);
            if let Some(chunk) = parse_chunk(&joined) {
                self.pending.clear();
                self.apply(chunk, events);
                return Ok(());
            }
            if let Some(chunk) = parse_chunk(payload) {
                log::warn!(
                    "stream: dropping {} bytes of unparsable frame",
                    self.pending.len()
                );
                self.pending.clear();
                self.apply(chunk, events);
                return Ok(());
            }
            self.pending = joined;
            log::warn!(
                "stream: frame still unparsable after joining ({} bytes held)",
                self.pending.len()
            );
        } else if let Some(chunk) = parse_chunk(payload) {
            self.apply(chunk, events);
            return Ok(());
        } else {
            log::debug!("stream: holding partial frame ({} bytes)", payload.len());
            self.pending = payload.to_string();
        }

        if self.pending.len() > MAX_PENDING_FRAME_BYTES {
            self.pending.clear();
            return Err(DecodeError::FrameTooLarge {
                limit: MAX_PENDING_FRAME_BYTES,
            });
        }
        Ok(())
    }

    fn apply(&mut self, chunk: StreamChunk, events: &mut Vec<DecodedEvent>) {
        let delta = chunk
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.delta)
            .and_then(|d| d.content);
        if let Some(content) = delta {
            if !content.is_empty() {
                self.text.push_str(&content);
                events.push(DecodedEvent {
                    text: self.text.clone(),
                    done: false,
                });
            }
        }
    }
}

fn is_sse_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|p| line.starts_with(p))
}

fn parse_chunk(s: &str) -> Option<StreamChunk> {
    serde_json::from_str::<StreamChunk>(s).ok()
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
