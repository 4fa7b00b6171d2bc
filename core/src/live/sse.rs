/// Incremental Server-Sent-Events decoder for conversation streams
///
/// Bytes are buffered and split on the blank-line separator before UTF-8
/// decoding, so a character split across two reads is never mangled.
use crate::messenger_types::{NewMessagePayload, StreamEvent};

/// One raw SSE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name, `message` when the frame has no `event:` line
    pub event: String,
    /// Concatenated `data:` lines
    pub data: String,
}

/// Pending bytes allowed without a frame terminator
pub const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

/// Frame terminators: a blank line after LF, CRLF or CR line endings
const TERMINATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes already searched for a terminator
    scanned: usize,
    max_pending: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_pending,
        }
    }

    /// Feed one chunk; returns every frame completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            // A terminator may straddle the previous scan boundary
            let from = self.scanned.saturating_sub(3);
            match find_terminator(&self.buffer, from) {
                Some((end, len)) => {
                    if let Some(frame) = parse_frame(&self.buffer[..end]) {
                        frames.push(frame);
                    }
                    self.buffer.drain(..end + len);
                    self.scanned = 0;
                }
                None => {
                    self.scanned = self.buffer.len();
                    break;
                }
            }
        }
        frames
    }

    /// Bytes waiting for a frame terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// The unterminated tail grew past the limit
    pub fn is_overflowing(&self) -> bool {
        self.buffer.len() > self.max_pending
    }
}

/// Earliest complete terminator at or after `from`: (start, length)
fn find_terminator(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buffer.len()).find_map(|i| {
        TERMINATORS
            .iter()
            .find(|t| buffer[i..].starts_with(t))
            .map(|t| (i, t.len()))
    })
}

/// Parse the lines of one frame. Comment-only and empty frames yield None.
pub fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = String::from("message");
    let mut data = String::new();
    let mut has_field = false;

    for line in text.split(|c: char| c == '\n' || c == '\r') {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
            has_field = true;
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim());
            has_field = true;
        }
    }

    has_field.then_some(SseFrame { event, data })
}

/// Turn a frame into a typed event. Only `message.new` payloads can fail.
pub fn classify(frame: SseFrame) -> Result<StreamEvent, serde_json::Error> {
    match frame.event.as_str() {
        "ping" => Ok(StreamEvent::Ping),
        "message.new" => serde_json::from_str::<NewMessagePayload>(&frame.data)
            .map(|payload| StreamEvent::MessageNew(payload.into_message())),
        _ => Ok(StreamEvent::Other(frame.event)),
    }
}
