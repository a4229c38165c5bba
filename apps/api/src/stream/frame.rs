//! SSE framing over raw bytes.
//!
//! Bytes are buffered until a blank line (`\n\n`) closes a frame. Frames are
//! only decoded to text once complete, so a multi-byte UTF-8 character split
//! across two chunks is reassembled before decoding.

const FRAME_DELIMITER: &[u8] = b"\n\n";
const DATA_FIELD: &str = "data:";

/// The payload of one complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `[DONE]` sentinel.
    Done,
    /// The text after `data: `, untrimmed. Multiple data lines are joined
    /// with `\n`.
    Data(String),
}

#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every frame it completed, in order.
    /// Non-data frames (comments, `event:`/`id:` metadata) are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        // CR only ever appears as a line terminator; JSON escapes it in strings.
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = find(&self.buffer, FRAME_DELIMITER) {
            let raw: Vec<u8> = self.buffer.drain(..pos + FRAME_DELIMITER.len()).collect();
            let text = String::from_utf8_lossy(&raw[..pos]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Joins the frame's `data:` lines. Blank lines, comments and other fields
/// (`event:`, `id:`) around them are ignored.
fn parse_frame(text: &str) -> Option<Frame> {
    let mut data: Option<String> = None;
    for line in text.lines() {
        let Some(value) = line.strip_prefix(DATA_FIELD) else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(joined) => {
                joined.push('\n');
                joined.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }

    let payload = data?;
    if payload.trim() == "[DONE]" {
        Some(Frame::Done)
    } else {
        Some(Frame::Data(payload))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
