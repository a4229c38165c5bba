//! Backend-event to UI-event translation.
//!
//! The transcoder owns a single text block id for its whole lifetime. Every
//! `text-start`/`text-end` cycle the backend emits is folded into that one id:
//! a delta after a `text-end` reopens the same block.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::chat::MessagePart;
use crate::stream::events::{BackendEvent, UiEvent};
use crate::stream::frame::{Frame, SseFramer};

const DEFAULT_REASONING_ID: &str = "reasoning";
const LOGGED_FRAME_PREFIX: usize = 200;

/// Content accumulated from the stream, in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulated {
    blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Reasoning { id: String, text: String },
    Text(String),
}

impl Accumulated {
    fn push_text(&mut self, delta: &str) {
        for block in &mut self.blocks {
            if let Block::Text(text) = block {
                text.push_str(delta);
                return;
            }
        }
        self.blocks.push(Block::Text(delta.to_string()));
    }

    fn push_reasoning(&mut self, id: &str, delta: &str) {
        for block in &mut self.blocks {
            if let Block::Reasoning { id: existing, text } = block {
                if existing == id {
                    text.push_str(delta);
                    return;
                }
            }
        }
        self.blocks.push(Block::Reasoning {
            id: id.to_string(),
            text: delta.to_string(),
        });
    }

    /// The answer text. Reasoning is never part of it.
    pub fn text(&self) -> &str {
        self.blocks
            .iter()
            .find_map(|b| match b {
                Block::Text(text) => Some(text.as_str()),
                Block::Reasoning { .. } => None,
            })
            .unwrap_or("")
    }

    pub fn to_parts(&self) -> Vec<MessagePart> {
        self.blocks
            .iter()
            .map(|b| match b {
                Block::Text(text) => MessagePart::Text { text: text.clone() },
                Block::Reasoning { text, .. } => MessagePart::Reasoning { text: text.clone() },
            })
            .collect()
    }
}

pub struct Transcoder {
    framer: SseFramer,
    text_id: String,
    text_open: bool,
    open_reasoning: Vec<String>,
    finish_sent: bool,
    done: bool,
    malformed_frames: usize,
    content: Accumulated,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self::with_text_id(format!("text-{}", Uuid::new_v4().simple()))
    }

    pub fn with_text_id(text_id: impl Into<String>) -> Self {
        Self {
            framer: SseFramer::new(),
            text_id: text_id.into(),
            text_open: false,
            open_reasoning: Vec::new(),
            finish_sent: false,
            done: false,
            malformed_frames: 0,
            content: Accumulated::default(),
        }
    }

    #[cfg(test)]
    pub fn text_id(&self) -> &str {
        &self.text_id
    }

    /// True once `[DONE]` has been seen. Further input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn malformed_frames(&self) -> usize {
        self.malformed_frames
    }

    #[cfg(test)]
    pub fn content(&self) -> &Accumulated {
        &self.content
    }

    pub fn into_content(self) -> Accumulated {
        self.content
    }

    /// Feeds one chunk of the backend body and returns the UI events it produced.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<UiEvent> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        for frame in self.framer.push(chunk) {
            match frame {
                Frame::Done => {
                    self.close_all(&mut out);
                    if !self.finish_sent {
                        out.push(UiEvent::Finish);
                        self.finish_sent = true;
                    }
                    self.done = true;
                    if self.framer.pending() > 0 {
                        debug!(
                            "Discarding {} bytes after [DONE]",
                            self.framer.pending()
                        );
                    }
                    break;
                }
                Frame::Data(payload) => match serde_json::from_str::<BackendEvent>(payload.trim()) {
                    Ok(event) => self.on_event(event, &mut out),
                    Err(e) => {
                        self.malformed_frames += 1;
                        warn!(
                            "Dropping malformed backend frame ({e}): {}",
                            truncate(&payload, LOGGED_FRAME_PREFIX)
                        );
                    }
                },
            }
        }

        out
    }

    /// Closes any open blocks after the source failed or went away.
    pub fn interrupt(&mut self) -> Vec<UiEvent> {
        let mut out = Vec::new();
        if !self.done {
            self.close_all(&mut out);
        }
        out
    }

    fn on_event(&mut self, event: BackendEvent, out: &mut Vec<UiEvent>) {
        // Content after a backend finish reopens the turn; `[DONE]` then
        // owes the client another finish.
        if matches!(
            event,
            BackendEvent::ReasoningStart { .. }
                | BackendEvent::ReasoningDelta { .. }
                | BackendEvent::TextStart { .. }
                | BackendEvent::TextDelta { .. }
        ) {
            self.finish_sent = false;
        }
        match event {
            BackendEvent::ReasoningStart { id } => {
                let id = reasoning_id(id);
                if !self.open_reasoning.contains(&id) {
                    self.open_reasoning.push(id.clone());
                }
                out.push(UiEvent::ReasoningStart { id });
            }
            BackendEvent::ReasoningDelta { id, delta } => {
                let id = reasoning_id(id);
                self.content.push_reasoning(&id, &delta);
                out.push(UiEvent::ReasoningDelta { id, delta });
            }
            BackendEvent::ReasoningEnd { id } => {
                let id = reasoning_id(id);
                self.open_reasoning.retain(|open| open != &id);
                out.push(UiEvent::ReasoningEnd { id });
            }
            BackendEvent::TextStart { .. } => self.ensure_text_open(out),
            BackendEvent::TextDelta { delta, .. } => {
                self.ensure_text_open(out);
                self.content.push_text(&delta);
                out.push(UiEvent::TextDelta {
                    id: self.text_id.clone(),
                    delta,
                });
            }
            BackendEvent::TextEnd { .. } => self.close_text(out),
            BackendEvent::Finish { finish_reason } => {
                debug!("Backend finish (reason: {:?})", finish_reason);
                self.close_all(out);
                if !self.finish_sent {
                    out.push(UiEvent::Finish);
                    self.finish_sent = true;
                }
            }
            BackendEvent::Unknown => debug!("Ignoring backend event with unknown type"),
        }
    }

    fn ensure_text_open(&mut self, out: &mut Vec<UiEvent>) {
        if !self.text_open {
            self.text_open = true;
            out.push(UiEvent::TextStart {
                id: self.text_id.clone(),
            });
        }
    }

    fn close_text(&mut self, out: &mut Vec<UiEvent>) {
        if self.text_open {
            self.text_open = false;
            out.push(UiEvent::TextEnd {
                id: self.text_id.clone(),
            });
        }
    }

    fn close_all(&mut self, out: &mut Vec<UiEvent>) {
        for id in self.open_reasoning.drain(..) {
            out.push(UiEvent::ReasoningEnd { id });
        }
        self.close_text(out);
    }
}

fn reasoning_id(id: String) -> String {
    if id.is_empty() {
        DEFAULT_REASONING_ID.to_string()
    } else {
        id
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
