//! Wire types on both sides of the transcoder.

use serde::{Deserialize, Serialize};

/// A decoded backend frame. Unknown `type` tags decode to `Unknown` and are
/// dropped by the transcoder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendEvent {
    ReasoningStart {
        #[serde(default)]
        id: String,
    },
    ReasoningDelta {
        #[serde(default)]
        id: String,
        #[serde(default)]
        delta: String,
    },
    ReasoningEnd {
        #[serde(default)]
        id: String,
    },
    TextStart {
        #[serde(default)]
        id: Option<String>,
    },
    TextDelta {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    TextEnd {
        #[serde(default)]
        id: Option<String>,
    },
    Finish {
        #[serde(default, rename = "finishReason")]
        finish_reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// An event in the UI-facing stream protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    Finish,
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

impl UiEvent {
    /// Serializes the event as the JSON payload of one SSE `data:` line.
    pub fn to_json(&self) -> String {
        // Every variant is plain strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}
