//! Chat turn coordination.
//!
//! Flow: validate → ensure chat → save user message → register resumable
//!       stream → open backend → forward + accumulate → save assistant
//!       message → extract and upsert hypotheses.
//!
//! `prepare` runs inside the HTTP request so every terminal failure becomes an
//! error response before any SSE byte is sent. `drive` runs in its own task
//! and keeps going if the client disconnects: the registry still records the
//! events and the assistant message is saved once the source is final.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{BackendRequest, ByteStream, TokenSource};
use crate::errors::AppError;
use crate::hypotheses::extract_hypotheses;
use crate::models::chat::{Chat, Message, MessagePart, Role, Visibility};
use crate::models::hypothesis::Hypothesis;
use crate::registry::StreamRegistry;
use crate::store::ChatStore;
use crate::stream::{StreamError, TranscodeStream, Transcoder, UiEvent};

pub const MAX_MESSAGE_CHARS: usize = 32_000;
const TITLE_MAX_CHARS: usize = 80;
const DEFAULT_TITLE: &str = "New chat";
const INTERRUPTED_TEXT: &str = "The response was interrupted before it finished.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Created,
    UserMessageSaved,
    StreamOpen,
    Streaming,
    Completed,
    Interrupted,
    BackendUnavailable,
    AssistantMessageSaved,
    Failed,
}

// ────────────────────────────────────────────────────────────────────────────
// Request types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub id: Uuid,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

/// Request body for one chat turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// The chat id; created on first use.
    pub id: Uuid,
    pub message: IncomingMessage,
    #[serde(default = "default_visibility", rename = "selectedVisibilityType")]
    pub visibility: Visibility,
    /// Generation-control knobs forwarded to the backend as-is.
    #[serde(default)]
    pub facets: Map<String, Value>,
}

fn default_visibility() -> Visibility {
    Visibility::Private
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A turn whose backend stream is open and not yet read.
pub struct PreparedTurn {
    pub chat_id: Uuid,
    pub stream_id: Uuid,
    pub assistant_message_id: Uuid,
    body: ByteStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// `Completed` or `Interrupted`.
    pub ended: TurnState,
    /// `AssistantMessageSaved` or `Failed`.
    pub state: TurnState,
    pub assistant_message_id: Uuid,
    pub hypotheses_saved: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Coordinator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn ChatStore>,
    source: Arc<dyn TokenSource>,
    registry: Arc<dyn StreamRegistry>,
    settings: GenerationSettings,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        source: Arc<dyn TokenSource>,
        registry: Arc<dyn StreamRegistry>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            store,
            source,
            registry,
            settings,
        }
    }

    /// Everything up to an open backend stream.
    ///
    /// The user message is saved before the backend is contacted, so it
    /// survives a backend failure. On `BackendUnavailable` nothing else is
    /// written.
    pub async fn prepare(
        &self,
        user_id: Uuid,
        request: ChatRequest,
    ) -> Result<PreparedTurn, AppError> {
        let message_text = validate(&request)?;
        let mut state = TurnState::Created;

        let chat = self.ensure_chat(user_id, &request).await?;

        let user_message = Message {
            id: request.message.id,
            chat_id: chat.id,
            role: Role::User,
            parts: request.message.parts,
            created_at: Utc::now(),
            hypotheses: None,
        };
        self.store.save_message(&user_message).await?;
        advance(&mut state, TurnState::UserMessageSaved, chat.id);

        let stream_id = Uuid::new_v4();
        if let Err(e) = self.registry.create(stream_id, chat.id).await {
            warn!("Failed to register resumable stream {stream_id}: {e}");
        }

        let backend_request = BackendRequest {
            user_id,
            message: message_text,
            conversation_id: chat.id,
            stream: true,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            facets: request.facets,
        };

        let body = match self.source.open(&backend_request).await {
            Ok(body) => body,
            Err(e) => {
                advance(&mut state, TurnState::BackendUnavailable, chat.id);
                if let Err(e) = self.registry.complete(stream_id).await {
                    warn!("Failed to close resumable stream {stream_id}: {e}");
                }
                return Err(e.into());
            }
        };
        advance(&mut state, TurnState::StreamOpen, chat.id);

        Ok(PreparedTurn {
            chat_id: chat.id,
            stream_id,
            assistant_message_id: Uuid::new_v4(),
            body,
        })
    }

    /// Forwards the transcoded stream to `tx` and persists the result.
    pub async fn drive(&self, turn: PreparedTurn, tx: mpsc::Sender<UiEvent>) -> TurnOutcome {
        let PreparedTurn {
            chat_id,
            stream_id,
            assistant_message_id,
            body,
        } = turn;
        let mut state = TurnState::StreamOpen;
        advance(&mut state, TurnState::Streaming, chat_id);

        let mut forwarder = Forwarder {
            registry: self.registry.as_ref(),
            stream_id,
            tx,
            connected: true,
        };
        forwarder
            .send(UiEvent::Start {
                message_id: assistant_message_id.to_string(),
            })
            .await;

        let mut stream = TranscodeStream::new(body, Transcoder::new());
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => forwarder.send(event).await,
                Err(StreamError::Interrupted(reason)) => {
                    warn!("Backend stream for chat {chat_id} interrupted: {reason}");
                    forwarder
                        .send(UiEvent::Error {
                            error_text: INTERRUPTED_TEXT.to_string(),
                        })
                        .await;
                }
            }
        }

        let ended = if stream.completed() {
            TurnState::Completed
        } else {
            TurnState::Interrupted
        };
        advance(&mut state, ended, chat_id);
        if stream.malformed_frames() > 0 {
            warn!(
                "Dropped {} malformed backend frames for chat {chat_id}",
                stream.malformed_frames()
            );
        }

        // The source is final from here on; only now is the content read.
        let content = stream.into_content();
        if let Err(e) = self.registry.complete(stream_id).await {
            warn!("Failed to close resumable stream {stream_id}: {e}");
        }
        // `forwarder` lives to the end of the turn: the client's stream only
        // ends once the assistant message and its hypotheses are stored.

        let assistant = Message {
            id: assistant_message_id,
            chat_id,
            role: Role::Assistant,
            parts: content.to_parts(),
            created_at: Utc::now(),
            hypotheses: None,
        };
        if let Err(e) = self.store.save_message(&assistant).await {
            error!("Failed to save assistant message {assistant_message_id}: {e}");
            advance(&mut state, TurnState::Failed, chat_id);
            return TurnOutcome {
                ended,
                state,
                assistant_message_id,
                hypotheses_saved: 0,
            };
        }
        advance(&mut state, TurnState::AssistantMessageSaved, chat_id);

        let hypotheses_saved = self
            .save_hypotheses(chat_id, assistant_message_id, content.text())
            .await;

        TurnOutcome {
            ended,
            state,
            assistant_message_id,
            hypotheses_saved,
        }
    }

    /// Returns the chat the caller may post to, creating it on first use.
    async fn ensure_chat(&self, user_id: Uuid, request: &ChatRequest) -> Result<Chat, AppError> {
        if let Some(existing) = self.store.get_chat(request.id).await? {
            return authorize_post(existing, user_id);
        }

        let chat = Chat {
            id: request.id,
            user_id,
            title: derive_title(&request.message.parts),
            visibility: request.visibility,
            created_at: Utc::now(),
        };
        // A concurrent duplicate submission may have won the insert; the
        // stored row is what counts.
        let stored = self.store.create_chat(&chat).await?;
        authorize_post(stored, user_id)
    }

    /// Hypothesis failures are logged and never undo the assistant message.
    async fn save_hypotheses(&self, chat_id: Uuid, message_id: Uuid, text: &str) -> usize {
        let extracted = extract_hypotheses(text, chat_id, message_id);
        if extracted.is_empty() {
            return 0;
        }

        let now = Utc::now();
        let records: Vec<Hypothesis> = extracted
            .into_iter()
            .map(|h| Hypothesis {
                id: h.id,
                message_id,
                title: h.title,
                description: h.description,
                order_index: h.order_index,
                created_at: now,
            })
            .collect();

        match self.store.upsert_hypotheses(&records).await {
            Ok(()) => {
                info!(
                    "Saved {} hypotheses for message {message_id}",
                    records.len()
                );
                records.len()
            }
            Err(e) => {
                error!("Failed to save hypotheses for message {message_id}: {e}");
                0
            }
        }
    }
}

/// Forwarding to the registry and to the client happen in the same step.
struct Forwarder<'a> {
    registry: &'a dyn StreamRegistry,
    stream_id: Uuid,
    tx: mpsc::Sender<UiEvent>,
    connected: bool,
}

impl Forwarder<'_> {
    async fn send(&mut self, event: UiEvent) {
        if let Err(e) = self.registry.append(self.stream_id, &event).await {
            warn!("Failed to record event for stream {}: {e}", self.stream_id);
        }
        if self.connected && self.tx.send(event).await.is_err() {
            info!(
                "Client left stream {}; finishing in the background",
                self.stream_id
            );
            self.connected = false;
        }
    }
}

fn advance(state: &mut TurnState, next: TurnState, chat_id: Uuid) {
    info!("Chat {chat_id}: {:?} -> {:?}", state, next);
    *state = next;
}

fn authorize_post(chat: Chat, user_id: Uuid) -> Result<Chat, AppError> {
    if chat.user_id != user_id {
        warn!("User {user_id} tried to post to chat {} owned by another user", chat.id);
        return Err(AppError::Forbidden);
    }
    Ok(chat)
}

/// Checks the inbound message and returns the text sent to the backend.
fn validate(request: &ChatRequest) -> Result<String, AppError> {
    let mut text = String::new();
    let mut has_file = false;
    for part in &request.message.parts {
        match part {
            MessagePart::Text { text: t } => text.push_str(t),
            MessagePart::File { url, .. } => {
                if url.trim().is_empty() {
                    return Err(AppError::BadRequest("file part has no url".to_string()));
                }
                has_file = true;
            }
            MessagePart::Reasoning { .. } => {
                return Err(AppError::BadRequest(
                    "user messages cannot contain reasoning parts".to_string(),
                ))
            }
        }
    }

    if text.trim().is_empty() && !has_file {
        return Err(AppError::BadRequest("message cannot be empty".to_string()));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::BadRequest(format!(
            "message exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(text)
}

fn derive_title(parts: &[MessagePart]) -> String {
    let first_line = parts
        .iter()
        .filter_map(|p| match p {
            MessagePart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .flat_map(str::lines)
        .map(str::trim)
        .find(|line| !line.is_empty());

    match first_line {
        Some(line) => line.chars().take(TITLE_MAX_CHARS).collect(),
        None => DEFAULT_TITLE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::backend::scripted::ScriptedSource;
    use crate::backend::BackendError;
    use crate::registry::LocalStreamRegistry;
    use crate::store::memory::MemoryStore;

    const SETTINGS: GenerationSettings = GenerationSettings {
        temperature: 0.2,
        max_tokens: 512,
    };

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<LocalStreamRegistry>,
        source: Arc<ScriptedSource>,
        coordinator: Coordinator,
    }

    fn harness(source: ScriptedSource) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(LocalStreamRegistry::new(Duration::from_secs(60)));
        let source = Arc::new(source);
        let coordinator = Coordinator::new(
            store.clone(),
            source.clone(),
            registry.clone(),
            SETTINGS,
        );
        Harness {
            store,
            registry,
            source,
            coordinator,
        }
    }

    fn request(chat_id: Uuid, text: &str) -> ChatRequest {
        ChatRequest {
            id: chat_id,
            message: IncomingMessage {
                id: Uuid::new_v4(),
                parts: vec![MessagePart::Text {
                    text: text.to_string(),
                }],
            },
            visibility: Visibility::Private,
            facets: Map::new(),
        }
    }

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({ "type": "text-delta", "delta": text })
        )
    }

    async fn run_turn(h: &Harness, user: Uuid, req: ChatRequest) -> (TurnOutcome, Vec<UiEvent>) {
        let turn = h.coordinator.prepare(user, req).await.unwrap();
        let (tx, mut rx) = mpsc::channel(256);
        let outcome = h.coordinator.drive(turn, tx).await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn test_completed_turn_saves_messages_and_hypotheses() {
        let research = "Ideas:\n<!-- HYPOTHESES_START -->\n**Hypothesis 1: Title A**\nDesc A\n**Hypothesis 2: Title B**\nDesc B\n<!-- HYPOTHESES_END -->";
        let first = delta(&research[..20]);
        let second = delta(&research[20..]);
        let h = harness(ScriptedSource::streaming(&[&first, &second, "data: [DONE]\n\n"]));
        let (user, chat_id) = (Uuid::new_v4(), Uuid::new_v4());

        let (outcome, events) = run_turn(&h, user, request(chat_id, "Why do plants lean?")).await;

        assert_eq!(outcome.ended, TurnState::Completed);
        assert_eq!(outcome.state, TurnState::AssistantMessageSaved);
        assert_eq!(outcome.hypotheses_saved, 2);

        assert_eq!(
            events.first(),
            Some(&UiEvent::Start {
                message_id: outcome.assistant_message_id.to_string()
            })
        );
        assert_eq!(events.last(), Some(&UiEvent::Finish));

        let messages = h.store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), research);

        let hyps = h.store.hypotheses();
        assert_eq!(hyps.len(), 2);
        assert!(hyps
            .iter()
            .any(|x| x.id == format!("hyp_{chat_id}_{}_1", outcome.assistant_message_id)));

        let sent = h.source.requests.lock().unwrap();
        assert_eq!(sent[0].message, "Why do plants lean?");
        assert_eq!(sent[0].conversation_id, chat_id);
        assert!(sent[0].stream);
        assert_eq!(sent[0].max_tokens, 512);
    }

    #[tokio::test]
    async fn test_new_chat_title_comes_from_first_line() {
        let h = harness(ScriptedSource::streaming(&["data: [DONE]\n\n"]));
        let (user, chat_id) = (Uuid::new_v4(), Uuid::new_v4());
        run_turn(&h, user, request(chat_id, "\n  Soil question  \nmore detail")).await;
        let chat = h.store.get_chat(chat_id).await.unwrap().unwrap();
        assert_eq!(chat.title, "Soil question");
        assert_eq!(chat.user_id, user);
    }

    #[tokio::test]
    async fn test_backend_unavailable_keeps_only_user_message() {
        let h = harness(ScriptedSource::unavailable(503));
        let (user, chat_id) = (Uuid::new_v4(), Uuid::new_v4());

        let result = h.coordinator.prepare(user, request(chat_id, "hello")).await;

        assert!(matches!(result, Err(AppError::BackendUnavailable(_))));
        let messages = h.store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert!(h.store.hypotheses().is_empty());

        let stream_id = h.registry.latest(chat_id).await.unwrap().unwrap();
        assert!(h.registry.replay(stream_id, 0).await.unwrap().completed);
    }

    #[tokio::test]
    async fn test_interrupted_turn_saves_partial_text() {
        let first = delta("Partial ans");
        let h = harness(ScriptedSource::new(Ok(vec![
            Ok(Bytes::from(first)),
            Err(BackendError::EmptyBody),
        ])));
        let (user, chat_id) = (Uuid::new_v4(), Uuid::new_v4());

        let (outcome, events) = run_turn(&h, user, request(chat_id, "q")).await;

        assert_eq!(outcome.ended, TurnState::Interrupted);
        assert_eq!(outcome.state, TurnState::AssistantMessageSaved);
        assert!(matches!(events.last(), Some(UiEvent::Error { .. })));
        assert!(events.iter().any(|e| matches!(e, UiEvent::TextEnd { .. })));

        let messages = h.store.messages();
        assert_eq!(messages[1].text(), "Partial ans");
    }

    #[tokio::test]
    async fn test_client_disconnect_still_saves_full_reply() {
        let (a, b) = (delta("one "), delta("two"));
        let h = harness(ScriptedSource::streaming(&[&a, &b, "data: [DONE]\n\n"]));
        let (user, chat_id) = (Uuid::new_v4(), Uuid::new_v4());

        let turn = h.coordinator.prepare(user, request(chat_id, "q")).await.unwrap();
        let stream_id = turn.stream_id;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = h.coordinator.drive(turn, tx).await;

        assert_eq!(outcome.ended, TurnState::Completed);
        assert_eq!(outcome.state, TurnState::AssistantMessageSaved);
        assert_eq!(h.store.messages()[1].text(), "one two");

        let replay = h.registry.replay(stream_id, 0).await.unwrap();
        assert!(replay.completed);
        assert!(replay.events.last().unwrap().contains("finish"));
    }

    #[tokio::test]
    async fn test_hypothesis_save_failure_does_not_fail_turn() {
        let text = "<!-- HYPOTHESES_START -->\n**Hypothesis 1: A**\nB\n<!-- HYPOTHESES_END -->";
        let d = delta(text);
        let h = harness(ScriptedSource::streaming(&[&d, "data: [DONE]\n\n"]));
        h.store.fail_hypotheses.store(true, Ordering::SeqCst);

        let (outcome, _) = run_turn(&h, Uuid::new_v4(), request(Uuid::new_v4(), "q")).await;

        assert_eq!(outcome.state, TurnState::AssistantMessageSaved);
        assert_eq!(outcome.hypotheses_saved, 0);
        assert_eq!(h.store.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_assistant_save_failure_ends_failed() {
        let d = delta("x");
        let h = harness(ScriptedSource::streaming(&[&d, "data: [DONE]\n\n"]));
        let turn = h
            .coordinator
            .prepare(Uuid::new_v4(), request(Uuid::new_v4(), "q"))
            .await
            .unwrap();
        h.store.fail_messages.store(true, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(16);

        let outcome = h.coordinator.drive(turn, tx).await;

        assert_eq!(outcome.ended, TurnState::Completed);
        assert_eq!(outcome.state, TurnState::Failed);
    }

    #[tokio::test]
    async fn test_existing_chat_of_other_user_is_forbidden() {
        let h = harness(ScriptedSource::streaming(&["data: [DONE]\n\n"]));
        let chat_id = Uuid::new_v4();
        h.store
            .create_chat(&Chat {
                id: chat_id,
                user_id: Uuid::new_v4(),
                title: "theirs".into(),
                visibility: Visibility::Public,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let result = h
            .coordinator
            .prepare(Uuid::new_v4(), request(chat_id, "hi"))
            .await;

        assert!(matches!(result, Err(AppError::Forbidden)));
        assert!(h.store.messages().is_empty());
        assert!(h.source.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_turn_reuses_chat() {
        let user = Uuid::new_v4();
        let chat_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(LocalStreamRegistry::new(Duration::from_secs(60)));

        for text in ["first", "second"] {
            let source = Arc::new(ScriptedSource::streaming(&["data: [DONE]\n\n"]));
            let coordinator =
                Coordinator::new(store.clone(), source, registry.clone(), SETTINGS);
            let turn = coordinator.prepare(user, request(chat_id, text)).await.unwrap();
            let (tx, _rx) = mpsc::channel(16);
            coordinator.drive(turn, tx).await;
        }

        assert_eq!(store.chat_count(), 1);
        assert_eq!(store.messages().len(), 4);
        let chat = store.get_chat(chat_id).await.unwrap().unwrap();
        assert_eq!(chat.title, "first");
    }

    #[test]
    fn test_validate_rejects_bad_payloads() {
        let mut empty = request(Uuid::new_v4(), "   ");
        assert!(matches!(validate(&empty), Err(AppError::BadRequest(_))));

        empty.message.parts.push(MessagePart::File {
            url: "https://files/a.png".into(),
            media_type: "image/png".into(),
            filename: None,
        });
        assert!(validate(&empty).is_ok());

        let mut reasoning = request(Uuid::new_v4(), "hi");
        reasoning
            .message
            .parts
            .push(MessagePart::Reasoning { text: "x".into() });
        assert!(matches!(validate(&reasoning), Err(AppError::BadRequest(_))));

        let long = request(Uuid::new_v4(), &"a".repeat(MAX_MESSAGE_CHARS + 1));
        assert!(matches!(validate(&long), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_derive_title_truncates_and_defaults() {
        let parts = vec![MessagePart::Text {
            text: "x".repeat(200),
        }];
        assert_eq!(derive_title(&parts).chars().count(), TITLE_MAX_CHARS);
        assert_eq!(derive_title(&[]), DEFAULT_TITLE);
    }

    #[test]
    fn test_chat_request_wire_shape() {
        let body = serde_json::json!({
            "id": Uuid::nil(),
            "message": { "id": Uuid::nil(), "parts": [{ "type": "text", "text": "hi" }] },
            "selectedVisibilityType": "public",
            "facets": { "facet_count": 4 }
        });
        let req: ChatRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.visibility, Visibility::Public);
        assert_eq!(req.facets["facet_count"], 4);
    }
}
