//! Axum route handlers for the Chat API.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::chat::coordinator::ChatRequest;
use crate::chat::resume::follow_stream;
use crate::errors::AppError;
use crate::models::chat::{Chat, Message, Visibility, Vote};
use crate::state::AppState;
use crate::store::ChatStore;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

// ────────────────────────────────────────────────────────────────────────────
// Request / Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ChatDetailResponse {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub visibility: Visibility,
}

#[derive(Debug, Deserialize)]
pub struct TrailingQuery {
    pub after: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: u64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteType {
    Up,
    Down,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    #[serde(rename = "chatId")]
    pub chat_id: Uuid,
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub vote_type: VoteType,
}

// ────────────────────────────────────────────────────────────────────────────
// Access helpers
// ────────────────────────────────────────────────────────────────────────────

/// Loads a chat the caller may read: their own, or any public one.
pub async fn load_readable_chat(
    store: &dyn ChatStore,
    chat_id: Uuid,
    user: AuthUser,
) -> Result<Chat, AppError> {
    let chat = store
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Chat {chat_id} not found")))?;
    if chat.visibility == Visibility::Private && chat.user_id != user.id {
        return Err(AppError::Forbidden);
    }
    Ok(chat)
}

/// Loads a chat the caller owns.
pub async fn load_owned_chat(
    store: &dyn ChatStore,
    chat_id: Uuid,
    user: AuthUser,
) -> Result<Chat, AppError> {
    let chat = store
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Chat {chat_id} not found")))?;
    if chat.user_id != user.id {
        return Err(AppError::Forbidden);
    }
    Ok(chat)
}

fn sse_response<S>(payloads: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = String> + Send + 'static,
{
    let done = stream::once(async { "[DONE]".to_string() });
    let events = payloads
        .chain(done)
        .map(|payload| Ok(Event::default().data(payload)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/chat
///
/// Runs one chat turn. Validation, ownership and backend failures are
/// returned as JSON errors; after that the body is the UI event stream.
pub async fn handle_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let turn = state.coordinator.prepare(user.id, request).await?;
    info!(
        "Streaming chat {} (stream {}) for user {}",
        turn.chat_id, turn.stream_id, user.id
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        let outcome = coordinator.drive(turn, tx).await;
        info!("Turn finished: {:?}", outcome);
    });

    Ok(sse_response(ReceiverStream::new(rx).map(|event| event.to_json())))
}

/// GET /api/chat/:id/stream
///
/// Replays the chat's latest stream. 204 when there is none.
pub async fn handle_resume_stream(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let chat = load_readable_chat(state.store.as_ref(), chat_id, user).await?;
    let Some(stream_id) = state.registry.latest(chat.id).await? else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(follow_stream(state.registry.clone(), stream_id, tx));

    Ok(sse_response(ReceiverStream::new(rx)).into_response())
}

/// GET /api/chat/:id
pub async fn handle_get_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<ChatDetailResponse>, AppError> {
    let chat = load_readable_chat(state.store.as_ref(), chat_id, user).await?;
    let messages = state.store.list_messages(chat.id).await?;
    Ok(Json(ChatDetailResponse { chat, messages }))
}

/// DELETE /api/chat/:id
pub async fn handle_delete_chat(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let chat = load_owned_chat(state.store.as_ref(), chat_id, user).await?;
    state.store.delete_chat(chat.id).await?;
    info!("Deleted chat {} for user {}", chat.id, user.id);
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /api/chat/:id/visibility
pub async fn handle_set_visibility(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<Uuid>,
    Json(request): Json<VisibilityRequest>,
) -> Result<StatusCode, AppError> {
    let chat = load_owned_chat(state.store.as_ref(), chat_id, user).await?;
    state
        .store
        .set_visibility(chat.id, request.visibility)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/chat/:id/messages?after=<rfc3339>
///
/// Drops the messages at and after `after`, for edit and regenerate.
pub async fn handle_delete_trailing(
    State(state): State<AppState>,
    user: AuthUser,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<TrailingQuery>,
) -> Result<Json<DeletedResponse>, AppError> {
    let chat = load_owned_chat(state.store.as_ref(), chat_id, user).await?;
    let deleted = state
        .store
        .delete_messages_after(chat.id, query.after)
        .await?;
    Ok(Json(DeletedResponse { deleted }))
}

/// GET /api/history
pub async fn handle_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Chat>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.store.list_chats(user.id, limit).await?))
}

/// POST /api/vote
pub async fn handle_vote(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<VoteRequest>,
) -> Result<StatusCode, AppError> {
    let chat = load_owned_chat(state.store.as_ref(), request.chat_id, user).await?;
    let message = state
        .store
        .get_message(request.message_id)
        .await?
        .filter(|m| m.chat_id == chat.id)
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", request.message_id)))?;

    state
        .store
        .upsert_vote(&Vote {
            chat_id: chat.id,
            message_id: message.id,
            is_upvoted: matches!(request.vote_type, VoteType::Up),
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
