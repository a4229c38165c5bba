//! Feedback upserts, including the lazy hypothesis backfill.
//!
//! A hypothesis id encodes its chat, message and ordinal, so feedback can
//! arrive for a hypothesis that was never persisted (the save after the
//! stream failed, or the message predates extraction). In that case the
//! record is rebuilt by re-extracting the stored message.

use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::chat::handlers::load_readable_chat;
use crate::errors::AppError;
use crate::hypotheses::{extract_hypotheses, parse_hypothesis_id, MAX_ID_LEN};
use crate::models::chat::Message;
use crate::models::feedback::{FeedbackInput, HypothesisFeedback, MessageFeedback};
use crate::models::hypothesis::Hypothesis;
use crate::store::ChatStore;

const MAX_COMMENT_CHARS: usize = 4_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFeedbackRequest {
    pub message_id: Uuid,
    #[serde(flatten)]
    pub feedback: FeedbackInput,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypothesisFeedbackRequest {
    pub hypothesis_id: String,
    #[serde(flatten)]
    pub feedback: FeedbackInput,
}

pub async fn record_message_feedback(
    store: &dyn ChatStore,
    user: AuthUser,
    request: &MessageFeedbackRequest,
) -> Result<MessageFeedback, AppError> {
    validate_comment(&request.feedback)?;
    let message = load_visible_message(store, user, request.message_id).await?;
    let feedback = store
        .upsert_message_feedback(message.id, user.id, &request.feedback)
        .await?;
    info!(
        "Recorded {:?} feedback on message {} from user {}",
        feedback.rating, message.id, user.id
    );
    Ok(feedback)
}

pub async fn record_hypothesis_feedback(
    store: &dyn ChatStore,
    user: AuthUser,
    request: &HypothesisFeedbackRequest,
) -> Result<HypothesisFeedback, AppError> {
    validate_comment(&request.feedback)?;
    let id = request.hypothesis_id.as_str();
    if id.len() > MAX_ID_LEN {
        return Err(AppError::BadRequest(format!(
            "Hypothesis id exceeds {MAX_ID_LEN} characters"
        )));
    }
    let (chat_id, message_id, _) = parse_hypothesis_id(id)
        .ok_or_else(|| AppError::BadRequest(format!("Malformed hypothesis id: {id}")))?;

    let message = load_visible_message(store, user, message_id).await?;
    if message.chat_id != chat_id {
        return Err(AppError::NotFound(format!("Hypothesis {id} not found")));
    }

    if store.get_hypothesis(id).await?.is_none() {
        let hypothesis = backfill(&message, id)?;
        store.upsert_hypotheses(std::slice::from_ref(&hypothesis)).await?;
        info!("Backfilled hypothesis {id}");
    }

    let feedback = store
        .upsert_hypothesis_feedback(id, user.id, &request.feedback)
        .await?;
    Ok(feedback)
}

/// Messages are visible when their chat is.
pub async fn load_visible_message(
    store: &dyn ChatStore,
    user: AuthUser,
    message_id: Uuid,
) -> Result<Message, AppError> {
    let message = store
        .get_message(message_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Message {message_id} not found")))?;
    load_readable_chat(store, message.chat_id, user).await?;
    Ok(message)
}

/// Rebuilds a hypothesis from the stored message. Only ids the extractor
/// produces for that text are accepted.
fn backfill(message: &Message, hypothesis_id: &str) -> Result<Hypothesis, AppError> {
    let extracted = extract_hypotheses(&message.text(), message.chat_id, message.id)
        .into_iter()
        .find(|h| h.id == hypothesis_id)
        .ok_or_else(|| AppError::NotFound(format!("Hypothesis {hypothesis_id} not found")))?;

    Ok(Hypothesis {
        id: extracted.id,
        message_id: message.id,
        title: extracted.title,
        description: extracted.description,
        order_index: extracted.order_index,
        created_at: Utc::now(),
    })
}

fn validate_comment(input: &FeedbackInput) -> Result<(), AppError> {
    match &input.comment {
        Some(comment) if comment.chars().count() > MAX_COMMENT_CHARS => Err(AppError::BadRequest(
            format!("Comment exceeds {MAX_COMMENT_CHARS} characters"),
        )),
        _ => Ok(()),
    }
}
