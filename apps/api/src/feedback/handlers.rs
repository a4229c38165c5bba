use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::errors::AppError;
use crate::feedback::service::{
    load_visible_message, record_hypothesis_feedback, record_message_feedback,
    HypothesisFeedbackRequest, MessageFeedbackRequest,
};
use crate::models::feedback::{HypothesisFeedback, MessageFeedback};
use crate::models::hypothesis::Hypothesis;
use crate::state::AppState;

/// POST /api/feedback/message
pub async fn handle_message_feedback(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<MessageFeedbackRequest>,
) -> Result<Json<MessageFeedback>, AppError> {
    let feedback = record_message_feedback(state.store.as_ref(), user, &request).await?;
    Ok(Json(feedback))
}

/// POST /api/feedback/hypothesis
///
/// Creates the hypothesis first when it was never persisted.
pub async fn handle_hypothesis_feedback(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<HypothesisFeedbackRequest>,
) -> Result<Json<HypothesisFeedback>, AppError> {
    let feedback = record_hypothesis_feedback(state.store.as_ref(), user, &request).await?;
    Ok(Json(feedback))
}

/// GET /api/messages/:id/hypotheses
pub async fn handle_list_hypotheses(
    State(state): State<AppState>,
    user: AuthUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<Vec<Hypothesis>>, AppError> {
    let message = load_visible_message(state.store.as_ref(), user, message_id).await?;
    Ok(Json(state.store.list_hypotheses(message.id).await?))
}
