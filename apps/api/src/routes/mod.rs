pub mod health;

use axum::{
    routing::{delete, get, patch, post},
    Router,
};

use crate::chat::handlers as chat;
use crate::feedback::handlers as feedback;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Chat turns
        .route("/api/chat", post(chat::handle_chat))
        .route("/api/chat/:id/stream", get(chat::handle_resume_stream))
        // Chat CRUD
        .route(
            "/api/chat/:id",
            get(chat::handle_get_chat).delete(chat::handle_delete_chat),
        )
        .route(
            "/api/chat/:id/visibility",
            patch(chat::handle_set_visibility),
        )
        .route(
            "/api/chat/:id/messages",
            delete(chat::handle_delete_trailing),
        )
        .route("/api/history", get(chat::handle_history))
        .route("/api/vote", post(chat::handle_vote))
        // Feedback
        .route(
            "/api/feedback/message",
            post(feedback::handle_message_feedback),
        )
        .route(
            "/api/feedback/hypothesis",
            post(feedback::handle_hypothesis_feedback),
        )
        .route(
            "/api/messages/:id/hypotheses",
            get(feedback::handle_list_hypotheses),
        )
        .with_state(state)
}
