//! Relational store seam.
//!
//! `PgChatStore` is the production backend. The coordinator and handlers only
//! see `Arc<dyn ChatStore>`, the same way `AppState` carries other pluggable
//! services.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::chat::{Chat, Message, Visibility, Vote};
use crate::models::feedback::{FeedbackInput, HypothesisFeedback, MessageFeedback};
use crate::models::hypothesis::Hypothesis;

pub use postgres::PgChatStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError>;

    /// Inserts `chat` unless a chat with its id exists, then returns the
    /// stored row. A duplicate id is not an error.
    async fn create_chat(&self, chat: &Chat) -> Result<Chat, StoreError>;

    /// Most recent first.
    async fn list_chats(&self, user_id: Uuid, limit: i64) -> Result<Vec<Chat>, StoreError>;

    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError>;

    async fn set_visibility(&self, id: Uuid, visibility: Visibility) -> Result<(), StoreError>;

    /// Saving a message id twice keeps the first write.
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Oldest first, each with its hypotheses attached.
    async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<Message>, StoreError>;

    /// Deletes messages created at or after `after`. Returns the count.
    async fn delete_messages_after(
        &self,
        chat_id: Uuid,
        after: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Inserts or updates by id (title, description and order index).
    async fn upsert_hypotheses(&self, hypotheses: &[Hypothesis]) -> Result<(), StoreError>;

    async fn get_hypothesis(&self, id: &str) -> Result<Option<Hypothesis>, StoreError>;

    async fn list_hypotheses(&self, message_id: Uuid) -> Result<Vec<Hypothesis>, StoreError>;

    async fn upsert_vote(&self, vote: &Vote) -> Result<(), StoreError>;

    async fn upsert_message_feedback(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        input: &FeedbackInput,
    ) -> Result<MessageFeedback, StoreError>;

    async fn upsert_hypothesis_feedback(
        &self,
        hypothesis_id: &str,
        user_id: Uuid,
        input: &FeedbackInput,
    ) -> Result<HypothesisFeedback, StoreError>;
}
