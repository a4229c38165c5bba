use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted hypothesis. `id` is `hyp_<chatId>_<messageId>_<ordinal>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Hypothesis {
    pub id: String,
    pub message_id: Uuid,
    pub title: String,
    pub description: String,
    /// 1-based, dense within a message.
    pub order_index: i32,
    pub created_at: DateTime<Utc>,
}
