use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::chat::{Chat, Message, MessagePart, Role, Visibility, Vote};
use crate::models::feedback::{FeedbackInput, HypothesisFeedback, MessageFeedback};
use crate::models::hypothesis::Hypothesis;
use crate::store::{ChatStore, StoreError};

#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    chat_id: Uuid,
    role: Role,
    parts: Json<Vec<MessagePart>>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            chat_id: row.chat_id,
            role: row.role,
            parts: row.parts.0,
            created_at: row.created_at,
            hypotheses: None,
        }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        Ok(sqlx::query_as::<_, Chat>("SELECT * FROM chats WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn create_chat(&self, chat: &Chat) -> Result<Chat, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, title, visibility, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(chat.id)
        .bind(chat.user_id)
        .bind(&chat.title)
        .bind(chat.visibility)
        .bind(chat.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!("Chat {} already exists, keeping stored row", chat.id);
        } else {
            info!("Created chat {} for user {}", chat.id, chat.user_id);
        }

        Ok(sqlx::query_as::<_, Chat>("SELECT * FROM chats WHERE id = $1")
            .bind(chat.id)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn list_chats(&self, user_id: Uuid, limit: i64) -> Result<Vec<Chat>, StoreError> {
        Ok(sqlx::query_as::<_, Chat>(
            "SELECT * FROM chats WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError> {
        // Messages, hypotheses, votes and feedback go with it (ON DELETE CASCADE).
        let deleted = sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("Chat {id}")));
        }
        Ok(())
    }

    async fn set_visibility(&self, id: Uuid, visibility: Visibility) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE chats SET visibility = $1 WHERE id = $2")
            .bind(visibility)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("Chat {id}")));
        }
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, role, parts, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.chat_id)
        .bind(message.role)
        .bind(Json(&message.parts))
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Message::from))
    }

    async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE chat_id = $1 ORDER BY created_at ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        let hypotheses = sqlx::query_as::<_, Hypothesis>(
            r#"
            SELECT h.*
            FROM hypotheses h
            JOIN messages m ON m.id = h.message_id
            WHERE m.chat_id = $1
            ORDER BY h.message_id, h.order_index
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<Uuid, Vec<Hypothesis>> = HashMap::new();
        for h in hypotheses {
            by_message.entry(h.message_id).or_default().push(h);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let attached = by_message.remove(&row.id).unwrap_or_default();
                Message::from(row).with_hypotheses(attached)
            })
            .collect())
    }

    async fn delete_messages_after(
        &self,
        chat_id: Uuid,
        after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM messages WHERE chat_id = $1 AND created_at >= $2")
            .bind(chat_id)
            .bind(after)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!("Deleted {deleted} trailing messages from chat {chat_id}");
        Ok(deleted)
    }

    async fn upsert_hypotheses(&self, hypotheses: &[Hypothesis]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for h in hypotheses {
            sqlx::query(
                r#"
                INSERT INTO hypotheses (id, message_id, title, description, order_index, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    description = EXCLUDED.description,
                    order_index = EXCLUDED.order_index
                "#,
            )
            .bind(&h.id)
            .bind(h.message_id)
            .bind(&h.title)
            .bind(&h.description)
            .bind(h.order_index)
            .bind(h.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_hypothesis(&self, id: &str) -> Result<Option<Hypothesis>, StoreError> {
        Ok(
            sqlx::query_as::<_, Hypothesis>("SELECT * FROM hypotheses WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_hypotheses(&self, message_id: Uuid) -> Result<Vec<Hypothesis>, StoreError> {
        Ok(sqlx::query_as::<_, Hypothesis>(
            "SELECT * FROM hypotheses WHERE message_id = $1 ORDER BY order_index ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn upsert_vote(&self, vote: &Vote) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO votes (chat_id, message_id, is_upvoted)
            VALUES ($1, $2, $3)
            ON CONFLICT (chat_id, message_id) DO UPDATE SET is_upvoted = EXCLUDED.is_upvoted
            "#,
        )
        .bind(vote.chat_id)
        .bind(vote.message_id)
        .bind(vote.is_upvoted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_message_feedback(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        input: &FeedbackInput,
    ) -> Result<MessageFeedback, StoreError> {
        Ok(sqlx::query_as::<_, MessageFeedback>(
            r#"
            INSERT INTO message_feedback (id, message_id, user_id, rating, comment, category)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, message_id) DO UPDATE SET
                rating = EXCLUDED.rating,
                comment = EXCLUDED.comment,
                category = EXCLUDED.category,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message_id)
        .bind(user_id)
        .bind(input.rating)
        .bind(&input.comment)
        .bind(input.category)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn upsert_hypothesis_feedback(
        &self,
        hypothesis_id: &str,
        user_id: Uuid,
        input: &FeedbackInput,
    ) -> Result<HypothesisFeedback, StoreError> {
        Ok(sqlx::query_as::<_, HypothesisFeedback>(
            r#"
            INSERT INTO hypothesis_feedback (id, hypothesis_id, user_id, rating, comment, category)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, hypothesis_id) DO UPDATE SET
                rating = EXCLUDED.rating,
                comment = EXCLUDED.comment,
                category = EXCLUDED.category,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(hypothesis_id)
        .bind(user_id)
        .bind(input.rating)
        .bind(&input.comment)
        .bind(input.category)
        .fetch_one(&self.pool)
        .await?)
    }
}
