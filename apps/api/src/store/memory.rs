//! In-memory `ChatStore` for tests, with switches to inject write failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::chat::{Chat, Message, Visibility, Vote};
use crate::models::feedback::{FeedbackInput, HypothesisFeedback, MessageFeedback};
use crate::models::hypothesis::Hypothesis;
use crate::store::{ChatStore, StoreError};

#[derive(Default)]
struct Inner {
    chats: HashMap<Uuid, Chat>,
    messages: Vec<Message>,
    hypotheses: BTreeMap<String, Hypothesis>,
    votes: HashMap<(Uuid, Uuid), Vote>,
    message_feedback: Vec<MessageFeedback>,
    hypothesis_feedback: Vec<HypothesisFeedback>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pub fail_messages: AtomicBool,
    pub fail_hypotheses: AtomicBool,
}

fn injected() -> StoreError {
    StoreError::Database(sqlx::Error::Protocol("injected failure".to_string()))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn hypotheses(&self) -> Vec<Hypothesis> {
        self.inner.lock().unwrap().hypotheses.values().cloned().collect()
    }

    pub fn chat_count(&self) -> usize {
        self.inner.lock().unwrap().chats.len()
    }

    pub fn hypothesis_feedback(&self) -> Vec<HypothesisFeedback> {
        self.inner.lock().unwrap().hypothesis_feedback.clone()
    }

    pub fn message_feedback(&self) -> Vec<MessageFeedback> {
        self.inner.lock().unwrap().message_feedback.clone()
    }

    pub fn votes(&self) -> Vec<Vote> {
        self.inner.lock().unwrap().votes.values().cloned().collect()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn get_chat(&self, id: Uuid) -> Result<Option<Chat>, StoreError> {
        Ok(self.inner.lock().unwrap().chats.get(&id).cloned())
    }

    async fn create_chat(&self, chat: &Chat) -> Result<Chat, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.chats.entry(chat.id).or_insert_with(|| chat.clone()).clone())
    }

    async fn list_chats(&self, user_id: Uuid, limit: i64) -> Result<Vec<Chat>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut chats: Vec<Chat> = inner
            .chats
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        chats.truncate(limit.max(0) as usize);
        Ok(chats)
    }

    async fn delete_chat(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.chats.remove(&id).is_none() {
            return Err(StoreError::NotFound(format!("Chat {id}")));
        }
        let removed: Vec<Uuid> = inner
            .messages
            .iter()
            .filter(|m| m.chat_id == id)
            .map(|m| m.id)
            .collect();
        inner.messages.retain(|m| m.chat_id != id);
        inner.hypotheses.retain(|_, h| !removed.contains(&h.message_id));
        inner.votes.retain(|(chat_id, _), _| *chat_id != id);
        Ok(())
    }

    async fn set_visibility(&self, id: Uuid, visibility: Visibility) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let chat = inner
            .chats
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Chat {id}")))?;
        chat.visibility = visibility;
        Ok(())
    }

    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(injected());
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.messages.iter().any(|m| m.id == message.id) {
            let mut stored = message.clone();
            stored.hypotheses = None;
            inner.messages.push(stored);
        }
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .map(|m| {
                let mut attached: Vec<Hypothesis> = inner
                    .hypotheses
                    .values()
                    .filter(|h| h.message_id == m.id)
                    .cloned()
                    .collect();
                attached.sort_by_key(|h| h.order_index);
                m.with_hypotheses(attached)
            })
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn delete_messages_after(
        &self,
        chat_id: Uuid,
        after: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.messages.len();
        inner
            .messages
            .retain(|m| m.chat_id != chat_id || m.created_at < after);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn upsert_hypotheses(&self, hypotheses: &[Hypothesis]) -> Result<(), StoreError> {
        if self.fail_hypotheses.load(Ordering::SeqCst) {
            return Err(injected());
        }
        let mut inner = self.inner.lock().unwrap();
        for h in hypotheses {
            inner
                .hypotheses
                .entry(h.id.clone())
                .and_modify(|existing| {
                    existing.title = h.title.clone();
                    existing.description = h.description.clone();
                    existing.order_index = h.order_index;
                })
                .or_insert_with(|| h.clone());
        }
        Ok(())
    }

    async fn get_hypothesis(&self, id: &str) -> Result<Option<Hypothesis>, StoreError> {
        Ok(self.inner.lock().unwrap().hypotheses.get(id).cloned())
    }

    async fn list_hypotheses(&self, message_id: Uuid) -> Result<Vec<Hypothesis>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut found: Vec<Hypothesis> = inner
            .hypotheses
            .values()
            .filter(|h| h.message_id == message_id)
            .cloned()
            .collect();
        found.sort_by_key(|h| h.order_index);
        Ok(found)
    }

    async fn upsert_vote(&self, vote: &Vote) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .votes
            .insert((vote.chat_id, vote.message_id), vote.clone());
        Ok(())
    }

    async fn upsert_message_feedback(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        input: &FeedbackInput,
    ) -> Result<MessageFeedback, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        if let Some(existing) = inner
            .message_feedback
            .iter_mut()
            .find(|f| f.message_id == message_id && f.user_id == user_id)
        {
            existing.rating = input.rating;
            existing.comment = input.comment.clone();
            existing.category = input.category;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let row = MessageFeedback {
            id: Uuid::new_v4(),
            message_id,
            user_id,
            rating: input.rating,
            comment: input.comment.clone(),
            category: input.category,
            created_at: now,
            updated_at: now,
        };
        inner.message_feedback.push(row.clone());
        Ok(row)
    }

    async fn upsert_hypothesis_feedback(
        &self,
        hypothesis_id: &str,
        user_id: Uuid,
        input: &FeedbackInput,
    ) -> Result<HypothesisFeedback, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.hypotheses.contains_key(hypothesis_id) {
            return Err(StoreError::NotFound(format!("Hypothesis {hypothesis_id}")));
        }
        let now = Utc::now();
        if let Some(existing) = inner
            .hypothesis_feedback
            .iter_mut()
            .find(|f| f.hypothesis_id == hypothesis_id && f.user_id == user_id)
        {
            existing.rating = input.rating;
            existing.comment = input.comment.clone();
            existing.category = input.category;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let row = HypothesisFeedback {
            id: Uuid::new_v4(),
            hypothesis_id: hypothesis_id.to_string(),
            user_id,
            rating: input.rating,
            comment: input.comment.clone(),
            category: input.category,
            created_at: now,
            updated_at: now,
        };
        inner.hypothesis_feedback.push(row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::feedback::{FeedbackCategory, Rating};

    fn hypothesis(id: &str, message_id: Uuid, title: &str, order_index: i32) -> Hypothesis {
        Hypothesis {
            id: id.to_string(),
            message_id,
            title: title.to_string(),
            description: "d".to_string(),
            order_index,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_feedback_upsert_keeps_one_row() {
        let store = MemoryStore::new();
        let msg = Uuid::new_v4();
        store
            .upsert_hypotheses(&[hypothesis("hyp_a", msg, "A", 1)])
            .await
            .unwrap();
        let user = Uuid::new_v4();

        let first = store
            .upsert_hypothesis_feedback(
                "hyp_a",
                user,
                &FeedbackInput {
                    rating: Rating::Helpful,
                    comment: None,
                    category: None,
                },
            )
            .await
            .unwrap();
        let second = store
            .upsert_hypothesis_feedback(
                "hyp_a",
                user,
                &FeedbackInput {
                    rating: Rating::NeedsImprovement,
                    comment: Some("too vague".into()),
                    category: Some(FeedbackCategory::Clarity),
                },
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        let rows = store.hypothesis_feedback();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rating, Rating::NeedsImprovement);
        assert_eq!(rows[0].comment.as_deref(), Some("too vague"));
        assert_eq!(rows[0].category, Some(FeedbackCategory::Clarity));
    }

    #[tokio::test]
    async fn test_hypothesis_upsert_updates_in_place() {
        let store = MemoryStore::new();
        let msg = Uuid::new_v4();
        store
            .upsert_hypotheses(&[hypothesis("hyp_x", msg, "Old", 1)])
            .await
            .unwrap();
        store
            .upsert_hypotheses(&[hypothesis("hyp_x", msg, "New", 2)])
            .await
            .unwrap();
        let stored = store.hypotheses();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "New");
        assert_eq!(stored[0].order_index, 2);
    }
}
