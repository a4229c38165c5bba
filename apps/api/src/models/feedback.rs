use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "feedback_rating", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Helpful,
    NotHelpful,
    NeedsImprovement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "feedback_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Quality,
    Novelty,
    Feasibility,
    Clarity,
    Other,
}

/// The user-supplied part of a feedback submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackInput {
    pub rating: Rating,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub category: Option<FeedbackCategory>,
}

/// Feedback on a whole assistant message. One row per (user, message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MessageFeedback {
    pub id: Uuid,
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub rating: Rating,
    pub comment: Option<String>,
    pub category: Option<FeedbackCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Feedback on a single hypothesis. One row per (user, hypothesis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct HypothesisFeedback {
    pub id: Uuid,
    pub hypothesis_id: String,
    pub user_id: Uuid,
    pub rating: Rating,
    pub comment: Option<String>,
    pub category: Option<FeedbackCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
