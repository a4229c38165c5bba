//! Resumable stream registry.
//!
//! Every turn registers a stream id for its chat and appends each UI event
//! it forwards. A client that lost its connection asks for the chat's latest
//! stream and replays it from the start, then follows along until the turn
//! marks it complete.
//!
//! The registry is built once in `main` and shared through `AppState`.

pub mod local;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::stream::UiEvent;

pub use self::local::LocalStreamRegistry;
pub use self::redis::RedisStreamRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Events recorded for a stream, starting at the requested offset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    /// JSON payloads exactly as they were sent to the original client.
    pub events: Vec<String>,
    pub completed: bool,
}

#[async_trait]
pub trait StreamRegistry: Send + Sync {
    /// Registers `stream_id` as the latest stream of `chat_id`.
    async fn create(&self, stream_id: Uuid, chat_id: Uuid) -> Result<(), RegistryError>;

    async fn append(&self, stream_id: Uuid, event: &UiEvent) -> Result<(), RegistryError>;

    async fn complete(&self, stream_id: Uuid) -> Result<(), RegistryError>;

    async fn latest(&self, chat_id: Uuid) -> Result<Option<Uuid>, RegistryError>;

    async fn replay(&self, stream_id: Uuid, from: usize) -> Result<Replay, RegistryError>;
}
