use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;
use uuid::Uuid;

use crate::registry::{RegistryError, Replay, StreamRegistry};
use crate::stream::UiEvent;

/// Redis-backed registry, shared by every API instance.
///
/// Keys (all expire after the configured TTL):
/// - `chat:<chat_id>:stream` → latest stream id
/// - `stream:<stream_id>:meta` → owning chat id, present while the stream is live
/// - `stream:<stream_id>:events` → list of event payloads
/// - `stream:<stream_id>:done` → set once the turn has finished
#[derive(Clone)]
pub struct RedisStreamRegistry {
    conn: MultiplexedConnection,
    ttl_secs: u64,
}

impl RedisStreamRegistry {
    pub async fn connect(client: &redis::Client, ttl: Duration) -> Result<Self, RegistryError> {
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Redis stream registry connected");
        Ok(Self {
            conn,
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

fn chat_key(chat_id: Uuid) -> String {
    format!("chat:{chat_id}:stream")
}

fn events_key(stream_id: Uuid) -> String {
    format!("stream:{stream_id}:events")
}

fn meta_key(stream_id: Uuid) -> String {
    format!("stream:{stream_id}:meta")
}

fn done_key(stream_id: Uuid) -> String {
    format!("stream:{stream_id}:done")
}

#[async_trait]
impl StreamRegistry for RedisStreamRegistry {
    async fn create(&self, stream_id: Uuid, chat_id: Uuid) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .set_ex(chat_key(chat_id), stream_id.to_string(), self.ttl_secs)
            .ignore()
            .set_ex(meta_key(stream_id), chat_id.to_string(), self.ttl_secs)
            .ignore()
            .del(events_key(stream_id))
            .ignore()
            .del(done_key(stream_id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn append(&self, stream_id: Uuid, event: &UiEvent) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let key = events_key(stream_id);
        redis::pipe()
            .rpush(&key, event.to_json())
            .ignore()
            .expire(&key, self.ttl_secs as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn complete(&self, stream_id: Uuid) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(done_key(stream_id), 1, self.ttl_secs)
            .await?;
        Ok(())
    }

    async fn latest(&self, chat_id: Uuid) -> Result<Option<Uuid>, RegistryError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(chat_key(chat_id)).await?;
        Ok(value.and_then(|v| Uuid::parse_str(&v).ok()))
    }

    async fn replay(&self, stream_id: Uuid, from: usize) -> Result<Replay, RegistryError> {
        let mut conn = self.conn.clone();
        // Flags are read before the list inside one MULTI, so a stream seen
        // as done always comes with every event appended before `complete`.
        let (done, meta_exists, events): (Option<String>, bool, Vec<String>) = redis::pipe()
            .atomic()
            .get(done_key(stream_id))
            .exists(meta_key(stream_id))
            .lrange(events_key(stream_id), from as isize, -1)
            .query_async(&mut conn)
            .await?;
        Ok(to_replay(done.is_some(), meta_exists, events))
    }
}

/// An expired stream (no meta key) has nothing more to deliver.
fn to_replay(done: bool, meta_exists: bool, events: Vec<String>) -> Replay {
    Replay {
        events,
        completed: done || !meta_exists,
    }
}
