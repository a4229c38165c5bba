use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::registry::{RegistryError, Replay, StreamRegistry};
use crate::stream::UiEvent;

/// How long a finished stream stays replayable, capped by the TTL.
const COMPLETED_RETENTION: Duration = Duration::from_secs(10 * 60);

struct Entry {
    events: Vec<String>,
    completed_at: Option<Instant>,
    created: Instant,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<Uuid, Entry>,
    latest: HashMap<Uuid, Uuid>,
}

/// Process-local registry used when no `REDIS_URL` is configured.
/// Resumption only works against the same instance.
pub struct LocalStreamRegistry {
    inner: Mutex<Inner>,
    ttl: Duration,
    completed_ttl: Duration,
}

impl LocalStreamRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self::with_retention(ttl, COMPLETED_RETENTION)
    }

    /// `completed_ttl` bounds how long a finished stream is kept.
    pub fn with_retention(ttl: Duration, completed_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl,
            completed_ttl: completed_ttl.min(ttl),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another request panicked mid-update;
        // the maps are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops streams past the TTL and finished streams past their retention.
    fn prune(&self, inner: &mut Inner) {
        let (ttl, completed_ttl) = (self.ttl, self.completed_ttl);
        let before = inner.streams.len();
        inner.streams.retain(|_, e| {
            let finished_long_ago = e
                .completed_at
                .is_some_and(|at| at.elapsed() >= completed_ttl);
            e.created.elapsed() < ttl && !finished_long_ago
        });
        let expired = before - inner.streams.len();
        if expired > 0 {
            debug!("Expired {expired} resumable streams");
            let Inner { streams, latest } = inner;
            latest.retain(|_, id| streams.contains_key(id));
        }
    }
}

#[async_trait]
impl StreamRegistry for LocalStreamRegistry {
    async fn create(&self, stream_id: Uuid, chat_id: Uuid) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        self.prune(&mut inner);

        inner.streams.insert(
            stream_id,
            Entry {
                events: Vec::new(),
                completed_at: None,
                created: Instant::now(),
            },
        );
        inner.latest.insert(chat_id, stream_id);
        Ok(())
    }

    async fn append(&self, stream_id: Uuid, event: &UiEvent) -> Result<(), RegistryError> {
        if let Some(entry) = self.lock().streams.get_mut(&stream_id) {
            entry.events.push(event.to_json());
        }
        Ok(())
    }

    async fn complete(&self, stream_id: Uuid) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        // Pruned before marking, so the stream just finished stays replayable.
        self.prune(&mut inner);
        if let Some(entry) = inner.streams.get_mut(&stream_id) {
            entry.completed_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn latest(&self, chat_id: Uuid) -> Result<Option<Uuid>, RegistryError> {
        Ok(self.lock().latest.get(&chat_id).copied())
    }

    async fn replay(&self, stream_id: Uuid, from: usize) -> Result<Replay, RegistryError> {
        let inner = self.lock();
        Ok(match inner.streams.get(&stream_id) {
            Some(entry) => Replay {
                events: entry.events.iter().skip(from).cloned().collect(),
                completed: entry.completed_at.is_some(),
            },
            // Unknown or expired: nothing left to follow.
            None => Replay {
                events: Vec::new(),
                completed: true,
            },
        })
    }
}
