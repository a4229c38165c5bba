use std::sync::Arc;

use crate::chat::coordinator::Coordinator;
use crate::registry::StreamRegistry;
use crate::store::ChatStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    /// Resumable stream registry, Redis-backed when `REDIS_URL` is set.
    pub registry: Arc<dyn StreamRegistry>,
    pub coordinator: Coordinator,
}
