//! Replay of a registered stream for a reconnecting client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::registry::StreamRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Stop following a stream that shows no progress for this many polls.
const MAX_IDLE_POLLS: u32 = 240;

/// Sends every recorded payload of `stream_id` to `tx`, then keeps following
/// until the stream completes, goes idle, or the client leaves.
pub async fn follow_stream(
    registry: Arc<dyn StreamRegistry>,
    stream_id: Uuid,
    tx: mpsc::Sender<String>,
) {
    let mut offset = 0;
    let mut idle = 0;

    loop {
        let replay = match registry.replay(stream_id, offset).await {
            Ok(replay) => replay,
            Err(e) => {
                warn!("Failed to replay stream {stream_id}: {e}");
                return;
            }
        };

        if replay.events.is_empty() {
            idle += 1;
        } else {
            idle = 0;
        }
        offset += replay.events.len();

        for payload in replay.events {
            if tx.send(payload).await.is_err() {
                debug!("Resuming client left stream {stream_id}");
                return;
            }
        }

        if replay.completed {
            return;
        }
        if idle >= MAX_IDLE_POLLS {
            warn!("Stream {stream_id} idle for too long, ending replay");
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
