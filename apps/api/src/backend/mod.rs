//! Backend client, the single point of entry for calls to the research backend.
//!
//! The backend answers a chat message with a `text/event-stream` body. This
//! module only opens that stream; decoding lives in `crate::stream`.
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OPEN_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Backend closed the connection without a body")]
    EmptyBody,
}

/// Request body sent to the backend. `facets` are generation-control knobs
/// passed through untouched, flattened next to the fixed fields.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendRequest {
    pub user_id: Uuid,
    pub message: String,
    pub conversation_id: Uuid,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(flatten)]
    pub facets: Map<String, Value>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// Anything that can open a backend SSE body for a message.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Opens the response body. Fails before yielding anything if the backend
    /// is unreachable, answers non-2xx, or closes without a body.
    async fn open(&self, request: &BackendRequest) -> Result<ByteStream, BackendError>;
}

#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl BackendClient {
    pub fn new(url: String, api_key: Option<String>, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(timeout)
                .build()?,
            url,
            api_key,
        })
    }

    async fn send(&self, request: &BackendRequest) -> Result<reqwest::Response, reqwest::Error> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("accept", "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.send().await
    }
}

#[async_trait]
impl TokenSource for BackendClient {
    /// Retries on connect errors, 429 and 5xx with exponential backoff. Once a
    /// first body chunk has arrived the stream is handed over and never retried.
    async fn open(&self, request: &BackendRequest) -> Result<ByteStream, BackendError> {
        let mut last_error: Option<BackendError> = None;

        for attempt in 0..MAX_OPEN_ATTEMPTS {
            if attempt > 0 {
                // Exponential backoff: 500ms, 1s
                let delay = Duration::from_millis(500 * (1 << (attempt - 1)));
                warn!(
                    "Backend open attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self.send(request).await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(BackendError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Backend returned {}: {}", status, body);
                last_error = Some(BackendError::Status {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(BackendError::Status {
                    status: status.as_u16(),
                    message: body,
                });
            }

            let body = response.bytes_stream().map_err(BackendError::Http);
            match first_chunk(Box::pin(body)).await {
                Ok(stream) => {
                    debug!("Backend stream opened for conversation {}", request.conversation_id);
                    return Ok(stream);
                }
                Err(BackendError::EmptyBody) => return Err(BackendError::EmptyBody),
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            }
        }

        Err(last_error.unwrap_or(BackendError::EmptyBody))
    }
}

/// Waits for the first non-empty chunk so "no body" is reported as an open
/// failure, then puts that chunk back in front of the rest.
pub async fn first_chunk(mut body: ByteStream) -> Result<ByteStream, BackendError> {
    loop {
        match body.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => {
                let head = stream::once(async move { Ok(chunk) });
                return Ok(Box::pin(head.chain(body)));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(BackendError::EmptyBody),
        }
    }
}
