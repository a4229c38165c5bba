//! Stream transcoding: backend SSE in, UI SSE out.

pub mod events;
pub mod frame;
pub mod transcoder;

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

pub use events::UiEvent;
pub use transcoder::{Accumulated, Transcoder};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    #[error("stream interrupted: {0}")]
    Interrupted(String),
}

/// Lazy adapter that transcodes a backend byte stream as it is polled.
///
/// Yields UI events until `[DONE]`, then ends. If the source errors or closes
/// first, the open blocks are closed and a single `StreamError::Interrupted`
/// is yielded last. The accumulated content stays available through
/// [`TranscodeStream::into_content`] either way.
pub struct TranscodeStream<S> {
    source: S,
    transcoder: Transcoder,
    pending: VecDeque<UiEvent>,
    failure: Option<StreamError>,
    finished: bool,
}

impl<S> TranscodeStream<S> {
    pub fn new(source: S, transcoder: Transcoder) -> Self {
        Self {
            source,
            transcoder,
            pending: VecDeque::new(),
            failure: None,
            finished: false,
        }
    }

    pub fn malformed_frames(&self) -> usize {
        self.transcoder.malformed_frames()
    }

    pub fn into_content(self) -> Accumulated {
        self.transcoder.into_content()
    }

    /// True when the stream ended on `[DONE]`.
    pub fn completed(&self) -> bool {
        self.transcoder.is_done()
    }

    fn fail(&mut self, reason: String) {
        self.pending.extend(self.transcoder.interrupt());
        self.failure = Some(StreamError::Interrupted(reason));
    }
}

impl<S, E> Stream for TranscodeStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<UiEvent, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if let Some(err) = this.failure.take() {
                this.finished = true;
                return Poll::Ready(Some(Err(err)));
            }
            if this.finished || this.transcoder.is_done() {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.source).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let events = this.transcoder.push(&chunk);
                    this.pending.extend(events);
                }
                Some(Err(e)) => this.fail(e.to_string()),
                None => this.fail("backend closed the stream before [DONE]".to_string()),
            }
        }
    }
}
