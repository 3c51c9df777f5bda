//! Streaming relay: turns upstream fragments into client-facing events.
//!
//! Every stream follows the same event grammar:
//!
//! ```text
//! ready (data)* (done | error)
//! ```
//!
//! `ready` goes out before any retrieval or upstream I/O. Fragments are
//! re-buffered by [`FlushBuffer`] so the client sees fewer, larger `data`
//! events whose concatenation is byte-identical to the upstream text.
//!
//! The relay watches the client channel while it waits on retrieval, the
//! upstream call, and every upstream read. When the client goes away the
//! fragment stream is dropped at once, which releases the upstream connection.

use crate::config::RelayConfig;
use crate::error::RagError;
use crate::prompt::AssembledPrompt;
use crate::providers::ChatProvider;
use axum::response::sse::Event;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Marker sent as the first event of every stream.
pub const READY_MARKER: &str = "[ready]";

/// Payload of the named `done` event.
pub const DONE_MARKER: &str = "[DONE]";

/// One event delivered to the streaming client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The connection was accepted; nothing has been generated yet.
    Ready,
    /// A flushed run of model text.
    Data(String),
    /// Terminal failure with a human-readable message.
    Error(String),
    /// Terminal success.
    Done,
}

impl RelayEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Error(_) | RelayEvent::Done)
    }

    /// Encode as a Server-Sent Event.
    ///
    /// `ready` and `data` are unnamed events; `error` and `done` are named.
    /// Carriage returns become `\n` since SSE treats them as line breaks.
    pub fn into_sse_event(self) -> Event {
        match self {
            RelayEvent::Ready => Event::default().data(READY_MARKER),
            RelayEvent::Data(text) => Event::default().data(normalize_line_breaks(&text)),
            RelayEvent::Error(message) => Event::default()
                .event("error")
                .data(normalize_line_breaks(&message)),
            RelayEvent::Done => Event::default().event("done").data(DONE_MARKER),
        }
    }
}

fn normalize_line_breaks(text: &str) -> String {
    if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text.to_string()
    }
}

/// Position of a relay in its lifecycle. `Completed` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Init,
    Ready,
    Streaming,
    Completed,
    Failed,
}

impl RelayState {
    /// The state reached by emitting `event`, or `None` if the event is not
    /// allowed here.
    pub fn after(self, event: &RelayEvent) -> Option<RelayState> {
        use RelayState::*;
        match (self, event) {
            (Init, RelayEvent::Ready) => Some(Ready),
            (Ready | Streaming, RelayEvent::Data(_)) => Some(Streaming),
            (Ready | Streaming, RelayEvent::Done) => Some(Completed),
            (Ready | Streaming, RelayEvent::Error(_)) => Some(Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Completed | RelayState::Failed)
    }
}

/// Why an event could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("client disconnected")]
    Closed,

    #[error("event {event} not allowed in state {state:?}")]
    OutOfOrder { state: RelayState, event: String },
}

/// Write side of one client's event channel.
///
/// Tracks the relay state and refuses events that would break the stream
/// grammar.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<RelayEvent>,
    state: RelayState,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<RelayEvent>) -> Self {
        Self {
            tx,
            state: RelayState::Init,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Deliver `event`, waiting for channel capacity.
    pub async fn emit(&mut self, event: RelayEvent) -> Result<(), EmitError> {
        let next = self
            .state
            .after(&event)
            .ok_or_else(|| EmitError::OutOfOrder {
                state: self.state,
                event: format!("{:?}", event),
            })?;
        self.tx.send(event).await.map_err(|_| EmitError::Closed)?;
        self.state = next;
        Ok(())
    }

    /// Deliver `event`, ignoring any failure.
    pub async fn emit_best_effort(&mut self, event: RelayEvent) {
        if let Err(e) = self.emit(event).await {
            debug!(error = %e, "Dropped best-effort relay event");
        }
    }

    /// Resolves once the client side of the channel is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Accumulates fragment text and decides when to flush it as one event.
///
/// A flush happens when the buffer holds at least `threshold` characters or
/// the fragment just appended contains a newline.
#[derive(Debug)]
pub struct FlushBuffer {
    threshold: usize,
    buf: String,
    chars: usize,
}

impl FlushBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            buf: String::new(),
            chars: 0,
        }
    }

    /// Append a fragment, returning the buffered text if it should be flushed.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buf.push_str(fragment);
        self.chars += fragment.chars().count();
        if self.chars >= self.threshold || fragment.contains('\n') {
            self.take()
        } else {
            None
        }
    }

    /// Take any buffered text.
    pub fn take(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        self.chars = 0;
        Some(std::mem::take(&mut self.buf))
    }
}

/// How a relay run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

enum Stop {
    Cancelled,
    Failed(String),
}

impl From<RagError> for Stop {
    fn from(err: RagError) -> Self {
        Stop::Failed(err.to_string())
    }
}

impl From<EmitError> for Stop {
    fn from(err: EmitError) -> Self {
        match err {
            EmitError::Closed => Stop::Cancelled,
            other => Stop::Failed(other.to_string()),
        }
    }
}

/// Drives one streaming request from `ready` to its terminal event.
pub struct StreamingRelay {
    provider: Arc<dyn ChatProvider>,
    flush_threshold: usize,
}

impl StreamingRelay {
    pub fn new(provider: Arc<dyn ChatProvider>, config: &RelayConfig) -> Self {
        Self {
            provider,
            flush_threshold: config.flush_threshold,
        }
    }

    /// Run the relay.
    ///
    /// `prepare` produces the prompt (retrieval plus assembly) and is only
    /// polled after `ready` has been delivered.
    pub async fn run<P>(&self, prepare: P, mut sink: EventSink) -> RelayOutcome
    where
        P: Future<Output = Result<AssembledPrompt, RagError>> + Send,
    {
        if sink.emit(RelayEvent::Ready).await.is_err() {
            debug!("Client left before ready");
            return RelayOutcome::Cancelled;
        }

        match self.pump(prepare, &mut sink).await {
            Ok(()) => {
                info!("Stream completed");
                RelayOutcome::Completed
            }
            Err(Stop::Cancelled) => {
                info!("Client disconnected; upstream released");
                RelayOutcome::Cancelled
            }
            Err(Stop::Failed(message)) => {
                warn!(error = %message, "Stream failed");
                // The client may already be gone; the error event is not guaranteed.
                sink.emit_best_effort(RelayEvent::Error(message.clone()))
                    .await;
                RelayOutcome::Failed(message)
            }
        }
    }

    async fn pump<P>(&self, prepare: P, sink: &mut EventSink) -> Result<(), Stop>
    where
        P: Future<Output = Result<AssembledPrompt, RagError>> + Send,
    {
        let prepared = tokio::select! {
            biased;
            _ = sink.closed() => None,
            prepared = prepare => Some(prepared),
        };
        let prompt = prepared.ok_or(Stop::Cancelled)??;

        let opened = tokio::select! {
            biased;
            _ = sink.closed() => None,
            opened = self.provider.stream(&prompt) => Some(opened),
        };
        let mut fragments = opened.ok_or(Stop::Cancelled)?.map_err(RagError::from)?;
        debug!(
            provider = self.provider.name(),
            model = self.provider.model_name(),
            "Upstream stream opened"
        );

        let mut buffer = FlushBuffer::new(self.flush_threshold);
        let mut fragment_count = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => None,
                next = fragments.next() => Some(next),
            };
            match next.ok_or(Stop::Cancelled)? {
                Some(Ok(fragment)) if fragment.done => break,
                Some(Ok(fragment)) => {
                    fragment_count += 1;
                    if let Some(chunk) = buffer.push(&fragment.text) {
                        sink.emit(RelayEvent::Data(chunk)).await?;
                    }
                }
                Some(Err(e)) => return Err(RagError::from(e).into()),
                None => break,
            }
        }
        drop(fragments);
        debug!(fragments = fragment_count, "Upstream stream finished");

        if let Some(rest) = buffer.take() {
            sink.emit(RelayEvent::Data(rest)).await?;
        }
        sink.emit(RelayEvent::Done).await?;
        Ok(())
    }
}
