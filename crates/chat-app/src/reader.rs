use std::sync::Arc;

use murmur_llm::{Frame, FrameStream, PushStreamTransport, StreamHandle, TransportError};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::throttle::UpdateThrottle;

/// Payload fields that carry generated text when a frame is a JSON object.
const TEXT_FIELDS: [&str; 4] = ["output", "text", "content", "delta"];

/// Monotonic tag identifying one `attach` of a [`StreamReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamGeneration(u64);

#[derive(Debug)]
pub enum ReaderEvent {
    /// Full buffer so far; intermediate updates may be dropped by the throttle.
    Update(String),
    Completed(String),
    Failed(TransportError),
}

impl ReaderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

struct ActiveSubscription {
    stream: FrameStream,
    worker: JoinHandle<()>,
}

/// Owns at most one push-stream subscription and turns its frames into reader events.
///
/// Each attach yields a finite sequence ending in exactly one terminal event.
pub struct StreamReader {
    transport: Arc<dyn PushStreamTransport>,
    throttle: UpdateThrottle,
    buffer: String,
    generation: StreamGeneration,
    active: Option<ActiveSubscription>,
    queued: Option<(StreamGeneration, ReaderEvent)>,
}

impl StreamReader {
    pub fn new(transport: Arc<dyn PushStreamTransport>, throttle: UpdateThrottle) -> Self {
        Self {
            transport,
            throttle,
            buffer: String::new(),
            generation: StreamGeneration(0),
            active: None,
            queued: None,
        }
    }

    pub fn generation(&self) -> StreamGeneration {
        self.generation
    }

    pub fn is_attached(&self) -> bool {
        self.active.is_some()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Opens a subscription for `handle`, tearing down the previous one first.
    ///
    /// A subscription that cannot be opened surfaces as a `Failed` event.
    pub fn attach(&mut self, handle: StreamHandle) -> StreamGeneration {
        self.detach();
        self.buffer.clear();
        self.throttle.reset();

        let generation = self.generation;
        match self.transport.subscribe(handle.clone()) {
            Ok(subscription) => {
                tracing::debug!(handle = %handle, ?generation, "push stream attached");
                self.active = Some(ActiveSubscription {
                    stream: subscription.stream,
                    worker: tokio::spawn(subscription.worker),
                });
            }
            Err(error) => {
                tracing::warn!(handle = %handle, error = %error, "failed to subscribe to push stream");
                self.queued = Some((generation, ReaderEvent::Failed(error)));
            }
        }
        generation
    }

    /// Closes the current subscription, if any. Idempotent.
    ///
    /// Nothing from the detached subscription is yielded afterwards.
    pub fn detach(&mut self) {
        self.queued = None;
        if self.release() {
            tracing::debug!(generation = ?self.generation, "push stream detached");
        }
        self.generation = StreamGeneration(self.generation.0.saturating_add(1));
    }

    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        loop {
            if let Some((generation, event)) = self.queued.take() {
                if generation == self.generation {
                    return Some(event);
                }
                continue;
            }

            let active = self.active.as_mut()?;
            let next = active.stream.recv().await;

            match next {
                Some(Ok(Frame::Data(payload))) => {
                    self.buffer.push_str(&parse_payload(&payload));
                    if self.throttle.admit(Instant::now()) {
                        return Some(ReaderEvent::Update(self.buffer.clone()));
                    }
                }
                Some(Ok(Frame::Done)) => {
                    self.release();
                    let text = self.buffer.clone();
                    self.throttle.mark(Instant::now());
                    self.queued = Some((self.generation, ReaderEvent::Completed(text.clone())));
                    return Some(ReaderEvent::Update(text));
                }
                Some(Ok(Frame::Error(detail))) => {
                    self.release();
                    return Some(ReaderEvent::Failed(TransportError::Remote {
                        stage: "stream-error-frame",
                        message: remote_error_message(&detail),
                    }));
                }
                Some(Err(error)) => {
                    self.release();
                    return Some(ReaderEvent::Failed(error));
                }
                None => {
                    self.release();
                    return Some(ReaderEvent::Failed(TransportError::EndedWithoutDone {
                        stage: "stream-closed",
                    }));
                }
            }
        }
    }

    fn release(&mut self) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        active.stream.cancel();
        active.worker.abort();
        true
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// Extracts generated text from one data frame, falling back to the raw payload.
pub fn parse_payload(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(text)) => text,
        Ok(Value::Object(fields)) => TEXT_FIELDS
            .iter()
            .find_map(|field| fields.get(*field).and_then(text_of))
            .unwrap_or_else(|| raw.to_string()),
        Ok(value @ Value::Array(_)) => text_of(&value).unwrap_or_else(|| raw.to_string()),
        Ok(_) => raw.to_string(),
        Err(error) => {
            tracing::trace!(error = %error, "frame payload is not json, using raw text");
            raw.to_string()
        }
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str())
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat()),
        _ => None,
    }
}

fn remote_error_message(detail: &str) -> String {
    match serde_json::from_str::<Value>(detail) {
        Ok(Value::Object(fields)) => ["detail", "error", "message"]
            .iter()
            .find_map(|field| fields.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| detail.to_string()),
        Ok(Value::String(text)) => text,
        _ if detail.trim().is_empty() => "stream reported an error".to_string(),
        _ => detail.to_string(),
    }
}
