use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::frame::Frame;

/// Connection settings for a prediction backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: Option<String>,
    pub request_timeout: Duration,
    pub retry_max_elapsed: Duration,
}

impl BackendConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            api_key: api_key.into().trim().to_string(),
            model: None,
            request_timeout: Duration::from_secs(30),
            retry_max_elapsed: Duration::from_secs(20),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into().trim().to_string();
        self.model = (!model.is_empty()).then_some(model);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.retry_max_elapsed = max_elapsed;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One prior turn sent to the backend as conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl SamplingParams {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.top_p.is_none() && self.max_tokens.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub sampling: Option<SamplingParams>,
    pub history: Vec<ContextMessage>,
}

impl PredictionRequest {
    pub fn new(prompt: impl Into<String>, history: Vec<ContextMessage>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            sampling: None,
            history,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        if !system_prompt.trim().is_empty() {
            self.system_prompt = Some(system_prompt);
        }
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        if !sampling.is_empty() {
            self.sampling = Some(sampling);
        }
        self
    }
}

/// Opaque locator for one prediction's push stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamHandle(String);

impl StreamHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Backend acknowledgement of a prediction job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionAccepted {
    pub id: String,
    pub status: String,
    pub stream_handle: Option<StreamHandle>,
}

/// User-facing failure categories for a dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchErrorKind {
    NetworkUnavailable,
    AuthOrConfigMissing,
    Timeout,
    Backend,
}

impl DispatchErrorKind {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NetworkUnavailable => {
                "Could not reach the assistant. Check your network connection and try again."
            }
            Self::AuthOrConfigMissing => {
                "The assistant is not configured. Check the API key and endpoint in settings."
            }
            Self::Timeout => "The assistant took too long to respond. Please try again.",
            Self::Backend => "The assistant could not generate a response. Please try again later.",
        }
    }
}

/// Classifies free-form backend failure text into a dispatch category.
pub fn classify_failure_text(text: &str) -> DispatchErrorKind {
    let lowered = text.to_ascii_lowercase();
    let mentions = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));

    if mentions(&["timed out", "timeout", "deadline exceeded"]) {
        DispatchErrorKind::Timeout
    } else if mentions(&[
        "api key",
        "api_key",
        "unauthorized",
        "unauthenticated",
        "forbidden",
        "invalid token",
        "not configured",
        "missing credentials",
    ]) {
        DispatchErrorKind::AuthOrConfigMissing
    } else if mentions(&[
        "network",
        "connection refused",
        "connection reset",
        "fetch failed",
        "dns",
        "unreachable",
        "offline",
    ]) {
        DispatchErrorKind::NetworkUnavailable
    } else {
        DispatchErrorKind::Backend
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type DispatchResult<T> = Result<T, DispatchError>;
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DispatchError {
    #[snafu(display("missing API key for prediction backend"))]
    MissingApiKey { stage: &'static str },
    #[snafu(display("prediction endpoint is not configured"))]
    MissingEndpoint { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("prediction request failed on `{stage}`: {source}"))]
    Network {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("prediction request timed out after {after:?}"))]
    Timeout {
        stage: &'static str,
        after: Duration,
    },
    #[snafu(display("prediction backend rejected credentials with status {status}: {body}"))]
    Unauthorized {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("prediction backend returned status {status}: {body}"))]
    BackendStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse prediction response on `{stage}`: {source}"))]
    InvalidResponse {
        stage: &'static str,
        body: String,
        source: serde_json::Error,
    },
    #[snafu(display("prediction '{prediction_id}' failed: {detail}"))]
    PredictionFailed {
        stage: &'static str,
        prediction_id: String,
        detail: String,
    },
    #[snafu(display("prediction '{prediction_id}' was accepted without a stream handle"))]
    MissingStreamHandle {
        stage: &'static str,
        prediction_id: String,
    },
}

impl DispatchError {
    pub fn kind(&self) -> DispatchErrorKind {
        match self {
            Self::MissingApiKey { .. } | Self::MissingEndpoint { .. } => {
                DispatchErrorKind::AuthOrConfigMissing
            }
            Self::Unauthorized { .. } => DispatchErrorKind::AuthOrConfigMissing,
            Self::Timeout { .. } => DispatchErrorKind::Timeout,
            Self::Network { source, .. } if source.is_timeout() => DispatchErrorKind::Timeout,
            Self::Network { .. } => DispatchErrorKind::NetworkUnavailable,
            Self::BackendStatus { body, .. } => classify_failure_text(body),
            Self::PredictionFailed { detail, .. } => classify_failure_text(detail),
            Self::BuildClient { .. }
            | Self::InvalidResponse { .. }
            | Self::MissingStreamHandle { .. } => DispatchErrorKind::Backend,
        }
    }

    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("stream handle '{handle}' is not a usable URL"))]
    InvalidHandle {
        stage: &'static str,
        handle: StreamHandle,
    },
    #[snafu(display("failed to open push stream on `{stage}`: {source}"))]
    Connect {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("push stream rejected with status {status}: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("push stream read failed on `{stage}`: {source}"))]
    ReadLine {
        stage: &'static str,
        source: tokio_util::codec::AnyDelimiterCodecError,
    },
    #[snafu(display("backend reported a stream error: {message}"))]
    Remote {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("push stream closed before the done signal"))]
    EndedWithoutDone { stage: &'static str },
}

/// Receiving half of one push-stream subscription.
///
/// Dropping it (or calling [`FrameStream::cancel`]) tells the transport worker to stop.
pub struct FrameStream {
    handle: StreamHandle,
    frames: mpsc::UnboundedReceiver<TransportResult<Frame>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct Subscription {
    pub stream: FrameStream,
    pub worker: TransportWorker,
}

impl FrameStream {
    pub fn new(
        handle: StreamHandle,
        frames: mpsc::UnboundedReceiver<TransportResult<Frame>>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            handle,
            frames,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn handle(&self) -> &StreamHandle {
        &self.handle
    }

    pub async fn recv(&mut self) -> Option<TransportResult<Frame>> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TransportResult<Frame>> {
        self.frames.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.frames.close();
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait PredictionDispatcher: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        request: PredictionRequest,
    ) -> BoxFuture<'a, DispatchResult<PredictionAccepted>>;
}

pub trait PushStreamTransport: Send + Sync {
    fn subscribe(&self, handle: StreamHandle) -> TransportResult<Subscription>;
}

/// Builds the channel pair a transport worker feeds and a reader drains.
pub fn make_frame_stream(
    handle: StreamHandle,
) -> (
    mpsc::UnboundedSender<TransportResult<Frame>>,
    FrameStream,
    oneshot::Receiver<()>,
) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        frame_tx,
        FrameStream::new(handle, frame_rx, cancel_tx),
        cancel_rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_maps_to_categories() {
        assert_eq!(
            classify_failure_text("upstream request timed out"),
            DispatchErrorKind::Timeout
        );
        assert_eq!(
            classify_failure_text("Invalid API key provided"),
            DispatchErrorKind::AuthOrConfigMissing
        );
        assert_eq!(
            classify_failure_text("TypeError: fetch failed"),
            DispatchErrorKind::NetworkUnavailable
        );
        assert_eq!(
            classify_failure_text("CUDA out of memory"),
            DispatchErrorKind::Backend
        );
    }

    #[test]
    fn each_kind_has_a_distinct_user_message() {
        let kinds = [
            DispatchErrorKind::NetworkUnavailable,
            DispatchErrorKind::AuthOrConfigMissing,
            DispatchErrorKind::Timeout,
            DispatchErrorKind::Backend,
        ];
        for (index, kind) in kinds.iter().enumerate() {
            for other in &kinds[index + 1..] {
                assert_ne!(kind.user_message(), other.user_message());
            }
        }
    }

    #[test]
    fn backend_status_is_classified_by_its_body() {
        let error = DispatchError::BackendStatus {
            stage: "test",
            status: 500,
            body: "gateway timeout while waiting for model".to_string(),
        };
        assert_eq!(error.kind(), DispatchErrorKind::Timeout);

        let missing_key = DispatchError::MissingApiKey { stage: "test" };
        assert_eq!(missing_key.kind(), DispatchErrorKind::AuthOrConfigMissing);
    }

    #[test]
    fn builders_skip_blank_optional_fields() {
        let request = PredictionRequest::new("Hi", Vec::new())
            .with_system_prompt("   ")
            .with_sampling(SamplingParams::default());
        assert_eq!(request.system_prompt, None);
        assert_eq!(request.sampling, None);

        let config = BackendConfig::new(" https://api.example.com/v1/ ", " key ").with_model(" ");
        assert_eq!(config.endpoint, "https://api.example.com/v1");
        assert_eq!(config.api_key, "key");
        assert_eq!(config.model, None);
    }

    #[tokio::test]
    async fn cancelling_signals_the_worker_once() {
        let (_frame_tx, mut stream, mut cancel_rx) =
            make_frame_stream(StreamHandle::new("https://stream.example.com/p/1"));

        assert!(stream.cancel());
        assert!(!stream.cancel());
        assert!(cancel_rx.try_recv().is_ok());
    }
}
