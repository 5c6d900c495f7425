mod frame;
mod http_adapter;
mod provider;

pub use frame::{DONE_SENTINEL, Frame, SseDecoder};
pub use http_adapter::HttpPredictionClient;
pub use provider::{
    BackendConfig, BoxFuture, ContextMessage, DispatchError, DispatchErrorKind, DispatchResult,
    FrameStream, PredictionAccepted, PredictionDispatcher, PredictionRequest, PushStreamTransport,
    Role, SamplingParams, StreamHandle, Subscription, TransportError, TransportResult,
    TransportWorker, classify_failure_text, make_frame_stream,
};
