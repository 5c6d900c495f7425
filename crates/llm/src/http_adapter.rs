use std::time::Duration;

use backoff::{ExponentialBackoff, future::retry};
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, ensure};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader as ByteStreamReader;

use crate::frame::{Frame, SseDecoder};
use crate::provider::{
    BackendConfig, BoxFuture, BuildClientSnafu, ConnectSnafu, ContextMessage, DispatchError,
    DispatchResult, InvalidHandleSnafu, InvalidResponseSnafu, MissingApiKeySnafu,
    MissingEndpointSnafu, PredictionAccepted, PredictionDispatcher, PredictionRequest,
    PushStreamTransport, SamplingParams, StreamHandle, Subscription, TransportError,
    TransportResult, TransportWorker, make_frame_stream,
};

const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Prediction backend spoken over plain HTTP: JSON to create a job, SSE to follow it.
#[derive(Debug, Clone)]
pub struct HttpPredictionClient {
    client: Client,
    config: BackendConfig,
}

#[derive(Debug, Serialize)]
struct PredictionBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    input: PredictionInput<'a>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct PredictionInput<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<&'a str>,
    history: &'a [ContextMessage],
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    sampling: Option<&'a SamplingParams>,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    urls: Option<PredictionUrls>,
    #[serde(default)]
    stream_url: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    #[serde(default)]
    stream: Option<String>,
}

impl PredictionResponse {
    fn into_accepted(self) -> DispatchResult<PredictionAccepted> {
        if matches!(self.status.as_str(), "failed" | "canceled") {
            let detail = match self.error {
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
                None => format!("prediction status '{}'", self.status),
            };
            return Err(DispatchError::PredictionFailed {
                stage: "dispatch-prediction-status",
                prediction_id: self.id,
                detail,
            });
        }

        let stream_handle = self
            .urls
            .and_then(|urls| urls.stream)
            .or(self.stream_url)
            .filter(|url| !url.trim().is_empty())
            .map(StreamHandle::new);

        Ok(PredictionAccepted {
            id: self.id,
            status: self.status,
            stream_handle,
        })
    }
}

impl HttpPredictionClient {
    pub fn new(config: BackendConfig) -> DispatchResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "http-client-build",
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed_time: Some(self.config.retry_max_elapsed),
            ..Default::default()
        }
    }

    async fn create_prediction(
        &self,
        request: PredictionRequest,
    ) -> DispatchResult<PredictionAccepted> {
        ensure!(
            !self.config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "dispatch-check-api-key",
            }
        );
        ensure!(
            !self.config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "dispatch-check-endpoint",
            }
        );

        let body = PredictionBody {
            model: self.config.model.as_deref(),
            input: PredictionInput {
                prompt: &request.prompt,
                system_prompt: request.system_prompt.as_deref(),
                history: &request.history,
                sampling: request.sampling.as_ref(),
            },
            stream: true,
        };
        let url = format!("{}/predictions", self.config.endpoint);

        tracing::debug!(
            url = %url,
            history_len = request.history.len(),
            "dispatching prediction request"
        );

        // Connection failures, 429 and 5xx are retried; everything else fails fast.
        let operation = || async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .timeout(self.config.request_timeout)
                .json(&body)
                .send()
                .await
                .map_err(|source| {
                    let transient = source.is_connect() || source.is_timeout();
                    let error = DispatchError::Network {
                        stage: "dispatch-send",
                        source,
                    };
                    if transient {
                        tracing::warn!(error = %error, "prediction dispatch failed, retrying");
                        backoff::Error::transient(error)
                    } else {
                        backoff::Error::permanent(error)
                    }
                })?;

            let status = response.status();
            let text = response.text().await.map_err(|source| {
                backoff::Error::permanent(DispatchError::Network {
                    stage: "dispatch-read-body",
                    source,
                })
            })?;

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(backoff::Error::permanent(DispatchError::Unauthorized {
                    stage: "dispatch-status",
                    status: status.as_u16(),
                    body: text,
                }));
            }

            if status.as_u16() == 429 || status.is_server_error() {
                tracing::warn!(status = status.as_u16(), "prediction backend busy, retrying");
                return Err(backoff::Error::transient(DispatchError::BackendStatus {
                    stage: "dispatch-status",
                    status: status.as_u16(),
                    body: text,
                }));
            }

            if !status.is_success() {
                return Err(backoff::Error::permanent(DispatchError::BackendStatus {
                    stage: "dispatch-status",
                    status: status.as_u16(),
                    body: text,
                }));
            }

            serde_json::from_str::<PredictionResponse>(&text)
                .context(InvalidResponseSnafu {
                    stage: "dispatch-parse-response",
                    body: text.clone(),
                })
                .map_err(backoff::Error::permanent)
        };

        let response = retry(self.retry_policy(), operation).await?;
        let accepted = response.into_accepted()?;
        tracing::info!(
            prediction_id = %accepted.id,
            status = %accepted.status,
            has_stream = accepted.stream_handle.is_some(),
            "prediction accepted"
        );
        Ok(accepted)
    }

    async fn open_stream(
        client: &Client,
        api_key: &str,
        handle: &StreamHandle,
    ) -> TransportResult<reqwest::Response> {
        let mut request = client
            .get(handle.as_str())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-store");
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.context(ConnectSnafu {
            stage: "stream-open-send",
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                stage: "stream-open-status",
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn run_stream_worker(
        client: Client,
        api_key: String,
        handle: StreamHandle,
        frame_tx: mpsc::UnboundedSender<TransportResult<Frame>>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let opened = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(handle = %handle, "push stream cancelled before it opened");
                return;
            }
            opened = Self::open_stream(&client, &api_key, &handle) => opened,
        };

        let response = match opened {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(handle = %handle, error = %error, "failed to open push stream");
                let _ = frame_tx.send(Err(error));
                return;
            }
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        pump_sse_frames(ByteStreamReader::new(body), &handle, &frame_tx, &mut cancel_rx).await;
    }
}

/// Forwards SSE frames decoded from `body` until the stream ends or is cancelled.
///
/// Lines are split on raw bytes and decoded lossily, so invalid UTF-8 only garbles its own frame.
async fn pump_sse_frames<R>(
    body: R,
    handle: &StreamHandle,
    frame_tx: &mpsc::UnboundedSender<TransportResult<Frame>>,
    cancel_rx: &mut oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(
        body,
        AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            MAX_SSE_LINE_BYTES,
        ),
    );
    let mut decoder = SseDecoder::new();

    loop {
        tokio::select! {
            _ = &mut *cancel_rx => {
                tracing::debug!(handle = %handle, "push stream cancelled");
                return;
            }
            next_line = lines.next() => {
                match next_line {
                    Some(Ok(raw)) => {
                        let line = String::from_utf8_lossy(&raw);
                        let Some(frame) = decoder.push_line(&line) else {
                            continue;
                        };
                        let terminal = frame.is_terminal();
                        if frame_tx.send(Ok(frame)).is_err() || terminal {
                            return;
                        }
                    }
                    Some(Err(source)) => {
                        tracing::warn!(handle = %handle, error = %source, "push stream read failed");
                        let _ = frame_tx.send(Err(TransportError::ReadLine {
                            stage: "stream-read-line",
                            source,
                        }));
                        return;
                    }
                    None => {
                        if let Some(frame) = decoder.finish() {
                            let _ = frame_tx.send(Ok(frame));
                        }
                        // Closing the channel without a terminal frame is reported by the reader.
                        return;
                    }
                }
            }
        }
    }
}

impl PredictionDispatcher for HttpPredictionClient {
    fn dispatch<'a>(
        &'a self,
        request: PredictionRequest,
    ) -> BoxFuture<'a, DispatchResult<PredictionAccepted>> {
        Box::pin(self.create_prediction(request))
    }
}

impl PushStreamTransport for HttpPredictionClient {
    fn subscribe(&self, handle: StreamHandle) -> TransportResult<Subscription> {
        let raw = handle.as_str();
        ensure!(
            raw.starts_with("https://") || raw.starts_with("http://"),
            InvalidHandleSnafu {
                stage: "stream-subscribe-validate",
                handle: handle.clone(),
            }
        );

        let (frame_tx, stream, cancel_rx) = make_frame_stream(handle.clone());
        let worker: TransportWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.api_key.clone(),
            handle,
            frame_tx,
            cancel_rx,
        ));

        Ok(Subscription { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> PredictionResponse {
        serde_json::from_str(json).expect("valid prediction response")
    }

    #[test]
    fn stream_url_is_read_from_urls_or_top_level() {
        let nested = response(
            r#"{"id":"p1","status":"starting","urls":{"stream":"https://stream.example.com/p1"}}"#,
        )
        .into_accepted()
        .expect("accepted");
        assert_eq!(
            nested.stream_handle,
            Some(StreamHandle::new("https://stream.example.com/p1"))
        );

        let flat = response(r#"{"id":"p2","status":"processing","stream_url":"https://s/p2"}"#)
            .into_accepted()
            .expect("accepted");
        assert_eq!(flat.stream_handle, Some(StreamHandle::new("https://s/p2")));

        let none = response(r#"{"id":"p3","status":"starting"}"#)
            .into_accepted()
            .expect("accepted");
        assert_eq!(none.stream_handle, None);
    }

    #[test]
    fn failed_status_becomes_a_classified_error() {
        let error = response(r#"{"id":"p4","status":"failed","error":"Invalid API key"}"#)
            .into_accepted()
            .expect_err("failed prediction");
        assert_eq!(
            error.kind(),
            crate::provider::DispatchErrorKind::AuthOrConfigMissing
        );
    }

    #[test]
    fn request_body_flattens_sampling_into_input() {
        let history = vec![ContextMessage::new(crate::provider::Role::User, "Hi")];
        let sampling = SamplingParams {
            temperature: Some(0.5),
            top_p: None,
            max_tokens: Some(256),
        };
        let body = PredictionBody {
            model: Some("small"),
            input: PredictionInput {
                prompt: "Hello",
                system_prompt: None,
                history: &history,
                sampling: Some(&sampling),
            },
            stream: true,
        };

        let value = serde_json::to_value(&body).expect("serializable");
        assert_eq!(value["model"], "small");
        assert_eq!(value["stream"], true);
        assert_eq!(value["input"]["prompt"], "Hello");
        assert_eq!(value["input"]["temperature"], 0.5);
        assert_eq!(value["input"]["max_tokens"], 256);
        assert_eq!(value["input"]["history"][0]["role"], "user");
        assert!(value["input"].get("system_prompt").is_none());
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let client = HttpPredictionClient::new(BackendConfig::new("https://api.example.com", ""))
            .expect("client builds");
        let error = client
            .dispatch(PredictionRequest::new("Hello", Vec::new()))
            .await
            .expect_err("no api key");
        assert!(matches!(error, DispatchError::MissingApiKey { .. }));
    }

    async fn pump_bytes<R>(body: R) -> Vec<TransportResult<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let handle = StreamHandle::new("https://stream.test/p1");
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let (_cancel_tx, mut cancel_rx) = oneshot::channel();
        pump_sse_frames(body, &handle, &frame_tx, &mut cancel_rx).await;
        drop(frame_tx);

        let mut frames = Vec::new();
        while let Some(frame) = frame_rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    fn data_frames(frames: &[TransportResult<Frame>]) -> Vec<Frame> {
        frames
            .iter()
            .map(|frame| frame.as_ref().expect("no transport error").clone())
            .collect()
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_end_the_stream() {
        let body: &[u8] = b"data: He\n\ndata: \xff\xfe garbled\n\ndata: llo\n\nevent: done\ndata: {}\n\n";
        let frames = data_frames(&pump_bytes(body).await);

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0], Frame::Data("He".to_string()));
        assert_eq!(
            frames[1],
            Frame::Data("\u{fffd}\u{fffd} garbled".to_string())
        );
        assert_eq!(frames[2], Frame::Data("llo".to_string()));
        assert_eq!(frames[3], Frame::Done);
    }

    #[tokio::test]
    async fn unterminated_event_is_flushed_at_end_of_body() {
        let body: &[u8] = b": keep-alive\r\ndata: tail\r\n";
        let frames = data_frames(&pump_bytes(body).await);
        assert_eq!(frames, vec![Frame::Data("tail".to_string())]);
    }

    #[tokio::test]
    async fn nothing_is_forwarded_after_a_terminal_frame() {
        let body: &[u8] = b"data: [DONE]\n\ndata: late\n\n";
        let frames = data_frames(&pump_bytes(body).await);
        assert_eq!(frames, vec![Frame::Done]);
    }

    #[tokio::test]
    async fn read_failure_is_reported_after_delivered_frames() {
        let chunks = futures::stream::iter(vec![
            Ok(&b"data: He\n\n"[..]),
            Err(std::io::Error::other("connection reset")),
        ]);
        let frames = pump_bytes(ByteStreamReader::new(chunks)).await;

        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Ok(Frame::Data(text)) if text == "He"));
        assert!(matches!(&frames[1], Err(TransportError::ReadLine { .. })));
    }

    #[tokio::test]
    async fn cancel_stops_an_idle_stream() {
        let (mut writer, body) = tokio::io::duplex(256);
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let pump = tokio::spawn(async move {
            let handle = StreamHandle::new("https://stream.test/p1");
            pump_sse_frames(body, &handle, &frame_tx, &mut cancel_rx).await;
        });

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"data: He\n\n")
            .await
            .expect("write");
        let first = frame_rx.recv().await.expect("frame").expect("data");
        assert_eq!(first, Frame::Data("He".to_string()));

        cancel_tx.send(()).expect("pump still listening");
        tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump stops after cancel")
            .expect("pump task");
        assert!(frame_rx.recv().await.is_none());
        drop(writer);
    }

    #[tokio::test]
    async fn unreachable_stream_reports_a_connect_error() {
        let client = HttpPredictionClient::new(BackendConfig::new("https://api.example.com", "k"))
            .expect("client builds");
        let Subscription { mut stream, worker } = client
            .subscribe(StreamHandle::new("http://127.0.0.1:9/stream"))
            .expect("valid handle");

        worker.await;
        let first = stream.recv().await.expect("an outcome is delivered");
        assert!(matches!(first, Err(TransportError::Connect { .. })));
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn non_http_handles_are_rejected() {
        let client = HttpPredictionClient::new(BackendConfig::new("https://api.example.com", "k"))
            .expect("client builds");
        let result = client.subscribe(StreamHandle::new("ftp://nope"));
        assert!(matches!(result, Err(TransportError::InvalidHandle { .. })));
    }
}
