use std::sync::Arc;
use std::time::Duration;

use murmur_llm::{
    DispatchError, DispatchErrorKind, PredictionDispatcher, PredictionRequest, PushStreamTransport,
    SamplingParams, StreamHandle, TransportError, classify_failure_text,
};
use murmur_storage::{
    ConversationId, ConversationRecord, MessageRole, NewConversation, NewMessage, Storage,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::watch;

use crate::context::{ContextWindow, DEFAULT_CONTEXT_MESSAGES};
use crate::error::{
    ChatResult, ConversationUnavailableSnafu, EmptyMessageSnafu, MessageNotFoundSnafu,
    MessageNotTerminalSnafu, StorageSnafu, StreamInFlightSnafu,
};
use crate::message::{
    Message, MessageFactory, MessageKey, MessageStatus, Role, SAVE_FAILED_NOTICE,
    title_from_first_message,
};
use crate::reader::{ReaderEvent, StreamGeneration, StreamReader};
use crate::throttle::{DEFAULT_UPDATE_INTERVAL, UpdateThrottle};

const STREAM_INTERRUPTED_TEXT: &str = "The response was interrupted. Please try again.";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub context_max_messages: usize,
    pub update_interval: Duration,
    pub dispatch_timeout: Duration,
    pub title_max_chars: usize,
    pub system_prompt: Option<String>,
    pub sampling: SamplingParams,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            context_max_messages: DEFAULT_CONTEXT_MESSAGES,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            dispatch_timeout: Duration::from_secs(30),
            title_max_chars: 48,
            system_prompt: None,
            sampling: SamplingParams::default(),
        }
    }
}

/// What became of an accepted `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The placeholder is attached to a push stream; drive it with `drive_stream`.
    Streaming { placeholder: MessageKey },
    /// The user message could not be stored, so nothing was dispatched.
    NotPersisted { user: MessageKey },
    DispatchFailed { kind: DispatchErrorKind },
}

/// Effect of one applied reader event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamProgress {
    Updated { key: MessageKey, content: String },
    Completed { key: MessageKey },
    /// The reply finished but could not be stored; it stays on screen as local-only.
    NotSaved { key: MessageKey },
    Failed { key: MessageKey, reason: String },
}

impl StreamProgress {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Updated { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveStream {
    conversation_id: ConversationId,
    placeholder: MessageKey,
    generation: StreamGeneration,
}

/// Controller for one open chat view.
///
/// All state is mutated through `&mut self`; observers read snapshots from the watch channels.
pub struct ConversationOrchestrator {
    store: Arc<dyn Storage>,
    dispatcher: Arc<dyn PredictionDispatcher>,
    reader: StreamReader,
    factory: MessageFactory,
    context: ContextWindow,
    config: OrchestratorConfig,
    selected_conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    active_stream: Option<ActiveStream>,
    messages_tx: watch::Sender<Vec<Message>>,
    streaming_tx: watch::Sender<bool>,
}

impl ConversationOrchestrator {
    pub fn new(
        store: Arc<dyn Storage>,
        dispatcher: Arc<dyn PredictionDispatcher>,
        transport: Arc<dyn PushStreamTransport>,
        config: OrchestratorConfig,
    ) -> Self {
        let (messages_tx, _) = watch::channel(Vec::new());
        let (streaming_tx, _) = watch::channel(false);

        Self {
            store,
            dispatcher,
            reader: StreamReader::new(transport, UpdateThrottle::new(config.update_interval)),
            factory: MessageFactory::new(),
            context: ContextWindow::new(config.context_max_messages),
            config,
            selected_conversation_id: None,
            messages: Vec::new(),
            active_stream: None,
            messages_tx,
            streaming_tx,
        }
    }

    pub fn selected_conversation_id(&self) -> Option<ConversationId> {
        self.selected_conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.active_stream.is_some()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages_tx.subscribe()
    }

    pub fn subscribe_streaming(&self) -> watch::Receiver<bool> {
        self.streaming_tx.subscribe()
    }

    pub async fn conversations(&self) -> ChatResult<Vec<ConversationRecord>> {
        self.store
            .list_conversations(false)
            .await
            .context(StorageSnafu {
                stage: "list-conversations",
            })
    }

    /// Sends `text` as a user message and attaches to the reply stream.
    ///
    /// Returns once the reply is streaming or the send has failed; the reply itself
    /// arrives through [`Self::drive_stream`].
    pub async fn send(&mut self, text: &str) -> ChatResult<SendOutcome> {
        let text = text.trim();
        ensure!(!text.is_empty(), EmptyMessageSnafu { stage: "send-validate" });
        ensure!(
            !self.has_outstanding_message(),
            StreamInFlightSnafu {
                stage: "send-validate"
            }
        );

        let conversation_id = match self.ensure_conversation(text).await {
            Ok(conversation_id) => conversation_id,
            Err(attempted_id) => {
                let mut user = self.factory.outbound_user(attempted_id, text);
                user.notice = Some(SAVE_FAILED_NOTICE.to_string());
                user.advance(MessageStatus::Error)?;
                let user_key = user.key;
                self.messages.push(user);
                self.publish_messages();
                return Ok(SendOutcome::NotPersisted { user: user_key });
            }
        };

        let user = self.factory.outbound_user(conversation_id, text);
        let mut user_key = user.key;
        self.messages.push(user);
        self.publish_messages();

        match self
            .store
            .append_message(conversation_id, NewMessage::new(MessageRole::User, text))
            .await
        {
            Ok(record) => {
                let durable_key = MessageKey::Durable(record.id);
                self.update_message(user_key, |message| {
                    message.key = durable_key;
                    Ok(())
                })?;
                user_key = durable_key;
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "failed to persist user message"
                );
                self.update_message(user_key, |message| {
                    message.notice = Some(SAVE_FAILED_NOTICE.to_string());
                    message.advance(MessageStatus::Error)
                })?;
                self.publish_messages();
                return Ok(SendOutcome::NotPersisted { user: user_key });
            }
        }

        let request = self.build_request(text);
        let handle = match self.dispatch(request).await {
            Ok(handle) => handle,
            Err(error) => {
                let kind = error.kind();
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    ?kind,
                    "prediction dispatch failed"
                );
                self.update_message(user_key, |message| message.advance(MessageStatus::Error))?;
                let reply = self
                    .factory
                    .error(conversation_id, Role::Assistant, kind.user_message());
                self.messages.push(reply);
                self.publish_messages();
                return Ok(SendOutcome::DispatchFailed { kind });
            }
        };

        self.update_message(user_key, |message| message.advance(MessageStatus::Success))?;

        let placeholder = self.factory.assistant_placeholder(conversation_id);
        let placeholder_key = placeholder.key;
        self.messages.push(placeholder);

        let generation = self.reader.attach(handle);
        self.active_stream = Some(ActiveStream {
            conversation_id,
            placeholder: placeholder_key,
            generation,
        });
        self.streaming_tx.send_replace(true);
        self.publish_messages();

        Ok(SendOutcome::Streaming {
            placeholder: placeholder_key,
        })
    }

    /// Applies the next reader event to the message list.
    ///
    /// Returns `None` when no stream is active.
    pub async fn next_stream_event(&mut self) -> Option<StreamProgress> {
        let active = self.active_stream?;
        let event = match self.reader.next_event().await {
            Some(event) if self.reader.generation() == active.generation => event,
            // A reader that goes quiet without a terminal event counts as an interruption.
            _ => {
                return Some(self.fail_stream(
                    active,
                    TransportError::EndedWithoutDone {
                        stage: "stream-reader-exhausted",
                    },
                ));
            }
        };

        Some(match event {
            ReaderEvent::Update(content) => self.apply_update(active, content),
            ReaderEvent::Completed(text) => self.complete_stream(active, text).await,
            ReaderEvent::Failed(error) => self.fail_stream(active, error),
        })
    }

    /// Drives the active stream to its terminal event.
    pub async fn drive_stream(&mut self) -> Option<StreamProgress> {
        while let Some(progress) = self.next_stream_event().await {
            if progress.is_terminal() {
                return Some(progress);
            }
        }
        None
    }

    /// Selects a conversation (or none, for a fresh one created on first send).
    pub async fn switch_conversation(
        &mut self,
        conversation_id: Option<ConversationId>,
    ) -> ChatResult<()> {
        let Some(conversation_id) = conversation_id else {
            self.cancel_stream("switch-conversation");
            self.selected_conversation_id = None;
            self.messages.clear();
            self.publish_messages();
            return Ok(());
        };

        let record = self
            .store
            .get_conversation(conversation_id)
            .await
            .context(StorageSnafu {
                stage: "switch-conversation-load",
            })?
            .filter(|record| record.deleted_at_unix_seconds.is_none())
            .context(ConversationUnavailableSnafu {
                stage: "switch-conversation-load",
                id: conversation_id.to_string(),
            })?;

        let records = self
            .store
            .list_messages(record.id)
            .await
            .context(StorageSnafu {
                stage: "switch-conversation-messages",
            })?;

        // Only a successful load leaves the current view; a failed one keeps its stream.
        self.cancel_stream("switch-conversation");
        self.messages = records
            .into_iter()
            .filter_map(MessageFactory::from_record)
            .collect();
        self.selected_conversation_id = Some(record.id);
        tracing::info!(
            conversation_id = %record.id,
            messages = self.messages.len(),
            "conversation opened"
        );
        self.publish_messages();
        Ok(())
    }

    /// Removes a terminal message from the view, soft-deleting it if it was stored.
    pub async fn delete_message(&mut self, key: MessageKey) -> ChatResult<()> {
        let message = self
            .messages
            .iter()
            .find(|message| message.key == key)
            .context(MessageNotFoundSnafu {
                stage: "delete-message-lookup",
                key,
            })?;
        ensure!(
            message.status.is_terminal(),
            MessageNotTerminalSnafu {
                stage: "delete-message-validate",
                key,
                status: message.status,
            }
        );

        if let Some(message_id) = key.durable_id() {
            self.store
                .soft_delete_message(message.conversation_id, message_id)
                .await
                .context(StorageSnafu {
                    stage: "delete-message-store",
                })?;
        }

        self.messages.retain(|message| message.key != key);
        self.publish_messages();
        Ok(())
    }

    /// Cancels any active stream and discards in-memory view state.
    ///
    /// Stored messages are untouched. Dropping the orchestrator has the same effect.
    pub fn teardown(&mut self) {
        self.cancel_stream("teardown");
        self.selected_conversation_id = None;
        self.messages.clear();
        self.publish_messages();
    }

    /// Returns the selected conversation, creating it on first send.
    ///
    /// On failure yields the id the conversation would have had, so the unsaved
    /// message can still be shown.
    async fn ensure_conversation(
        &mut self,
        first_message: &str,
    ) -> Result<ConversationId, ConversationId> {
        if let Some(conversation_id) = self.selected_conversation_id {
            return Ok(conversation_id);
        }

        let conversation_id = ConversationId::new_v7();
        let title = title_from_first_message(first_message, self.config.title_max_chars);
        match self
            .store
            .create_conversation(NewConversation::new(title).with_id(conversation_id))
            .await
        {
            Ok(record) => {
                tracing::info!(conversation_id = %record.id, title = %record.title, "conversation created");
                self.selected_conversation_id = Some(record.id);
                Ok(record.id)
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = error.stage(),
                    error = %error,
                    "failed to create conversation"
                );
                Err(conversation_id)
            }
        }
    }

    fn build_request(&self, prompt: &str) -> PredictionRequest {
        let mut request = PredictionRequest::new(prompt, self.context.build(&self.messages))
            .with_sampling(self.config.sampling.clone());
        if let Some(system_prompt) = &self.config.system_prompt {
            request = request.with_system_prompt(system_prompt.clone());
        }
        request
    }

    async fn dispatch(&self, request: PredictionRequest) -> Result<StreamHandle, DispatchError> {
        let timeout = self.config.dispatch_timeout;
        let accepted =
            match tokio::time::timeout(timeout, self.dispatcher.dispatch(request)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(DispatchError::Timeout {
                        stage: "dispatch-deadline",
                        after: timeout,
                    });
                }
            };

        tracing::debug!(prediction_id = %accepted.id, status = %accepted.status, "dispatch accepted");
        accepted
            .stream_handle
            .ok_or(DispatchError::MissingStreamHandle {
                stage: "dispatch-stream-handle",
                prediction_id: accepted.id,
            })
    }

    fn apply_update(&mut self, active: ActiveStream, content: String) -> StreamProgress {
        let applied = self.update_message(active.placeholder, |message| {
            message.replace_content(content.clone())
        });
        if let Err(error) = applied {
            tracing::warn!(key = %active.placeholder, error = %error, "dropped stream update");
        }
        self.publish_messages();
        StreamProgress::Updated {
            key: active.placeholder,
            content,
        }
    }

    async fn complete_stream(&mut self, active: ActiveStream, text: String) -> StreamProgress {
        self.finish_stream();

        let saved = self
            .store
            .append_message(
                active.conversation_id,
                NewMessage::new(MessageRole::Assistant, text.clone()),
            )
            .await;

        let progress = match saved {
            Ok(record) => {
                let final_message = Message {
                    key: MessageKey::Durable(record.id),
                    conversation_id: active.conversation_id,
                    role: Role::Assistant,
                    content: text,
                    status: MessageStatus::Success,
                    created_at: std::time::SystemTime::now(),
                    notice: None,
                };
                self.replace_message(active.placeholder, final_message);
                tracing::info!(
                    conversation_id = %active.conversation_id,
                    message_id = %record.id,
                    "assistant reply saved"
                );
                StreamProgress::Completed {
                    key: MessageKey::Durable(record.id),
                }
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %active.conversation_id,
                    error = %error,
                    "failed to persist assistant reply"
                );
                let result = self.update_message(active.placeholder, |message| {
                    message.replace_content(text.clone())?;
                    message.notice = Some(SAVE_FAILED_NOTICE.to_string());
                    message.advance(MessageStatus::Error)
                });
                if let Err(error) = result {
                    tracing::warn!(key = %active.placeholder, error = %error, "could not mark reply unsaved");
                }
                StreamProgress::NotSaved {
                    key: active.placeholder,
                }
            }
        };

        self.publish_messages();
        progress
    }

    fn fail_stream(&mut self, active: ActiveStream, error: TransportError) -> StreamProgress {
        self.finish_stream();
        tracing::warn!(
            conversation_id = %active.conversation_id,
            error = %error,
            "push stream failed"
        );

        let reason = stream_failure_text(&error).to_string();
        let replacement =
            self.factory
                .error(active.conversation_id, Role::Assistant, reason.clone());
        let key = replacement.key;
        self.replace_message(active.placeholder, replacement);
        self.publish_messages();

        StreamProgress::Failed { key, reason }
    }

    fn finish_stream(&mut self) {
        self.active_stream = None;
        self.reader.detach();
        self.streaming_tx.send_replace(false);
    }

    fn cancel_stream(&mut self, reason: &'static str) {
        self.reader.detach();
        let Some(active) = self.active_stream.take() else {
            return;
        };

        self.streaming_tx.send_replace(false);
        tracing::info!(
            conversation_id = %active.conversation_id,
            placeholder = %active.placeholder,
            reason,
            "active stream cancelled"
        );
    }

    fn has_outstanding_message(&self) -> bool {
        self.active_stream.is_some()
            || self
                .messages
                .iter()
                .any(|message| !message.status.is_terminal())
    }

    fn update_message(
        &mut self,
        key: MessageKey,
        update: impl FnOnce(&mut Message) -> ChatResult<()>,
    ) -> ChatResult<()> {
        let message = self
            .messages
            .iter_mut()
            .find(|message| message.key == key)
            .context(MessageNotFoundSnafu {
                stage: "update-message",
                key,
            })?;

        // Work on a copy so a rejected transition leaves the stored message untouched.
        let mut next = message.clone();
        update(&mut next)?;
        *message = next;
        Ok(())
    }

    fn replace_message(&mut self, key: MessageKey, replacement: Message) {
        match self.messages.iter_mut().find(|message| message.key == key) {
            Some(message) => *message = replacement,
            None => self.messages.push(replacement),
        }
    }

    fn publish_messages(&self) {
        self.messages_tx.send_replace(self.messages.clone());
    }
}

fn stream_failure_text(error: &TransportError) -> &'static str {
    match error {
        TransportError::Remote { message, .. } => match classify_failure_text(message) {
            DispatchErrorKind::Backend => STREAM_INTERRUPTED_TEXT,
            kind => kind.user_message(),
        },
        _ => STREAM_INTERRUPTED_TEXT,
    }
}
