#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur::{ConversationOrchestrator, OrchestratorConfig};
use murmur_llm::{
    BoxFuture, DispatchError, DispatchResult, Frame, PredictionAccepted, PredictionDispatcher,
    PredictionRequest, PushStreamTransport, StreamHandle, Subscription, TransportError,
    TransportResult, make_frame_stream,
};
use murmur_storage::{
    BoxFuture as StoreFuture, ConversationId, ConversationPatch, ConversationRecord,
    ConversationStore, MessageId, MessageRecord, MessageRole, MessageStore, NewConversation,
    NewMessage, SqliteStorage, StorageError, StorageResult,
};

pub fn accepted(id: &str) -> DispatchResult<PredictionAccepted> {
    Ok(PredictionAccepted {
        id: id.to_string(),
        status: "starting".to_string(),
        stream_handle: Some(StreamHandle::new(format!("https://stream.test/{id}"))),
    })
}

/// Returns queued dispatch results in order and records every request.
#[derive(Default)]
pub struct ScriptedDispatcher {
    responses: Mutex<VecDeque<DispatchResult<PredictionAccepted>>>,
    requests: Mutex<Vec<PredictionRequest>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedDispatcher {
    pub fn respond(&self, response: DispatchResult<PredictionAccepted>) {
        self.responses.lock().expect("lock").push_back(response);
    }

    pub fn delay_responses(&self, delay: Duration) {
        *self.delay.lock().expect("lock") = Some(delay);
    }

    pub fn requests(&self) -> Vec<PredictionRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl PredictionDispatcher for ScriptedDispatcher {
    fn dispatch<'a>(
        &'a self,
        request: PredictionRequest,
    ) -> BoxFuture<'a, DispatchResult<PredictionAccepted>> {
        Box::pin(async move {
            self.requests.lock().expect("lock").push(request);
            let delay = *self.delay.lock().expect("lock");
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| {
                    Err(DispatchError::PredictionFailed {
                        stage: "scripted-dispatch",
                        prediction_id: "unscripted".to_string(),
                        detail: "no scripted response".to_string(),
                    })
                })
        })
    }
}

#[derive(Debug)]
pub enum Step {
    Frame(Frame),
    Fail(TransportError),
    /// Keeps the stream open until the subscriber cancels it.
    Hold,
}

pub fn data(payload: &str) -> Step {
    Step::Frame(Frame::Data(payload.to_string()))
}

pub fn done() -> Step {
    Step::Frame(Frame::Done)
}

/// Each subscription plays the next queued script; an exhausted script closes the stream.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    subscriptions: AtomicUsize,
}

impl ScriptedTransport {
    pub fn script(&self, steps: Vec<Step>) {
        self.scripts.lock().expect("lock").push_back(steps);
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl PushStreamTransport for ScriptedTransport {
    fn subscribe(&self, handle: StreamHandle) -> TransportResult<Subscription> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let steps = self
            .scripts
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_default();
        let (frame_tx, stream, cancel_rx) = make_frame_stream(handle);

        let worker = Box::pin(async move {
            for step in steps {
                match step {
                    Step::Frame(frame) => {
                        if frame_tx.send(Ok(frame)).is_err() {
                            return;
                        }
                        tokio::task::yield_now().await;
                    }
                    Step::Fail(error) => {
                        let _ = frame_tx.send(Err(error));
                        return;
                    }
                    Step::Hold => {
                        let _ = cancel_rx.await;
                        return;
                    }
                }
            }
        });

        Ok(Subscription { stream, worker })
    }
}

/// In-memory SQLite store whose message appends can be made to fail per role.
pub struct FlakyStore {
    inner: SqliteStorage,
    fail_creates: AtomicBool,
    fail_user_appends: AtomicBool,
    fail_assistant_appends: AtomicBool,
}

impl FlakyStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteStorage::open_in_memory()
                .await
                .expect("in-memory sqlite opens"),
            fail_creates: AtomicBool::new(false),
            fail_user_appends: AtomicBool::new(false),
            fail_assistant_appends: AtomicBool::new(false),
        }
    }

    pub fn fail_conversation_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_appends_for(&self, role: MessageRole, fail: bool) {
        match role {
            MessageRole::User => self.fail_user_appends.store(fail, Ordering::SeqCst),
            MessageRole::Assistant => self.fail_assistant_appends.store(fail, Ordering::SeqCst),
            MessageRole::System => {}
        }
    }

    pub async fn stored(&self, conversation_id: ConversationId) -> Vec<MessageRecord> {
        self.inner
            .list_messages(conversation_id)
            .await
            .expect("list stored messages")
    }
}

impl ConversationStore for FlakyStore {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> StoreFuture<'_, StorageResult<ConversationRecord>> {
        let fail = self.fail_creates.load(Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                return Err(StorageError::Query {
                    stage: "scripted-create",
                    source: sqlx::Error::Io(std::io::Error::other("database is locked")),
                });
            }
            self.inner.create_conversation(input).await
        })
    }

    fn list_conversations(
        &self,
        include_deleted: bool,
    ) -> StoreFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(self.inner.list_conversations(include_deleted))
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(self.inner.get_conversation(conversation_id))
    }

    fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> StoreFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(self.inner.update_conversation(conversation_id, patch))
    }

    fn soft_delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, StorageResult<()>> {
        Box::pin(self.inner.soft_delete_conversation(conversation_id))
    }

    fn restore_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, StorageResult<()>> {
        Box::pin(self.inner.restore_conversation(conversation_id))
    }
}

impl MessageStore for FlakyStore {
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StoreFuture<'_, StorageResult<MessageRecord>> {
        let fail = match input.role {
            MessageRole::User => self.fail_user_appends.load(Ordering::SeqCst),
            MessageRole::Assistant => self.fail_assistant_appends.load(Ordering::SeqCst),
            MessageRole::System => false,
        };

        Box::pin(async move {
            if fail {
                return Err(StorageError::Query {
                    stage: "scripted-append",
                    source: sqlx::Error::Io(std::io::Error::other("disk full")),
                });
            }
            self.inner.append_message(conversation_id, input).await
        })
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> StoreFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(self.inner.list_messages(conversation_id))
    }

    fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> StoreFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(self.inner.get_message(conversation_id, message_id))
    }

    fn soft_delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> StoreFuture<'_, StorageResult<()>> {
        Box::pin(self.inner.soft_delete_message(conversation_id, message_id))
    }
}

pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub transport: Arc<ScriptedTransport>,
    pub orchestrator: ConversationOrchestrator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(OrchestratorConfig::default()).await
    }

    pub async fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(FlakyStore::new().await);
        let dispatcher = Arc::new(ScriptedDispatcher::default());
        let transport = Arc::new(ScriptedTransport::default());
        let orchestrator = ConversationOrchestrator::new(
            store.clone(),
            dispatcher.clone(),
            transport.clone(),
            config,
        );

        Self {
            store,
            dispatcher,
            transport,
            orchestrator,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.orchestrator
            .selected_conversation_id()
            .expect("a conversation is selected")
    }
}
