#![deny(unsafe_code)]

//! Chat-streaming core: turns a pushed token stream into a persisted conversation.

pub mod context;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod reader;
pub mod settings;
pub mod telemetry;
pub mod throttle;

pub use context::ContextWindow;
pub use error::{ChatError, ChatResult};
pub use message::{
    LocalMessageId, Message, MessageFactory, MessageKey, MessageStatus, Role, SAVE_FAILED_NOTICE,
    is_durable, title_from_first_message,
};
pub use orchestrator::{ConversationOrchestrator, OrchestratorConfig, SendOutcome, StreamProgress};
pub use reader::{ReaderEvent, StreamGeneration, StreamReader, parse_payload};
pub use settings::{Settings, SettingsError, SettingsStore};
pub use throttle::{Throttled, UpdateThrottle};
