use murmur_storage::StorageError;
use snafu::Snafu;

use crate::message::{MessageKey, MessageStatus};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("refusing to send an empty message"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("a response is still streaming; wait for it to finish"))]
    StreamInFlight { stage: &'static str },
    #[snafu(display("message status cannot move from {from:?} to {to:?}"))]
    IllegalTransition {
        stage: &'static str,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[snafu(display("message {key} is not in the current view"))]
    MessageNotFound {
        stage: &'static str,
        key: MessageKey,
    },
    #[snafu(display("message {key} is still {status:?} and cannot be removed"))]
    MessageNotTerminal {
        stage: &'static str,
        key: MessageKey,
        status: MessageStatus,
    },
    #[snafu(display("conversation '{id}' does not exist or was deleted"))]
    ConversationUnavailable { stage: &'static str, id: String },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

impl ChatError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::EmptyMessage { stage }
            | Self::StreamInFlight { stage }
            | Self::IllegalTransition { stage, .. }
            | Self::MessageNotFound { stage, .. }
            | Self::MessageNotTerminal { stage, .. }
            | Self::ConversationUnavailable { stage, .. }
            | Self::Storage { stage, .. } => stage,
        }
    }

    /// True for errors that reject a request without touching any state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::EmptyMessage { .. } | Self::StreamInFlight { .. }
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
