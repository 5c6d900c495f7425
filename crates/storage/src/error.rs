use snafu::Snafu;

use super::ids::{ConversationId, MessageId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The conversation was never created, or it is soft-deleted and the operation needs it live.
    #[snafu(display("conversation {conversation_id} does not exist"))]
    ConversationMissing {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("message {message_id} is not in conversation {conversation_id}"))]
    MessageMissing {
        stage: &'static str,
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    #[snafu(display("'{raw}' is not a valid {kind} id"))]
    MalformedId {
        stage: &'static str,
        kind: &'static str,
        raw: String,
        source: uuid::Error,
    },
    /// A row holds a value the schema allows but this crate never writes.
    #[snafu(display("stored {column} value '{value}' is unreadable"))]
    CorruptColumn {
        stage: &'static str,
        column: &'static str,
        value: String,
    },
    #[snafu(display("cannot create database directory {path}: {source}"))]
    DatabaseDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("cannot open database {database_url}: {source}"))]
    OpenDatabase {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("database schema upgrade failed: {source}"))]
    Migrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("{stage}: {source}"))]
    Query {
        stage: &'static str,
        source: sqlx::Error,
    },
}

impl StorageError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::ConversationMissing { stage, .. }
            | Self::MessageMissing { stage, .. }
            | Self::MalformedId { stage, .. }
            | Self::CorruptColumn { stage, .. }
            | Self::DatabaseDirectory { stage, .. }
            | Self::OpenDatabase { stage, .. }
            | Self::Migrate { stage, .. }
            | Self::Query { stage, .. } => stage,
        }
    }

    /// True when the target row is absent rather than the database misbehaving.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            Self::ConversationMissing { .. } | Self::MessageMissing { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
