use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use murmur_storage::{ConversationId, MessageId, MessageRecord, MessageRole};

use crate::error::{ChatResult, IllegalTransitionSnafu};

/// In-process identifier for a message that has not been persisted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalMessageId(u64);

impl LocalMessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Message identity: either allocated locally or assigned by storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Local(LocalMessageId),
    Durable(MessageId),
}

impl MessageKey {
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Durable(_))
    }

    pub fn durable_id(&self) -> Option<MessageId> {
        match self {
            Self::Durable(id) => Some(*id),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(formatter, "local:{}", id.0),
            Self::Durable(id) => write!(formatter, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn to_storage(self) -> MessageRole {
        match self {
            Self::User => MessageRole::User,
            Self::Assistant => MessageRole::Assistant,
        }
    }

    pub fn to_provider(self) -> murmur_llm::Role {
        match self {
            Self::User => murmur_llm::Role::User,
            Self::Assistant => murmur_llm::Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Sending,
    Streaming,
    Success,
    Error,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// `Streaming -> Streaming` is allowed so content replaces count as transitions.
    pub fn can_advance_to(self, next: Self) -> bool {
        match self {
            Self::Sending => matches!(next, Self::Success | Self::Error),
            Self::Streaming => matches!(next, Self::Streaming | Self::Success | Self::Error),
            Self::Success | Self::Error => false,
        }
    }
}

/// Text attached to a completed reply that could not be written to storage.
pub const SAVE_FAILED_NOTICE: &str = "failed to save";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: SystemTime,
    pub notice: Option<String>,
}

impl Message {
    pub fn is_durable(&self) -> bool {
        self.key.is_durable()
    }

    pub fn advance(&mut self, next: MessageStatus) -> ChatResult<()> {
        snafu::ensure!(
            self.status.can_advance_to(next),
            IllegalTransitionSnafu {
                stage: "advance-message-status",
                from: self.status,
                to: next,
            }
        );
        self.status = next;
        Ok(())
    }

    /// Replaces the whole content of a streaming message.
    pub fn replace_content(&mut self, content: impl Into<String>) -> ChatResult<()> {
        self.advance(MessageStatus::Streaming)?;
        self.content = content.into();
        Ok(())
    }
}

/// Builds messages in their initial lifecycle shapes.
///
/// The only state is the local id counter; every call returns a fresh key.
#[derive(Debug, Default)]
pub struct MessageFactory {
    next_local_id: u64,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outbound_user(
        &mut self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Message {
        self.build(conversation_id, Role::User, content, MessageStatus::Sending)
    }

    pub fn assistant_placeholder(&mut self, conversation_id: ConversationId) -> Message {
        self.build(
            conversation_id,
            Role::Assistant,
            String::new(),
            MessageStatus::Streaming,
        )
    }

    pub fn error(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        text: impl Into<String>,
    ) -> Message {
        self.build(conversation_id, role, text, MessageStatus::Error)
    }

    /// Hydrates a stored record; system rows never enter the view list.
    pub fn from_record(record: MessageRecord) -> Option<Message> {
        let role = match record.role {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
            MessageRole::System => return None,
        };

        Some(Message {
            key: MessageKey::Durable(record.id),
            conversation_id: record.conversation_id,
            role,
            content: record.content,
            status: MessageStatus::Success,
            created_at: UNIX_EPOCH + Duration::from_secs(record.created_at_unix_seconds),
            notice: None,
        })
    }

    pub fn alloc_local_id(&mut self) -> LocalMessageId {
        let id = LocalMessageId::new(self.next_local_id);
        self.next_local_id = self.next_local_id.saturating_add(1);
        id
    }

    fn build(
        &mut self,
        conversation_id: ConversationId,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Message {
        Message {
            key: MessageKey::Local(self.alloc_local_id()),
            conversation_id,
            role,
            content: content.into(),
            status,
            created_at: SystemTime::now(),
            notice: None,
        }
    }
}

/// Durable-or-local check used before re-sending or re-persisting a message.
pub fn is_durable(message: &Message) -> bool {
    message.is_durable()
}

/// Derives a conversation title from the first message sent in it.
pub fn title_from_first_message(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if max_chars == 0 || collapsed.chars().count() <= max_chars {
        return collapsed;
    }

    let mut title = collapsed
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    title.truncate(title.trim_end().len());
    title.push('…');
    title
}
