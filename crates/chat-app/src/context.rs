use murmur_llm::ContextMessage;

use crate::message::{Message, MessageStatus};

pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;

/// Bounded recent-history slice sent along with each prediction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    max_messages: usize,
}

impl Default for ContextWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_MESSAGES)
    }
}

impl ContextWindow {
    pub const fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }

    pub const fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Most recent durable, successful messages in their original order.
    pub fn build(&self, messages: &[Message]) -> Vec<ContextMessage> {
        let eligible = messages
            .iter()
            .filter(|message| message.is_durable() && message.status == MessageStatus::Success)
            .collect::<Vec<_>>();
        let skip = eligible.len().saturating_sub(self.max_messages);

        eligible
            .into_iter()
            .skip(skip)
            .map(|message| ContextMessage::new(message.role.to_provider(), message.content.clone()))
            .collect()
    }
}
