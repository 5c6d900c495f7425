use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{MalformedIdSnafu, StorageError, StorageResult};

/// Identity of a stored conversation. Time-ordered, so newer ids sort later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(Uuid);

/// Identity of a stored message; the view uses it as the message's durable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Uuid);

impl ConversationId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        parse_uuid(raw, "conversation").map(Self)
    }
}

impl MessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        parse_uuid(raw, "message").map(Self)
    }
}

fn parse_uuid(raw: &str, kind: &'static str) -> StorageResult<Uuid> {
    Uuid::parse_str(raw.trim()).context(MalformedIdSnafu {
        stage: "parse-id",
        kind,
        raw: raw.to_string(),
    })
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, formatter)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, formatter)
    }
}

impl FromStr for ConversationId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl FromStr for MessageId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasted_ids_parse_with_surrounding_whitespace() {
        let id = ConversationId::new_v7();
        let parsed: ConversationId = format!("  {id}\n").parse().expect("valid uuid");
        assert_eq!(parsed, id);
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let first = MessageId::new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = MessageId::new_v7();
        assert!(first < second);
    }

    #[test]
    fn malformed_ids_name_what_was_expected() {
        let error = MessageId::parse("not-a-uuid").expect_err("invalid uuid");
        match &error {
            StorageError::MalformedId { kind, raw, .. } => {
                assert_eq!(*kind, "message");
                assert_eq!(raw, "not-a-uuid");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(error.to_string(), "'not-a-uuid' is not a valid message id");
    }
}
