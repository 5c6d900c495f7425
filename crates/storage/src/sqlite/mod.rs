use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConversationMissingSnafu, CorruptColumnSnafu, DatabaseDirectorySnafu, MessageMissingSnafu,
    MigrateSnafu, OpenDatabaseSnafu, QuerySnafu, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole,
    NewConversation, NewMessage,
};
use super::{BoxFuture, ConversationStore, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(OpenDatabaseSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One long-lived connection: writes are serialized and `:memory:` databases
        // survive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(OpenDatabaseSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(OpenDatabaseSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(MigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { pool, database_url })
    }

    /// Opens a private in-memory database, mostly useful for tests and dry runs.
    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn create_conversation(
        &self,
        input: NewConversation,
    ) -> StorageResult<ConversationRecord> {
        let title = normalize_title(input.title);
        let conversation_id = input.id.unwrap_or_else(ConversationId::new_v7);
        let now = unix_timestamp_seconds();

        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, updated_at, deleted_at) VALUES (?, ?, ?, ?, NULL)",
        )
        .bind(conversation_id.to_string())
        .bind(title.clone())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "conversation-create-insert",
        })?;

        Ok(ConversationRecord {
            id: conversation_id,
            title,
            created_at_unix_seconds: i64_to_u64(now, "conversation-create-created-at")?,
            updated_at_unix_seconds: i64_to_u64(now, "conversation-create-updated-at")?,
            deleted_at_unix_seconds: None,
        })
    }

    pub async fn list_conversations(
        &self,
        include_deleted: bool,
    ) -> StorageResult<Vec<ConversationRecord>> {
        let rows = if include_deleted {
            sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at, deleted_at FROM conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at, deleted_at FROM conversations WHERE deleted_at IS NULL ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&self.pool)
            .await
        }
        .context(QuerySnafu {
            stage: "conversation-list-query",
        })?;

        rows.into_iter().map(conversation_row_to_record).collect()
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, created_at, updated_at, deleted_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "conversation-get-query",
        })?;

        row.map(conversation_row_to_record).transpose()
    }

    pub async fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> StorageResult<ConversationRecord> {
        let now = unix_timestamp_seconds();
        let update_result = sqlx::query(
            "UPDATE conversations SET title = COALESCE(?, title), updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(patch.title.map(normalize_title))
        .bind(now)
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "conversation-update-apply",
        })?;

        if update_result.rows_affected() == 0 {
            return ConversationMissingSnafu {
                stage: "conversation-update-missing",
                conversation_id,
            }
            .fail();
        }

        self.get_conversation(conversation_id)
            .await?
            .context(ConversationMissingSnafu {
                stage: "conversation-update-load-missing",
                conversation_id,
            })
    }

    pub async fn soft_delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<()> {
        let now = unix_timestamp_seconds();
        let update_result = sqlx::query(
            "UPDATE conversations SET deleted_at = COALESCE(deleted_at, ?), updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "conversation-soft-delete-apply",
        })?;

        if update_result.rows_affected() == 0 {
            return ConversationMissingSnafu {
                stage: "conversation-soft-delete-missing",
                conversation_id,
            }
            .fail();
        }

        Ok(())
    }

    pub async fn restore_conversation(&self, conversation_id: ConversationId) -> StorageResult<()> {
        let now = unix_timestamp_seconds();
        let update_result = sqlx::query(
            "UPDATE conversations SET deleted_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(conversation_id.to_string())
        .execute(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "conversation-restore-apply",
        })?;

        if update_result.rows_affected() == 0 {
            return ConversationMissingSnafu {
                stage: "conversation-restore-missing",
                conversation_id,
            }
            .fail();
        }

        Ok(())
    }

    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.context(QuerySnafu {
            stage: "message-append-begin",
        })?;

        let live = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM conversations WHERE id = ? AND deleted_at IS NULL LIMIT 1",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context(QuerySnafu {
            stage: "message-append-conversation-exists",
        })?;
        if live.is_none() {
            return ConversationMissingSnafu {
                stage: "message-append-conversation-missing",
                conversation_id,
            }
            .fail();
        }

        let next_seq = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context(QuerySnafu {
            stage: "message-append-next-seq",
        })?;

        let now = unix_timestamp_seconds();
        let message_id = MessageId::new_v7();

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, seq, role, content, created_at, deleted_at) VALUES (?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(message_id.to_string())
        .bind(conversation_id.to_string())
        .bind(next_seq)
        .bind(input.role.as_str())
        .bind(input.content.clone())
        .bind(now)
        .execute(&mut *tx)
        .await
        .context(QuerySnafu {
            stage: "message-append-insert",
        })?;

        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context(QuerySnafu {
                stage: "message-append-touch-conversation",
            })?;

        tx.commit().await.context(QuerySnafu {
            stage: "message-append-commit",
        })?;

        Ok(MessageRecord {
            id: message_id,
            conversation_id,
            seq: i64_to_u64(next_seq, "message-append-seq")?,
            role: input.role,
            content: input.content,
            created_at_unix_seconds: i64_to_u64(now, "message-append-created-at")?,
            deleted_at_unix_seconds: None,
        })
    }

    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, conversation_id, seq, role, content, created_at, deleted_at FROM messages WHERE conversation_id = ? AND deleted_at IS NULL ORDER BY seq ASC, id ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "message-list-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    pub async fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> StorageResult<Option<MessageRecord>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, conversation_id, seq, role, content, created_at, deleted_at FROM messages WHERE conversation_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(conversation_id.to_string())
        .bind(message_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "message-get-query",
        })?;

        row.map(message_row_to_record).transpose()
    }

    pub async fn soft_delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> StorageResult<()> {
        let now = unix_timestamp_seconds();
        let update_result = sqlx::query(
            "UPDATE messages SET deleted_at = ? WHERE conversation_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(conversation_id.to_string())
        .bind(message_id.to_string())
        .execute(&self.pool)
        .await
        .context(QuerySnafu {
            stage: "message-soft-delete-apply",
        })?;

        if update_result.rows_affected() == 0 {
            return MessageMissingSnafu {
                stage: "message-soft-delete-missing",
                conversation_id,
                message_id,
            }
            .fail();
        }

        Ok(())
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(SqliteStorage::create_conversation(self, input))
    }

    fn list_conversations(
        &self,
        include_deleted: bool,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(SqliteStorage::list_conversations(self, include_deleted))
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        Box::pin(SqliteStorage::get_conversation(self, conversation_id))
    }

    fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(SqliteStorage::update_conversation(
            self,
            conversation_id,
            patch,
        ))
    }

    fn soft_delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(SqliteStorage::soft_delete_conversation(
            self,
            conversation_id,
        ))
    }

    fn restore_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(SqliteStorage::restore_conversation(self, conversation_id))
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(SqliteStorage::append_message(self, conversation_id, input))
    }

    fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(SqliteStorage::list_messages(self, conversation_id))
    }

    fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<Option<MessageRecord>>> {
        Box::pin(SqliteStorage::get_message(self, conversation_id, message_id))
    }

    fn soft_delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(SqliteStorage::soft_delete_message(
            self,
            conversation_id,
            message_id,
        ))
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    content: String,
    created_at: i64,
    deleted_at: Option<i64>,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_unix_seconds: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_seconds: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
        deleted_at_unix_seconds: row
            .deleted_at
            .map(|value| i64_to_u64(value, "conversation-row-deleted-at"))
            .transpose()?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_seconds: i64_to_u64(row.created_at, "message-row-created-at")?,
        deleted_at_unix_seconds: row
            .deleted_at
            .map(|value| i64_to_u64(value, "message-row-deleted-at"))
            .transpose()?,
    })
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "system" => Ok(MessageRole::System),
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => CorruptColumnSnafu {
            stage: "message-role-from-sql",
            column: "messages.role",
            value: raw.to_string(),
        }
        .fail(),
    }
}

fn normalize_title(title: String) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        DEFAULT_CONVERSATION_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    u64::try_from(value).ok().context(CorruptColumnSnafu {
        stage,
        column: "integer",
        value: value.to_string(),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(DatabaseDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
