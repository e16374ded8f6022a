//! SQLite-backed history store.

use super::{BranchSummary, ChatRecord, HistoryStore, MessageMetadata, MessageRecord, ProfileRecord, Role};
use crate::error::{EngineError, Result};
use crate::{BranchId, ChatId, MessageId, ProfileId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use uuid::Uuid;

/// History store over a SQLite pool.
///
/// Ids are stored as hyphenated UUID text and timestamps as fixed-precision
/// RFC 3339 UTC text, so `ORDER BY created_at, id` compares correctly as
/// plain text.
#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|error| {
            EngineError::DataIntegrity(format!("unparseable {column} timestamp {raw:?}: {error}"))
        })
}

fn decode_id(raw: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|error| EngineError::DataIntegrity(format!("unparseable {column} id {raw:?}: {error}")))
}

fn decode_role(raw: &str) -> Result<Role> {
    match raw {
        "human" => Ok(Role::Human),
        "assistant" => Ok(Role::Assistant),
        other => Err(EngineError::DataIntegrity(format!(
            "unknown message role {other:?}"
        ))),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let chat_id: String = row.try_get("chat_id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let role: String = row.try_get("role")?;
    let content: String = row.try_get("content")?;
    let branch: String = row.try_get("branch")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(MessageRecord {
        id: decode_id(&id, "message")?,
        created_at: decode_ts(&created_at, "message")?,
        chat_id: decode_id(&chat_id, "chat")?,
        parent_id: parent_id
            .as_deref()
            .map(|raw| decode_id(raw, "parent"))
            .transpose()?,
        role: decode_role(&role)?,
        content,
        branch: decode_id(&branch, "branch")?,
        metadata: metadata
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<MessageMetadata>(raw).map_err(|error| {
                    EngineError::DataIntegrity(format!("unparseable message metadata: {error}"))
                })
            })
            .transpose()?
            .unwrap_or_default(),
    })
}

fn chat_from_row(row: &SqliteRow) -> Result<ChatRecord> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let title: Option<String> = row.try_get("title")?;
    let root_message_id: String = row.try_get("root_message_id")?;
    let active_branches: String = row.try_get("active_branches")?;

    Ok(ChatRecord {
        id: decode_id(&id, "chat")?,
        created_at: decode_ts(&created_at, "chat")?,
        title,
        root_message_id: decode_id(&root_message_id, "root message")?,
        active_branches: serde_json::from_str::<Vec<BranchId>>(&active_branches).map_err(
            |error| EngineError::DataIntegrity(format!("unparseable active_branches: {error}")),
        )?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, created_at, chat_id, parent_id, role, content, branch, metadata";

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn insert_chat(&self, chat: &ChatRecord) -> Result<()> {
        let active_branches = serde_json::to_string(&chat.active_branches)
            .map_err(|error| anyhow::anyhow!("failed to encode active_branches: {error}"))?;
        sqlx::query(
            "INSERT INTO chats (id, created_at, title, root_message_id, active_branches) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chat.id.to_string())
        .bind(encode_ts(&chat.created_at))
        .bind(&chat.title)
        .bind(chat.root_message_id.to_string())
        .bind(active_branches)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn chat_by_id(&self, id: ChatId) -> Result<Option<ChatRecord>> {
        let row = sqlx::query(
            "SELECT id, created_at, title, root_message_id, active_branches \
             FROM chats WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chat_from_row).transpose()
    }

    async fn delete_chat(&self, id: ChatId) -> Result<bool> {
        // Explicit cascade inside one transaction, so deletion does not
        // depend on the connection's foreign_keys pragma.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chat_messages WHERE chat_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn set_chat_title(&self, id: ChatId, title: &str) -> Result<()> {
        sqlx::query("UPDATE chats SET title = ? WHERE id = ?")
            .bind(title)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_active_branches(&self, id: ChatId, branches: &[BranchId]) -> Result<()> {
        let encoded = serde_json::to_string(branches)
            .map_err(|error| anyhow::anyhow!("failed to encode active_branches: {error}"))?;
        sqlx::query("UPDATE chats SET active_branches = ? WHERE id = ?")
            .bind(encoded)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        let metadata = if message.metadata.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&message.metadata)
                    .map_err(|error| anyhow::anyhow!("failed to encode metadata: {error}"))?,
            )
        };
        sqlx::query(
            "INSERT INTO chat_messages \
             (id, created_at, chat_id, parent_id, role, content, branch, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(encode_ts(&message.created_at))
        .bind(message.chat_id.to_string())
        .bind(message.parent_id.map(|id| id.to_string()))
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.branch.to_string())
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn message_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn message_count(&self, chat_id: ChatId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE chat_id = ?")
            .bind(chat_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn latest_in_chat(&self, chat_id: ChatId) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(chat_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn latest_in_branch(
        &self,
        chat_id: ChatId,
        branch: BranchId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ? AND branch = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(chat_id.to_string())
        .bind(branch.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn branches_under(&self, parent_id: MessageId) -> Result<Vec<BranchSummary>> {
        let rows = sqlx::query(
            "SELECT branch, MIN(created_at) AS earliest_created_at \
             FROM chat_messages WHERE parent_id = ? \
             GROUP BY branch \
             ORDER BY MIN(created_at) DESC",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let branch: String = row.try_get("branch")?;
                let earliest: String = row.try_get("earliest_created_at")?;
                Ok(BranchSummary {
                    branch: decode_id(&branch, "branch")?,
                    earliest_created_at: decode_ts(&earliest, "branch")?,
                })
            })
            .collect()
    }

    async fn insert_profile(&self, profile: &ProfileRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_profiles (id, created_at, name, provider, model) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(profile.id.to_string())
        .bind(encode_ts(&profile.created_at))
        .bind(&profile.name)
        .bind(&profile.provider)
        .bind(&profile.model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn profile_by_id(&self, id: ProfileId) -> Result<Option<ProfileRecord>> {
        let row = sqlx::query(
            "SELECT id, created_at, name, provider, model FROM chat_profiles WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let id: String = row.try_get("id")?;
            let created_at: String = row.try_get("created_at")?;
            Ok(ProfileRecord {
                id: decode_id(&id, "profile")?,
                created_at: decode_ts(&created_at, "profile")?,
                name: row.try_get("name")?,
                provider: row.try_get("provider")?,
                model: row.try_get("model")?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_store, message, new_chat};
    use crate::{Role, new_id};

    #[tokio::test]
    async fn message_roundtrip_preserves_all_fields() {
        let store = memory_store().await;
        let chat = new_chat(&store).await;

        let branch = new_id();
        let mut human = message(&chat, None, Role::Human, branch);
        human.content = "hello".into();
        store
            .insert_message(&human)
            .await
            .expect("message should insert");

        let mut assistant = message(&chat, Some(human.id), Role::Assistant, branch);
        assistant.content = "hi there".into();
        assistant.metadata = MessageMetadata {
            provider: Some("openai".into()),
            model: Some("gpt-4.1".into()),
        };
        store
            .insert_message(&assistant)
            .await
            .expect("message should insert");

        let loaded = store
            .message_by_id(assistant.id)
            .await
            .expect("lookup should succeed")
            .expect("message should exist");
        assert_eq!(loaded.parent_id, Some(human.id));
        assert_eq!(loaded.role, Role::Assistant);
        assert_eq!(loaded.content, "hi there");
        assert_eq!(loaded.branch, branch);
        assert_eq!(loaded.metadata.provider.as_deref(), Some("openai"));
        assert_eq!(loaded.created_at, assistant.created_at);
    }

    #[tokio::test]
    async fn latest_lookups_order_by_created_at_then_id() {
        let store = memory_store().await;
        let chat = new_chat(&store).await;
        let branch_a = new_id();
        let branch_b = new_id();

        let first = message(&chat, None, Role::Human, branch_a);
        store.insert_message(&first).await.expect("insert");

        // Same timestamp as `first`, larger id: id descending breaks the tie.
        let mut second = message(&chat, Some(first.id), Role::Assistant, branch_b);
        second.created_at = first.created_at;
        store.insert_message(&second).await.expect("insert");

        let latest = store
            .latest_in_chat(chat.id)
            .await
            .expect("lookup should succeed")
            .expect("chat should have messages");
        assert_eq!(latest.id, second.id.max(first.id));

        let latest_a = store
            .latest_in_branch(chat.id, branch_a)
            .await
            .expect("lookup should succeed")
            .expect("branch should have messages");
        assert_eq!(latest_a.id, first.id);
    }

    #[tokio::test]
    async fn branches_under_orders_most_recent_fork_first() {
        let store = memory_store().await;
        let chat = new_chat(&store).await;
        let parent = message(&chat, None, Role::Human, new_id());
        store.insert_message(&parent).await.expect("insert");

        let old_branch = new_id();
        let mut old_child = message(&chat, Some(parent.id), Role::Assistant, old_branch);
        old_child.created_at -= chrono::Duration::seconds(60);
        store.insert_message(&old_child).await.expect("insert");

        let new_branch = new_id();
        let new_child = message(&chat, Some(parent.id), Role::Assistant, new_branch);
        store.insert_message(&new_child).await.expect("insert");

        let branches = store
            .branches_under(parent.id)
            .await
            .expect("aggregation should succeed");
        let ids: Vec<_> = branches.iter().map(|b| b.branch).collect();
        assert_eq!(ids, vec![new_branch, old_branch]);
    }

    #[tokio::test]
    async fn delete_chat_cascades_to_messages() {
        let store = memory_store().await;
        let chat = new_chat(&store).await;
        let root = message(&chat, None, Role::Human, new_id());
        store.insert_message(&root).await.expect("insert");

        assert!(store.delete_chat(chat.id).await.expect("delete"));
        assert!(
            store
                .message_by_id(root.id)
                .await
                .expect("lookup should succeed")
                .is_none(),
            "messages should be deleted with their chat"
        );
        assert!(
            !store.delete_chat(chat.id).await.expect("second delete"),
            "deleting a missing chat should report false"
        );
    }

    #[tokio::test]
    async fn unknown_role_surfaces_as_integrity_fault() {
        let store = memory_store().await;
        let chat = new_chat(&store).await;
        let id = new_id();
        sqlx::query(
            "INSERT INTO chat_messages (id, created_at, chat_id, parent_id, role, content, branch) \
             VALUES (?, ?, ?, NULL, 'robot', 'x', ?)",
        )
        .bind(id.to_string())
        .bind(encode_ts(&chrono::Utc::now()))
        .bind(chat.id.to_string())
        .bind(new_id().to_string())
        .execute(store.pool())
        .await
        .expect("raw insert should succeed");

        let error = store
            .message_by_id(id)
            .await
            .expect_err("bad role should not decode");
        assert!(matches!(error, EngineError::DataIntegrity(_)));
    }
}

#[cfg(test)]
impl SqliteHistoryStore {
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
