//! Persistence contract for chats, messages, and model profiles.
//!
//! The engine talks to storage exclusively through [`HistoryStore`], so the
//! SQLite implementation in `store::sqlite` can be swapped without touching
//! resolver or generation logic.

pub mod sqlite;

pub use sqlite::SqliteHistoryStore;

use crate::error::Result;
use crate::{BranchId, ChatId, MessageId, ProfileId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A chat row. `root_message_id` is reserved at creation time, before the
/// root message row exists; `active_branches` caches the last-viewed branch
/// path and is always recomputable from the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: ChatId,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub root_message_id: MessageId,
    pub active_branches: Vec<BranchId>,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Assistant => "assistant",
        }
    }
}

/// Provider/model attribution for assistant messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.provider.is_none() && self.model.is_none()
    }
}

/// A message row. `parent_id` is `None` only for the root; parent links form
/// a tree because ids are minted before linking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub chat_id: ChatId,
    pub parent_id: Option<MessageId>,
    pub role: Role,
    pub content: String,
    pub branch: BranchId,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

/// A model profile: which provider/model a generation should use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: ProfileId,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub provider: String,
    pub model: String,
}

/// One branch forked under a parent, with the creation time of its earliest
/// member (the fork moment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSummary {
    pub branch: BranchId,
    pub earliest_created_at: DateTime<Utc>,
}

/// Contract over persistence: point insert/lookup, latest-by-filter lookup,
/// and the children-grouped-by-branch aggregation the branch navigator needs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_chat(&self, chat: &ChatRecord) -> Result<()>;
    async fn chat_by_id(&self, id: ChatId) -> Result<Option<ChatRecord>>;
    /// Delete a chat and all of its messages. Returns false when the chat
    /// did not exist.
    async fn delete_chat(&self, id: ChatId) -> Result<bool>;
    async fn set_chat_title(&self, id: ChatId, title: &str) -> Result<()>;
    async fn set_active_branches(&self, id: ChatId, branches: &[BranchId]) -> Result<()>;

    async fn insert_message(&self, message: &MessageRecord) -> Result<()>;
    async fn message_by_id(&self, id: MessageId) -> Result<Option<MessageRecord>>;
    async fn message_count(&self, chat_id: ChatId) -> Result<i64>;
    /// Newest message in the chat, ties on `created_at` broken by id descending.
    async fn latest_in_chat(&self, chat_id: ChatId) -> Result<Option<MessageRecord>>;
    /// Newest message carrying the given branch id.
    async fn latest_in_branch(
        &self,
        chat_id: ChatId,
        branch: BranchId,
    ) -> Result<Option<MessageRecord>>;
    /// Branches forked directly under `parent_id`, ordered by each branch's
    /// earliest member `created_at` descending (most recent fork first).
    async fn branches_under(&self, parent_id: MessageId) -> Result<Vec<BranchSummary>>;

    async fn insert_profile(&self, profile: &ProfileRecord) -> Result<()>;
    async fn profile_by_id(&self, id: ProfileId) -> Result<Option<ProfileRecord>>;
}
