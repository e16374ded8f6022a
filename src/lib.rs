//! Branching conversational history engine.
//!
//! Maintains a tree-shaped, replayable chat history between a user and a
//! language-model assistant. Any point in history can be regenerated or
//! edited without losing alternate timelines, and streamed model output is
//! relayed incrementally with cancellation that always leaves a persisted
//! terminal message behind.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod generation;
pub mod history;
pub mod llm;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use uuid::Uuid;

/// Identifier of a chat.
pub type ChatId = Uuid;
/// Identifier of a single message in a chat's tree.
pub type MessageId = Uuid;
/// Identifier grouping messages created by one operation; forks happen
/// where children of a parent span different branch values.
pub type BranchId = Uuid;
/// Identifier of a model profile (provider + model selection).
pub type ProfileId = Uuid;

pub use engine::{ChatEngine, ListQuery, MessagePage};
pub use error::{EngineError, LlmError, Result};
pub use generation::{ActiveGenerations, ChatEvent};
pub use history::{PageCursor, Window, WindowQuery};
pub use store::{ChatRecord, HistoryStore, MessageRecord, ProfileRecord, Role, SqliteHistoryStore};

/// Mint a fresh identifier. UUIDv7 so ids are time-ordered and ties on
/// equal timestamps can be broken by comparing ids.
pub(crate) fn new_id() -> Uuid {
    Uuid::now_v7()
}
