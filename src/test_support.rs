//! Shared test fixtures: an in-memory store, record builders, and a scripted
//! model client.

use crate::llm::{ChatTurn, ChunkStream, ModelClient, StreamChunk, StreamOptions};
use crate::store::{ChatRecord, HistoryStore as _, MessageRecord, Role, SqliteHistoryStore};
use crate::{BranchId, MessageId, new_id};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound as _, Utc};
use futures::StreamExt as _;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::{Mutex, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Now, truncated to the store's microsecond timestamp precision so records
/// round-trip through the store unchanged.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Route traces through the test writer so failing tests show engine logs.
pub(crate) fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .try_init();
    });
}

/// Fresh in-memory store with migrations applied. A single connection keeps
/// every query on the same in-memory database.
pub(crate) async fn memory_store() -> SqliteHistoryStore {
    init_tracing();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database should open");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations should apply");
    SqliteHistoryStore::new(pool)
}

/// Insert and return a chat with a reserved root message id and no title.
pub(crate) async fn new_chat(store: &SqliteHistoryStore) -> ChatRecord {
    let chat = ChatRecord {
        id: new_id(),
        created_at: now(),
        title: None,
        root_message_id: new_id(),
        active_branches: Vec::new(),
    };
    store.insert_chat(&chat).await.expect("chat should insert");
    chat
}

/// Build an unpersisted message in `chat` with empty content. The first
/// parentless human message takes the chat's reserved root id.
pub(crate) fn message(
    chat: &ChatRecord,
    parent_id: Option<MessageId>,
    role: Role,
    branch: BranchId,
) -> MessageRecord {
    let id = if parent_id.is_none() && role == Role::Human {
        chat.root_message_id
    } else {
        new_id()
    };
    MessageRecord {
        id,
        created_at: now(),
        chat_id: chat.id,
        parent_id,
        role,
        content: String::new(),
        branch,
        metadata: Default::default(),
    }
}

/// Scripted model client. Each `stream` call pops the next chunk script;
/// `generate` always answers with the configured reply.
pub(crate) struct MockModel {
    scripts: Mutex<VecDeque<Vec<StreamChunk>>>,
    delay: Duration,
    reply: String,
}

impl MockModel {
    pub(crate) fn scripted(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            delay: Duration::ZERO,
            reply: "Scripted reply".into(),
        }
    }

    /// Pause before yielding each chunk, so tests can race cancellation
    /// against a stream in flight.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.into();
        self
    }
}

#[async_trait]
impl ModelClient for MockModel {
    async fn stream(
        &self,
        _history: Vec<ChatTurn>,
        _opts: StreamOptions,
    ) -> Result<ChunkStream, crate::error::LlmError> {
        let chunks = self
            .scripts
            .lock()
            .expect("script lock should not be poisoned")
            .pop_front()
            .unwrap_or_default();
        let delay = self.delay;
        Ok(Box::pin(futures::stream::iter(chunks).then(
            move |chunk| async move {
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                chunk
            },
        )))
    }

    async fn generate(
        &self,
        _history: Vec<ChatTurn>,
        _model: &str,
    ) -> Result<String, crate::error::LlmError> {
        Ok(self.reply.clone())
    }
}
