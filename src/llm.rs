//! Model collaborator boundary.
//!
//! The engine only ever sees [`ModelClient`]: a streamed completion for
//! generations and a one-shot completion for title synthesis. The production
//! implementation lives in `llm::openai`; tests script their own.

pub mod manager;
pub mod openai;

pub use manager::LlmManager;
pub use openai::OpenAiCompatClient;

use crate::error::LlmError;
use crate::{BranchId, ChatId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// One message of model context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// One item of a streamed completion. Upstream faults arrive as `Error`
/// chunks so the stream itself stays infallible after it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCall(String),
    Error(String),
}

/// Per-call routing and cancellation context.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Chat the generation belongs to.
    pub resource_id: ChatId,
    /// Branch the generation is extending.
    pub thread_id: BranchId,
    /// `provider/model` selector from the profile driving this call.
    pub model: String,
    /// Caller-supplied cancellation, propagated into the transport.
    pub cancel: CancellationToken,
}

pub type ChunkStream = BoxStream<'static, StreamChunk>;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open a streamed completion over `history`. The stream ends at
    /// end-of-stream; mid-stream faults are surfaced as `Error` chunks.
    async fn stream(
        &self,
        history: Vec<ChatTurn>,
        opts: StreamOptions,
    ) -> Result<ChunkStream, LlmError>;

    /// One-shot completion, used for best-effort title synthesis.
    async fn generate(&self, history: Vec<ChatTurn>, model: &str) -> Result<String, LlmError>;
}
