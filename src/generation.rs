//! Generation lifecycle: placeholder, streaming, cancellation, terminal
//! persistence.
//!
//! One coordinator run drives one streamed model response, identified by its
//! assistant message id. Whatever happens mid-stream — normal end, upstream
//! fault, caller cancellation, or abort via the registry — exactly one
//! assistant message with non-empty content is persisted at the end, and the
//! id leaves the registry.

pub mod registry;

pub use registry::ActiveGenerations;

use crate::error::Result;
use crate::llm::{ChatTurn, ModelClient, StreamChunk, StreamOptions};
use crate::store::{HistoryStore, MessageRecord};
use crate::{BranchId, MessageId};
use futures::StreamExt as _;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Marker appended to a generation that was stopped before the stream ended.
pub const STREAM_STOPPED_MARKER: &str = "_Stream stopped._";

/// Events relayed to the client while an operation runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A new message entered the timeline (human or assistant placeholder).
    PushMessage(MessageRecord),
    /// Streamed content to append to a message.
    AppendChunk {
        message_id: MessageId,
        chunk: String,
    },
    /// The model invoked a tool; carries the tool name, never touches content.
    ToolInvoke(String),
    /// A title was synthesized for the chat.
    SetTitle(String),
    /// Drop the rendered timeline after this message id (regenerate).
    TruncateAfter(MessageId),
    /// Drop the rendered timeline from this message id onward (edit).
    TruncateSince(MessageId),
    /// The active timeline moved to this branch.
    SwitchBranch(BranchId),
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Finished,
    Errored,
    Cancelled,
}

/// The persisted result of one generation attempt.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub state: TerminalState,
    pub message: MessageRecord,
}

/// Append `block` to `content` with a visual separator when content already
/// exists.
fn append_block(content: &mut String, block: &str) {
    if !content.is_empty() {
        content.push_str("\n---\n\n");
    }
    content.push_str(block);
    content.push('\n');
}

fn error_block(message: &str) -> String {
    format!("> **Error:** {message}")
}

/// Drives one streamed generation to a terminal state.
#[derive(Clone)]
pub struct GenerationCoordinator {
    store: Arc<dyn HistoryStore>,
    registry: ActiveGenerations,
}

impl GenerationCoordinator {
    pub fn new(store: Arc<dyn HistoryStore>, registry: ActiveGenerations) -> Self {
        Self { store, registry }
    }

    /// Stream a model response into `assistant` (an unpersisted placeholder
    /// with empty content) and persist the terminal message.
    ///
    /// Event sends are best-effort: a client that stopped listening must not
    /// prevent terminal persistence. The final insert runs after the delta
    /// loop, outside any select with the cancel signal, so it is never
    /// interrupted by cancellation.
    pub async fn run(
        &self,
        model: &dyn ModelClient,
        mut assistant: MessageRecord,
        history: Vec<ChatTurn>,
        model_selector: String,
        cancel: CancellationToken,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<GenerationOutcome> {
        let generation_id = assistant.id;
        self.registry.insert(generation_id).await;

        let opts = StreamOptions {
            resource_id: assistant.chat_id,
            thread_id: assistant.branch,
            model: model_selector,
            cancel: cancel.clone(),
        };

        let mut cancelled = false;
        let mut errored = false;

        let stream = match model.stream(history, opts).await {
            Ok(stream) => Some(stream),
            Err(error) => {
                tracing::warn!(
                    %error,
                    generation_id = %generation_id,
                    "model stream failed to open"
                );
                let block = error_block(&error.to_string());
                append_block(&mut assistant.content, &block);
                let _ = events
                    .send(ChatEvent::AppendChunk {
                        message_id: generation_id,
                        chunk: block,
                    })
                    .await;
                errored = true;
                None
            }
        };

        if let Some(mut stream) = stream {
            while let Some(chunk) = stream.next().await {
                // Cancellation is polled once per received delta: both the
                // caller's signal and external registry removal converge on
                // the cancelled terminal state with bounded latency.
                if cancel.is_cancelled() || !self.registry.contains(generation_id).await {
                    cancelled = true;
                    break;
                }

                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        assistant.content.push_str(&delta);
                        let _ = events
                            .send(ChatEvent::AppendChunk {
                                message_id: generation_id,
                                chunk: delta,
                            })
                            .await;
                    }
                    StreamChunk::ToolCall(name) => {
                        let _ = events.send(ChatEvent::ToolInvoke(name)).await;
                    }
                    StreamChunk::Error(message) => {
                        tracing::warn!(
                            generation_id = %generation_id,
                            error = %message,
                            "model stream fault absorbed into generation"
                        );
                        let block = error_block(&message);
                        append_block(&mut assistant.content, &block);
                        let _ = events
                            .send(ChatEvent::AppendChunk {
                                message_id: generation_id,
                                chunk: block,
                            })
                            .await;
                        errored = true;
                    }
                }
            }
        }

        let state = if cancelled {
            TerminalState::Cancelled
        } else if errored {
            TerminalState::Errored
        } else {
            TerminalState::Finished
        };

        // Terminal content is never empty: cancelled generations carry the
        // stop marker, and so does a stream that ended without producing
        // anything.
        if cancelled || assistant.content.is_empty() {
            append_block(&mut assistant.content, STREAM_STOPPED_MARKER);
        }

        self.registry.remove(generation_id).await;
        self.store.insert_message(&assistant).await?;

        tracing::debug!(
            generation_id = %generation_id,
            state = ?state,
            content_len = assistant.content.len(),
            "generation persisted"
        );

        Ok(GenerationOutcome {
            state,
            message: assistant,
        })
    }
}
