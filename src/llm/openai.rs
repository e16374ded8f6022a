//! Streaming model client for OpenAI-compatible chat completion APIs.
//!
//! Opens a `chat/completions` request with `stream: true` and relays SSE
//! deltas through a channel. Transport faults after the stream opens become
//! `StreamChunk::Error` items so the caller's delta loop can fold them into
//! the generation instead of tearing it down.

use crate::error::LlmError;
use crate::llm::{ChatTurn, ChunkStream, LlmManager, ModelClient, StreamChunk, StreamOptions};
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct OpenAiCompatClient {
    manager: Arc<LlmManager>,
}

impl OpenAiCompatClient {
    pub fn new(manager: Arc<LlmManager>) -> Self {
        Self { manager }
    }
}

fn messages_payload(history: &[ChatTurn]) -> Vec<serde_json::Value> {
    history
        .iter()
        .map(|turn| {
            serde_json::json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            })
        })
        .collect()
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    async fn stream(
        &self,
        history: Vec<ChatTurn>,
        opts: StreamOptions,
    ) -> Result<ChunkStream, LlmError> {
        let (provider, model) = self.manager.resolve_model(&opts.model);
        let api_key = self.manager.get_api_key(&provider)?;
        let base_url = self.manager.get_base_url(&provider)?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let payload = serde_json::json!({
            "model": model,
            "messages": messages_payload(&history),
            "stream": true,
        });

        tracing::debug!(
            %url,
            model = %model,
            chat_id = %opts.resource_id,
            branch = %opts.thread_id,
            "opening model stream"
        );

        let response = self
            .manager
            .http_client()
            .post(&url)
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(16);
        tokio::spawn(process_sse(
            response.bytes_stream(),
            tx,
            opts.cancel.clone(),
        ));

        Ok(Box::pin(futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }

    async fn generate(&self, history: Vec<ChatTurn>, model: &str) -> Result<String, LlmError> {
        let (provider, model) = self.manager.resolve_model(model);
        let api_key = self.manager.get_api_key(&provider)?;
        let base_url = self.manager.get_base_url(&provider)?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let payload = serde_json::json!({
            "model": model,
            "messages": messages_payload(&history),
            "stream": false,
        });

        let response = self
            .manager
            .http_client()
            .post(&url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, body });
        }

        let body: serde_json::Value = response.json().await?;
        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(str::to_owned)
            .ok_or_else(|| LlmError::Stream("completion response had no content".into()))
    }
}

/// Relay SSE events as stream chunks until end-of-stream, `[DONE]`, a
/// transport fault, or cancellation.
async fn process_sse<S>(stream: S, tx: mpsc::Sender<StreamChunk>, cancel: CancellationToken)
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            // Stream closed gracefully without [DONE].
            return;
        };
        let event = match event {
            Ok(event) => event,
            Err(error) => {
                let _ = tx.send(StreamChunk::Error(error.to_string())).await;
                return;
            }
        };

        if event.data.trim() == "[DONE]" {
            return;
        }

        let Ok(chunk) = serde_json::from_str::<serde_json::Value>(&event.data) else {
            continue;
        };
        let delta = chunk
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("delta"));

        if let Some(content) = delta
            .and_then(|delta| delta.get("content"))
            .and_then(|content| content.as_str())
            && !content.is_empty()
            && tx
                .send(StreamChunk::TextDelta(content.to_string()))
                .await
                .is_err()
        {
            return;
        }

        if let Some(name) = delta
            .and_then(|delta| delta.get("tool_calls"))
            .and_then(|calls| calls.get(0))
            .and_then(|call| call.get("function"))
            .and_then(|function| function.get("name"))
            .and_then(|name| name.as_str())
            && tx.send(StreamChunk::ToolCall(name.to_string())).await.is_err()
        {
            return;
        }
    }
}
