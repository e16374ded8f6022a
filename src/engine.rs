//! Engine facade: the operations callers see.
//!
//! Every streaming operation validates structurally first (missing rows,
//! wrong roles), then spawns the generation and hands back the event
//! receiver. Once streaming starts, faults are absorbed into the persisted
//! message rather than surfaced — see `generation`.

use crate::config::EngineTunables;
use crate::error::{EngineError, Result};
use crate::generation::{ActiveGenerations, ChatEvent, GenerationCoordinator, TerminalState};
use crate::history::branches::BranchNavigator;
use crate::history::cursor::PageCursor;
use crate::history::resolver::{HistoryResolver, UNLIMITED, WindowQuery};
use crate::llm::{ChatTurn, ModelClient, TurnRole};
use crate::store::{
    ChatRecord, HistoryStore, MessageMetadata, MessageRecord, ProfileRecord, Role,
};
use crate::{BranchId, ChatId, MessageId, ProfileId, new_id};
use chrono::Utc;
use regex::Regex;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 64;

const TITLE_PROMPT: &str = "SYSTEM INSTRUCTION:\nGenerate a concise title for this conversation. Reply with only the title, avoiding special characters, formatting, or prefixes like 'A conversation...'. Maximum length: 100 characters.";

static THINK_BLOCKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("pattern is valid"));
static TITLE_CHARSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^[a-z0-9\s'":,.-]+$"#).expect("pattern is valid"));

/// Query parameters for [`ChatEngine::list_messages`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub branch: Option<BranchId>,
    /// 1..=99, or -1 for the whole path. Defaults to the engine's page limit.
    pub limit: Option<i64>,
    /// Opaque cursor from a previous page's `next_cursor`.
    pub cursor: Option<String>,
    pub until_id: Option<MessageId>,
}

/// One page of the active path, with encoded continuation cursor.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub data: Vec<MessageRecord>,
    pub active_branches: Vec<BranchId>,
    pub next_cursor: Option<String>,
}

/// Facade over store, resolver, and generation coordinator.
#[derive(Clone)]
pub struct ChatEngine {
    store: Arc<dyn HistoryStore>,
    model: Arc<dyn ModelClient>,
    registry: ActiveGenerations,
    tunables: EngineTunables,
}

impl ChatEngine {
    pub fn new(store: Arc<dyn HistoryStore>, model: Arc<dyn ModelClient>) -> Self {
        Self {
            store,
            model,
            registry: ActiveGenerations::new(),
            tunables: EngineTunables::default(),
        }
    }

    pub fn with_tunables(mut self, tunables: EngineTunables) -> Self {
        self.tunables = tunables;
        self
    }

    fn resolver(&self) -> HistoryResolver {
        HistoryResolver::new(self.store.clone())
    }

    fn coordinator(&self) -> GenerationCoordinator {
        GenerationCoordinator::new(self.store.clone(), self.registry.clone())
    }

    /// Create an untitled chat with a reserved root message id.
    pub async fn create_chat(&self) -> Result<ChatRecord> {
        let chat = ChatRecord {
            id: new_id(),
            created_at: Utc::now(),
            title: None,
            root_message_id: new_id(),
            active_branches: Vec::new(),
        };
        self.store.insert_chat(&chat).await?;
        Ok(chat)
    }

    /// Delete a chat and all of its messages.
    pub async fn delete_chat(&self, chat_id: ChatId) -> Result<()> {
        if self.store.delete_chat(chat_id).await? {
            Ok(())
        } else {
            Err(EngineError::NotFound("chat"))
        }
    }

    pub async fn create_profile(
        &self,
        name: &str,
        provider: &str,
        model: &str,
    ) -> Result<ProfileRecord> {
        let profile = ProfileRecord {
            id: new_id(),
            created_at: Utc::now(),
            name: name.to_owned(),
            provider: provider.to_owned(),
            model: model.to_owned(),
        };
        self.store.insert_profile(&profile).await?;
        Ok(profile)
    }

    /// Append a human message and stream the assistant's reply.
    ///
    /// The first human message of a chat takes the chat's reserved root id.
    /// The branch is inherited from the parent, or freshly minted when there
    /// is no parent.
    pub async fn send_message(
        &self,
        chat_id: ChatId,
        content: String,
        profile_id: ProfileId,
        parent_id: Option<MessageId>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let chat = self
            .store
            .chat_by_id(chat_id)
            .await?
            .ok_or(EngineError::NotFound("chat"))?;
        let profile = self
            .store
            .profile_by_id(profile_id)
            .await?
            .ok_or(EngineError::NotFound("profile"))?;
        let parent = match parent_id {
            Some(parent_id) => Some(
                self.store
                    .message_by_id(parent_id)
                    .await?
                    .ok_or(EngineError::NotFound("parent message"))?,
            ),
            None => None,
        };
        let message_count = self.store.message_count(chat_id).await?;

        let branch = parent.as_ref().map(|p| p.branch).unwrap_or_else(new_id);
        let human = MessageRecord {
            id: if message_count == 0 {
                chat.root_message_id
            } else {
                new_id()
            },
            created_at: Utc::now(),
            chat_id,
            parent_id: parent.as_ref().map(|p| p.id),
            role: Role::Human,
            content,
            branch,
            metadata: MessageMetadata::default(),
        };
        let assistant = assistant_placeholder(&profile, chat_id, human.id, branch);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine
                .run_send(chat, profile, human, assistant, cancel, tx)
                .await
            {
                tracing::error!(%error, chat_id = %chat_id, "send generation failed");
            }
        });
        Ok(rx)
    }

    async fn run_send(
        &self,
        chat: ChatRecord,
        profile: ProfileRecord,
        human: MessageRecord,
        assistant: MessageRecord,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let _ = tx.send(ChatEvent::PushMessage(human.clone())).await;
        self.store.insert_message(&human).await?;
        let _ = tx.send(ChatEvent::PushMessage(assistant.clone())).await;

        let window = self
            .resolver()
            .load_window(
                chat.id,
                WindowQuery {
                    branch: Some(human.branch),
                    limit: self.tunables.context_depth,
                    ..Default::default()
                },
            )
            .await?;
        let history = context_turns(&window.messages);

        let selector = model_selector(&profile);
        let outcome = self
            .coordinator()
            .run(
                self.model.as_ref(),
                assistant,
                history.clone(),
                selector.clone(),
                cancel,
                &tx,
            )
            .await?;

        if outcome.state == TerminalState::Finished && chat.title.is_none() {
            self.synthesize_title(&chat, history, &outcome.message, &selector, &tx)
                .await;
        }
        Ok(())
    }

    /// Regenerate an assistant message: fork a fresh branch at its parent
    /// and stream a new reply there. The original stays retrievable on its
    /// own branch.
    pub async fn regenerate(
        &self,
        message_id: MessageId,
        profile_id: ProfileId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let source = self
            .store
            .message_by_id(message_id)
            .await?
            .ok_or(EngineError::NotFound("message"))?;
        let profile = self
            .store
            .profile_by_id(profile_id)
            .await?
            .ok_or(EngineError::NotFound("profile"))?;
        if source.role != Role::Assistant {
            return Err(EngineError::InvalidState(
                "cannot regenerate a non-assistant message".into(),
            ));
        }
        let parent_id = source
            .parent_id
            .ok_or(EngineError::NotFound("parent message"))?;
        let parent = self
            .store
            .message_by_id(parent_id)
            .await?
            .ok_or(EngineError::NotFound("parent message"))?;

        let branch = new_id();
        let assistant = assistant_placeholder(&profile, source.chat_id, parent.id, branch);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            let chat_id = source.chat_id;
            if let Err(error) = engine
                .run_regenerate(source, parent, assistant, cancel, tx)
                .await
            {
                tracing::error!(%error, chat_id = %chat_id, "regenerate failed");
            }
        });
        Ok(rx)
    }

    async fn run_regenerate(
        &self,
        source: MessageRecord,
        parent: MessageRecord,
        assistant: MessageRecord,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let _ = tx.send(ChatEvent::TruncateAfter(parent.id)).await;
        let _ = tx.send(ChatEvent::PushMessage(assistant.clone())).await;

        // Context is the source branch's path up to and including the fork
        // point, bounded by the context depth.
        let window = self
            .resolver()
            .load_window(
                source.chat_id,
                WindowQuery {
                    branch: Some(source.branch),
                    limit: UNLIMITED,
                    ..Default::default()
                },
            )
            .await?;
        let end = window
            .messages
            .iter()
            .position(|m| m.id == parent.id)
            .map(|index| index + 1)
            .unwrap_or(window.messages.len());
        let history = context_turns(tail(&window.messages[..end], self.tunables.context_depth));

        let branch = assistant.branch;
        let profile_selector = selector_from_metadata(&assistant.metadata);
        self.coordinator()
            .run(
                self.model.as_ref(),
                assistant,
                history,
                profile_selector,
                cancel,
                &tx,
            )
            .await?;

        self.switch_active_branch(source.chat_id, branch, &tx).await
    }

    /// Edit a human message: fork a fresh branch at the original's parent
    /// with the new content, then stream a reply to it.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        new_content: String,
        profile_id: ProfileId,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let source = self
            .store
            .message_by_id(message_id)
            .await?
            .ok_or(EngineError::NotFound("message"))?;
        let profile = self
            .store
            .profile_by_id(profile_id)
            .await?
            .ok_or(EngineError::NotFound("profile"))?;
        if source.role != Role::Human {
            return Err(EngineError::InvalidState(
                "cannot edit a non-human message".into(),
            ));
        }
        let parent = match source.parent_id {
            Some(parent_id) => Some(self.store.message_by_id(parent_id).await?.ok_or_else(
                || {
                    EngineError::DataIntegrity(format!(
                        "message {} references missing parent {parent_id}",
                        source.id
                    ))
                },
            )?),
            None => None,
        };

        let branch = new_id();
        let human = MessageRecord {
            id: new_id(),
            created_at: Utc::now(),
            chat_id: source.chat_id,
            parent_id: parent.as_ref().map(|p| p.id),
            role: Role::Human,
            content: new_content,
            branch,
            metadata: MessageMetadata::default(),
        };
        let assistant = assistant_placeholder(&profile, source.chat_id, human.id, branch);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.clone();
        tokio::spawn(async move {
            let chat_id = source.chat_id;
            if let Err(error) = engine
                .run_edit(source.id, human, assistant, cancel, tx)
                .await
            {
                tracing::error!(%error, chat_id = %chat_id, "edit failed");
            }
        });
        Ok(rx)
    }

    async fn run_edit(
        &self,
        edited_id: MessageId,
        human: MessageRecord,
        assistant: MessageRecord,
        cancel: CancellationToken,
        tx: mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let _ = tx.send(ChatEvent::TruncateSince(edited_id)).await;
        let _ = tx.send(ChatEvent::PushMessage(human.clone())).await;
        self.store.insert_message(&human).await?;
        let _ = tx.send(ChatEvent::PushMessage(assistant.clone())).await;

        // The new branch already holds the replacement human message, so its
        // window is the edited path.
        let window = self
            .resolver()
            .load_window(
                human.chat_id,
                WindowQuery {
                    branch: Some(human.branch),
                    limit: self.tunables.context_depth,
                    ..Default::default()
                },
            )
            .await?;
        let history = context_turns(&window.messages);

        let branch = assistant.branch;
        let profile_selector = selector_from_metadata(&assistant.metadata);
        self.coordinator()
            .run(
                self.model.as_ref(),
                assistant,
                history,
                profile_selector,
                cancel,
                &tx,
            )
            .await?;

        self.switch_active_branch(human.chat_id, branch, &tx).await
    }

    /// Abort an in-flight generation by its assistant message id.
    pub async fn abort_generation(&self, assistant_message_id: MessageId) -> Result<()> {
        if self.registry.remove(assistant_message_id).await {
            Ok(())
        } else {
            Err(EngineError::NotFound("active generation"))
        }
    }

    /// One page of the active path, oldest-first, with an opaque cursor for
    /// the next (older) page.
    pub async fn list_messages(&self, chat_id: ChatId, query: ListQuery) -> Result<MessagePage> {
        let limit = query.limit.unwrap_or(self.tunables.default_page_limit);
        if limit != UNLIMITED && !(1..=99).contains(&limit) {
            return Err(EngineError::InvalidState(
                "limit must be between 1 and 99, or -1".into(),
            ));
        }
        let cursor = query
            .cursor
            .as_deref()
            .map(PageCursor::decode)
            .transpose()?;

        let window = self
            .resolver()
            .load_window(
                chat_id,
                WindowQuery {
                    branch: query.branch,
                    limit,
                    cursor,
                    until_id: query.until_id,
                },
            )
            .await?;
        Ok(MessagePage {
            data: window.messages,
            active_branches: window.active_branch_ids,
            next_cursor: window.next_cursor.map(|cursor| cursor.encode()),
        })
    }

    /// Branches forked under a message, newest first.
    pub async fn sibling_branches(&self, message_id: MessageId) -> Result<Vec<BranchId>> {
        BranchNavigator::new(self.store.clone())
            .sibling_branches(message_id)
            .await
    }

    /// Recompute and persist the chat's active branch path, then announce
    /// the switch.
    async fn switch_active_branch(
        &self,
        chat_id: ChatId,
        branch: BranchId,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let window = self
            .resolver()
            .load_window(
                chat_id,
                WindowQuery {
                    branch: Some(branch),
                    limit: 1,
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .set_active_branches(chat_id, &window.active_branch_ids)
            .await?;
        let _ = tx.send(ChatEvent::SwitchBranch(branch)).await;
        Ok(())
    }

    /// Best-effort title synthesis after the first finished exchange. Any
    /// failure is logged and swallowed.
    async fn synthesize_title(
        &self,
        chat: &ChatRecord,
        mut history: Vec<ChatTurn>,
        assistant: &MessageRecord,
        selector: &str,
        tx: &mpsc::Sender<ChatEvent>,
    ) {
        history.push(ChatTurn {
            role: TurnRole::Assistant,
            content: assistant.content.clone(),
        });
        history.push(ChatTurn {
            role: TurnRole::User,
            content: TITLE_PROMPT.into(),
        });

        match self.model.generate(history, selector).await {
            Ok(raw) => match sanitize_title(&raw) {
                Some(title) => {
                    let _ = tx.send(ChatEvent::SetTitle(title.clone())).await;
                    if let Err(error) = self.store.set_chat_title(chat.id, &title).await {
                        tracing::warn!(%error, chat_id = %chat.id, "failed to persist chat title");
                    }
                }
                None => {
                    tracing::debug!(chat_id = %chat.id, "synthesized title failed validation");
                }
            },
            Err(error) => {
                tracing::warn!(%error, chat_id = %chat.id, "title synthesis failed");
            }
        }
    }
}

fn assistant_placeholder(
    profile: &ProfileRecord,
    chat_id: ChatId,
    parent_id: MessageId,
    branch: BranchId,
) -> MessageRecord {
    MessageRecord {
        id: new_id(),
        created_at: Utc::now(),
        chat_id,
        parent_id: Some(parent_id),
        role: Role::Assistant,
        content: String::new(),
        branch,
        metadata: MessageMetadata {
            provider: Some(profile.provider.clone()),
            model: Some(profile.model.clone()),
        },
    }
}

fn model_selector(profile: &ProfileRecord) -> String {
    format!("{}/{}", profile.provider, profile.model)
}

fn selector_from_metadata(metadata: &MessageMetadata) -> String {
    match (&metadata.provider, &metadata.model) {
        (Some(provider), Some(model)) => format!("{provider}/{model}"),
        (_, Some(model)) => model.clone(),
        _ => String::new(),
    }
}

fn context_turns(messages: &[MessageRecord]) -> Vec<ChatTurn> {
    messages
        .iter()
        .map(|message| ChatTurn {
            role: match message.role {
                Role::Human => TurnRole::User,
                Role::Assistant => TurnRole::Assistant,
            },
            content: message.content.clone(),
        })
        .collect()
}

fn tail(messages: &[MessageRecord], depth: i64) -> &[MessageRecord] {
    if depth > 0 {
        &messages[messages.len().saturating_sub(depth as usize)..]
    } else {
        messages
    }
}

/// Strip think blocks and validate the model's title suggestion.
fn sanitize_title(raw: &str) -> Option<String> {
    let title = THINK_BLOCKS.replace_all(raw, "").trim().to_string();
    let lower = title.to_lowercase();
    if title.is_empty()
        || title.chars().count() > 100
        || lower.starts_with("a conversation")
        || lower.starts_with("conversation of")
        || !TITLE_CHARSET.is_match(&title)
    {
        return None;
    }
    Some(title)
}
