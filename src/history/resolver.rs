//! Active-path resolution and windowing.
//!
//! Given a chat and an optional branch hint, finds the anchor (newest message
//! on the requested timeline), walks parent links back to the root, and cuts
//! a window out of that path: count-based pages with opaque cursors, or
//! everything down to a specific message id.

use crate::error::{EngineError, Result};
use crate::history::cursor::PageCursor;
use crate::store::{HistoryStore, MessageRecord};
use crate::{BranchId, ChatId, MessageId};
use std::collections::HashSet;
use std::sync::Arc;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_LIMIT: i64 = 10;

/// Passing this as `limit` disables windowing entirely. Only meant for
/// model-context assembly, not for client paging.
pub const UNLIMITED: i64 = -1;

/// Window selection over the active path.
#[derive(Debug, Clone)]
pub struct WindowQuery {
    /// Branch hint: anchor on the newest message of this branch. Without a
    /// hint the anchor is the newest message overall. Cursor-based paging is
    /// only stable when the same hint is reused across pages.
    pub branch: Option<BranchId>,
    /// Page size, or [`UNLIMITED`].
    pub limit: i64,
    /// Only entries strictly older than this position qualify.
    pub cursor: Option<PageCursor>,
    /// Walk until this message id is included, then stop. Overrides `limit`
    /// and `cursor`.
    pub until_id: Option<MessageId>,
}

impl Default for WindowQuery {
    fn default() -> Self {
        Self {
            branch: None,
            limit: DEFAULT_PAGE_LIMIT,
            cursor: None,
            until_id: None,
        }
    }
}

/// A resolved window: messages in chronological order, every branch id seen
/// on the full active path, and the cursor for the next (older) page.
#[derive(Debug, Clone)]
pub struct Window {
    pub messages: Vec<MessageRecord>,
    pub active_branch_ids: Vec<BranchId>,
    pub next_cursor: Option<PageCursor>,
}

impl Window {
    fn empty() -> Self {
        Self {
            messages: Vec::new(),
            active_branch_ids: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Resolves windows over a chat's active path.
#[derive(Clone)]
pub struct HistoryResolver {
    store: Arc<dyn HistoryStore>,
}

impl HistoryResolver {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    pub async fn load_window(&self, chat_id: ChatId, query: WindowQuery) -> Result<Window> {
        let chat = self
            .store
            .chat_by_id(chat_id)
            .await?
            .ok_or(EngineError::NotFound("chat"))?;

        // The reserved root id may not exist as a row yet. An empty chat is
        // an empty window, not an error.
        if self.store.message_count(chat_id).await? == 0 {
            return Ok(Window::empty());
        }

        let anchor = match query.branch {
            Some(branch) => self.store.latest_in_branch(chat_id, branch).await?,
            None => None,
        };
        let anchor = match anchor {
            Some(anchor) => Some(anchor),
            None => self.store.latest_in_chat(chat_id).await?,
        };
        let anchor = match anchor {
            Some(anchor) => Some(anchor),
            None => self.store.message_by_id(chat.root_message_id).await?,
        };
        let Some(anchor) = anchor else {
            return Ok(Window::empty());
        };

        let path = self.walk_to_root(anchor).await?;

        let mut active_branch_ids = Vec::new();
        let mut seen_branches = HashSet::new();
        for message in &path {
            if seen_branches.insert(message.branch) {
                active_branch_ids.push(message.branch);
            }
        }

        // Windowing. `path` is newest-first here; reversed before returning.
        let mut next_cursor = None;
        let mut page: Vec<MessageRecord> = if let Some(until_id) = query.until_id {
            let mut out = Vec::new();
            for message in path {
                let id = message.id;
                out.push(message);
                if id == until_id {
                    break;
                }
            }
            out
        } else {
            // Cursors only apply to bounded pages; unlimited mode returns
            // the whole path.
            let cursor = if query.limit == UNLIMITED {
                None
            } else {
                query.cursor
            };
            let admitted = path.into_iter().filter(|message| {
                cursor
                    .map(|cursor| cursor.admits(message.created_at, message.id))
                    .unwrap_or(true)
            });
            let page: Vec<MessageRecord> = if query.limit == UNLIMITED {
                admitted.collect()
            } else {
                admitted.take(query.limit.max(0) as usize).collect()
            };

            // A next page exists only when this one came back full.
            if query.limit > 0 && page.len() == query.limit as usize {
                if let Some(oldest) = page.last() {
                    next_cursor = Some(PageCursor {
                        created_at: oldest.created_at,
                        id: oldest.id,
                    });
                }
            }
            page
        };

        page.reverse();
        Ok(Window {
            messages: page,
            active_branch_ids,
            next_cursor,
        })
    }

    /// Follow parent links from the anchor to the root. Returns the active
    /// path newest-first. A dangling parent pointer or a repeated id is a
    /// data-integrity fault, surfaced rather than truncated.
    async fn walk_to_root(&self, anchor: MessageRecord) -> Result<Vec<MessageRecord>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = anchor;

        loop {
            if !visited.insert(current.id) {
                tracing::error!(
                    chat_id = %current.chat_id,
                    message_id = %current.id,
                    "cycle detected in message ancestry"
                );
                return Err(EngineError::DataIntegrity(format!(
                    "cycle in message ancestry at {}",
                    current.id
                )));
            }

            let parent_id = current.parent_id;
            path.push(current);

            let Some(parent_id) = parent_id else {
                return Ok(path);
            };
            current = self
                .store
                .message_by_id(parent_id)
                .await?
                .ok_or_else(|| {
                    let child = path.last().map(|m| m.id).unwrap_or_default();
                    tracing::error!(
                        message_id = %child,
                        parent_id = %parent_id,
                        "message references a missing parent"
                    );
                    EngineError::DataIntegrity(format!(
                        "message {child} references missing parent {parent_id}"
                    ))
                })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_store, message, new_chat};
    use crate::{Role, new_id};
    use crate::store::SqliteHistoryStore;

    /// Seed a chat with a linear human/assistant path on one branch.
    /// Returns the chat and the messages in chronological order.
    async fn seed_linear(
        store: &Arc<SqliteHistoryStore>,
        pairs: usize,
    ) -> (crate::store::ChatRecord, Vec<MessageRecord>, BranchId) {
        let chat = new_chat(store.as_ref()).await;
        let branch = new_id();
        let mut all = Vec::new();
        let mut parent: Option<crate::MessageId> = None;
        for index in 0..pairs * 2 {
            let role = if index % 2 == 0 {
                Role::Human
            } else {
                Role::Assistant
            };
            let mut msg = message(&chat, parent, role, branch);
            msg.content = format!("message {index}");
            store.insert_message(&msg).await.expect("insert");
            parent = Some(msg.id);
            all.push(msg);
        }
        (chat, all, branch)
    }

    fn resolver(store: &Arc<SqliteHistoryStore>) -> HistoryResolver {
        HistoryResolver::new(store.clone() as Arc<dyn HistoryStore>)
    }

    #[tokio::test]
    async fn empty_chat_yields_empty_window() {
        let store = Arc::new(memory_store().await);
        let chat = new_chat(store.as_ref()).await;

        let window = resolver(&store)
            .load_window(chat.id, WindowQuery::default())
            .await
            .expect("empty chat should resolve");
        assert!(window.messages.is_empty());
        assert!(window.active_branch_ids.is_empty());
        assert!(window.next_cursor.is_none());
    }

    #[tokio::test]
    async fn missing_chat_is_not_found() {
        let store = Arc::new(memory_store().await);
        let error = resolver(&store)
            .load_window(new_id(), WindowQuery::default())
            .await
            .expect_err("unknown chat should fail");
        assert!(matches!(error, EngineError::NotFound("chat")));
    }

    #[tokio::test]
    async fn unlimited_window_returns_entire_path_chronologically() {
        let store = Arc::new(memory_store().await);
        let (chat, all, branch) = seed_linear(&store, 4).await;

        let window = resolver(&store)
            .load_window(
                chat.id,
                WindowQuery {
                    limit: UNLIMITED,
                    ..Default::default()
                },
            )
            .await
            .expect("window should resolve");

        let got: Vec<_> = window.messages.iter().map(|m| m.id).collect();
        let expected: Vec<_> = all.iter().map(|m| m.id).collect();
        assert_eq!(got, expected);
        assert_eq!(window.active_branch_ids, vec![branch]);
        assert!(window.next_cursor.is_none(), "unlimited mode never pages");
    }

    #[tokio::test]
    async fn concatenated_pages_reproduce_the_full_path() {
        let store = Arc::new(memory_store().await);
        let (chat, all, branch) = seed_linear(&store, 4).await;
        let resolver = resolver(&store);

        let mut collected = Vec::new();
        let mut cursor = None;
        loop {
            let window = resolver
                .load_window(
                    chat.id,
                    WindowQuery {
                        branch: Some(branch),
                        limit: 3,
                        cursor,
                        until_id: None,
                    },
                )
                .await
                .expect("page should resolve");
            if window.messages.is_empty() {
                assert!(window.next_cursor.is_none());
                break;
            }
            // Pages walk backwards in time; prepend to rebuild the path.
            let mut page = window.messages.clone();
            page.extend(collected);
            collected = page;
            match window.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let got: Vec<_> = collected.iter().map(|m| m.id).collect();
        let expected: Vec<_> = all.iter().map(|m| m.id).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn cursor_at_oldest_entry_returns_empty_page() {
        let store = Arc::new(memory_store().await);
        let (chat, all, branch) = seed_linear(&store, 2).await;

        let oldest = &all[0];
        let window = resolver(&store)
            .load_window(
                chat.id,
                WindowQuery {
                    branch: Some(branch),
                    limit: 10,
                    cursor: Some(PageCursor {
                        created_at: oldest.created_at,
                        id: oldest.id,
                    }),
                    until_id: None,
                },
            )
            .await
            .expect("window should resolve");
        assert!(window.messages.is_empty());
        assert!(window.next_cursor.is_none());
    }

    #[tokio::test]
    async fn partial_page_has_no_next_cursor() {
        let store = Arc::new(memory_store().await);
        let (chat, all, _) = seed_linear(&store, 2).await;

        let window = resolver(&store)
            .load_window(
                chat.id,
                WindowQuery {
                    limit: 99,
                    ..Default::default()
                },
            )
            .await
            .expect("window should resolve");
        assert_eq!(window.messages.len(), all.len());
        assert!(window.next_cursor.is_none());
    }

    #[tokio::test]
    async fn branch_hint_pins_the_anchor_across_forks() {
        let store = Arc::new(memory_store().await);
        let (chat, all, old_branch) = seed_linear(&store, 2).await;

        // Fork: regenerate the last assistant message onto a new branch.
        let fork_parent = &all[2];
        let new_branch = new_id();
        let mut alt = message(&chat, Some(fork_parent.id), Role::Assistant, new_branch);
        alt.content = "alternate".into();
        store.insert_message(&alt).await.expect("insert");

        let resolver = resolver(&store);

        // Old branch hint: the original path, fork branch not visible.
        let window = resolver
            .load_window(
                chat.id,
                WindowQuery {
                    branch: Some(old_branch),
                    limit: UNLIMITED,
                    ..Default::default()
                },
            )
            .await
            .expect("window should resolve");
        let got: Vec<_> = window.messages.iter().map(|m| m.id).collect();
        let expected: Vec<_> = all.iter().map(|m| m.id).collect();
        assert_eq!(got, expected);
        assert_eq!(window.active_branch_ids, vec![old_branch]);

        // No hint: anchor is the newest message overall — the fork.
        let window = resolver
            .load_window(
                chat.id,
                WindowQuery {
                    limit: UNLIMITED,
                    ..Default::default()
                },
            )
            .await
            .expect("window should resolve");
        let got: Vec<_> = window.messages.iter().map(|m| m.id).collect();
        let expected: Vec<_> = vec![all[0].id, all[1].id, all[2].id, alt.id];
        assert_eq!(got, expected);
        assert_eq!(window.active_branch_ids, vec![new_branch, old_branch]);
    }

    #[tokio::test]
    async fn until_id_stops_after_including_the_target() {
        let store = Arc::new(memory_store().await);
        let (chat, all, branch) = seed_linear(&store, 3).await;

        let window = resolver(&store)
            .load_window(
                chat.id,
                WindowQuery {
                    branch: Some(branch),
                    until_id: Some(all[2].id),
                    ..Default::default()
                },
            )
            .await
            .expect("window should resolve");

        let got: Vec<_> = window.messages.iter().map(|m| m.id).collect();
        let expected: Vec<_> = all[2..].iter().map(|m| m.id).collect();
        assert_eq!(got, expected, "walk stops once the target id is included");
        assert!(window.next_cursor.is_none(), "until-id mode never pages");
    }

    #[tokio::test]
    async fn unlimited_mode_ignores_cursors() {
        let store = Arc::new(memory_store().await);
        let (chat, all, branch) = seed_linear(&store, 3).await;

        let oldest = &all[0];
        let window = resolver(&store)
            .load_window(
                chat.id,
                WindowQuery {
                    branch: Some(branch),
                    limit: UNLIMITED,
                    cursor: Some(PageCursor {
                        created_at: oldest.created_at,
                        id: oldest.id,
                    }),
                    until_id: None,
                },
            )
            .await
            .expect("window should resolve");
        assert_eq!(
            window.messages.len(),
            all.len(),
            "a stale cursor must not truncate the unbounded path"
        );
    }

    #[tokio::test]
    async fn parent_cycle_is_an_integrity_fault() {
        let store = Arc::new(memory_store().await);
        let chat = new_chat(store.as_ref()).await;
        let branch = new_id();

        // Two messages pointing at each other as parents.
        let mut first = message(&chat, None, Role::Human, branch);
        first.content = "chicken".into();
        let mut second = message(&chat, Some(first.id), Role::Assistant, branch);
        second.content = "egg".into();
        first.parent_id = Some(second.id);
        store.insert_message(&first).await.expect("insert");
        store.insert_message(&second).await.expect("insert");

        let error = resolver(&store)
            .load_window(chat.id, WindowQuery::default())
            .await
            .expect_err("a cycle must fail instead of walking forever");
        assert!(matches!(error, EngineError::DataIntegrity(_)));
    }

    #[tokio::test]
    async fn dangling_parent_is_an_integrity_fault() {
        let store = Arc::new(memory_store().await);
        let chat = new_chat(store.as_ref()).await;
        let branch = new_id();

        let mut orphan = message(&chat, Some(new_id()), Role::Human, branch);
        orphan.content = "my parent never existed".into();
        store.insert_message(&orphan).await.expect("insert");

        let error = resolver(&store)
            .load_window(chat.id, WindowQuery::default())
            .await
            .expect_err("dangling parent must not be silently truncated");
        assert!(matches!(error, EngineError::DataIntegrity(_)));
    }
}
