//! Branch navigation: which alternate timelines hang off a message.

use crate::error::{EngineError, Result};
use crate::store::HistoryStore;
use crate::{BranchId, MessageId};
use std::sync::Arc;

/// Enumerates sibling branches forked under a message.
#[derive(Clone)]
pub struct BranchNavigator {
    store: Arc<dyn HistoryStore>,
}

impl BranchNavigator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// All branches whose first member is a direct child of `message_id`,
    /// most recently created first — the newest regeneration is the default
    /// suggestion.
    pub async fn sibling_branches(&self, message_id: MessageId) -> Result<Vec<BranchId>> {
        self.store
            .message_by_id(message_id)
            .await?
            .ok_or(EngineError::NotFound("message"))?;

        let branches = self.store.branches_under(message_id).await?;
        Ok(branches.into_iter().map(|summary| summary.branch).collect())
    }
}
