//! Process-wide registry of in-flight generations.
//!
//! Holds only assistant message ids. Removal is how aborts are signalled:
//! the coordinator polls membership once per received delta, so an external
//! removal stops a generation within one delta's worth of work.

use crate::MessageId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Concurrent set of assistant message ids with a generation in flight.
#[derive(Debug, Clone, Default)]
pub struct ActiveGenerations {
    inner: Arc<RwLock<HashSet<MessageId>>>,
}

impl ActiveGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: MessageId) {
        self.inner.write().await.insert(id);
    }

    /// Remove an id. Returns false when it was not present, so callers can
    /// distinguish "aborted" from "nothing to abort".
    pub async fn remove(&self, id: MessageId) -> bool {
        self.inner.write().await.remove(&id)
    }

    pub async fn contains(&self, id: MessageId) -> bool {
        self.inner.read().await.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::ActiveGenerations;
    use crate::new_id;

    #[tokio::test]
    async fn insert_remove_contains() {
        let registry = ActiveGenerations::new();
        let id = new_id();

        assert!(!registry.contains(id).await);
        registry.insert(id).await;
        assert!(registry.contains(id).await);

        assert!(registry.remove(id).await, "first removal should report true");
        assert!(
            !registry.remove(id).await,
            "second removal should report false"
        );
        assert!(!registry.contains(id).await);
    }
}
