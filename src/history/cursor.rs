//! Opaque pagination cursors.
//!
//! A cursor pins a `(created_at, id)` position on the active path. Clients
//! treat the encoding as opaque; only the engine mints them.

use crate::MessageId;
use crate::error::{EngineError, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: MessageId,
}

impl PageCursor {
    pub fn encode(&self) -> String {
        // Serialization of a two-field struct cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidState("invalid pagination cursor".into());
        let bytes = STANDARD.decode(raw).map_err(|_| invalid())?;
        serde_json::from_slice(&bytes).map_err(|_| invalid())
    }

    /// True when `(created_at, id)` sorts strictly before this cursor —
    /// older by timestamp, ties broken by id.
    pub fn admits(&self, created_at: DateTime<Utc>, id: MessageId) -> bool {
        created_at < self.created_at || (created_at == self.created_at && id < self.id)
    }
}
