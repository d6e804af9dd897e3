// Persisted operator session keys
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session identifiers kept across restarts of the console.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(default)]
    pub session_active: bool,
}

impl PersistedSession {
    pub fn active(session_id: impl Into<String>) -> Self {
        Self {
            active_session_id: Some(session_id.into()),
            session_active: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> Result<PersistedSession, SessionStoreError>;

    async fn save(&self, session: &PersistedSession) -> Result<(), SessionStoreError>;

    /// Drop both session keys.
    async fn clear(&self) -> Result<(), SessionStoreError>;
}
