// JSON file holding the operator session keys
use crate::application::session_store::{PersistedSession, SessionStore, SessionStoreError};
use async_trait::async_trait;
use fs_err::tokio as fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Session keys stored as one small JSON document, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "session.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<PersistedSession, SessionStoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PersistedSession::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(PersistedSession::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, session: &PersistedSession) -> Result<(), SessionStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(session)?;
        let temp = self.temp_path();
        fs::write(&temp, content).await?;
        fs::rename(&temp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), active = session.session_active, "Saved session state");
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        self.save(&PersistedSession::default()).await?;
        tracing::info!(path = %self.path.display(), "Cleared session state");
        Ok(())
    }
}
