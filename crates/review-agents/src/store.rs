//! Session snapshot storage.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

/// Error from a session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persists serialized session snapshots by id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn load(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Keep a snapshot of a session generation that was reset.
    async fn archive(&self, id: &str, generation: u32, bytes: &[u8]) -> Result<(), StoreError> {
        self.save(&format!("{id}.gen{generation}"), bytes).await
    }
}

/// Ids become file names, so only a conservative character set is allowed.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

/// One `<id>.json` file per session under a directory.
///
/// Saves write a sibling temp file and rename it over the target, so a
/// crash mid-write never leaves a truncated snapshot.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_id(id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.path_for(id);
        let tmp = self.dir.join(format!(".{id}.json.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        tracing::debug!(path = %target.display(), bytes = bytes.len(), "session saved");
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        validate_id(id)?;
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// In-process store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_id(id)?;
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
