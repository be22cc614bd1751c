//! Persistence collaborator for session snapshots.
//!
//! One JSON snapshot per conversation. The file store lays them out flat:
//!
//! ```text
//! <root>/<conversation_id>.json
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::protocol::SessionSnapshot;

pub type Result<T> = core::result::Result<T, StoreError>;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persisted snapshot for a conversation, or None if nothing was saved yet.
    async fn load(&self, conversation_id: &str) -> Result<Option<SessionSnapshot>>;

    async fn save(&self, conversation_id: &str, snapshot: &SessionSnapshot) -> Result<()>;
}

/// In-process store. Used when no data directory is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<String, SessionSnapshot>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves since creation.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub async fn insert(&self, conversation_id: &str, snapshot: SessionSnapshot) {
        self.snapshots.write().await.insert(conversation_id.to_string(), snapshot);
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.snapshots.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, conversation_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
        self.snapshots.write().await.insert(conversation_id.to_string(), snapshot.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// JSON files under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates the root directory if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, conversation_id: &str) -> Result<PathBuf> {
        if !valid_id(conversation_id) {
            return Err(StoreError::InvalidId(conversation_id.to_string()));
        }
        Ok(self.root.join(format!("{conversation_id}.json")))
    }
}

/// Conversation ids become file names: ASCII alphanumerics, '-' and '_' only.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 128 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl SnapshotStore for FileStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<SessionSnapshot>> {
        let path = self.path_for(conversation_id)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn save(&self, conversation_id: &str, snapshot: &SessionSnapshot) -> Result<()> {
        let path = self.path_for(conversation_id)?;
        let json = serde_json::to_string_pretty(snapshot)?;
        // Write then rename so a crash never leaves a half-written snapshot.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(target: "reconcile", conversation_id, path = %path.display(), "Snapshot written");
        Ok(())
    }
}
