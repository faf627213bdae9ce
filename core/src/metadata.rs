//! Persisted session metadata (survives process restarts, unlike the
//! in-memory session table). Replaces the teacher's `LocalStore`, which wrote
//! session state with a plain `fs::write`; this store writes to a temp path
//! and renames over the target so a crash mid-write never leaves a truncated
//! or partially-written document behind.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::fs::FileSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    #[serde(rename = "mode")]
    pub kind: SessionKind,
    /// Present only for SSH sessions.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Path only, never the key material itself. No secrets are persisted.
    pub key_path: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub cwd: Option<String>,
    /// Opaque, passed through untouched for the out-of-scope tunnel layer to
    /// reattach after recovery. Persisted as `tunnels` to match the document
    /// schema.
    #[serde(rename = "tunnels")]
    pub saved_tunnels: Vec<String>,
}

impl SessionMetadata {
    /// `user@host[:port]`, used to key the `ControlSession` pool. `None` for
    /// local sessions or malformed metadata.
    pub fn connection_string(&self) -> Option<String> {
        let host = self.host.as_ref()?;
        let user = self.user.as_ref()?;
        match self.port {
            Some(22) | None => Some(format!("{user}@{host}")),
            Some(port) => Some(format!("{user}@{host}:{port}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    pub sessions: HashMap<String, SessionMetadata>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self) -> SessionResult<StoreDocument>;
    async fn save(&self, document: &StoreDocument) -> SessionResult<()>;
}

pub struct JsonFileStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(fs: Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self { fs, path }
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn load(&self) -> SessionResult<StoreDocument> {
        if !self.fs.exists(&self.path).await {
            return Ok(StoreDocument::default());
        }
        let raw = self
            .fs
            .read(&self.path)
            .await
            .map_err(|e| SessionError::IoFailed(format!("reading {}: {e}", self.path.display())))?;
        serde_json::from_slice(&raw)
            .map_err(|e| SessionError::IoFailed(format!("parsing {}: {e}", self.path.display())))
    }

    async fn save(&self, document: &StoreDocument) -> SessionResult<()> {
        if let Some(parent) = self.path.parent() {
            self.fs
                .create_dir_all(parent)
                .await
                .map_err(|e| SessionError::IoFailed(format!("creating {}: {e}", parent.display())))?;
        }
        let data = serde_json::to_vec_pretty(document)
            .map_err(|e| SessionError::IoFailed(format!("serializing session store: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");
        self.fs
            .write(&tmp_path, &data)
            .await
            .map_err(|e| SessionError::IoFailed(format!("writing {}: {e}", tmp_path.display())))?;
        self.fs
            .rename(&tmp_path, &self.path)
            .await
            .map_err(|e| SessionError::IoFailed(format!("renaming {} -> {}: {e}", tmp_path.display(), self.path.display())))
    }
}
