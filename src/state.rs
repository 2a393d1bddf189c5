//! Cross-phase state persistence
//!
//! Restore, build, and save run as separate processes; nothing survives in
//! memory between them. Every cross-phase value is an explicit string write
//! in one phase and an explicit read in a later one.

use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// Well-known phase-state keys
pub mod keys {
    pub const WORKSPACE: &str = "workspace";
    pub const CACHE_TAG: &str = "cacheTag";
    pub const CACHE_DIR: &str = "cacheDir";
    pub const CACHE_DIR_TO: &str = "cacheDirTo";
    pub const VERBOSE: &str = "verbose";
    pub const EXCLUDE: &str = "exclude";
    pub const PROXY_PID: &str = "proxyPid";
    pub const PROXY_PORT: &str = "proxyPort";
    pub const BUILDER: &str = "builder";
    pub const CACHE_FROM: &str = "cacheFrom";
    pub const CACHE_TO: &str = "cacheTo";
}

/// String-keyed store carrying values across pipeline phases
#[async_trait]
pub trait PhaseStore: Send + Sync {
    async fn get(&self, key: &str) -> KilnResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> KilnResult<()>;
    async fn remove(&self, key: &str) -> KilnResult<()>;
}

/// Fetch a key that a later phase cannot proceed without.
pub async fn require(store: &dyn PhaseStore, key: &str) -> KilnResult<String> {
    store
        .get(key)
        .await?
        .ok_or_else(|| KilnError::StateMissing(key.to_string()))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    entries: HashMap<String, String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// File-backed store: a JSON map rewritten on every set.
///
/// Phases are sequential within a run, so last-writer-wins is sufficient;
/// concurrent runs must use distinct state files.
pub struct FilePhaseStore {
    path: PathBuf,
}

impl FilePhaseStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Default location under the OS temp dir.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join("kiln-state.json")
    }

    async fn load(&self) -> KilnResult<StateDocument> {
        if !self.path.exists() {
            return Ok(StateDocument::default());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| KilnError::io(format!("reading state file {}", self.path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn persist(&self, doc: &StateDocument) -> KilnResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io("creating state directory", e))?;
        }
        let content = serde_json::to_string_pretty(doc)?;
        fs::write(&self.path, content)
            .await
            .map_err(|e| KilnError::io(format!("writing state file {}", self.path.display()), e))
    }
}

#[async_trait]
impl PhaseStore for FilePhaseStore {
    async fn get(&self, key: &str) -> KilnResult<Option<String>> {
        Ok(self.load().await?.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> KilnResult<()> {
        let mut doc = self.load().await?;
        doc.entries.insert(key.to_string(), value.to_string());
        doc.updated_at = Some(Utc::now());
        self.persist(&doc).await
    }

    async fn remove(&self, key: &str) -> KilnResult<()> {
        let mut doc = self.load().await?;
        doc.entries.remove(key);
        doc.updated_at = Some(Utc::now());
        self.persist(&doc).await
    }
}

/// In-memory store for tests
#[cfg(test)]
pub struct MemoryPhaseStore {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryPhaseStore {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl PhaseStore for MemoryPhaseStore {
    async fn get(&self, key: &str) -> KilnResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> KilnResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> KilnResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(dir.path().join("state.json"));

        assert_eq!(store.get(keys::WORKSPACE).await.unwrap(), None);

        store.set(keys::WORKSPACE, "default/app").await.unwrap();
        store.set(keys::PROXY_PID, "12345").await.unwrap();

        // Fresh store instance simulates a separate phase process.
        let later = FilePhaseStore::new(dir.path().join("state.json"));
        assert_eq!(
            later.get(keys::WORKSPACE).await.unwrap().as_deref(),
            Some("default/app")
        );
        assert_eq!(
            later.get(keys::PROXY_PID).await.unwrap().as_deref(),
            Some("12345")
        );
    }

    #[tokio::test]
    async fn file_store_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePhaseStore::new(dir.path().join("state.json"));
        store.set(keys::PROXY_PID, "1").await.unwrap();
        store.remove(keys::PROXY_PID).await.unwrap();
        assert_eq!(store.get(keys::PROXY_PID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn require_missing_key_errors() {
        let store = MemoryPhaseStore::new();
        let err = require(&store, keys::CACHE_TAG).await.unwrap_err();
        assert!(err.to_string().contains("cacheTag"));
    }

    #[tokio::test]
    async fn garbled_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "not json").await.unwrap();
        let store = FilePhaseStore::new(path);
        assert!(store.get(keys::WORKSPACE).await.is_err());
    }
}
