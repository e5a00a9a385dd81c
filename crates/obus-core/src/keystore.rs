//! Persisted per-peer credentials.
//!
//! The key store maps a peer GUID to the shared secret established by a
//! completed authentication handshake, with an optional expiration epoch.
//! A valid unexpired entry lets reconnection skip re-authentication.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during key store operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("storage operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// Entry
// ============================================================================

/// One persisted credential: peer GUID -> shared secret (+ expiration).
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyStoreEntry {
    #[zeroize(skip)]
    pub guid: String,
    /// Master secret bytes, zeroized on drop
    pub secret: Vec<u8>,
    /// Unix epoch seconds after which the entry is invalid; None = no bound
    #[zeroize(skip)]
    pub expiration: Option<u64>,
}

impl KeyStoreEntry {
    pub fn new(guid: impl Into<String>, secret: Vec<u8>, expiration: Option<u64>) -> Self {
        Self {
            guid: guid.into(),
            secret,
            expiration,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expiration, Some(at) if at <= now)
    }
}

impl std::fmt::Debug for KeyStoreEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("KeyStoreEntry")
            .field("guid", &self.guid)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// KeyStore Trait
// ============================================================================

/// Storage abstraction for established peer secrets.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert or replace the entry for its GUID.
    async fn store_key(&self, entry: KeyStoreEntry) -> Result<(), KeyStoreError>;

    /// Load the entry for a GUID. Expired entries are purged and reported
    /// absent.
    async fn load_key(&self, guid: &str) -> Result<Option<KeyStoreEntry>, KeyStoreError>;

    /// Remove one peer's entry. No-op when absent.
    async fn clear_key(&self, guid: &str) -> Result<(), KeyStoreError>;

    /// Remove every entry.
    async fn clear_all(&self) -> Result<(), KeyStoreError>;

    /// GUIDs with stored entries (including expired, until purged).
    async fn list_guids(&self) -> Result<Vec<String>, KeyStoreError>;

    /// Re-read from backing storage, dropping un-persisted state.
    async fn reload(&self) -> Result<(), KeyStoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Volatile key store for tests and short-lived attachments.
#[derive(Default)]
pub struct InMemoryKeyStore {
    entries: RwLock<HashMap<String, KeyStoreEntry>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn store_key(&self, entry: KeyStoreEntry) -> Result<(), KeyStoreError> {
        self.entries.write().await.insert(entry.guid.clone(), entry);
        Ok(())
    }

    async fn load_key(&self, guid: &str) -> Result<Option<KeyStoreEntry>, KeyStoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(guid) {
            Some(entry) if entry.is_expired(now_secs()) => {
                entries.remove(guid);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn clear_key(&self, guid: &str) -> Result<(), KeyStoreError> {
        self.entries.write().await.remove(guid);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), KeyStoreError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn list_guids(&self) -> Result<Vec<String>, KeyStoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn reload(&self) -> Result<(), KeyStoreError> {
        // Nothing backs this store.
        Ok(())
    }
}

// ============================================================================
// File-Backed Implementation
// ============================================================================

/// JSON-file-backed key store. Every mutation rewrites the file through a
/// temporary sibling so a crash never leaves a half-written store.
pub struct FileKeyStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, KeyStoreEntry>>,
}

impl FileKeyStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, KeyStoreError> {
        let path = path.into();
        let entries = Self::read_file(&path).await?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn read_file(path: &PathBuf) -> Result<HashMap<String, KeyStoreEntry>, KeyStoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let list: Vec<KeyStoreEntry> = serde_json::from_slice(&bytes)
                    .map_err(|e| KeyStoreError::Serialization(e.to_string()))?;
                Ok(list.into_iter().map(|e| (e.guid.clone(), e)).collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(KeyStoreError::Io(e)),
        }
    }

    async fn persist(
        &self,
        entries: &HashMap<String, KeyStoreEntry>,
    ) -> Result<(), KeyStoreError> {
        let mut list: Vec<&KeyStoreEntry> = entries.values().collect();
        list.sort_by(|a, b| a.guid.cmp(&b.guid));
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|e| KeyStoreError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = list.len(), "key store persisted");
        Ok(())
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn store_key(&self, entry: KeyStoreEntry) -> Result<(), KeyStoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(entry.guid.clone(), entry);
        self.persist(&entries).await
    }

    async fn load_key(&self, guid: &str) -> Result<Option<KeyStoreEntry>, KeyStoreError> {
        let mut entries = self.entries.write().await;
        match entries.get(guid) {
            Some(entry) if entry.is_expired(now_secs()) => {
                entries.remove(guid);
                self.persist(&entries).await?;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn clear_key(&self, guid: &str) -> Result<(), KeyStoreError> {
        let mut entries = self.entries.write().await;
        if entries.remove(guid).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), KeyStoreError> {
        let mut entries = self.entries.write().await;
        entries.clear();
        self.persist(&entries).await
    }

    async fn list_guids(&self) -> Result<Vec<String>, KeyStoreError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn reload(&self) -> Result<(), KeyStoreError> {
        let fresh = Self::read_file(&self.path).await?;
        *self.entries.write().await = fresh;
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryKeyStore::new();
        store
            .store_key(KeyStoreEntry::new("guid-a", vec![1, 2, 3], None))
            .await
            .unwrap();

        let entry = store.load_key("guid-a").await.unwrap().unwrap();
        assert_eq!(entry.secret, vec![1, 2, 3]);
        assert_eq!(entry.expiration, None);

        assert!(store.load_key("guid-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_purged_on_load() {
        let store = InMemoryKeyStore::new();
        store
            .store_key(KeyStoreEntry::new("guid-a", vec![1], Some(1)))
            .await
            .unwrap();

        assert!(store.load_key("guid-a").await.unwrap().is_none());
        assert!(store.list_guids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unexpired_entry_survives() {
        let store = InMemoryKeyStore::new();
        let far_future = now_secs() + 3600;
        store
            .store_key(KeyStoreEntry::new("guid-a", vec![1], Some(far_future)))
            .await
            .unwrap();
        assert!(store.load_key("guid-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_key_and_clear_all() {
        let store = InMemoryKeyStore::new();
        store
            .store_key(KeyStoreEntry::new("a", vec![1], None))
            .await
            .unwrap();
        store
            .store_key(KeyStoreEntry::new("b", vec![2], None))
            .await
            .unwrap();

        store.clear_key("a").await.unwrap();
        assert!(store.load_key("a").await.unwrap().is_none());
        assert!(store.load_key("b").await.unwrap().is_some());

        store.clear_all().await.unwrap();
        assert!(store.list_guids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        {
            let store = FileKeyStore::open(&path).await.unwrap();
            store
                .store_key(KeyStoreEntry::new("guid-a", vec![9, 9], Some(now_secs() + 60)))
                .await
                .unwrap();
        }

        let store = FileKeyStore::open(&path).await.unwrap();
        let entry = store.load_key("guid-a").await.unwrap().unwrap();
        assert_eq!(entry.secret, vec![9, 9]);
    }

    #[tokio::test]
    async fn test_file_store_reload_drops_unpersisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let store = FileKeyStore::open(&path).await.unwrap();
        store
            .store_key(KeyStoreEntry::new("a", vec![1], None))
            .await
            .unwrap();

        // A second handle clears the backing file...
        let other = FileKeyStore::open(&path).await.unwrap();
        other.clear_all().await.unwrap();

        // ...and reload drops what the first handle still cached.
        store.reload().await.unwrap();
        assert!(store.load_key("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::open(dir.path().join("nope.json")).await.unwrap();
        assert!(store.list_guids().await.unwrap().is_empty());
    }

    #[test]
    fn test_debug_hides_secret() {
        let entry = KeyStoreEntry::new("g", vec![42; 32], None);
        let text = format!("{:?}", entry);
        assert!(!text.contains("42"));
    }
}
