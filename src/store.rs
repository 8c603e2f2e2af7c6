use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::IdeError;

/// Key/value store holding heartbeat records. Values are binary-safe; TTLs
/// are optional per write. The production deployment points this at a shared
/// store, tests and the standalone daemon use [`InMemoryStore`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IdeError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), IdeError>;

    /// Atomic set-if-not-exists. Returns `false` when the key already held a
    /// live value.
    async fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, IdeError>;

    async fn del(&self, key: &str) -> Result<(), IdeError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= Instant::now())
    }
}

/// Expiry is lazy: a dead entry is dropped the next time its key is touched.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore::default()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, IdeError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), IdeError> {
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, IdeError> {
        self.entries.remove_if(key, |_, entry| entry.expired());
        let mut inserted = false;
        self.entries.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            Entry::new(value, ttl)
        });
        Ok(inserted)
    }

    async fn del(&self, key: &str) -> Result<(), IdeError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = InMemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_only_wins_once() {
        let store = InMemoryStore::new();
        assert!(store.set_nx("k", b"first".to_vec(), None).await.unwrap());
        assert!(!store.set_nx("k", b"second".to_vec(), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v".to_vec(), Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        // an expired key no longer blocks set_nx
        assert!(store.set_nx("k", b"w".to_vec(), None).await.unwrap());
    }

    #[tokio::test]
    async fn del_removes_key() {
        let store = InMemoryStore::new();
        store.set("k", b"v".to_vec(), None).await.unwrap();
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
