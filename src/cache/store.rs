// src/cache/store.rs
//! Key-value backend for the adaptive cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::KvError;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    async fn clear(&self) -> Result<(), KvError>;
}

/// In-process store. Expiry follows tokio's clock, so paused-time tests
/// can step past a TTL.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> KvError {
    KvError::Unavailable("memory kv lock poisoned".to_string())
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut m = self.inner.lock().map_err(poisoned)?;
        match m.get(key) {
            Some((v, expires)) if Instant::now() < *expires => Ok(Some(v.clone())),
            Some(_) => {
                m.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        let expires = Instant::now() + ttl;
        self.inner
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.lock().map_err(poisoned)?.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), KvError> {
        self.inner.lock().map_err(poisoned)?.clear();
        Ok(())
    }
}
