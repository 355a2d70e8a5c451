//! Coordination store adapter
//!
//! Every component of the kernel talks to shared state through [`CoordinationStore`]:
//! atomic set-if-absent with expiry, key reads/expiry/deletes, hash fields, append-only
//! lists and publish/subscribe channels. The store is the single source of truth for
//! locks and liveness; in-process caches elsewhere are rebuilt from it.

pub mod keys;
pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("Stored value could not be (de)serialized: {0}")]
    Serialization(String),
    #[error("Key {key} holds a {actual} value, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Coordination store closed")]
    Closed,
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Shared coordination store primitives.
///
/// Expired keys must be invisible to every read and to [`set_if_absent`], even if the
/// backend has not physically removed them yet.
///
/// [`set_if_absent`]: CoordinationStore::set_if_absent
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically store `value` under `key` with expiry, only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Unconditionally store `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Remaining lifetime of `key`; `None` when absent or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Replace the expiry of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Replace a hash field only if it currently holds `expected`.
    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Atomically add `delta` to an integer hash field, returning the new value.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Append to a list, returning its new length.
    async fn push(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Keep only the newest `keep_last` entries of a list.
    async fn trim(&self, key: &str, keep_last: usize) -> Result<(), StoreError>;

    /// Atomically remove and return every entry of a list.
    async fn take(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Publish to a channel, returning the number of subscribers reached.
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError>;

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
}

impl std::fmt::Debug for dyn CoordinationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CoordinationStore")
    }
}
