//! In-process coordination store.
//!
//! Keeps keys, hashes and lists in one map guarded by a mutex so that every primitive
//! is atomic with respect to the others. Expiry is lazy: an entry whose deadline has
//! passed is treated as absent by every operation and physically removed on the next
//! write to that key or by [`MemoryStore::purge_expired`]. Deadlines use
//! `tokio::time::Instant`, so paused-clock tests control lease expiry.
//!
//! Pub/sub uses one tokio broadcast channel per channel name.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::{CoordinationStore, StoreError};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Text(_) => "string",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// In-memory [`CoordinationStore`] shared by clones.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    channel_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            channel_capacity,
        }
    }

    /// Physically remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, "Purged expired store entries");
        }
        purged
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

/// Live entry for `key`, dropping it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, StoreError> {
    if live(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|entry| &mut entry.value) {
        Some(Value::Hash(map)) => Ok(map),
        Some(other) => Err(StoreError::WrongType {
            key: key.to_string(),
            expected: "hash",
            actual: other.kind(),
        }),
        None => Err(StoreError::Unavailable(format!("hash {key} vanished"))),
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StoreError> {
    if live(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|entry| &mut entry.value) {
        Some(Value::List(list)) => Ok(list),
        Some(other) => Err(StoreError::WrongType {
            key: key.to_string(),
            expected: "list",
            actual: other.kind(),
        }),
        None => Err(StoreError::Unavailable(format!("list {key} vanished"))),
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self.entries();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(other) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        let matches = matches!(
            live(&mut entries, key).map(|entry| &entry.value),
            Some(Value::Text(current)) if current == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut entries = self.entries();
        let now = Instant::now();
        Ok(live(&mut entries, key)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries();
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(map.get(field).cloned()),
            Some(other) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
                actual: other.kind(),
            }),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries();
        hash_mut(&mut entries, key)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hcompare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_none() {
            return Ok(false);
        }
        match hash_mut(&mut entries, key)?.get_mut(field) {
            Some(current) if current == expected => {
                *current = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_none() {
            return Ok(false);
        }
        Ok(hash_mut(&mut entries, key)?.remove(field).is_some())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(other) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "hash",
                actual: other.kind(),
            }),
        }
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut entries = self.entries();
        let map = hash_mut(&mut entries, key)?;
        let current = match map.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|e| {
                StoreError::Serialization(format!("{key}.{field} is not an integer: {e}"))
            })?,
            None => 0,
        };
        let updated = current + delta;
        map.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries();
        let list = list_mut(&mut entries, key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.iter().cloned().collect()),
            Some(other) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "list",
                actual: other.kind(),
            }),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries();
        match live(&mut entries, key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(other) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "list",
                actual: other.kind(),
            }),
        }
    }

    async fn trim(&self, key: &str, keep_last: usize) -> Result<(), StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_none() {
            return Ok(());
        }
        let list = list_mut(&mut entries, key)?;
        while list.len() > keep_last {
            list.pop_front();
        }
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries();
        if live(&mut entries, key).is_none() {
            return Ok(Vec::new());
        }
        let drained = list_mut(&mut entries, key)?.drain(..).collect();
        entries.remove(key);
        Ok(drained)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        // A send error only means nobody is subscribed right now.
        Ok(self.sender(channel).send(message.to_string()).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(2)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(2)).await.unwrap());

        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", Duration::from_secs(2)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn compare_and_delete_only_removes_matching_value() {
        let store = MemoryStore::new();
        store.set("k", "owner-a", None).await.unwrap();
        assert!(!store.compare_and_delete("k", "owner-b").await.unwrap());
        assert!(store.compare_and_delete("k", "owner-a").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_and_list_operations() {
        let store = MemoryStore::new();
        store.hset("h", "f", "1").await.unwrap();
        assert_eq!(store.hincr("h", "f", 4).await.unwrap(), 5);
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("5"));

        for i in 0..5 {
            store.push("l", &i.to_string()).await.unwrap();
        }
        store.trim("l", 2).await.unwrap();
        assert_eq!(store.list("l").await.unwrap(), vec!["3", "4"]);
        assert_eq!(store.take("l").await.unwrap().len(), 2);
        assert_eq!(store.list_len("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hash_compare_and_set_needs_the_current_value() {
        let store = MemoryStore::new();
        assert!(!store.hcompare_and_set("h", "f", "v1", "v2").await.unwrap());
        store.hset("h", "f", "v1").await.unwrap();
        assert!(!store.hcompare_and_set("h", "f", "stale", "v2").await.unwrap());
        assert!(store.hcompare_and_set("h", "f", "v1", "v2").await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        let err = store.push("k", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { expected: "list", .. }));
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("chan");
        assert_eq!(store.publish("chan", "hello").await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert_eq!(store.publish("nobody", "x").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_expired_drops_dead_entries() {
        let store = MemoryStore::new();
        store.set("a", "1", Some(Duration::from_secs(1))).await.unwrap();
        store.set("b", "1", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.keys("").await.unwrap(), vec!["b"]);
    }
}
