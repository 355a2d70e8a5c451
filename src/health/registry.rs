//! Store-backed agent registry.
//!
//! The store hash `agents:registry` is authoritative. The in-process map is a cache
//! that is refreshed on every read and may be dropped and rebuilt at any time.
//!
//! Heartbeat time and count live in their own hashes and are overlaid on every read, so
//! a writer holding an older copy of the record can never roll them back. Every other
//! field changes through [`AgentRegistry::update`], a compare-and-set on the stored JSON.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use super::types::{AgentRecord, HealthError};
use crate::store::keys;
use crate::store::{CoordinationStore, StoreError};

const MAX_UPDATE_ATTEMPTS: u32 = 8;

/// A record as it was read and as it was written back.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub before: AgentRecord,
    pub after: AgentRecord,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    store: Arc<dyn CoordinationStore>,
    cache: Arc<RwLock<HashMap<String, AgentRecord>>>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn cache_put(&self, record: &AgentRecord) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record.clone());
    }

    /// Raw stored JSON plus the decoded record with heartbeat fields overlaid.
    async fn read(&self, agent_id: &str) -> Result<Option<(String, AgentRecord)>, HealthError> {
        let Some(raw) = self.store.hget(keys::AGENT_REGISTRY, agent_id).await? else {
            return Ok(None);
        };
        let mut record = serde_json::from_str::<AgentRecord>(&raw).map_err(StoreError::from)?;
        let beat = self.store.hget(keys::AGENT_HEARTBEATS, agent_id).await?;
        let count = self.store.hget(keys::AGENT_HEARTBEAT_COUNTS, agent_id).await?;
        overlay_heartbeat(&mut record, beat.as_deref(), count.as_deref());
        Ok(Some((raw, record)))
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, HealthError> {
        let record = self.read(agent_id).await?.map(|(_, record)| record);
        match &record {
            Some(record) => self.cache_put(record),
            None => {
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(agent_id);
            }
        }
        Ok(record)
    }

    /// Replace the whole record, heartbeat time and count included.
    pub async fn upsert(&self, record: &AgentRecord) -> Result<(), HealthError> {
        let raw = serde_json::to_string(record).map_err(StoreError::from)?;
        self.store.hset(keys::AGENT_REGISTRY, &record.id, &raw).await?;
        self.store
            .hset(keys::AGENT_HEARTBEATS, &record.id, &record.last_heartbeat.to_rfc3339())
            .await?;
        self.store
            .hset(
                keys::AGENT_HEARTBEAT_COUNTS,
                &record.id,
                &record.heartbeat_count.to_string(),
            )
            .await?;
        self.cache_put(record);
        Ok(())
    }

    /// Stamp a heartbeat without touching the record itself. Returns the new count.
    pub async fn record_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<u64, HealthError> {
        self.store
            .hset(keys::AGENT_HEARTBEATS, agent_id, &at.to_rfc3339())
            .await?;
        let count = self
            .store
            .hincr(keys::AGENT_HEARTBEAT_COUNTS, agent_id, 1)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Read, modify and conditionally write one record, retrying when another writer got
    /// there first. `apply` may run several times and must only touch the record.
    /// Returns `None` when the agent is not registered.
    pub async fn update<F>(&self, agent_id: &str, mut apply: F) -> Result<Option<RecordChange>, HealthError>
    where
        F: FnMut(&mut AgentRecord) + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some((raw, before)) = self.read(agent_id).await? else {
                return Ok(None);
            };
            let mut after = before.clone();
            apply(&mut after);
            let next = serde_json::to_string(&after).map_err(StoreError::from)?;
            if next == raw {
                self.cache_put(&after);
                return Ok(Some(RecordChange { before, after }));
            }
            if self
                .store
                .hcompare_and_set(keys::AGENT_REGISTRY, agent_id, &raw, &next)
                .await?
            {
                self.cache_put(&after);
                return Ok(Some(RecordChange { before, after }));
            }
            debug!(agent_id = %agent_id, attempt, "Agent record changed concurrently, retrying");
        }
        Err(HealthError::Contended(agent_id.to_string()))
    }

    pub async fn remove(&self, agent_id: &str) -> Result<bool, HealthError> {
        let removed = self.store.hdel(keys::AGENT_REGISTRY, agent_id).await?;
        self.store.hdel(keys::AGENT_HEARTBEATS, agent_id).await?;
        self.store.hdel(keys::AGENT_HEARTBEAT_COUNTS, agent_id).await?;
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
        Ok(removed)
    }

    /// Every registered agent, read from the store. Unreadable entries are skipped.
    pub async fn all(&self) -> Result<Vec<AgentRecord>, HealthError> {
        let raw = self.store.hgetall(keys::AGENT_REGISTRY).await?;
        let beats = self.store.hgetall(keys::AGENT_HEARTBEATS).await?;
        let counts = self.store.hgetall(keys::AGENT_HEARTBEAT_COUNTS).await?;
        let mut records = Vec::with_capacity(raw.len());
        for (agent_id, value) in raw {
            match serde_json::from_str::<AgentRecord>(&value) {
                Ok(mut record) => {
                    overlay_heartbeat(
                        &mut record,
                        beats.get(&agent_id).map(String::as_str),
                        counts.get(&agent_id).map(String::as_str),
                    );
                    records.push(record);
                }
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Skipping unreadable agent record"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        *cache = records
            .iter()
            .map(|record| (record.id.clone(), record.clone()))
            .collect();
        Ok(records)
    }

    /// Drop the cache and reload it from the store.
    pub async fn rehydrate(&self) -> Result<usize, HealthError> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(self.all().await?.len())
    }

    /// Last known view without touching the store.
    pub fn cached(&self) -> Vec<AgentRecord> {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<_> = cache.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn overlay_heartbeat(record: &mut AgentRecord, beat: Option<&str>, count: Option<&str>) {
    if let Some(at) = beat.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok()) {
        record.last_heartbeat = record.last_heartbeat.max(at.with_timezone(&Utc));
    }
    if let Some(count) = count.and_then(|raw| raw.parse().ok()) {
        record.heartbeat_count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn store_wins_over_cache() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let registry = AgentRegistry::new(store.clone());
        registry
            .upsert(&AgentRecord::new("a1", vec![], None, Utc::now()))
            .await
            .unwrap();
        assert_eq!(registry.cached_len(), 1);

        // Another kernel instance removed the agent.
        store.hdel(keys::AGENT_REGISTRY, "a1").await.unwrap();
        assert!(registry.get("a1").await.unwrap().is_none());
        assert_eq!(registry.cached_len(), 0);
    }

    #[tokio::test]
    async fn rehydrate_rebuilds_from_store() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let writer = AgentRegistry::new(store.clone());
        writer
            .upsert(&AgentRecord::new("a1", vec!["rust".into()], None, Utc::now()))
            .await
            .unwrap();
        store
            .hset(keys::AGENT_REGISTRY, "broken", "{not json")
            .await
            .unwrap();

        let reader = AgentRegistry::new(store);
        assert_eq!(reader.cached_len(), 0);
        assert_eq!(reader.rehydrate().await.unwrap(), 1);
        assert_eq!(reader.cached()[0].capabilities, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn heartbeat_fields_survive_a_stale_update() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let registry = AgentRegistry::new(store);
        let registered = Utc::now();
        registry
            .upsert(&AgentRecord::new("a1", vec![], None, registered))
            .await
            .unwrap();

        let later = registered + chrono::Duration::seconds(30);
        registry.record_heartbeat("a1", later).await.unwrap();
        let change = registry
            .update("a1", |record| record.error_count += 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.after.last_heartbeat, later);
        assert_eq!(change.after.heartbeat_count, 1);

        let stored = registry.get("a1").await.unwrap().unwrap();
        assert_eq!(stored.error_count, 1);
        assert_eq!(stored.last_heartbeat, later);
    }

    #[tokio::test]
    async fn update_of_unknown_agent_is_none() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let registry = AgentRegistry::new(store);
        assert!(registry.update("ghost", |record| record.error_count += 1).await.unwrap().is_none());
    }
}
