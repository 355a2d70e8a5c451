//! Lease-based lock manager.
//!
//! Mutual exclusion rests entirely on the store's atomic set-if-absent: exactly one of
//! several concurrent claimants for a resource id wins, and a lease that outlives its
//! owner expires on its own. Contention and ownership violations come back as
//! structured outcomes; only store failures are errors.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::*;
use crate::config::LockConfig;
use crate::context::KernelContext;
use crate::events::LockEvent;
use crate::store::keys::{self, channels};

#[derive(Debug, Clone)]
pub struct LeaseLockManager {
    ctx: KernelContext,
    namespace: LockNamespace,
    config: LockConfig,
}

impl LeaseLockManager {
    pub fn new(ctx: KernelContext, namespace: LockNamespace, config: LockConfig) -> Self {
        Self {
            ctx,
            namespace,
            config,
        }
    }

    /// Lock manager for file and other resource paths.
    pub fn for_files(ctx: KernelContext, config: LockConfig) -> Self {
        Self::new(ctx, LockNamespace::File, config)
    }

    pub fn namespace(&self) -> LockNamespace {
        self.namespace
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub(crate) fn context(&self) -> &KernelContext {
        &self.ctx
    }

    fn lock_key(&self, resource_id: &str) -> String {
        keys::lock(self.namespace.as_str(), resource_id)
    }

    fn meta_key(&self, resource_id: &str) -> String {
        keys::lock_meta(self.namespace.as_str(), resource_id)
    }

    fn channel(&self) -> Option<&'static str> {
        match self.namespace {
            LockNamespace::File => Some(channels::FILE_LOCKS),
            LockNamespace::Command => None,
        }
    }

    pub(crate) async fn emit(&self, event: LockEvent) {
        let Some(channel) = self.channel() else {
            return;
        };
        if let Err(e) = self.ctx.publish(channel, event).await {
            warn!(error = %e, channel, "Failed to publish lock event");
        }
    }

    /// Attempt an atomic conditional write. Never blocks.
    pub async fn claim(
        &self,
        resource_id: &str,
        agent_id: &str,
        ttl: Option<Duration>,
    ) -> Result<ClaimOutcome, LockError> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let key = self.lock_key(resource_id);

        if self.ctx.store.set_if_absent(&key, agent_id, ttl).await? {
            let now = self.ctx.clock.now();
            let lock = ResourceLock {
                resource_id: resource_id.to_string(),
                owner: agent_id.to_string(),
                acquired_at: now,
                ttl_seconds: ttl.as_secs(),
                expires_at: now + chrono_duration(ttl),
                forced: false,
                reason: None,
                previous_owner: None,
                last_heartbeat: None,
            };
            self.write_metadata(&lock, ttl).await?;

            info!(
                namespace = self.namespace.as_str(),
                resource_id = %resource_id,
                agent_id = %agent_id,
                ttl_seconds = ttl.as_secs(),
                "Lock claimed"
            );
            self.emit(LockEvent::FileClaimed {
                resource_id: resource_id.to_string(),
                owner: agent_id.to_string(),
                ttl_seconds: ttl.as_secs(),
            })
            .await;

            return Ok(ClaimOutcome::granted(agent_id, ttl));
        }

        let owner = self.ctx.store.get(&key).await?;
        let ttl_remaining = self.ctx.store.ttl(&key).await?;
        debug!(
            namespace = self.namespace.as_str(),
            resource_id = %resource_id,
            agent_id = %agent_id,
            owner = ?owner,
            ttl_remaining_secs = ?ttl_remaining.map(|d| d.as_secs()),
            "Lock busy"
        );
        Ok(ClaimOutcome::busy(owner, ttl_remaining))
    }

    /// Release a lock. Only the current owner succeeds.
    pub async fn release(&self, resource_id: &str, agent_id: &str) -> Result<ReleaseOutcome, LockError> {
        let key = self.lock_key(resource_id);
        let owner = self.ctx.store.get(&key).await?;

        match owner {
            None => Ok(ReleaseOutcome {
                success: false,
                message: format!("{resource_id} is not locked"),
                hold_duration_seconds: None,
            }),
            Some(owner) if owner != agent_id => {
                warn!(
                    resource_id = %resource_id,
                    agent_id = %agent_id,
                    owner = %owner,
                    "Release refused: caller does not own the lock"
                );
                Ok(ReleaseOutcome {
                    success: false,
                    message: format!("{resource_id} is held by {owner}"),
                    hold_duration_seconds: None,
                })
            }
            Some(_) => {
                let metadata = self.metadata(resource_id).await.unwrap_or_else(|e| {
                    warn!(resource_id = %resource_id, error = %e, "Ignoring unreadable lock metadata");
                    None
                });

                if !self.ctx.store.compare_and_delete(&key, agent_id).await? {
                    return Ok(ReleaseOutcome {
                        success: false,
                        message: format!("{resource_id} changed hands during release"),
                        hold_duration_seconds: None,
                    });
                }
                self.ctx.store.delete(&self.meta_key(resource_id)).await?;

                let hold_duration_seconds = metadata
                    .map(|lock| (self.ctx.clock.now() - lock.acquired_at).num_seconds());
                info!(
                    namespace = self.namespace.as_str(),
                    resource_id = %resource_id,
                    agent_id = %agent_id,
                    hold_duration_seconds = ?hold_duration_seconds,
                    "Lock released"
                );
                self.emit(LockEvent::FileReleased {
                    resource_id: resource_id.to_string(),
                    owner: agent_id.to_string(),
                    hold_duration_seconds: hold_duration_seconds.unwrap_or_default(),
                })
                .await;

                Ok(ReleaseOutcome {
                    success: true,
                    message: format!("{resource_id} released"),
                    hold_duration_seconds,
                })
            }
        }
    }

    /// Add `additional` to the remaining lease of an owned lock.
    pub async fn extend(
        &self,
        resource_id: &str,
        agent_id: &str,
        additional: Duration,
    ) -> Result<ExtendOutcome, LockError> {
        let key = self.lock_key(resource_id);
        match self.ctx.store.get(&key).await? {
            Some(owner) if owner == agent_id => {}
            Some(owner) => {
                return Ok(ExtendOutcome {
                    success: false,
                    ttl_remaining: None,
                    message: format!("{resource_id} is held by {owner}"),
                })
            }
            None => {
                return Ok(ExtendOutcome {
                    success: false,
                    ttl_remaining: None,
                    message: format!("{resource_id} is not locked"),
                })
            }
        }

        let remaining = self.ctx.store.ttl(&key).await?.unwrap_or_default();
        let extended = remaining + additional;
        if !self.ctx.store.expire(&key, extended).await? {
            return Ok(ExtendOutcome {
                success: false,
                ttl_remaining: None,
                message: format!("{resource_id} expired before it could be extended"),
            });
        }

        if let Some(mut lock) = self.metadata(resource_id).await? {
            lock.ttl_seconds += additional.as_secs();
            lock.expires_at = self.ctx.clock.now() + chrono_duration(extended);
            self.write_metadata(&lock, extended).await?;
        }

        debug!(
            resource_id = %resource_id,
            agent_id = %agent_id,
            ttl_remaining_secs = extended.as_secs(),
            "Lock extended"
        );
        Ok(ExtendOutcome {
            success: true,
            ttl_remaining: Some(extended),
            message: format!("{resource_id} extended by {}s", additional.as_secs()),
        })
    }

    /// Take the lock regardless of the current holder. Always audited and broadcast.
    pub async fn force(
        &self,
        resource_id: &str,
        agent_id: &str,
        reason: &str,
    ) -> Result<ForceOutcome, LockError> {
        let key = self.lock_key(resource_id);
        let ttl = self.config.default_ttl();
        let previous_owner = self.ctx.store.get(&key).await?;

        self.ctx.store.set(&key, agent_id, Some(ttl)).await?;

        let now = self.ctx.clock.now();
        let lock = ResourceLock {
            resource_id: resource_id.to_string(),
            owner: agent_id.to_string(),
            acquired_at: now,
            ttl_seconds: ttl.as_secs(),
            expires_at: now + chrono_duration(ttl),
            forced: true,
            reason: Some(reason.to_string()),
            previous_owner: previous_owner.clone(),
            last_heartbeat: None,
        };
        self.ctx.store.delete(&self.meta_key(resource_id)).await?;
        self.write_metadata(&lock, ttl).await?;

        let entry = ForceAuditEntry {
            namespace: self.namespace,
            resource_id: resource_id.to_string(),
            previous_owner: previous_owner.clone(),
            new_owner: agent_id.to_string(),
            reason: reason.to_string(),
            timestamp: now,
        };
        self.ctx
            .store
            .push(keys::AUDIT_FORCE_LOCKS, &serde_json::to_string(&entry).map_err(crate::store::StoreError::from)?)
            .await?;
        self.ctx
            .store
            .trim(keys::AUDIT_FORCE_LOCKS, self.config.audit_log_max)
            .await?;

        warn!(
            namespace = self.namespace.as_str(),
            resource_id = %resource_id,
            previous_owner = ?previous_owner,
            new_owner = %agent_id,
            reason = %reason,
            "Lock force-acquired"
        );
        self.emit(LockEvent::FileForceLocked {
            resource_id: resource_id.to_string(),
            previous_owner: previous_owner.clone(),
            new_owner: agent_id.to_string(),
            reason: reason.to_string(),
        })
        .await;

        Ok(ForceOutcome {
            success: true,
            previous_owner,
        })
    }

    /// Retry `claim` every poll interval until it succeeds or `timeout` elapses.
    pub async fn wait_for(
        &self,
        resource_id: &str,
        agent_id: &str,
        ttl: Option<Duration>,
        timeout: Duration,
    ) -> Result<WaitOutcome, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = self.config.wait_poll_interval();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = self.claim(resource_id, agent_id, ttl).await?;
            if outcome.success {
                return Ok(WaitOutcome {
                    success: true,
                    timed_out: false,
                    attempts,
                    owner: outcome.owner,
                });
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                info!(
                    resource_id = %resource_id,
                    agent_id = %agent_id,
                    attempts,
                    owner = ?outcome.owner,
                    "Timed out waiting for lock"
                );
                return Ok(WaitOutcome {
                    success: false,
                    timed_out: true,
                    attempts,
                    owner: outcome.owner,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    pub async fn status(&self, resource_id: &str) -> Result<LockStatus, LockError> {
        let metadata = self.metadata(resource_id).await?;
        self.status_with(resource_id, metadata).await
    }

    async fn status_with(
        &self,
        resource_id: &str,
        metadata: Option<ResourceLock>,
    ) -> Result<LockStatus, LockError> {
        let key = self.lock_key(resource_id);
        let owner = self.ctx.store.get(&key).await?;
        if owner.is_none() {
            return Ok(LockStatus {
                resource_id: resource_id.to_string(),
                locked: false,
                owner: None,
                ttl: None,
                metadata: None,
            });
        }
        Ok(LockStatus {
            resource_id: resource_id.to_string(),
            locked: true,
            ttl: self.ctx.store.ttl(&key).await?,
            metadata,
            owner,
        })
    }

    /// Every held lock. Locks with unreadable metadata are listed without it.
    pub async fn list_all(&self) -> Result<Vec<LockStatus>, LockError> {
        let prefix = keys::lock_prefix(self.namespace.as_str());
        let mut locks = Vec::new();
        for key in self.ctx.store.keys(&prefix).await? {
            let Some(resource_id) = keys::strip(&key, &prefix) else {
                continue;
            };
            let metadata = match self.metadata(resource_id).await {
                Ok(metadata) => metadata,
                Err(e @ LockError::CorruptMetadata { .. }) => {
                    warn!(resource_id = %resource_id, error = %e, "Listing lock without unreadable metadata");
                    None
                }
                Err(e) => return Err(e),
            };
            let status = self.status_with(resource_id, metadata).await?;
            if status.locked {
                locks.push(status);
            }
        }
        Ok(locks)
    }

    pub async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<LockStatus>, LockError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|status| status.owner.as_deref() == Some(agent_id))
            .collect())
    }

    /// Remove locks whose lease has elapsed but which the store has not dropped yet,
    /// together with orphaned metadata.
    pub async fn cleanup_expired(&self) -> Result<usize, LockError> {
        let prefix = keys::lock_meta_prefix(self.namespace.as_str());
        let now = self.ctx.clock.now();
        let mut removed = 0;

        for meta_key in self.ctx.store.keys(&prefix).await? {
            let Some(resource_id) = keys::strip(&meta_key, &prefix) else {
                continue;
            };
            let lock_key = self.lock_key(resource_id);
            let owner = self.ctx.store.get(&lock_key).await?;

            let stale = match self.metadata(resource_id).await {
                Ok(Some(lock)) => {
                    if owner.as_deref() != Some(lock.owner.as_str()) {
                        true
                    } else if lock.is_expired(now) {
                        self.ctx.store.compare_and_delete(&lock_key, &lock.owner).await?;
                        true
                    } else {
                        false
                    }
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(resource_id = %resource_id, error = %e, "Dropping corrupt lock metadata");
                    true
                }
            };

            if stale {
                self.ctx.store.delete(&meta_key).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(namespace = self.namespace.as_str(), removed, "Cleaned up expired locks");
        }
        Ok(removed)
    }

    /// Release every lock held by `agent_id`; used on crash or shutdown.
    pub async fn emergency_release_all(&self, agent_id: &str) -> Result<usize, LockError> {
        let mut released = 0;
        for status in self.list_for_agent(agent_id).await? {
            if self.release(&status.resource_id, agent_id).await?.success {
                released += 1;
            }
        }
        if released > 0 {
            warn!(
                namespace = self.namespace.as_str(),
                agent_id = %agent_id,
                released,
                "Emergency release of all locks held by agent"
            );
        }
        Ok(released)
    }

    /// Recent forced acquisitions, oldest first.
    pub async fn force_audit_log(&self, limit: usize) -> Result<Vec<ForceAuditEntry>, LockError> {
        let raw = self.ctx.store.list(keys::AUDIT_FORCE_LOCKS).await?;
        let skip = raw.len().saturating_sub(limit);
        Ok(raw
            .iter()
            .skip(skip)
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    pub async fn metadata(&self, resource_id: &str) -> Result<Option<ResourceLock>, LockError> {
        let fields = self.ctx.store.hgetall(&self.meta_key(resource_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_metadata(resource_id, &fields).map(Some)
    }

    /// Stamp `last_heartbeat` on the lock's metadata if `owner` still holds it.
    /// Returns `false` once the lease has lapsed or changed hands.
    pub async fn touch(&self, resource_id: &str, owner: &str, at: DateTime<Utc>) -> Result<bool, LockError> {
        let held_by = self.ctx.store.get(&self.lock_key(resource_id)).await?;
        if held_by.as_deref() != Some(owner) {
            return Ok(false);
        }
        let meta_key = self.meta_key(resource_id);
        if self.ctx.store.hget(&meta_key, "owner").await?.as_deref() != Some(owner) {
            return Ok(false);
        }
        self.ctx
            .store
            .hset(&meta_key, "last_heartbeat", &at.to_rfc3339())
            .await?;
        Ok(true)
    }

    async fn write_metadata(&self, lock: &ResourceLock, ttl: Duration) -> Result<(), LockError> {
        let meta_key = self.meta_key(&lock.resource_id);
        for (field, value) in encode_metadata(lock) {
            self.ctx.store.hset(&meta_key, field, &value).await?;
        }
        self.ctx.store.expire(&meta_key, ttl).await?;
        Ok(())
    }
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn encode_metadata(lock: &ResourceLock) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("owner", lock.owner.clone()),
        ("acquired_at", lock.acquired_at.to_rfc3339()),
        ("ttl_seconds", lock.ttl_seconds.to_string()),
        ("expires_at", lock.expires_at.to_rfc3339()),
        ("forced", lock.forced.to_string()),
    ];
    if let Some(reason) = &lock.reason {
        fields.push(("reason", reason.clone()));
    }
    if let Some(previous) = &lock.previous_owner {
        fields.push(("previous_owner", previous.clone()));
    }
    if let Some(heartbeat) = &lock.last_heartbeat {
        fields.push(("last_heartbeat", heartbeat.to_rfc3339()));
    }
    fields
}

fn decode_metadata(resource_id: &str, fields: &HashMap<String, String>) -> Result<ResourceLock, LockError> {
    let corrupt = |reason: String| LockError::CorruptMetadata {
        resource_id: resource_id.to_string(),
        reason,
    };
    let required = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| corrupt(format!("missing field {name}")))
    };
    let timestamp = |raw: &str| {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("bad timestamp {raw}: {e}")))
    };

    let last_heartbeat = match fields.get("last_heartbeat") {
        Some(raw) => Some(timestamp(raw)?),
        None => None,
    };

    Ok(ResourceLock {
        resource_id: resource_id.to_string(),
        owner: required("owner")?,
        acquired_at: timestamp(&required("acquired_at")?)?,
        ttl_seconds: required("ttl_seconds")?
            .parse()
            .map_err(|e| corrupt(format!("bad ttl_seconds: {e}")))?,
        expires_at: timestamp(&required("expires_at")?)?,
        forced: fields.get("forced").map(|v| v == "true").unwrap_or(false),
        reason: fields.get("reason").cloned(),
        previous_owner: fields.get("previous_owner").cloned(),
        last_heartbeat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockCoordinationStore, StoreError};
    use std::sync::Arc;

    fn manager() -> LeaseLockManager {
        LeaseLockManager::for_files(KernelContext::in_memory("test"), LockConfig::default())
    }

    #[tokio::test]
    async fn second_claim_reports_owner_and_remaining_ttl() {
        let locks = manager();
        let first = locks.claim("src/main.rs", "agent-a", Some(Duration::from_secs(60))).await.unwrap();
        assert!(first.success);

        let second = locks.claim("src/main.rs", "agent-b", Some(Duration::from_secs(60))).await.unwrap();
        assert!(!second.success);
        assert_eq!(second.owner.as_deref(), Some("agent-a"));
        assert!(second.ttl_remaining.unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn extend_adds_to_remaining_lease() {
        let locks = manager();
        locks.claim("f", "agent-a", Some(Duration::from_secs(30))).await.unwrap();

        let denied = locks.extend("f", "agent-b", Duration::from_secs(30)).await.unwrap();
        assert!(!denied.success);

        let extended = locks.extend("f", "agent-a", Duration::from_secs(30)).await.unwrap();
        assert!(extended.success);
        let remaining = extended.ttl_remaining.unwrap();
        assert!(remaining > Duration::from_secs(30) && remaining <= Duration::from_secs(60));

        let meta = locks.metadata("f").await.unwrap().unwrap();
        assert_eq!(meta.ttl_seconds, 60);
    }

    #[tokio::test]
    async fn metadata_round_trips_through_hash_fields() {
        let locks = manager();
        locks.force("f", "agent-b", "incident").await.unwrap();
        let meta = locks.metadata("f").await.unwrap().unwrap();
        assert!(meta.forced);
        assert_eq!(meta.reason.as_deref(), Some("incident"));
        assert_eq!(meta.previous_owner, None);
    }

    #[tokio::test]
    async fn touch_only_refreshes_the_current_owner() {
        let locks = manager();
        locks.claim("f", "agent-a", None).await.unwrap();
        let at = Utc::now();
        assert!(!locks.touch("f", "agent-b", at).await.unwrap());
        assert!(locks.metadata("f").await.unwrap().unwrap().last_heartbeat.is_none());

        assert!(locks.touch("f", "agent-a", at).await.unwrap());
        let meta = locks.metadata("f").await.unwrap().unwrap();
        assert_eq!(meta.last_heartbeat.map(|t| t.timestamp()), Some(at.timestamp()));

        locks.release("f", "agent-a").await.unwrap();
        assert!(!locks.touch("f", "agent-a", at).await.unwrap());
    }

    #[tokio::test]
    async fn emergency_release_covers_locks_with_bad_metadata() {
        let locks = manager();
        locks.claim("a.rs", "agent-a", None).await.unwrap();
        locks.claim("b.rs", "agent-a", None).await.unwrap();
        locks.claim("c.rs", "agent-a", None).await.unwrap();
        let store = &locks.context().store;
        store.delete(&keys::lock_meta("file", "a.rs")).await.unwrap();
        store
            .hset(&keys::lock_meta("file", "b.rs"), "acquired_at", "yesterday")
            .await
            .unwrap();

        let listed = locks.list_all().await.unwrap();
        assert_eq!(listed.len(), 3);
        let mut ids: Vec<_> = listed.iter().map(|status| status.resource_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a.rs", "b.rs", "c.rs"]);

        assert_eq!(locks.emergency_release_all("agent-a").await.unwrap(), 3);
        assert!(locks.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failures_surface_as_errors() {
        let mut store = MockCoordinationStore::new();
        store
            .expect_set_if_absent()
            .returning(|_, _, _| Err(StoreError::Unavailable("connection refused".into())));
        let ctx = KernelContext::new(Arc::new(store), Arc::new(crate::clock::SystemClock), "test");
        let locks = LeaseLockManager::for_files(ctx, LockConfig::default());

        let err = locks.claim("f", "agent-a", None).await.unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn command_namespace_is_isolated_from_files() {
        let ctx = KernelContext::in_memory("test");
        let files = LeaseLockManager::for_files(ctx.clone(), LockConfig::default());
        let commands = LeaseLockManager::new(ctx, LockNamespace::Command, LockConfig::default());

        assert!(files.claim("build", "agent-a", None).await.unwrap().success);
        assert!(commands.claim("build", "agent-b", None).await.unwrap().success);
        assert_eq!(files.list_all().await.unwrap().len(), 1);
        assert_eq!(commands.list_all().await.unwrap().len(), 1);
    }
}
