//! Agent-side view of the kernel.
//!
//! An [`AgentSession`] is what a worker process holds: it announces itself on the
//! inbound `agent-events` channel, takes and returns locks directly through the store,
//! and on shutdown releases everything it holds before saying goodbye, so lease expiry
//! stays a backstop rather than the normal release path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::KernelContext;
use crate::events::AgentEvent;
use crate::health::{AgentStatus, Severity};
use crate::locks::{
    ClaimOutcome, CommandCoordinator, CommandDecision, ExtendOutcome, ForceOutcome, LeaseLockManager,
    LockError, ReleaseOutcome, WaitOutcome,
};
use crate::store::keys::channels;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSummary {
    pub file_locks_released: usize,
    pub command_locks_released: usize,
}

#[derive(Debug)]
pub struct AgentSession {
    agent_id: String,
    pool: Option<String>,
    ctx: KernelContext,
    locks: LeaseLockManager,
    commands: Arc<CommandCoordinator>,
    heartbeat_cancel: CancellationToken,
}

impl AgentSession {
    pub fn new(
        ctx: KernelContext,
        agent_id: impl Into<String>,
        pool: Option<String>,
        locks: LeaseLockManager,
        commands: Arc<CommandCoordinator>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            pool,
            ctx,
            locks,
            commands,
            heartbeat_cancel: CancellationToken::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn send(&self, event: AgentEvent) -> Result<(), StoreError> {
        self.ctx.publish(channels::AGENT_EVENTS, event).await?;
        Ok(())
    }

    pub async fn register(&self, capabilities: Vec<String>) -> Result<(), StoreError> {
        self.send(AgentEvent::Register {
            agent_id: self.agent_id.clone(),
            capabilities,
            pool: self.pool.clone(),
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        status: AgentStatus,
        metrics: HashMap<String, serde_json::Value>,
    ) -> Result<(), StoreError> {
        self.send(AgentEvent::Heartbeat {
            agent_id: self.agent_id.clone(),
            status: Some(status),
            metrics,
        })
        .await
    }

    /// Send an `active` heartbeat every `every` until the session shuts down.
    pub fn spawn_heartbeat(&self, every: Duration) -> JoinHandle<()> {
        let cancel = self.heartbeat_cancel.clone();
        let ctx = self.ctx.clone();
        let agent_id = self.agent_id.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let beat = AgentEvent::Heartbeat {
                            agent_id: agent_id.clone(),
                            status: Some(AgentStatus::Active),
                            metrics: HashMap::new(),
                        };
                        if let Err(e) = ctx.publish(channels::AGENT_EVENTS, beat).await {
                            warn!(agent_id = %agent_id, error = %e, "Heartbeat publish failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub async fn report_error(&self, error: &str, severity: Severity) -> Result<(), StoreError> {
        self.send(AgentEvent::Error {
            agent_id: self.agent_id.clone(),
            error: error.to_string(),
            severity,
        })
        .await
    }

    pub async fn claim(&self, resource_id: &str, ttl: Option<Duration>) -> Result<ClaimOutcome, LockError> {
        self.locks.claim(resource_id, &self.agent_id, ttl).await
    }

    pub async fn release(&self, resource_id: &str) -> Result<ReleaseOutcome, LockError> {
        self.locks.release(resource_id, &self.agent_id).await
    }

    pub async fn extend(&self, resource_id: &str, additional: Duration) -> Result<ExtendOutcome, LockError> {
        self.locks.extend(resource_id, &self.agent_id, additional).await
    }

    /// Take a lock from whoever holds it. Audited and broadcast.
    pub async fn force(&self, resource_id: &str, reason: &str) -> Result<ForceOutcome, LockError> {
        self.locks.force(resource_id, &self.agent_id, reason).await
    }

    pub async fn wait_for(
        &self,
        resource_id: &str,
        ttl: Option<Duration>,
        timeout: Duration,
    ) -> Result<WaitOutcome, LockError> {
        self.locks
            .wait_for(resource_id, &self.agent_id, ttl, timeout)
            .await
    }

    pub async fn request_command(&self, command: &str) -> Result<CommandDecision, LockError> {
        self.commands
            .request_command_execution(&self.agent_id, command)
            .await
    }

    pub async fn complete_command(&self, command: &str, success: bool) -> Result<bool, LockError> {
        self.commands
            .complete_command_execution(&self.agent_id, command, success)
            .await
    }

    /// Release every file and command lock, stop heartbeats and unregister.
    pub async fn shutdown(self) -> Result<SessionSummary, LockError> {
        self.heartbeat_cancel.cancel();
        let summary = SessionSummary {
            file_locks_released: self.locks.emergency_release_all(&self.agent_id).await?,
            command_locks_released: self.commands.release_all_for(&self.agent_id).await?,
        };
        self.send(AgentEvent::Unregister {
            agent_id: self.agent_id.clone(),
        })
        .await?;
        info!(
            agent_id = %self.agent_id,
            file_locks_released = summary.file_locks_released,
            command_locks_released = summary.command_locks_released,
            "Agent session closed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandConfig, LockConfig};

    #[tokio::test]
    async fn shutdown_releases_locks_and_unregisters() {
        let ctx = KernelContext::in_memory("test");
        let locks = LeaseLockManager::for_files(ctx.clone(), LockConfig::default());
        let commands = Arc::new(CommandCoordinator::new(
            ctx.clone(),
            CommandConfig::default(),
            LockConfig::default(),
        ));
        let mut events = ctx.store.subscribe(channels::AGENT_EVENTS);

        let session = AgentSession::new(ctx, "a1", None, locks.clone(), commands.clone());
        assert!(session.claim("src/lib.rs", None).await.unwrap().success);
        assert!(session.claim("src/main.rs", None).await.unwrap().success);
        assert!(session.request_command("npm install").await.unwrap().may_run());

        let summary = session.shutdown().await.unwrap();
        assert_eq!(summary.file_locks_released, 2);
        assert_eq!(summary.command_locks_released, 1);
        assert!(locks.list_all().await.unwrap().is_empty());

        let raw = events.recv().await.unwrap();
        let event: AgentEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event, AgentEvent::Unregister { agent_id: "a1".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_extend_force_and_wait_on_locks() {
        let ctx = KernelContext::in_memory("test");
        let locks = LeaseLockManager::for_files(ctx.clone(), LockConfig::default());
        let commands = Arc::new(CommandCoordinator::new(
            ctx.clone(),
            CommandConfig::default(),
            LockConfig::default(),
        ));
        let a1 = AgentSession::new(ctx.clone(), "a1", None, locks.clone(), commands.clone());
        let a2 = AgentSession::new(ctx, "a2", None, locks.clone(), commands);

        assert!(a1.claim("schema.sql", Some(Duration::from_secs(5))).await.unwrap().success);
        assert!(a1.extend("schema.sql", Duration::from_secs(5)).await.unwrap().success);
        assert!(!a2.extend("schema.sql", Duration::from_secs(5)).await.unwrap().success);

        let waited = a2
            .wait_for("schema.sql", None, Duration::from_secs(3))
            .await
            .unwrap();
        assert!(waited.timed_out);

        let forced = a2.force("schema.sql", "migration stuck").await.unwrap();
        assert_eq!(forced.previous_owner.as_deref(), Some("a1"));
        assert_eq!(locks.status("schema.sql").await.unwrap().owner.as_deref(), Some("a2"));
    }
}
