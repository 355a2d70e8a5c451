//! Exclusive command coordination.
//!
//! Commands are normalized, classified against the configured exclusive list, and
//! exclusive ones are serialized through the lock protocol in the `command`
//! namespace. Monitored commands are only logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::LeaseLockManager;
use super::types::{LockError, LockNamespace, WaitOutcome};
use crate::config::{CommandConfig, LockConfig};
use crate::context::KernelContext;
use crate::events::CommandEvent;
use crate::store::keys::{self, channels};
use crate::store::StoreError;

/// Lower-case and collapse runs of whitespace.
pub fn normalize_command(command: &str) -> String {
    command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 hex digest of the normalized command.
pub fn command_hash(command: &str) -> String {
    let digest = Sha256::digest(normalize_command(command).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CommandDecision {
    /// Not exclusive; logged and free to run.
    Monitored,
    Granted {
        command_hash: String,
    },
    Busy {
        command_hash: String,
        owner: Option<String>,
        ttl_remaining: Option<Duration>,
    },
}

impl CommandDecision {
    pub fn may_run(&self) -> bool {
        !matches!(self, CommandDecision::Busy { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandLogKind {
    Monitored,
    Started,
    Blocked,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub kind: CommandLogKind,
    pub agent_id: String,
    pub command: String,
    pub command_hash: String,
    pub exclusive: bool,
    pub success: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub command_hash: String,
    pub running: bool,
    pub owner: Option<String>,
    pub ttl_remaining: Option<Duration>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_stale: bool,
}

#[derive(Debug)]
pub struct CommandCoordinator {
    locks: LeaseLockManager,
    config: CommandConfig,
    exclusive_patterns: Vec<String>,
    heartbeats: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl CommandCoordinator {
    pub fn new(ctx: KernelContext, config: CommandConfig, lock_config: LockConfig) -> Self {
        let exclusive_patterns = config
            .exclusive_commands
            .iter()
            .map(|pattern| normalize_command(pattern))
            .filter(|pattern| !pattern.is_empty())
            .collect();
        Self {
            locks: LeaseLockManager::new(ctx, LockNamespace::Command, lock_config),
            config,
            exclusive_patterns,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn locks(&self) -> &LeaseLockManager {
        &self.locks
    }

    /// A command is exclusive when a configured pattern appears as a run of whole words
    /// inside any `&&`, `;` or `|` separated segment, so wrappers such as `sudo`,
    /// `timeout 600`, `xargs` or leading `VAR=value` assignments do not hide it.
    pub fn is_exclusive(&self, command: &str) -> bool {
        let normalized = normalize_command(command);
        normalized.split(['&', ';', '|']).any(|segment| {
            let words: Vec<&str> = segment.split_whitespace().collect();
            self.exclusive_patterns.iter().any(|pattern| {
                let pattern: Vec<&str> = pattern.split_whitespace().collect();
                words.windows(pattern.len()).any(|window| window == pattern.as_slice())
            })
        })
    }

    pub async fn request_command_execution(
        &self,
        agent_id: &str,
        command: &str,
    ) -> Result<CommandDecision, LockError> {
        let hash = command_hash(command);

        if !self.is_exclusive(command) {
            debug!(agent_id = %agent_id, command = %command, "Monitored command");
            self.log(CommandLogKind::Monitored, agent_id, command, &hash, false, None)
                .await?;
            return Ok(CommandDecision::Monitored);
        }

        let outcome = self
            .locks
            .claim(&hash, agent_id, Some(self.config.lock_ttl()))
            .await?;
        if !outcome.success {
            info!(
                agent_id = %agent_id,
                command = %command,
                owner = ?outcome.owner,
                "Exclusive command already running"
            );
            self.log(CommandLogKind::Blocked, agent_id, command, &hash, true, None)
                .await?;
            return Ok(CommandDecision::Busy {
                command_hash: hash,
                owner: outcome.owner,
                ttl_remaining: outcome.ttl_remaining,
            });
        }

        self.start_heartbeat(&hash, agent_id);
        self.log(CommandLogKind::Started, agent_id, command, &hash, true, None)
            .await?;
        info!(agent_id = %agent_id, command = %command, command_hash = %hash, "Exclusive command started");
        self.publish(CommandEvent::ExclusiveCommandStarted {
            command_hash: hash.clone(),
            command: command.to_string(),
            agent_id: agent_id.to_string(),
        })
        .await;

        Ok(CommandDecision::Granted { command_hash: hash })
    }

    /// Finish an exclusive command: stop its heartbeat and release the lock.
    /// Returns `false` if the caller did not hold the command lock.
    pub async fn complete_command_execution(
        &self,
        agent_id: &str,
        command: &str,
        success: bool,
    ) -> Result<bool, LockError> {
        let hash = command_hash(command);
        let held = self.locks.status(&hash).await?;
        if held.owner.as_deref() != Some(agent_id) {
            warn!(agent_id = %agent_id, command = %command, owner = ?held.owner, "Completion from non-owner ignored");
            return Ok(false);
        }

        self.stop_heartbeat(&hash);
        let released = self.locks.release(&hash, agent_id).await?;
        let duration_seconds = released.hold_duration_seconds.unwrap_or_default();

        self.log(CommandLogKind::Completed, agent_id, command, &hash, true, Some(success))
            .await?;
        info!(
            agent_id = %agent_id,
            command = %command,
            success,
            duration_seconds,
            "Exclusive command completed"
        );
        self.publish(CommandEvent::ExclusiveCommandCompleted {
            command_hash: hash,
            command: command.to_string(),
            agent_id: agent_id.to_string(),
            success,
            duration_seconds,
        })
        .await;
        Ok(released.success)
    }

    /// Block until the exclusive command lock is free or `timeout` elapses.
    pub async fn wait_for_command(
        &self,
        agent_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, LockError> {
        let hash = command_hash(command);
        let outcome = self
            .locks
            .wait_for(&hash, agent_id, Some(self.config.lock_ttl()), timeout)
            .await?;
        if outcome.success {
            self.start_heartbeat(&hash, agent_id);
            self.log(CommandLogKind::Started, agent_id, command, &hash, true, None)
                .await?;
            self.publish(CommandEvent::ExclusiveCommandStarted {
                command_hash: hash,
                command: command.to_string(),
                agent_id: agent_id.to_string(),
            })
            .await;
        }
        Ok(outcome)
    }

    pub async fn command_status(&self, command: &str) -> Result<CommandStatus, LockError> {
        let hash = command_hash(command);
        let status = self.locks.status(&hash).await?;
        let last_heartbeat = status
            .metadata
            .as_ref()
            .map(|lock| lock.last_heartbeat.unwrap_or(lock.acquired_at));
        let stale_after = chrono::Duration::from_std(self.config.heartbeat_interval() * 3)
            .unwrap_or(chrono::Duration::MAX);
        let heartbeat_stale = status.locked
            && last_heartbeat
                .map(|beat| self.locks.context().clock.now() - beat > stale_after)
                .unwrap_or(true);

        Ok(CommandStatus {
            command_hash: hash,
            running: status.locked,
            owner: status.owner,
            ttl_remaining: status.ttl,
            last_heartbeat,
            heartbeat_stale,
        })
    }

    /// Most recent execution log entries, oldest first.
    pub async fn execution_log(&self, limit: usize) -> Result<Vec<CommandLogEntry>, LockError> {
        let raw = self.locks.context().store.list(keys::COMMAND_LOG).await?;
        let skip = raw.len().saturating_sub(limit);
        Ok(raw
            .iter()
            .skip(skip)
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    /// Release every command lock held by `agent_id` and stop their heartbeats.
    pub async fn release_all_for(&self, agent_id: &str) -> Result<usize, LockError> {
        let mut released = 0;
        for status in self.locks.list_for_agent(agent_id).await? {
            self.stop_heartbeat(&status.resource_id);
            if self.locks.release(&status.resource_id, agent_id).await?.success {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Number of exclusive commands this coordinator is refreshing heartbeats for.
    pub fn running_heartbeats(&self) -> usize {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        heartbeats.retain(|_, handle| !handle.is_finished());
        heartbeats.len()
    }

    /// Stop every heartbeat timer; used on shutdown.
    pub fn stop_all_heartbeats(&self) {
        let mut heartbeats = self.heartbeats.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in heartbeats.drain() {
            handle.abort();
        }
    }

    /// Refresh `last_heartbeat` for `owner`'s lease until it is released, expires or
    /// changes hands.
    fn start_heartbeat(&self, hash: &str, owner: &str) {
        let locks = self.locks.clone();
        let interval = self.config.heartbeat_interval();
        let resource_id = hash.to_string();
        let owner = owner.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = locks.context().clock.now();
                match locks.touch(&resource_id, &owner, now).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            command_hash = %resource_id,
                            owner = %owner,
                            "Command lease no longer held, stopping heartbeat"
                        );
                        break;
                    }
                    Err(e) => warn!(command_hash = %resource_id, error = %e, "Command heartbeat failed"),
                }
            }
        });

        let previous = self
            .heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string(), handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self, hash: &str) {
        let handle = self
            .heartbeats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn log(
        &self,
        kind: CommandLogKind,
        agent_id: &str,
        command: &str,
        hash: &str,
        exclusive: bool,
        success: Option<bool>,
    ) -> Result<(), LockError> {
        let entry = CommandLogEntry {
            kind,
            agent_id: agent_id.to_string(),
            command: command.to_string(),
            command_hash: hash.to_string(),
            exclusive,
            success,
            timestamp: self.locks.context().clock.now(),
        };
        let store = &self.locks.context().store;
        store
            .push(keys::COMMAND_LOG, &serde_json::to_string(&entry).map_err(StoreError::from)?)
            .await?;
        store.trim(keys::COMMAND_LOG, self.config.execution_log_max).await?;
        Ok(())
    }

    async fn publish(&self, event: CommandEvent) {
        if let Err(e) = self
            .locks
            .context()
            .publish(channels::COMMAND_EXECUTION, event)
            .await
        {
            warn!(error = %e, "Failed to publish command event");
        }
    }
}

impl Drop for CommandCoordinator {
    fn drop(&mut self) {
        self.stop_all_heartbeats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn coordinator() -> CommandCoordinator {
        CommandCoordinator::new(
            KernelContext::in_memory("test"),
            CommandConfig::default(),
            LockConfig::default(),
        )
    }

    #[test]
    fn normalization_collapses_whitespace_and_case() {
        assert_eq!(normalize_command("  NPM   Install\tlodash "), "npm install lodash");
        assert_eq!(command_hash("npm install"), command_hash("NPM  install"));
        assert_ne!(command_hash("npm install"), command_hash("npm ci"));
        assert_eq!(command_hash("npm install").len(), 64);
    }

    #[tokio::test]
    async fn classification_matches_whole_words_in_each_segment() {
        let commands = coordinator();
        assert!(commands.is_exclusive("npm install"));
        assert!(commands.is_exclusive("npm install --save lodash"));
        assert!(commands.is_exclusive("cd web && npm ci"));
        assert!(commands.is_exclusive("sudo systemctl restart nginx"));
        assert!(commands.is_exclusive("NODE_ENV=production npm install"));
        assert!(commands.is_exclusive("timeout 600 npm ci"));
        assert!(commands.is_exclusive("env CI=1 npm install"));
        assert!(commands.is_exclusive("pgrep node | xargs kill -9"));
        assert!(!commands.is_exclusive("npm test"));
        assert!(!commands.is_exclusive("cargo build --release"));
        assert!(!commands.is_exclusive("npm run skill-check"));
        assert!(!commands.is_exclusive("npm installer"));
    }

    #[tokio::test]
    async fn monitored_commands_never_lock() {
        let commands = coordinator();
        assert_eq!(
            commands.request_command_execution("a", "ls -la").await.unwrap(),
            CommandDecision::Monitored
        );
        assert_eq!(
            commands.request_command_execution("b", "ls -la").await.unwrap(),
            CommandDecision::Monitored
        );
        assert!(commands.locks().list_all().await.unwrap().is_empty());
        assert_eq!(commands.execution_log(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exclusive_commands_serialize_across_agents() {
        let commands = coordinator();
        let granted = commands.request_command_execution("a", "npm install").await.unwrap();
        assert!(matches!(granted, CommandDecision::Granted { .. }));
        assert_eq!(commands.running_heartbeats(), 1);

        let busy = commands.request_command_execution("b", "NPM install").await.unwrap();
        match busy {
            CommandDecision::Busy { owner, .. } => assert_eq!(owner.as_deref(), Some("a")),
            other => panic!("expected busy, got {other:?}"),
        }

        assert!(!commands.complete_command_execution("b", "npm install", true).await.unwrap());
        assert!(commands.complete_command_execution("a", "npm install", true).await.unwrap());
        assert_eq!(commands.running_heartbeats(), 0);

        let again = commands.request_command_execution("b", "npm install").await.unwrap();
        assert!(again.may_run());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_refreshes_lock_metadata() {
        let clock = Arc::new(ManualClock::default());
        let ctx = KernelContext::new(Arc::new(MemoryStore::new()), clock.clone(), "test");
        let commands = CommandCoordinator::new(ctx, CommandConfig::default(), LockConfig::default());

        commands.request_command_execution("a", "npm ci").await.unwrap();
        clock.advance(Duration::from_secs(25));
        tokio::time::sleep(Duration::from_secs(25)).await;

        let status = commands.command_status("npm ci").await.unwrap();
        assert!(status.running);
        assert!(!status.heartbeat_stale);
        assert!(status.last_heartbeat.is_some());

        commands.stop_all_heartbeats();
        clock.advance(Duration::from_secs(31));
        let stale = commands.command_status("npm ci").await.unwrap();
        assert!(stale.heartbeat_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_owner_stops_refreshing_the_next_holder() {
        let clock = Arc::new(ManualClock::default());
        let ctx = KernelContext::new(Arc::new(MemoryStore::new()), clock.clone(), "test");
        let short = CommandConfig {
            lock_ttl_seconds: 20,
            ..CommandConfig::default()
        };
        let first = CommandCoordinator::new(ctx.clone(), short, LockConfig::default());
        let second = CommandCoordinator::new(ctx, CommandConfig::default(), LockConfig::default());

        let granted = first.request_command_execution("a", "npm ci").await.unwrap();
        assert!(matches!(granted, CommandDecision::Granted { .. }));
        clock.advance(Duration::from_secs(21));
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(first.running_heartbeats(), 0);

        let granted = second.request_command_execution("b", "npm ci").await.unwrap();
        assert!(matches!(granted, CommandDecision::Granted { .. }));
        second.stop_all_heartbeats();

        clock.advance(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = second.command_status("npm ci").await.unwrap();
        assert_eq!(status.owner.as_deref(), Some("b"));
        assert!(status.heartbeat_stale);
        assert_eq!(first.running_heartbeats(), 0);
    }
}
