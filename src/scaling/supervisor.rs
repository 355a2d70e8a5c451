//! Child process supervision for scaled agents.
//!
//! [`ProcessSupervisor`] is the seam between scaling decisions and the OS: start a
//! process, terminate it with a grace period, force-kill it afterwards. Unexpected
//! exits are reported as [`ExitNotice`]s on the channel handed to the supervisor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SupervisorError {
    #[error("Failed to spawn agent {agent_id}: {reason}")]
    Spawn { agent_id: String, reason: String },
    #[error("Agent {0} is already supervised")]
    DuplicateAgent(String),
    #[error("Failed to signal agent {agent_id}: {reason}")]
    Signal { agent_id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub agent_id: String,
    pub pool_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotice {
    pub agent_id: String,
    pub pool_id: String,
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    Graceful,
    Killed,
    NotRunning,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start a process, returning its OS pid when known.
    async fn spawn(&self, spec: ProcessSpec) -> Result<Option<u32>, SupervisorError>;

    /// Ask the process to stop, force-killing it once `grace` has elapsed.
    async fn terminate(&self, agent_id: &str, grace: Duration) -> Result<TerminationOutcome, SupervisorError>;

    fn is_alive(&self, agent_id: &str) -> bool;
}

/// A process started by the auto-scaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedAgent {
    pub agent_id: String,
    pub pool_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub urgency: String,
}

/// In-process table of supervised agents, kept in start order per pool.
#[derive(Debug, Default)]
pub struct SupervisedTable {
    pools: HashMap<String, Vec<SupervisedAgent>>,
}

impl SupervisedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.pools
            .values()
            .any(|agents| agents.iter().any(|a| a.agent_id == agent_id))
    }

    pub fn insert(&mut self, agent: SupervisedAgent) -> Result<(), SupervisorError> {
        if self.contains(&agent.agent_id) {
            return Err(SupervisorError::DuplicateAgent(agent.agent_id));
        }
        self.pools.entry(agent.pool_id.clone()).or_default().push(agent);
        Ok(())
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<SupervisedAgent> {
        for agents in self.pools.values_mut() {
            if let Some(index) = agents.iter().position(|a| a.agent_id == agent_id) {
                return Some(agents.remove(index));
            }
        }
        None
    }

    pub fn count(&self, pool_id: &str) -> u32 {
        self.pools
            .get(pool_id)
            .map(|agents| u32::try_from(agents.len()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }

    /// The `count` most recently started agents of a pool, newest first.
    pub fn newest(&self, pool_id: &str, count: usize) -> Vec<SupervisedAgent> {
        self.pools
            .get(pool_id)
            .map(|agents| agents.iter().rev().take(count).cloned().collect())
            .unwrap_or_default()
    }

    pub fn agents(&self, pool_id: &str) -> Vec<SupervisedAgent> {
        self.pools.get(pool_id).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> Vec<SupervisedAgent> {
        self.pools.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ChildHandle {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// Supervisor backed by real OS processes.
pub struct TokioProcessSupervisor {
    children: Arc<Mutex<HashMap<String, ChildHandle>>>,
    exits: mpsc::UnboundedSender<ExitNotice>,
}

impl std::fmt::Debug for TokioProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let running = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("TokioProcessSupervisor")
            .field("running", &running)
            .finish()
    }
}

impl TokioProcessSupervisor {
    pub fn new(exits: mpsc::UnboundedSender<ExitNotice>) -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            exits,
        }
    }

    #[cfg(unix)]
    async fn send_terminate(agent_id: &str, pid: u32) -> Result<(), SupervisorError> {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| SupervisorError::Signal {
                agent_id: agent_id.to_string(),
                reason: e.to_string(),
            })?;
        if !status.success() {
            debug!(agent_id = %agent_id, pid, "kill -TERM reported failure, process may have exited");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn send_terminate(_agent_id: &str, _pid: u32) -> Result<(), SupervisorError> {
        Ok(())
    }
}

async fn wait_exit(exited: &mut watch::Receiver<bool>) {
    loop {
        let done = *exited.borrow_and_update();
        if done || exited.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl ProcessSupervisor for TokioProcessSupervisor {
    async fn spawn(&self, spec: ProcessSpec) -> Result<Option<u32>, SupervisorError> {
        if self.is_alive(&spec.agent_id) {
            return Err(SupervisorError::DuplicateAgent(spec.agent_id));
        }

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| SupervisorError::Spawn {
            agent_id: spec.agent_id.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                spec.agent_id.clone(),
                ChildHandle {
                    pid,
                    kill: Some(kill_tx),
                    exited: exited_rx,
                },
            );

        let children = Arc::clone(&self.children);
        let exits = self.exits.clone();
        let ProcessSpec {
            agent_id, pool_id, ..
        } = spec;
        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        warn!(agent_id = %agent_id, error = %e, "Force kill failed");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!(agent_id = %agent_id, error = %e, "Failed waiting on agent process");
                    None
                }
            };
            children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&agent_id);
            let _ = exited_tx.send(true);
            debug!(agent_id = %agent_id, pool_id = %pool_id, code = ?code, "Agent process exited");
            let _ = exits.send(ExitNotice {
                agent_id,
                pool_id,
                code,
            });
        });

        Ok(pid)
    }

    async fn terminate(&self, agent_id: &str, grace: Duration) -> Result<TerminationOutcome, SupervisorError> {
        let (pid, mut exited) = {
            let children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            match children.get(agent_id) {
                Some(handle) => (handle.pid, handle.exited.clone()),
                None => return Ok(TerminationOutcome::NotRunning),
            }
        };

        if let Some(pid) = pid {
            info!(agent_id = %agent_id, pid, "Sending graceful terminate");
            Self::send_terminate(agent_id, pid).await?;
        }

        let graceful = tokio::time::timeout(grace, wait_exit(&mut exited)).await.is_ok();
        if graceful {
            return Ok(TerminationOutcome::Graceful);
        }

        warn!(agent_id = %agent_id, grace_secs = grace.as_secs(), "Grace period elapsed, force killing");
        let kill = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(agent_id)
            .and_then(|handle| handle.kill.take());
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        wait_exit(&mut exited).await;
        Ok(TerminationOutcome::Killed)
    }

    fn is_alive(&self, agent_id: &str) -> bool {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }
}
