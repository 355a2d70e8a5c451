//! Teardown for agents the kernel stops on purpose.
//!
//! A scaled-down, restarted or shut-down agent gets the same treatment: its file and
//! command locks are released and it leaves the registry, so the health sweep never
//! mistakes it for a silent agent.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::health::AgentHealthMonitor;
use crate::locks::{CommandCoordinator, LeaseLockManager};

#[derive(Debug, Clone)]
pub struct AgentRetirement {
    locks: LeaseLockManager,
    commands: Arc<CommandCoordinator>,
    health: Arc<AgentHealthMonitor>,
}

impl AgentRetirement {
    pub fn new(
        locks: LeaseLockManager,
        commands: Arc<CommandCoordinator>,
        health: Arc<AgentHealthMonitor>,
    ) -> Self {
        Self {
            locks,
            commands,
            health,
        }
    }

    /// Release everything `agent_id` holds and unregister it. Failures are logged and
    /// the remaining steps still run. Returns the number of locks released.
    pub async fn retire(&self, agent_id: &str) -> usize {
        let mut released = 0;
        match self.locks.emergency_release_all(agent_id).await {
            Ok(count) => released += count,
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to release stopped agent's file locks"),
        }
        match self.commands.release_all_for(agent_id).await {
            Ok(count) => released += count,
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to release stopped agent's command locks"),
        }
        if let Err(e) = self.health.unregister(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to unregister stopped agent");
        }
        debug!(agent_id = %agent_id, released, "Stopped agent retired");
        released
    }
}
