//! Bounded recovery ladder: ping, restart, then hand over to a human.

use tracing::{error, info};

use super::monitor::AgentHealthMonitor;
use super::types::*;
use crate::events::{ControlMessage, EmergencyEvent};
use crate::store::keys::{self, channels};
use crate::store::StoreError;

/// Step taken on the `attempt`th (1-based) recovery try. The final allowed attempt
/// always escalates.
pub fn ladder_step(attempt: u32, max_attempts: u32) -> RecoveryAction {
    if attempt >= max_attempts {
        RecoveryAction::Escalate
    } else if attempt <= 1 {
        RecoveryAction::Ping
    } else {
        RecoveryAction::Restart
    }
}

impl AgentHealthMonitor {
    /// Pick at most one ladder step for a failed agent in the current sweep cycle and
    /// charge it to `record`. Only mutates `record`; the caller runs the step with
    /// [`run_recovery`](Self::run_recovery) once the change is committed.
    pub(super) fn plan_recovery(&self, record: &mut AgentRecord) -> Option<RecoveryAction> {
        if !self.config.auto_recovery || record.status.is_alive() {
            return None;
        }
        let max_attempts = self.config.max_recovery_attempts;
        if record.recovery_attempts >= max_attempts {
            return None;
        }
        let cycle = self.current_cycle();
        if record.last_recovery_cycle == Some(cycle) {
            return None;
        }

        record.recovery_attempts += 1;
        record.last_recovery_cycle = Some(cycle);
        Some(ladder_step(record.recovery_attempts, max_attempts))
    }

    /// Carry out a step already committed to the registry.
    pub(super) async fn run_recovery(
        &self,
        record: &AgentRecord,
        action: RecoveryAction,
        reason: &str,
    ) -> Result<(), HealthError> {
        let entry = RecoveryRecord {
            agent_id: record.id.clone(),
            attempt: record.recovery_attempts,
            action,
            reason: reason.to_string(),
            timestamp: self.ctx.clock.now(),
        };
        self.ctx
            .store
            .push(keys::RECOVERY_LOG, &serde_json::to_string(&entry).map_err(StoreError::from)?)
            .await?;

        match action {
            RecoveryAction::Ping => {
                info!(agent_id = %record.id, attempt = record.recovery_attempts, "Pinging agent");
                self.emit(
                    channels::AGENT_CONTROL,
                    ControlMessage::Ping {
                        agent_id: record.id.clone(),
                    },
                )
                .await;
            }
            RecoveryAction::Restart => {
                info!(agent_id = %record.id, attempt = record.recovery_attempts, "Requesting agent restart");
                self.emit(
                    channels::AGENT_CONTROL,
                    ControlMessage::Restart {
                        agent_id: record.id.clone(),
                        pool: record.pool.clone(),
                    },
                )
                .await;
            }
            RecoveryAction::Escalate => self.escalate(record, reason).await?,
        }
        Ok(())
    }

    async fn escalate(&self, record: &AgentRecord, reason: &str) -> Result<(), HealthError> {
        let escalation = EscalationRecord {
            agent_id: record.id.clone(),
            status: record.status,
            recovery_attempts: record.recovery_attempts,
            error_count: record.error_count,
            reason: reason.to_string(),
            escalated_at: self.ctx.clock.now(),
        };
        self.ctx
            .store
            .push(keys::ESCALATIONS, &serde_json::to_string(&escalation).map_err(StoreError::from)?)
            .await?;

        error!(
            agent_id = %record.id,
            recovery_attempts = record.recovery_attempts,
            reason = %reason,
            "Automatic recovery exhausted, human intervention required"
        );
        self.emit(
            channels::AGENT_EMERGENCY,
            EmergencyEvent::HumanInterventionRequired {
                agent_id: record.id.clone(),
                recovery_attempts: record.recovery_attempts,
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(())
    }

    pub async fn escalations(&self) -> Result<Vec<EscalationRecord>, HealthError> {
        Ok(self
            .ctx
            .store
            .list(keys::ESCALATIONS)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    /// Recovery steps taken, oldest first, optionally for one agent.
    pub async fn recovery_log(&self, agent_id: Option<&str>) -> Result<Vec<RecoveryRecord>, HealthError> {
        Ok(self
            .ctx
            .store
            .list(keys::RECOVERY_LOG)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str::<RecoveryRecord>(raw).ok())
            .filter(|entry| agent_id.map_or(true, |id| entry.agent_id == id))
            .collect())
    }
}
