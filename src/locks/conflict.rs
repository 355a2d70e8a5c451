//! Escalation hooks for a failed claim.
//!
//! None of these touch lock state directly. They record the blocked requester's intent
//! so it can be replayed, negotiated with the owner, or approved by a human.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::manager::LeaseLockManager;
use super::types::{LockError, LockNamespace};
use crate::events::LockEvent;
use crate::store::keys;
use crate::store::StoreError;

/// How a blocked requester wants the conflict handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    QueueAndMerge,
    NotifyAndCoordinate,
    RequireApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConflictResolution {
    Queued { position: usize },
    OwnerNotified { owner: String },
    ApprovalPending { approval_id: String },
    /// The resource was free by the time the hook ran; just claim it.
    NotHeld,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub requester: String,
    pub intent: String,
    pub ttl_seconds: Option<u64>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub namespace: LockNamespace,
    pub resource_id: String,
    pub requester: String,
    pub owner: Option<String>,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Message left in the owner's inbox by `notify_and_coordinate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub resource_id: String,
    pub requester: String,
    pub intent: String,
    pub sent_at: DateTime<Utc>,
}

/// Result of draining a resource queue.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReplayOutcome {
    pub granted_to: Option<String>,
    pub still_queued: usize,
}

impl LeaseLockManager {
    pub async fn resolve_conflict(
        &self,
        strategy: ConflictStrategy,
        resource_id: &str,
        requester: &str,
        intent: &str,
    ) -> Result<ConflictResolution, LockError> {
        match strategy {
            ConflictStrategy::QueueAndMerge => self.queue_and_merge(resource_id, requester, intent, None).await,
            ConflictStrategy::NotifyAndCoordinate => {
                self.notify_and_coordinate(resource_id, requester, intent).await
            }
            ConflictStrategy::RequireApproval => self.require_approval(resource_id, requester, intent).await,
        }
    }

    pub async fn queue_and_merge(
        &self,
        resource_id: &str,
        requester: &str,
        intent: &str,
        ttl: Option<Duration>,
    ) -> Result<ConflictResolution, LockError> {
        let request = QueuedRequest {
            requester: requester.to_string(),
            intent: intent.to_string(),
            ttl_seconds: ttl.map(|d| d.as_secs()),
            queued_at: self.context().clock.now(),
        };
        let queue_key = keys::lock_queue(self.namespace().as_str(), resource_id);
        let position = self
            .context()
            .store
            .push(&queue_key, &serde_json::to_string(&request).map_err(StoreError::from)?)
            .await?;

        info!(resource_id = %resource_id, requester = %requester, position, "Lock request queued");
        self.emit(LockEvent::RequestQueued {
            resource_id: resource_id.to_string(),
            requester: requester.to_string(),
            position,
        })
        .await;
        Ok(ConflictResolution::Queued { position })
    }

    pub async fn notify_and_coordinate(
        &self,
        resource_id: &str,
        requester: &str,
        intent: &str,
    ) -> Result<ConflictResolution, LockError> {
        let Some(owner) = self.status(resource_id).await?.owner else {
            return Ok(ConflictResolution::NotHeld);
        };

        let message = CoordinationMessage {
            resource_id: resource_id.to_string(),
            requester: requester.to_string(),
            intent: intent.to_string(),
            sent_at: self.context().clock.now(),
        };
        self.context()
            .store
            .push(
                &keys::agent_inbox(&owner),
                &serde_json::to_string(&message).map_err(StoreError::from)?,
            )
            .await?;

        info!(resource_id = %resource_id, requester = %requester, owner = %owner, "Owner notified of blocked request");
        self.emit(LockEvent::CoordinationRequest {
            resource_id: resource_id.to_string(),
            owner: owner.clone(),
            requester: requester.to_string(),
            intent: intent.to_string(),
        })
        .await;
        Ok(ConflictResolution::OwnerNotified { owner })
    }

    pub async fn require_approval(
        &self,
        resource_id: &str,
        requester: &str,
        reason: &str,
    ) -> Result<ConflictResolution, LockError> {
        let owner = self.status(resource_id).await?.owner;
        let request = ApprovalRequest {
            approval_id: Uuid::new_v4().to_string(),
            namespace: self.namespace(),
            resource_id: resource_id.to_string(),
            requester: requester.to_string(),
            owner: owner.clone(),
            reason: reason.to_string(),
            requested_at: self.context().clock.now(),
        };
        self.context()
            .store
            .hset(
                keys::APPROVALS_PENDING,
                &request.approval_id,
                &serde_json::to_string(&request).map_err(StoreError::from)?,
            )
            .await?;

        info!(
            approval_id = %request.approval_id,
            resource_id = %resource_id,
            requester = %requester,
            "Lock approval requested"
        );
        self.emit(LockEvent::ApprovalRequired {
            approval_id: request.approval_id.clone(),
            resource_id: resource_id.to_string(),
            requester: requester.to_string(),
            owner,
            reason: reason.to_string(),
        })
        .await;
        Ok(ConflictResolution::ApprovalPending {
            approval_id: request.approval_id,
        })
    }

    pub async fn queued_requests(&self, resource_id: &str) -> Result<Vec<QueuedRequest>, LockError> {
        let queue_key = keys::lock_queue(self.namespace().as_str(), resource_id);
        Ok(self
            .context()
            .store
            .list(&queue_key)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    /// Drain the queue for `resource_id` and grant the lock to the first requester that
    /// can claim it. Everyone behind the winner is re-queued in order.
    pub async fn replay_queue(&self, resource_id: &str, ttl: Option<Duration>) -> Result<ReplayOutcome, LockError> {
        let queue_key = keys::lock_queue(self.namespace().as_str(), resource_id);
        let drained = self.context().store.take(&queue_key).await?;
        let mut outcome = ReplayOutcome::default();

        for raw in drained {
            if outcome.granted_to.is_none() {
                let request: QueuedRequest = match serde_json::from_str(&raw) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(resource_id = %resource_id, error = %e, "Dropping unreadable queued request");
                        continue;
                    }
                };
                let request_ttl = request.ttl_seconds.map(Duration::from_secs).or(ttl);
                if self.claim(resource_id, &request.requester, request_ttl).await?.success {
                    info!(resource_id = %resource_id, requester = %request.requester, "Queued request granted");
                    outcome.granted_to = Some(request.requester);
                    continue;
                }
            }
            self.context().store.push(&queue_key, &raw).await?;
            outcome.still_queued += 1;
        }
        Ok(outcome)
    }

    pub async fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>, LockError> {
        let mut pending: Vec<ApprovalRequest> = self
            .context()
            .store
            .hgetall(keys::APPROVALS_PENDING)
            .await?
            .values()
            .filter_map(|raw| serde_json::from_str::<ApprovalRequest>(raw).ok())
            .filter(|request| request.namespace == self.namespace())
            .collect();
        pending.sort_by_key(|request| request.requested_at);
        Ok(pending)
    }

    /// Approve or reject a pending request. Approval hands the lock over via `force`.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        approver: &str,
        approved: bool,
    ) -> Result<ApprovalRequest, LockError> {
        let raw = self
            .context()
            .store
            .hget(keys::APPROVALS_PENDING, approval_id)
            .await?
            .ok_or_else(|| LockError::UnknownApproval(approval_id.to_string()))?;
        let request: ApprovalRequest = serde_json::from_str(&raw).map_err(StoreError::from)?;
        self.context().store.hdel(keys::APPROVALS_PENDING, approval_id).await?;

        if approved {
            let reason = format!("approved by {approver}: {}", request.reason);
            self.force(&request.resource_id, &request.requester, &reason).await?;
        } else {
            info!(approval_id = %approval_id, approver = %approver, "Lock approval rejected");
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::context::KernelContext;

    fn manager() -> LeaseLockManager {
        LeaseLockManager::for_files(KernelContext::in_memory("test"), LockConfig::default())
    }

    #[tokio::test]
    async fn queue_positions_increase() {
        let locks = manager();
        locks.claim("f", "a", None).await.unwrap();
        let first = locks.queue_and_merge("f", "b", "edit", None).await.unwrap();
        let second = locks.queue_and_merge("f", "c", "edit", None).await.unwrap();
        assert_eq!(first, ConflictResolution::Queued { position: 1 });
        assert_eq!(second, ConflictResolution::Queued { position: 2 });
        // Queueing never touches the lock itself.
        assert_eq!(locks.status("f").await.unwrap().owner.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn replay_grants_first_and_keeps_the_rest() {
        let locks = manager();
        locks.claim("f", "a", None).await.unwrap();
        locks.queue_and_merge("f", "b", "edit", None).await.unwrap();
        locks.queue_and_merge("f", "c", "edit", None).await.unwrap();

        let blocked = locks.replay_queue("f", None).await.unwrap();
        assert_eq!(blocked.granted_to, None);
        assert_eq!(blocked.still_queued, 2);

        locks.release("f", "a").await.unwrap();
        let replayed = locks.replay_queue("f", None).await.unwrap();
        assert_eq!(replayed.granted_to.as_deref(), Some("b"));
        assert_eq!(replayed.still_queued, 1);
        let remaining = locks.queued_requests("f").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].requester, "c");
    }

    #[tokio::test]
    async fn notify_writes_to_owner_inbox() {
        let locks = manager();
        assert_eq!(
            locks.notify_and_coordinate("f", "b", "refactor").await.unwrap(),
            ConflictResolution::NotHeld
        );

        locks.claim("f", "a", None).await.unwrap();
        let resolution = locks
            .resolve_conflict(ConflictStrategy::NotifyAndCoordinate, "f", "b", "refactor")
            .await
            .unwrap();
        assert_eq!(resolution, ConflictResolution::OwnerNotified { owner: "a".into() });

        let inbox = locks.context().store.list(&keys::agent_inbox("a")).await.unwrap();
        let message: CoordinationMessage = serde_json::from_str(&inbox[0]).unwrap();
        assert_eq!(message.requester, "b");
        assert_eq!(message.intent, "refactor");
    }

    #[tokio::test]
    async fn approved_request_forces_lock_with_audit_reason() {
        let locks = manager();
        locks.claim("f", "a", None).await.unwrap();
        let ConflictResolution::ApprovalPending { approval_id } =
            locks.require_approval("f", "b", "hotfix").await.unwrap()
        else {
            panic!("expected pending approval");
        };
        assert_eq!(locks.pending_approvals().await.unwrap().len(), 1);

        locks.resolve_approval(&approval_id, "oncall", true).await.unwrap();
        assert_eq!(locks.status("f").await.unwrap().owner.as_deref(), Some("b"));
        assert!(locks.pending_approvals().await.unwrap().is_empty());

        let audit = locks.force_audit_log(10).await.unwrap();
        assert_eq!(audit[0].previous_owner.as_deref(), Some("a"));
        assert!(audit[0].reason.contains("approved by oncall"));
    }

    #[tokio::test]
    async fn rejected_or_unknown_approvals_leave_lock_alone() {
        let locks = manager();
        locks.claim("f", "a", None).await.unwrap();
        let ConflictResolution::ApprovalPending { approval_id } =
            locks.require_approval("f", "b", "hotfix").await.unwrap()
        else {
            panic!("expected pending approval");
        };

        locks.resolve_approval(&approval_id, "oncall", false).await.unwrap();
        assert_eq!(locks.status("f").await.unwrap().owner.as_deref(), Some("a"));

        let err = locks.resolve_approval(&approval_id, "oncall", true).await.unwrap_err();
        assert!(matches!(err, LockError::UnknownApproval(_)));
    }
}
