use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Key namespace a lock lives in. File and command locks never interact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockNamespace {
    File,
    Command,
}

impl LockNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockNamespace::File => "file",
            LockNamespace::Command => "command",
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Corrupt lock metadata for {resource_id}: {reason}")]
    CorruptMetadata { resource_id: String, reason: String },
    #[error("Unknown approval request: {0}")]
    UnknownApproval(String),
}

/// Metadata stored alongside a held lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub forced: bool,
    pub reason: Option<String>,
    pub previous_owner: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ResourceLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a single claim attempt. Contention is `success: false`, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub success: bool,
    pub owner: Option<String>,
    pub ttl_remaining: Option<Duration>,
}

impl ClaimOutcome {
    pub fn granted(owner: &str, ttl: Duration) -> Self {
        Self {
            success: true,
            owner: Some(owner.to_string()),
            ttl_remaining: Some(ttl),
        }
    }

    pub fn busy(owner: Option<String>, ttl_remaining: Option<Duration>) -> Self {
        Self {
            success: false,
            owner,
            ttl_remaining,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub success: bool,
    pub message: String,
    pub hold_duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendOutcome {
    pub success: bool,
    pub ttl_remaining: Option<Duration>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceOutcome {
    pub success: bool,
    pub previous_owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub attempts: u32,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockStatus {
    pub resource_id: String,
    pub locked: bool,
    pub owner: Option<String>,
    pub ttl: Option<Duration>,
    pub metadata: Option<ResourceLock>,
}

/// Audit entry written for every forced acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceAuditEntry {
    pub namespace: LockNamespace,
    pub resource_id: String,
    pub previous_owner: Option<String>,
    pub new_owner: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}
