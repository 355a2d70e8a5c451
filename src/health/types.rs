use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::store::StoreError;

/// Agent liveness state. `Active`, `Idle` and `Working` all count as alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Working,
    Unresponsive,
    Crashed,
}

impl AgentStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Idle | AgentStatus::Working)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Unresponsive => "unresponsive",
            AgentStatus::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
    #[error("Agent record {0} kept changing under concurrent writers")]
    Contended(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub pool: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub error_count: u32,
    pub recovery_attempts: u32,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub heartbeat_count: u64,
    #[serde(default)]
    pub missed_heartbeats: u32,
    /// Sweep cycle in which the last recovery step ran.
    #[serde(default)]
    pub last_recovery_cycle: Option<u64>,
}

impl AgentRecord {
    pub fn new(id: &str, capabilities: Vec<String>, pool: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            capabilities,
            pool,
            status: AgentStatus::Active,
            last_heartbeat: now,
            error_count: 0,
            recovery_attempts: 0,
            registered_at: now,
            heartbeat_count: 0,
            missed_heartbeats: 0,
            last_recovery_cycle: None,
        }
    }

    pub fn seconds_since_heartbeat(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat).num_seconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Ping,
    Restart,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub agent_id: String,
    pub attempt: u32,
    pub action: RecoveryAction,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable record written when automatic recovery gives up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub agent_id: String,
    pub status: AgentStatus,
    pub recovery_attempts: u32,
    pub error_count: u32,
    pub reason: String,
    pub escalated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub error: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Capacity,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Capacity => "capacity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityReport {
    pub agent_id: String,
    pub pool: Option<String>,
    pub queue_backlog: f64,
    pub max_capacity: u32,
    pub utilization_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub alive: usize,
    pub total: usize,
    pub ratio: f64,
}

impl SystemHealth {
    pub fn from_counts(alive: usize, total: usize) -> Self {
        let ratio = if total == 0 { 1.0 } else { alive as f64 / total as f64 };
        Self { alive, total, ratio }
    }
}

/// Registry entry enriched with the agent's latest metrics and capacity figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub record: AgentRecord,
    pub metrics: HashMap<String, serde_json::Value>,
    pub capacity: Option<CapacityReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub cycle: u64,
    pub checked: usize,
    pub newly_unresponsive: Vec<String>,
    pub recovery_steps: usize,
    pub skipped_errors: usize,
    pub health: Option<SystemHealth>,
    pub shed_agents: Vec<String>,
}
