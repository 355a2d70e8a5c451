//! Event vocabulary of the kernel.
//!
//! Outbound events are published as JSON [`Envelope`]s whose `type` field names the
//! variant (`file_claimed`, `agent_crashed`, ...). Inbound agent traffic is the closed
//! [`AgentEvent`] enum; anything the kernel does not recognise lands in
//! [`AgentEvent::Unknown`] and is logged rather than silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::health::{AgentStatus, Severity};
use crate::store::{CoordinationStore, StoreError};

/// Wire shape shared by every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(flatten)]
    pub payload: T,
}

/// Serialize `payload` into an envelope stamped `timestamp` and publish it on `channel`.
pub async fn publish<T: Serialize>(
    store: &dyn CoordinationStore,
    channel: &str,
    source: &str,
    timestamp: DateTime<Utc>,
    payload: T,
) -> Result<usize, StoreError> {
    let envelope = Envelope {
        timestamp,
        source: source.to_string(),
        payload,
    };
    let message = serde_json::to_string(&envelope)?;
    store.publish(channel, &message).await
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockEvent {
    FileClaimed {
        resource_id: String,
        owner: String,
        ttl_seconds: u64,
    },
    FileReleased {
        resource_id: String,
        owner: String,
        hold_duration_seconds: i64,
    },
    FileForceLocked {
        resource_id: String,
        previous_owner: Option<String>,
        new_owner: String,
        reason: String,
    },
    RequestQueued {
        resource_id: String,
        requester: String,
        position: usize,
    },
    CoordinationRequest {
        resource_id: String,
        owner: String,
        requester: String,
        intent: String,
    },
    ApprovalRequired {
        approval_id: String,
        resource_id: String,
        requester: String,
        owner: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandEvent {
    ExclusiveCommandStarted {
        command_hash: String,
        command: String,
        agent_id: String,
    },
    ExclusiveCommandCompleted {
        command_hash: String,
        command: String,
        agent_id: String,
        success: bool,
        duration_seconds: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    AgentRegistered {
        agent_id: String,
        capabilities: Vec<String>,
        pool: Option<String>,
    },
    AgentUnregistered {
        agent_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    AgentHeartbeat {
        agent_id: String,
        status: AgentStatus,
        heartbeat_count: u64,
    },
    AgentStatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentUnresponsive {
        agent_id: String,
        seconds_since_heartbeat: i64,
        missed_heartbeats: u32,
    },
    AgentRecovered {
        agent_id: String,
        previous_status: AgentStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorEvent {
    AgentError {
        agent_id: String,
        error: String,
        severity: Severity,
        error_count: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmergencyEvent {
    AgentCrashed {
        agent_id: String,
        reason: Option<String>,
    },
    SystemOverload {
        agent_id: String,
        pool: Option<String>,
        utilization_percent: f64,
    },
    LowSystemHealth {
        health_ratio: f64,
        alive: usize,
        total: usize,
    },
    HumanInterventionRequired {
        agent_id: String,
        recovery_attempts: u32,
        reason: String,
    },
}

/// Control messages addressed to agents or to whoever supervises them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping {
        agent_id: String,
    },
    Restart {
        agent_id: String,
        pool: Option<String>,
    },
    Shutdown {
        agent_id: String,
        reason: String,
    },
}

/// Traffic agents publish on the inbound `agent-events` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Register {
        agent_id: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        pool: Option<String>,
    },
    Heartbeat {
        agent_id: String,
        #[serde(default)]
        status: Option<AgentStatus>,
        #[serde(default)]
        metrics: HashMap<String, serde_json::Value>,
    },
    Error {
        agent_id: String,
        error: String,
        #[serde(default)]
        severity: Severity,
    },
    Crash {
        agent_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Unregister {
        agent_id: String,
    },
    #[serde(other)]
    Unknown,
}
