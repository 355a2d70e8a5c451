// Key and channel namespaces shared by every kernel instance.

pub const AUDIT_FORCE_LOCKS: &str = "audit:force-locks";
pub const APPROVALS_PENDING: &str = "approvals:pending";
pub const COMMAND_LOG: &str = "commands:log";
pub const AGENT_REGISTRY: &str = "agents:registry";
pub const AGENT_HEARTBEATS: &str = "agents:heartbeats";
pub const AGENT_HEARTBEAT_COUNTS: &str = "agents:heartbeat-counts";
pub const RECOVERY_LOG: &str = "health:recovery-log";
pub const ESCALATIONS: &str = "health:escalations";
pub const ACTIVE_ALERTS: &str = "health:alerts";
pub const HEALTH_COUNTERS: &str = "health:counters";
pub const SCALER_LAST_ACTION: &str = "autoscaler:last-action";
pub const SCALER_HISTORY: &str = "autoscaler:history";

pub mod channels {
    pub const FILE_LOCKS: &str = "file-locks";
    pub const COMMAND_EXECUTION: &str = "command_execution";
    pub const AGENT_REGISTRY: &str = "agent-registry";
    pub const AGENT_HEARTBEAT: &str = "agent-heartbeat";
    pub const AGENT_STATUS: &str = "agent-status";
    pub const AGENT_ERRORS: &str = "agent-errors";
    pub const AGENT_EMERGENCY: &str = "agent-emergency";
    pub const AGENT_CONTROL: &str = "agent-control";
    pub const AGENT_EVENTS: &str = "agent-events";
    pub const SCALER_ACTION: &str = "autoscaler:action";
}

pub fn lock(namespace: &str, resource_id: &str) -> String {
    format!("lock:{namespace}:{resource_id}")
}

pub fn lock_prefix(namespace: &str) -> String {
    format!("lock:{namespace}:")
}

pub fn lock_meta(namespace: &str, resource_id: &str) -> String {
    format!("lock-meta:{namespace}:{resource_id}")
}

pub fn lock_meta_prefix(namespace: &str) -> String {
    format!("lock-meta:{namespace}:")
}

pub fn lock_queue(namespace: &str, resource_id: &str) -> String {
    format!("lock-queue:{namespace}:{resource_id}")
}

pub fn agent_inbox(agent_id: &str) -> String {
    format!("agent-inbox:{agent_id}")
}

pub fn agent_metrics(agent_id: &str) -> String {
    format!("agent-metrics:{agent_id}")
}

pub fn agent_errors(agent_id: &str) -> String {
    format!("agent-errors:{agent_id}")
}

pub fn agent_errors_prefix() -> &'static str {
    "agent-errors:"
}

pub fn queue(pool_id: &str) -> String {
    format!("queue:{pool_id}")
}

pub fn processing(pool_id: &str) -> String {
    format!("processing:{pool_id}")
}

pub fn pool_stats(pool_id: &str) -> String {
    format!("pool-stats:{pool_id}")
}

pub fn pool_durations(pool_id: &str) -> String {
    format!("pool-durations:{pool_id}")
}

/// Strip a namespace prefix, returning the resource id portion.
pub fn strip<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}
