//! Pure scaling decision logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::metrics::PoolMetrics;
use crate::config::{PoolConfig, ScalingConfig};

/// Average job time (seconds) above which a slow, failing pool gets one extra agent.
pub const DEGRADED_AVG_SECONDS: f64 = 300.0;
/// Error rate above which a slow pool counts as degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn from_score(score: f64) -> Self {
        if score > 3.0 {
            Urgency::Critical
        } else if score > 2.0 {
            Urgency::High
        } else if score > 1.0 {
            Urgency::Medium
        } else {
            Urgency::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub pool_id: String,
    pub action: ScalingAction,
    pub from_count: u32,
    pub to_count: u32,
    pub reason: String,
    pub urgency: Urgency,
    pub urgency_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl ScalingDecision {
    /// Agents to add (positive) or remove (negative).
    pub fn delta(&self) -> i64 {
        i64::from(self.to_count) - i64::from(self.from_count)
    }

    pub fn is_action(&self) -> bool {
        self.action != ScalingAction::None
    }
}

/// Effective limits for one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_agents: u32,
    pub max_agents: u32,
    pub scale_up_threshold: u32,
    pub scale_down_threshold: u32,
    pub cooldown: Duration,
}

impl ScalingPolicy {
    pub fn from_config(scaling: &ScalingConfig, pool: &PoolConfig) -> Self {
        Self {
            min_agents: pool.min_agents.unwrap_or(scaling.min_agents),
            max_agents: pool.max_agents.unwrap_or(scaling.max_agents),
            scale_up_threshold: pool.scale_up_threshold.unwrap_or(scaling.scale_up_threshold),
            scale_down_threshold: pool
                .scale_down_threshold
                .unwrap_or(scaling.scale_down_threshold),
            cooldown: Duration::from_secs(pool.cooldown_seconds.unwrap_or(scaling.cooldown_seconds)),
        }
    }
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from_config(&ScalingConfig::default(), &PoolConfig::default())
    }
}

/// Informational severity: queue pressure + error weight + latency in minutes.
pub fn urgency_score(metrics: &PoolMetrics, policy: &ScalingPolicy) -> f64 {
    let up = f64::from(policy.scale_up_threshold.max(1));
    metrics.queue_depth as f64 / up + metrics.error_rate * 10.0 + metrics.avg_processing_time / 60.0
}

fn div_ceil(load: u64, threshold: u32) -> u64 {
    load.div_ceil(u64::from(threshold.max(1)))
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Decide what to do with a pool. Pure: all state comes in as arguments.
pub fn make_scaling_decision(
    metrics: &PoolMetrics,
    policy: &ScalingPolicy,
    last_action: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ScalingDecision {
    let score = urgency_score(metrics, policy);
    let current = metrics.current_agents;
    let decision = |action, to_count, reason: String| ScalingDecision {
        pool_id: metrics.pool_id.clone(),
        action,
        from_count: current,
        to_count,
        reason,
        urgency: Urgency::from_score(score),
        urgency_score: score,
        timestamp: now,
    };

    if let Some(last) = last_action {
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed < policy.cooldown {
            let remaining = policy.cooldown - elapsed;
            return decision(
                ScalingAction::None,
                current,
                format!("cooldown ({}s remaining)", remaining.as_secs()),
            );
        }
    }

    let load = metrics.total_load();

    if metrics.queue_depth > u64::from(policy.scale_up_threshold) && current < policy.max_agents {
        let target = clamp_u32(div_ceil(load, policy.scale_up_threshold)).min(policy.max_agents);
        if target > current {
            return decision(
                ScalingAction::ScaleUp,
                target,
                format!(
                    "queue depth {} above threshold {}",
                    metrics.queue_depth, policy.scale_up_threshold
                ),
            );
        }
    }

    if metrics.queue_depth < u64::from(policy.scale_down_threshold)
        && current > policy.min_agents
        && metrics.processing_count == 0
    {
        let wanted = clamp_u32(div_ceil(load, policy.scale_down_threshold)).max(1);
        let target = wanted.max(policy.min_agents);
        if target < current {
            return decision(
                ScalingAction::ScaleDown,
                target,
                format!(
                    "queue depth {} below threshold {} with nothing processing",
                    metrics.queue_depth, policy.scale_down_threshold
                ),
            );
        }
    }

    if metrics.avg_processing_time > DEGRADED_AVG_SECONDS
        && metrics.error_rate > DEGRADED_ERROR_RATE
        && current < policy.max_agents
    {
        return decision(
            ScalingAction::ScaleUp,
            current + 1,
            format!(
                "performance degradation: avg {:.0}s, error rate {:.0}%",
                metrics.avg_processing_time,
                metrics.error_rate * 100.0
            ),
        );
    }

    decision(ScalingAction::None, current, "load within thresholds".to_string())
}
