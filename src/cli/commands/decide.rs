use anyhow::Result;
use chrono::Utc;

use crate::config::{FleetKernelConfig, PoolConfig};
use crate::scaling::{make_scaling_decision, PoolMetrics, ScalingDecision, ScalingPolicy};

/// Evaluates one pool snapshot without touching any store or process.
pub struct DecideCommand {
    pub pool: String,
    pub queue_depth: u64,
    pub processing: u64,
    pub current_agents: u32,
    pub avg_time: f64,
    pub error_rate: f64,
}

impl DecideCommand {
    pub fn decide(&self, config: &FleetKernelConfig) -> ScalingDecision {
        let pool = config
            .scaling
            .pools
            .iter()
            .find(|p| p.pool_id == self.pool)
            .cloned()
            .unwrap_or_else(|| PoolConfig {
                pool_id: self.pool.clone(),
                ..PoolConfig::default()
            });
        let policy = ScalingPolicy::from_config(&config.scaling, &pool);

        let now = Utc::now();
        let metrics = PoolMetrics {
            queue_depth: self.queue_depth,
            processing_count: self.processing,
            avg_processing_time: self.avg_time,
            error_rate: self.error_rate,
            ..PoolMetrics::idle(&self.pool, self.current_agents, now)
        };
        make_scaling_decision(&metrics, &policy, None, now)
    }

    pub fn execute(&self, config: &FleetKernelConfig) -> Result<()> {
        let decision = self.decide(config);
        println!("{}", serde_json::to_string_pretty(&decision)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaling::ScalingAction;

    fn command(queue_depth: u64, processing: u64, current_agents: u32) -> DecideCommand {
        DecideCommand {
            pool: "default".to_string(),
            queue_depth,
            processing,
            current_agents,
            avg_time: 0.0,
            error_rate: 0.0,
        }
    }

    #[test]
    fn deep_queue_scales_up() {
        let decision = command(45, 0, 1).decide(&FleetKernelConfig::default());
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.to_count, 3);
    }

    #[test]
    fn pool_limits_come_from_config() {
        let mut config = FleetKernelConfig::default();
        config.scaling.pools.push(PoolConfig {
            pool_id: "small".to_string(),
            command: "worker".to_string(),
            max_agents: Some(2),
            ..PoolConfig::default()
        });
        let mut cmd = command(200, 0, 1);
        cmd.pool = "small".to_string();
        let decision = cmd.decide(&config);
        assert_eq!(decision.to_count, 2);
    }
}
