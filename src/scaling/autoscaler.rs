//! Auto-scaler control loop.
//!
//! Every evaluation gathers pool metrics, asks [`make_scaling_decision`] what to do,
//! and executes non-trivial decisions through the [`ProcessSupervisor`]. The cooldown
//! timestamp and decision history live in the store so a restarted kernel keeps
//! honouring them.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::decision::{make_scaling_decision, ScalingAction, ScalingDecision, ScalingPolicy, Urgency};
use super::metrics::{gather_metrics, PoolMetrics, QueueProbe, StoreQueueProbe};
use super::supervisor::{ExitNotice, ProcessSpec, ProcessSupervisor, SupervisedAgent, SupervisedTable, TerminationOutcome};
use super::ScalingError;
use crate::config::{PoolConfig, ScalingConfig};
use crate::context::KernelContext;
use crate::events::ControlMessage;
use crate::health::AgentHealthMonitor;
use crate::retirement::AgentRetirement;
use crate::store::keys::{self, channels};
use crate::store::StoreError;

pub struct AutoScaler {
    ctx: KernelContext,
    config: ScalingConfig,
    supervisor: Arc<dyn ProcessSupervisor>,
    probe: Arc<dyn QueueProbe>,
    table: Mutex<SupervisedTable>,
    exits: Mutex<mpsc::UnboundedReceiver<ExitNotice>>,
    latest_metrics: Mutex<HashMap<String, PoolMetrics>>,
    health: Option<Arc<AgentHealthMonitor>>,
    retirement: Option<AgentRetirement>,
}

impl std::fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaler")
            .field("pools", &self.config.pools.len())
            .field("supervised", &self.table().len())
            .finish()
    }
}

impl AutoScaler {
    pub fn new(
        ctx: KernelContext,
        config: ScalingConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        exits: mpsc::UnboundedReceiver<ExitNotice>,
    ) -> Self {
        let probe = Arc::new(StoreQueueProbe::new(ctx.store.clone()));
        Self {
            ctx,
            config,
            supervisor,
            probe,
            table: Mutex::new(SupervisedTable::new()),
            exits: Mutex::new(exits),
            latest_metrics: Mutex::new(HashMap::new()),
            health: None,
            retirement: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn QueueProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Enables the deferred check that spawned agents actually registered.
    pub fn with_health_monitor(mut self, health: Arc<AgentHealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Release locks and registry entries of agents this scaler stops.
    pub fn with_retirement(mut self, retirement: AgentRetirement) -> Self {
        self.retirement = Some(retirement);
        self
    }

    fn table(&self) -> std::sync::MutexGuard<'_, SupervisedTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pool(&self, pool_id: &str) -> Result<&PoolConfig, ScalingError> {
        self.config
            .pools
            .iter()
            .find(|p| p.pool_id == pool_id)
            .ok_or_else(|| ScalingError::UnknownPool(pool_id.to_string()))
    }

    pub fn policy(&self, pool_id: &str) -> Result<ScalingPolicy, ScalingError> {
        Ok(ScalingPolicy::from_config(&self.config, self.pool(pool_id)?))
    }

    /// Forget processes that exited on their own.
    pub fn drain_exits(&self) -> usize {
        let mut exits = self.exits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        while let Ok(notice) = exits.try_recv() {
            if self.table().remove(&notice.agent_id).is_some() {
                warn!(
                    agent_id = %notice.agent_id,
                    pool_id = %notice.pool_id,
                    code = ?notice.code,
                    "Supervised agent exited unexpectedly"
                );
                removed += 1;
            }
        }
        removed
    }

    /// Evaluate every configured pool. A failing pool is logged and skipped.
    pub async fn evaluate_scaling(&self) -> Vec<ScalingDecision> {
        self.drain_exits();
        let mut decisions = Vec::with_capacity(self.config.pools.len());
        for pool in &self.config.pools {
            match self.evaluate_pool(&pool.pool_id).await {
                Ok(decision) => decisions.push(decision),
                Err(e) => warn!(pool_id = %pool.pool_id, error = %e, "Scaling evaluation failed"),
            }
        }
        decisions
    }

    pub async fn evaluate_pool(&self, pool_id: &str) -> Result<ScalingDecision, ScalingError> {
        let policy = self.policy(pool_id)?;
        let now = self.ctx.clock.now();
        let current = self.table().count(pool_id);
        let metrics = gather_metrics(self.ctx.store.as_ref(), self.probe.as_ref(), pool_id, current, now).await?;
        self.latest_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool_id.to_string(), metrics.clone());

        let last_action = self.last_action(pool_id).await?;
        let decision = make_scaling_decision(&metrics, &policy, last_action, now);
        debug!(
            pool_id = %pool_id,
            action = ?decision.action,
            queue_depth = metrics.queue_depth,
            processing = metrics.processing_count,
            current_agents = current,
            reason = %decision.reason,
            "Scaling decision"
        );

        match decision.action {
            ScalingAction::None => return Ok(decision),
            ScalingAction::ScaleUp => {
                let count = u32::try_from(decision.delta()).unwrap_or(0);
                self.scale_up(pool_id, count, decision.urgency).await?;
            }
            ScalingAction::ScaleDown => {
                let count = usize::try_from(-decision.delta()).unwrap_or(0);
                self.scale_down(pool_id, count).await;
            }
        }
        self.record(&decision).await?;
        Ok(decision)
    }

    async fn last_action(&self, pool_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .ctx
            .store
            .hget(keys::SCALER_LAST_ACTION, pool_id)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    async fn record(&self, decision: &ScalingDecision) -> Result<(), StoreError> {
        let store = &self.ctx.store;
        store
            .hset(
                keys::SCALER_LAST_ACTION,
                &decision.pool_id,
                &decision.timestamp.to_rfc3339(),
            )
            .await?;
        store
            .push(keys::SCALER_HISTORY, &serde_json::to_string(decision)?)
            .await?;
        store.trim(keys::SCALER_HISTORY, self.config.history_max).await?;

        info!(
            pool_id = %decision.pool_id,
            action = ?decision.action,
            from = decision.from_count,
            to = decision.to_count,
            urgency = decision.urgency.as_str(),
            reason = %decision.reason,
            "Scaling action executed"
        );
        if let Err(e) = self.ctx.publish(channels::SCALER_ACTION, decision).await {
            warn!(error = %e, "Failed to publish scaling decision");
        }
        Ok(())
    }

    /// Start `count` agents in a pool. Failed spawns are logged and not counted.
    pub async fn scale_up(&self, pool_id: &str, count: u32, urgency: Urgency) -> Result<Vec<String>, ScalingError> {
        let pool = self.pool(pool_id)?.clone();
        let mut spawned = Vec::new();
        for _ in 0..count {
            let agent_id = format!("{}-{}", pool.pool_id, &Uuid::new_v4().simple().to_string()[..8]);
            if self.spawn_agent(&pool, &agent_id, urgency).await {
                spawned.push(agent_id);
            }
        }
        Ok(spawned)
    }

    async fn spawn_agent(&self, pool: &PoolConfig, agent_id: &str, urgency: Urgency) -> bool {
        if self.table().contains(agent_id) {
            warn!(agent_id = %agent_id, "Refusing to spawn duplicate agent id");
            return false;
        }

        let spec = ProcessSpec {
            agent_id: agent_id.to_string(),
            pool_id: pool.pool_id.clone(),
            command: pool.command.clone(),
            args: pool.args.clone(),
            env: vec![
                ("FLEET_AGENT_ID".to_string(), agent_id.to_string()),
                ("FLEET_POOL_ID".to_string(), pool.pool_id.clone()),
                ("FLEET_SCALING_URGENCY".to_string(), urgency.as_str().to_string()),
                ("FLEET_KERNEL_INSTANCE".to_string(), self.ctx.instance_id.clone()),
            ],
        };

        match self.supervisor.spawn(spec).await {
            Ok(pid) => {
                let inserted = self.table().insert(SupervisedAgent {
                    agent_id: agent_id.to_string(),
                    pool_id: pool.pool_id.clone(),
                    pid,
                    started_at: self.ctx.clock.now(),
                    urgency: urgency.as_str().to_string(),
                });
                if let Err(e) = inserted {
                    warn!(agent_id = %agent_id, error = %e, "Spawned agent already tracked");
                    return false;
                }
                info!(agent_id = %agent_id, pool_id = %pool.pool_id, pid = ?pid, urgency = urgency.as_str(), "Agent spawned");
                self.schedule_liveness_check(agent_id);
                true
            }
            Err(e) => {
                error!(agent_id = %agent_id, pool_id = %pool.pool_id, error = %e, "Agent spawn failed");
                false
            }
        }
    }

    fn schedule_liveness_check(&self, agent_id: &str) {
        let Some(health) = self.health.clone() else {
            return;
        };
        let supervisor = Arc::clone(&self.supervisor);
        let delay = Duration::from_secs(self.config.liveness_check_delay_seconds);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !supervisor.is_alive(&agent_id) {
                return;
            }
            match health.get(&agent_id).await {
                Ok(Some(_)) => debug!(agent_id = %agent_id, "Spawned agent registered"),
                Ok(None) => warn!(
                    agent_id = %agent_id,
                    delay_secs = delay.as_secs(),
                    "Spawned agent never registered with the health monitor"
                ),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Liveness check failed"),
            }
        });
    }

    /// Stop the `count` most recently started agents of a pool.
    pub async fn scale_down(&self, pool_id: &str, count: usize) -> Vec<String> {
        let victims = {
            let mut table = self.table();
            let victims = table.newest(pool_id, count);
            for victim in &victims {
                table.remove(&victim.agent_id);
            }
            victims
        };
        self.terminate_all(victims).await
    }

    /// Gracefully stop every supervised process. Stopped agents are retired when a
    /// retirement handle is attached.
    pub async fn stop_all(&self) -> Vec<String> {
        let everyone = {
            let mut table = self.table();
            let all = table.all();
            for agent in &all {
                table.remove(&agent.agent_id);
            }
            all
        };
        if everyone.is_empty() {
            return Vec::new();
        }
        info!(agents = everyone.len(), "Stopping all supervised agents");
        self.terminate_all(everyone).await
    }

    async fn terminate_all(&self, agents: Vec<SupervisedAgent>) -> Vec<String> {
        let grace = Duration::from_secs(self.config.termination_grace_seconds);
        let results = join_all(agents.iter().map(|agent| async move {
            let outcome = self.supervisor.terminate(&agent.agent_id, grace).await;
            (agent.agent_id.clone(), outcome)
        }))
        .await;

        let mut stopped = Vec::new();
        for (agent_id, outcome) in results {
            match outcome {
                Ok(TerminationOutcome::Killed) => {
                    warn!(agent_id = %agent_id, "Agent force-killed after grace period");
                    stopped.push(agent_id);
                }
                Ok(_) => {
                    info!(agent_id = %agent_id, "Agent stopped");
                    stopped.push(agent_id);
                }
                Err(e) => error!(agent_id = %agent_id, error = %e, "Failed to stop agent"),
            }
        }

        if let Some(retirement) = &self.retirement {
            for agent_id in &stopped {
                retirement.retire(agent_id).await;
            }
        }
        stopped
    }

    /// Honour a restart request for an agent this scaler supervises: stop it and start a
    /// replacement in the same pool. Returns the replacement id.
    pub async fn handle_control(&self, message: ControlMessage) -> Option<String> {
        let ControlMessage::Restart { agent_id, .. } = message else {
            return None;
        };
        let agent = self.table().remove(&agent_id)?;
        info!(agent_id = %agent_id, pool_id = %agent.pool_id, "Restarting supervised agent");
        self.terminate_all(vec![agent.clone()]).await;

        let pool = match self.pool(&agent.pool_id) {
            Ok(pool) => pool.clone(),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Cannot respawn agent");
                return None;
            }
        };
        let replacement = format!("{}-{}", pool.pool_id, &Uuid::new_v4().simple().to_string()[..8]);
        self.spawn_agent(&pool, &replacement, Urgency::High)
            .await
            .then_some(replacement)
    }

    pub async fn scaling_history(&self) -> Result<Vec<ScalingDecision>, ScalingError> {
        Ok(self
            .ctx
            .store
            .list(keys::SCALER_HISTORY)
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    pub fn current_metrics(&self) -> HashMap<String, PoolMetrics> {
        self.latest_metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn supervised(&self, pool_id: &str) -> Vec<SupervisedAgent> {
        self.table().agents(pool_id)
    }

    pub fn supervised_count(&self) -> usize {
        self.table().len()
    }

    /// Evaluation loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Auto-scaler is disabled");
            return;
        }
        let mut tick = interval(Duration::from_secs(self.config.evaluation_interval_seconds.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            pools = self.config.pools.len(),
            evaluation_interval_seconds = self.config.evaluation_interval_seconds,
            "Starting auto-scaler"
        );
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let decisions = self.evaluate_scaling().await;
                    debug!(evaluated = decisions.len(), "Scaling evaluation complete");
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("Auto-scaler stopped");
    }

    /// Follow restart requests on the control channel until cancelled.
    pub async fn listen_control(self: Arc<Self>, cancel: CancellationToken) {
        let mut control = self.ctx.store.subscribe(channels::AGENT_CONTROL);
        loop {
            tokio::select! {
                message = control.recv() => match message {
                    Ok(raw) => match serde_json::from_str::<ControlMessage>(&raw) {
                        Ok(message) => {
                            self.handle_control(message).await;
                        }
                        Err(e) => debug!(error = %e, "Ignoring unreadable control message"),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Control subscriber lagged"),
                    Err(RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    }
}
