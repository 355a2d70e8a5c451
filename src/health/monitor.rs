//! Agent health monitor.
//!
//! Ingests registration, heartbeat, error and crash events, keeps the agent registry
//! current, and runs the periodic sweep that reclassifies stale agents and drives the
//! recovery ladder. Every periodic loop logs and skips its own failures so one bad
//! cycle never stalls the next.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{AgentRegistry, RecordChange};
use super::types::*;
use crate::config::HealthConfig;
use crate::context::KernelContext;
use crate::events::{AgentEvent, ControlMessage, EmergencyEvent, ErrorEvent, RegistryEvent, StatusEvent};
use crate::locks::LeaseLockManager;
use crate::store::keys::{self, channels};
use crate::store::StoreError;

#[derive(Debug)]
pub struct AgentHealthMonitor {
    pub(super) ctx: KernelContext,
    pub(super) config: HealthConfig,
    registry: AgentRegistry,
    cycle: AtomicU64,
    locks: Option<LeaseLockManager>,
}

impl AgentHealthMonitor {
    pub fn new(ctx: KernelContext, config: HealthConfig) -> Self {
        Self {
            registry: AgentRegistry::new(ctx.store.clone()),
            ctx,
            config,
            cycle: AtomicU64::new(0),
            locks: None,
        }
    }

    /// Release a crashed agent's locks through `locks` as soon as the crash is reported.
    pub fn with_lock_manager(mut self, locks: LeaseLockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, HealthError> {
        self.registry.get(agent_id).await
    }

    pub(super) fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub(super) async fn emit<T: Serialize>(&self, channel: &str, payload: T) {
        if let Err(e) = self.ctx.publish(channel, payload).await {
            warn!(channel, error = %e, "Failed to publish health event");
        }
    }

    async fn announce_status(&self, change: &RecordChange) {
        let (from, to) = (change.before.status, change.after.status);
        if from == to {
            return;
        }
        info!(agent_id = %change.after.id, from = %from, to = %to, "Agent status changed");
        self.emit(
            channels::AGENT_STATUS,
            StatusEvent::AgentStatusChanged {
                agent_id: change.after.id.clone(),
                from,
                to,
            },
        )
        .await;
    }

    pub async fn register(
        &self,
        agent_id: &str,
        capabilities: Vec<String>,
        pool: Option<String>,
    ) -> Result<AgentRecord, HealthError> {
        let record = AgentRecord::new(agent_id, capabilities, pool, self.ctx.clock.now());
        self.registry.upsert(&record).await?;
        self.ctx
            .store
            .hincr(keys::HEALTH_COUNTERS, "registrations", 1)
            .await?;

        info!(
            agent_id = %agent_id,
            capabilities = ?record.capabilities,
            pool = ?record.pool,
            "Agent registered"
        );
        self.emit(
            channels::AGENT_REGISTRY,
            RegistryEvent::AgentRegistered {
                agent_id: agent_id.to_string(),
                capabilities: record.capabilities.clone(),
                pool: record.pool.clone(),
            },
        )
        .await;
        Ok(record)
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<bool, HealthError> {
        let removed = self.registry.remove(agent_id).await?;
        self.ctx.store.delete(&keys::agent_metrics(agent_id)).await?;
        self.ctx.store.delete(&keys::agent_errors(agent_id)).await?;
        for kind in [AlertKind::Capacity] {
            self.ctx
                .store
                .hdel(keys::ACTIVE_ALERTS, &alert_field(agent_id, kind))
                .await?;
        }

        if removed {
            info!(agent_id = %agent_id, "Agent unregistered");
            self.emit(
                channels::AGENT_REGISTRY,
                RegistryEvent::AgentUnregistered {
                    agent_id: agent_id.to_string(),
                },
            )
            .await;
        }
        Ok(removed)
    }

    /// Record a heartbeat. Unknown agents are registered on the spot; a heartbeat from
    /// a failed agent counts as confirmed recovery.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
        metrics: HashMap<String, serde_json::Value>,
    ) -> Result<AgentRecord, HealthError> {
        if self.registry.get(agent_id).await?.is_none() {
            debug!(agent_id = %agent_id, "Heartbeat from unknown agent, registering");
            self.register(agent_id, Vec::new(), None).await?;
        }

        let now = self.ctx.clock.now();
        self.registry.record_heartbeat(agent_id, now).await?;
        let next = status.filter(AgentStatus::is_alive).unwrap_or(AgentStatus::Active);
        let change = self
            .registry
            .update(agent_id, |record| {
                record.last_heartbeat = record.last_heartbeat.max(now);
                record.missed_heartbeats = 0;
                if !record.status.is_alive() {
                    record.recovery_attempts = 0;
                    record.last_recovery_cycle = None;
                }
                record.status = next;
            })
            .await?
            .ok_or_else(|| HealthError::UnknownAgent(agent_id.to_string()))?;
        self.announce_status(&change).await;

        let metrics_key = keys::agent_metrics(agent_id);
        for (name, value) in &metrics {
            self.ctx
                .store
                .hset(&metrics_key, name, &value.to_string())
                .await?;
        }
        self.ctx
            .store
            .hincr(keys::HEALTH_COUNTERS, "heartbeats", 1)
            .await?;

        let previous = change.before.status;
        if !previous.is_alive() {
            info!(agent_id = %agent_id, previous_status = %previous, "Agent recovered");
            self.emit(
                channels::AGENT_STATUS,
                StatusEvent::AgentRecovered {
                    agent_id: agent_id.to_string(),
                    previous_status: previous,
                },
            )
            .await;
        }
        let record = change.after;
        self.emit(
            channels::AGENT_HEARTBEAT,
            StatusEvent::AgentHeartbeat {
                agent_id: agent_id.to_string(),
                status: record.status,
                heartbeat_count: record.heartbeat_count,
            },
        )
        .await;
        Ok(record)
    }

    pub async fn report_error(
        &self,
        agent_id: &str,
        error: &str,
        severity: Severity,
    ) -> Result<AgentRecord, HealthError> {
        let mut action = None;
        let change = self
            .registry
            .update(agent_id, |record| {
                record.error_count += 1;
                action = None;
                if severity == Severity::Critical {
                    if record.status.is_alive() {
                        record.status = AgentStatus::Unresponsive;
                    }
                    action = self.plan_recovery(record);
                }
            })
            .await?
            .ok_or_else(|| HealthError::UnknownAgent(agent_id.to_string()))?;
        let record = &change.after;

        let entry = ErrorLogEntry {
            error: error.to_string(),
            severity,
            timestamp: self.ctx.clock.now(),
        };
        let errors_key = keys::agent_errors(agent_id);
        self.ctx
            .store
            .push(&errors_key, &serde_json::to_string(&entry).map_err(StoreError::from)?)
            .await?;
        self.ctx.store.trim(&errors_key, self.config.error_log_max).await?;

        warn!(
            agent_id = %agent_id,
            error = %error,
            severity = ?severity,
            error_count = record.error_count,
            "Agent reported error"
        );
        self.emit(
            channels::AGENT_ERRORS,
            ErrorEvent::AgentError {
                agent_id: agent_id.to_string(),
                error: error.to_string(),
                severity,
                error_count: record.error_count,
            },
        )
        .await;

        self.announce_status(&change).await;
        if let Some(action) = action {
            self.run_recovery(record, action, &format!("critical error: {error}"))
                .await?;
        }
        Ok(change.after)
    }

    /// Explicit crash report. Releases the agent's locks when a lock manager is attached.
    pub async fn crash(&self, agent_id: &str, reason: Option<String>) -> Result<AgentRecord, HealthError> {
        let mut action = None;
        let change = self
            .registry
            .update(agent_id, |record| {
                record.status = AgentStatus::Crashed;
                action = self.plan_recovery(record);
            })
            .await?
            .ok_or_else(|| HealthError::UnknownAgent(agent_id.to_string()))?;

        error!(agent_id = %agent_id, reason = ?reason, "Agent crashed");
        self.announce_status(&change).await;
        self.emit(
            channels::AGENT_EMERGENCY,
            EmergencyEvent::AgentCrashed {
                agent_id: agent_id.to_string(),
                reason: reason.clone(),
            },
        )
        .await;

        if let Some(locks) = &self.locks {
            match locks.emergency_release_all(agent_id).await {
                Ok(released) => debug!(agent_id = %agent_id, released, "Released crashed agent's locks"),
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to release crashed agent's locks"),
            }
        }

        if let Some(action) = action {
            let reason = reason.unwrap_or_else(|| "crash reported".to_string());
            self.run_recovery(&change.after, action, &reason).await?;
        }
        Ok(change.after)
    }

    pub async fn handle_event(&self, event: AgentEvent) -> Result<(), HealthError> {
        match event {
            AgentEvent::Register {
                agent_id,
                capabilities,
                pool,
            } => {
                self.register(&agent_id, capabilities, pool).await?;
            }
            AgentEvent::Heartbeat {
                agent_id,
                status,
                metrics,
            } => {
                self.heartbeat(&agent_id, status, metrics).await?;
            }
            AgentEvent::Error {
                agent_id,
                error,
                severity,
            } => {
                self.report_error(&agent_id, &error, severity).await?;
            }
            AgentEvent::Crash { agent_id, reason } => {
                self.crash(&agent_id, reason).await?;
            }
            AgentEvent::Unregister { agent_id } => {
                self.unregister(&agent_id).await?;
            }
            AgentEvent::Unknown => {
                warn!("Ignoring agent event of unknown type");
            }
        }
        Ok(())
    }

    /// One pass over every registered agent. Each transition is a conditional write, so
    /// a heartbeat that lands mid-sweep wins over the sweep's view of the agent.
    pub async fn sweep(&self) -> Result<SweepReport, HealthError> {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.ctx.clock.now();
        let threshold = chrono::Duration::from_std(self.config.unresponsive_threshold())
            .unwrap_or(chrono::Duration::MAX);
        let agent_ids: Vec<String> = self.registry.all().await?.into_iter().map(|r| r.id).collect();
        let mut report = SweepReport {
            cycle,
            checked: agent_ids.len(),
            ..SweepReport::default()
        };

        for agent_id in &agent_ids {
            let result = self.check_agent(agent_id, now, threshold, &mut report).await;
            match result {
                Ok(true) => report.recovery_steps += 1,
                Ok(false) => {}
                Err(e) => {
                    report.skipped_errors += 1;
                    warn!(agent_id = %agent_id, error = %e, "Health check failed for agent");
                }
            }
        }

        let (health, shed) = self.check_system_health().await?;
        report.health = Some(health);
        report.shed_agents = shed;
        debug!(
            cycle,
            checked = report.checked,
            unresponsive = report.newly_unresponsive.len(),
            recovery_steps = report.recovery_steps,
            health_ratio = health.ratio,
            "Health sweep complete"
        );
        Ok(report)
    }

    /// Staleness transition and ladder step for one agent. Returns whether a recovery
    /// step ran.
    async fn check_agent(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
        report: &mut SweepReport,
    ) -> Result<bool, HealthError> {
        let mut action = None;
        let change = self
            .registry
            .update(agent_id, |record| {
                action = None;
                if record.status.is_alive() {
                    if now - record.last_heartbeat <= threshold {
                        return;
                    }
                    record.missed_heartbeats += 1;
                    record.status = AgentStatus::Unresponsive;
                } else if record.status == AgentStatus::Unresponsive {
                    record.missed_heartbeats += 1;
                }
                action = self.plan_recovery(record);
            })
            .await?;
        let Some(change) = change else {
            return Ok(false);
        };
        let record = &change.after;

        if change.before.status.is_alive() && !record.status.is_alive() {
            self.announce_status(&change).await;
            report.newly_unresponsive.push(record.id.clone());
            self.ctx
                .store
                .hincr(keys::HEALTH_COUNTERS, "missed_heartbeats", 1)
                .await?;
            warn!(
                agent_id = %record.id,
                seconds_since_heartbeat = record.seconds_since_heartbeat(now),
                "Agent unresponsive"
            );
            self.emit(
                channels::AGENT_STATUS,
                StatusEvent::AgentUnresponsive {
                    agent_id: record.id.clone(),
                    seconds_since_heartbeat: record.seconds_since_heartbeat(now),
                    missed_heartbeats: record.missed_heartbeats,
                },
            )
            .await;
        }
        match action {
            Some(action) => {
                self.run_recovery(record, action, "missed heartbeats").await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn system_health(&self) -> Result<SystemHealth, HealthError> {
        let records = self.registry.all().await?;
        let alive = records.iter().filter(|r| r.status.is_alive()).count();
        Ok(SystemHealth::from_counts(alive, records.len()))
    }

    /// Broadcast low system health and ask idle agents to shut down gracefully.
    async fn check_system_health(&self) -> Result<(SystemHealth, Vec<String>), HealthError> {
        let records = self.registry.all().await?;
        let alive = records.iter().filter(|r| r.status.is_alive()).count();
        let health = SystemHealth::from_counts(alive, records.len());
        if health.total == 0 || health.ratio >= self.config.system_health_floor {
            return Ok((health, Vec::new()));
        }

        warn!(
            health_ratio = health.ratio,
            alive = health.alive,
            total = health.total,
            "Low system health"
        );
        self.emit(
            channels::AGENT_EMERGENCY,
            EmergencyEvent::LowSystemHealth {
                health_ratio: health.ratio,
                alive: health.alive,
                total: health.total,
            },
        )
        .await;

        let mut shed = Vec::new();
        for record in records.iter().filter(|r| r.status == AgentStatus::Idle) {
            self.emit(
                channels::AGENT_CONTROL,
                ControlMessage::Shutdown {
                    agent_id: record.id.clone(),
                    reason: "load shedding: low system health".to_string(),
                },
            )
            .await;
            shed.push(record.id.clone());
        }
        if !shed.is_empty() {
            info!(agents = ?shed, "Requested graceful shutdown of idle agents");
        }
        Ok((health, shed))
    }

    /// Utilization of an agent's pool backlog against the configured capacity.
    pub async fn capacity(&self, agent_id: &str) -> Result<CapacityReport, HealthError> {
        let record = self
            .registry
            .all()
            .await?
            .into_iter()
            .find(|r| r.id == agent_id)
            .ok_or_else(|| HealthError::UnknownAgent(agent_id.to_string()))?;
        let report = self.capacity_for(&record).await?;
        self.raise_capacity_alert(&report).await?;
        Ok(report)
    }

    async fn capacity_for(&self, record: &AgentRecord) -> Result<CapacityReport, HealthError> {
        let queue_backlog = match &record.pool {
            Some(pool) => {
                let depth = self.ctx.store.list_len(&keys::queue(pool)).await?;
                let alive_in_pool = self
                    .registry
                    .cached()
                    .iter()
                    .filter(|r| r.pool.as_ref() == Some(pool) && r.status.is_alive())
                    .count()
                    .max(1);
                depth as f64 / alive_in_pool as f64
            }
            None => 0.0,
        };
        let max_capacity = self.config.max_capacity.max(1);
        Ok(CapacityReport {
            agent_id: record.id.clone(),
            pool: record.pool.clone(),
            queue_backlog,
            max_capacity,
            utilization_percent: queue_backlog / max_capacity as f64 * 100.0,
        })
    }

    async fn raise_capacity_alert(&self, report: &CapacityReport) -> Result<bool, HealthError> {
        if report.utilization_percent <= self.config.capacity_alert_percent {
            return Ok(false);
        }
        let field = alert_field(&report.agent_id, AlertKind::Capacity);
        if self.ctx.store.hget(keys::ACTIVE_ALERTS, &field).await?.is_some() {
            return Ok(false);
        }
        self.ctx
            .store
            .hset(keys::ACTIVE_ALERTS, &field, &self.ctx.clock.now().to_rfc3339())
            .await?;

        warn!(
            agent_id = %report.agent_id,
            pool = ?report.pool,
            utilization_percent = report.utilization_percent,
            "Agent over capacity"
        );
        self.emit(
            channels::AGENT_EMERGENCY,
            EmergencyEvent::SystemOverload {
                agent_id: report.agent_id.clone(),
                pool: report.pool.clone(),
                utilization_percent: report.utilization_percent,
            },
        )
        .await;
        Ok(true)
    }

    /// Capacity figures for every alive agent, raising alerts as needed.
    pub async fn sample_capacity(&self) -> Result<Vec<CapacityReport>, HealthError> {
        let records = self.registry.all().await?;
        let mut reports = Vec::new();
        for record in records.iter().filter(|r| r.status.is_alive()) {
            let report = self.capacity_for(record).await?;
            self.raise_capacity_alert(&report).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Clear a raised alert so the next breach is reported again.
    pub async fn acknowledge_alert(&self, agent_id: &str, kind: AlertKind) -> Result<bool, HealthError> {
        Ok(self
            .ctx
            .store
            .hdel(keys::ACTIVE_ALERTS, &alert_field(agent_id, kind))
            .await?)
    }

    pub async fn active_alerts(&self) -> Result<Vec<String>, HealthError> {
        let mut alerts: Vec<_> = self
            .ctx
            .store
            .hgetall(keys::ACTIVE_ALERTS)
            .await?
            .into_keys()
            .collect();
        alerts.sort();
        Ok(alerts)
    }

    pub async fn registry_snapshot(&self) -> Result<Vec<AgentSnapshot>, HealthError> {
        let records = self.registry.all().await?;
        let mut snapshot = Vec::with_capacity(records.len());
        for record in records {
            let metrics = self
                .ctx
                .store
                .hgetall(&keys::agent_metrics(&record.id))
                .await?
                .into_iter()
                .map(|(name, raw)| {
                    let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
                    (name, value)
                })
                .collect();
            let capacity = if record.status.is_alive() {
                Some(self.capacity_for(&record).await?)
            } else {
                None
            };
            snapshot.push(AgentSnapshot {
                record,
                metrics,
                capacity,
            });
        }
        Ok(snapshot)
    }

    pub async fn error_log(&self, agent_id: &str) -> Result<Vec<ErrorLogEntry>, HealthError> {
        Ok(self
            .ctx
            .store
            .list(&keys::agent_errors(agent_id))
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    /// Trim error and recovery logs to their configured bounds.
    pub async fn housekeeping(&self) -> Result<usize, HealthError> {
        let error_logs = self.ctx.store.keys(keys::agent_errors_prefix()).await?;
        for key in &error_logs {
            self.ctx.store.trim(key, self.config.error_log_max).await?;
        }
        self.ctx
            .store
            .trim(keys::RECOVERY_LOG, self.config.recovery_log_max)
            .await?;
        debug!(error_logs = error_logs.len(), "Health housekeeping complete");
        Ok(error_logs.len() + 1)
    }

    pub async fn rehydrate(&self) -> Result<usize, HealthError> {
        let count = self.registry.rehydrate().await?;
        info!(agents = count, "Agent registry rehydrated from store");
        Ok(count)
    }

    /// Consume inbound agent events until cancelled.
    pub async fn listen(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.ctx.store.subscribe(channels::AGENT_EVENTS);
        info!("Listening for agent events");
        loop {
            tokio::select! {
                message = events.recv() => match message {
                    Ok(raw) => match serde_json::from_str::<AgentEvent>(&raw) {
                        Ok(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                warn!(error = %e, "Failed to handle agent event");
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed agent event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Agent event subscriber lagged, rehydrating registry");
                        if let Err(e) = self.rehydrate().await {
                            warn!(error = %e, "Registry rehydrate failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("Agent event channel closed");
                        break;
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }
        info!("Agent event listener stopped");
    }

    /// Periodic sweep, capacity sampling and housekeeping until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut sweep_tick = interval(
            self.config
                .health_check_interval()
                .max(std::time::Duration::from_secs(1)),
        );
        let mut capacity_tick = interval(std::time::Duration::from_secs(
            self.config.capacity_sample_interval_seconds.max(1),
        ));
        let mut housekeeping_tick = interval(std::time::Duration::from_secs(
            self.config.housekeeping_interval_seconds.max(1),
        ));
        for tick in [&mut sweep_tick, &mut capacity_tick, &mut housekeeping_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            health_check_interval_seconds = self.config.health_check_interval_seconds,
            unresponsive_threshold_seconds = self.config.unresponsive_threshold_seconds,
            "Starting health monitor"
        );
        loop {
            tokio::select! {
                _ = sweep_tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Health sweep failed");
                    }
                }
                _ = capacity_tick.tick() => {
                    if let Err(e) = self.sample_capacity().await {
                        warn!(error = %e, "Capacity sampling failed");
                    }
                }
                _ = housekeeping_tick.tick() => {
                    if let Err(e) = self.housekeeping().await {
                        warn!(error = %e, "Health housekeeping failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("Health monitor stopped");
    }
}

fn alert_field(agent_id: &str, kind: AlertKind) -> String {
    format!("{agent_id}:{}", kind.as_str())
}
