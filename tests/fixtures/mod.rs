//! Shared helpers for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use fleet_kernel::config::{PoolConfig, ScalingConfig};
use fleet_kernel::scaling::{
    AutoScaler, ExitNotice, ProcessSpec, ProcessSupervisor, SupervisorError, TerminationOutcome,
};
use fleet_kernel::store::keys;
use fleet_kernel::{CoordinationStore, KernelContext, ManualClock, MemoryStore};

/// Context over a fresh store whose clock only moves when the test says so.
pub fn manual_context() -> (KernelContext, ManualClock) {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
    let ctx = KernelContext::new(
        Arc::new(MemoryStore::new()),
        Arc::new(clock.clone()),
        "test-kernel",
    );
    (ctx, clock)
}

pub fn pool(pool_id: &str) -> PoolConfig {
    PoolConfig {
        pool_id: pool_id.to_string(),
        command: "agent-worker".to_string(),
        args: vec!["--pool".to_string(), pool_id.to_string()],
        ..PoolConfig::default()
    }
}

pub fn scaling_config(pools: Vec<PoolConfig>) -> ScalingConfig {
    ScalingConfig {
        pools,
        ..ScalingConfig::default()
    }
}

/// Push `count` jobs onto a pool's queue.
pub async fn seed_queue(store: &dyn CoordinationStore, pool_id: &str, count: usize) {
    for job in 0..count {
        store
            .push(&keys::queue(pool_id), &format!("job-{job}"))
            .await
            .unwrap();
    }
}

pub async fn drain_queue(store: &dyn CoordinationStore, pool_id: &str) {
    store.take(&keys::queue(pool_id)).await.unwrap();
}

/// Process supervisor that records what it was asked to do.
#[derive(Debug, Default)]
pub struct FakeSupervisor {
    pub spawned: Mutex<Vec<ProcessSpec>>,
    pub terminated: Mutex<Vec<String>>,
    alive: Mutex<HashSet<String>>,
    fail_spawns: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        })
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawns.store(fail, Ordering::SeqCst);
    }

    pub fn spawned_ids(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.agent_id.clone())
            .collect()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    /// Simulate an agent dying on its own.
    pub fn exit(&self, agent_id: &str) {
        self.alive.lock().unwrap().remove(agent_id);
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn spawn(&self, spec: ProcessSpec) -> Result<Option<u32>, SupervisorError> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(SupervisorError::Spawn {
                agent_id: spec.agent_id,
                reason: "executable not found".to_string(),
            });
        }
        self.alive.lock().unwrap().insert(spec.agent_id.clone());
        self.spawned.lock().unwrap().push(spec);
        Ok(Some(self.next_pid.fetch_add(1, Ordering::SeqCst)))
    }

    async fn terminate(
        &self,
        agent_id: &str,
        _grace: Duration,
    ) -> Result<TerminationOutcome, SupervisorError> {
        self.terminated.lock().unwrap().push(agent_id.to_string());
        if self.alive.lock().unwrap().remove(agent_id) {
            Ok(TerminationOutcome::Graceful)
        } else {
            Ok(TerminationOutcome::NotRunning)
        }
    }

    fn is_alive(&self, agent_id: &str) -> bool {
        self.alive.lock().unwrap().contains(agent_id)
    }
}

pub struct ScalerHarness {
    pub ctx: KernelContext,
    pub clock: ManualClock,
    pub scaler: AutoScaler,
    pub supervisor: Arc<FakeSupervisor>,
    pub exits: mpsc::UnboundedSender<ExitNotice>,
}

pub fn scaler_harness(config: ScalingConfig) -> ScalerHarness {
    let (ctx, clock) = manual_context();
    let supervisor = FakeSupervisor::new();
    let (exits, exit_rx) = mpsc::unbounded_channel();
    let scaler = AutoScaler::new(ctx.clone(), config, supervisor.clone(), exit_rx);
    ScalerHarness {
        ctx,
        clock,
        scaler,
        supervisor,
        exits,
    }
}
