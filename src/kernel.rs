//! Kernel wiring.
//!
//! One [`Kernel`] per host: it builds every component over a shared store, runs each
//! periodic loop as its own task under one cancellation token, and tears everything
//! down in order on shutdown.

use anyhow::{anyhow, Context, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::config::FleetKernelConfig;
use crate::context::KernelContext;
use crate::health::AgentHealthMonitor;
use crate::locks::{CommandCoordinator, LeaseLockManager};
use crate::retirement::AgentRetirement;
use crate::scaling::{AutoScaler, ExitNotice, ProcessSupervisor, TokioProcessSupervisor};
use crate::session::AgentSession;
use crate::shutdown::{run_step, ShutdownCoordinator};
use crate::telemetry::create_coordination_span;

/// Exclusive per-host lock held for the kernel's lifetime.
pub struct HostLock {
    _guard: RwLockWriteGuard<'static, File>,
}

impl std::fmt::Debug for HostLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostLock")
    }
}

#[derive(Debug)]
pub struct Kernel {
    ctx: KernelContext,
    config: FleetKernelConfig,
    locks: LeaseLockManager,
    commands: Arc<CommandCoordinator>,
    health: Arc<AgentHealthMonitor>,
    scaler: Arc<AutoScaler>,
    shutdown: ShutdownCoordinator,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// Kernel supervising real child processes.
    pub fn new(ctx: KernelContext, config: FleetKernelConfig) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(TokioProcessSupervisor::new(exit_tx));
        Self::with_supervisor(ctx, config, supervisor, exit_rx)
    }

    pub fn with_supervisor(
        ctx: KernelContext,
        config: FleetKernelConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        exits: mpsc::UnboundedReceiver<ExitNotice>,
    ) -> Self {
        let locks = LeaseLockManager::for_files(ctx.clone(), config.locks.clone());
        let commands = Arc::new(CommandCoordinator::new(
            ctx.clone(),
            config.commands.clone(),
            config.locks.clone(),
        ));
        let health = Arc::new(
            AgentHealthMonitor::new(ctx.clone(), config.health.clone()).with_lock_manager(locks.clone()),
        );
        let retirement = AgentRetirement::new(locks.clone(), commands.clone(), health.clone());
        let scaler = Arc::new(
            AutoScaler::new(ctx.clone(), config.scaling.clone(), supervisor, exits)
                .with_health_monitor(health.clone())
                .with_retirement(retirement),
        );

        Self {
            ctx,
            config,
            locks,
            commands,
            health,
            scaler,
            shutdown: ShutdownCoordinator::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Take the host-wide singleton lock under `state_dir`.
    pub fn acquire_host_lock(state_dir: impl AsRef<Path>) -> Result<HostLock> {
        let state_dir = state_dir.as_ref();
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;
        let lock_file = File::create(state_dir.join("kernel.lock"))?;
        let lock = Box::leak(Box::new(RwLock::new(lock_file)));
        let guard = lock
            .try_write()
            .map_err(|_| anyhow!("Another fleet kernel is already running on this host"))?;
        Ok(HostLock { _guard: guard })
    }

    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    pub fn config(&self) -> &FleetKernelConfig {
        &self.config
    }

    pub fn locks(&self) -> &LeaseLockManager {
        &self.locks
    }

    pub fn commands(&self) -> &Arc<CommandCoordinator> {
        &self.commands
    }

    pub fn health(&self) -> &Arc<AgentHealthMonitor> {
        &self.health
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Session for an in-process agent sharing this kernel's store.
    pub fn session(&self, agent_id: &str, pool: Option<String>) -> AgentSession {
        AgentSession::new(
            self.ctx.clone(),
            agent_id,
            pool,
            self.locks.clone(),
            self.commands.clone(),
        )
    }

    fn spawn_task<F>(&self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = create_coordination_span(name, None, None, None);
        let handle = tokio::spawn(task.instrument(span));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Rehydrate state and start every loop.
    pub async fn start(&self) -> Result<()> {
        let agents = self.health.rehydrate().await?;
        let token = self.shutdown.token();
        info!(
            instance_id = %self.ctx.instance_id,
            agents,
            pools = self.config.scaling.pools.len(),
            "Starting fleet kernel"
        );

        self.spawn_task("agent_events", self.health.clone().listen(token.clone()));
        self.spawn_task("health_monitor", self.health.clone().run(token.clone()));
        self.spawn_task("autoscaler", self.scaler.clone().run(token.clone()));
        self.spawn_task("autoscaler_control", self.scaler.clone().listen_control(token.clone()));
        self.spawn_task(
            "lock_cleanup",
            lock_cleanup_loop(
                vec![self.locks.clone(), self.commands.locks().clone()],
                Duration::from_secs(self.config.locks.cleanup_interval_seconds.max(1)),
                token,
            ),
        );
        Ok(())
    }

    /// Stop loops, then stop supervised agents; the scaler retires each one it stops.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let limit = Duration::from_secs(self.config.kernel.shutdown_timeout_seconds.max(1));

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        run_step("stop_loops", limit, futures::future::join_all(tasks)).await;

        let stopped = run_step("stop_agents", limit, self.scaler.stop_all())
            .await
            .unwrap_or_default();
        self.commands.stop_all_heartbeats();
        info!(stopped_agents = stopped.len(), "Fleet kernel stopped");
    }

    /// Run until a signal arrives or `duration` elapses, then shut down.
    pub async fn run_until_shutdown(&self, duration: Option<Duration>) -> Result<()> {
        self.start().await?;
        match duration {
            Some(duration) => {
                tokio::select! {
                    result = self.shutdown.wait_for_signal() => result?,
                    _ = tokio::time::sleep(duration) => info!(duration_secs = duration.as_secs(), "Run duration elapsed"),
                }
            }
            None => self.shutdown.wait_for_signal().await?,
        }
        self.shutdown().await;
        Ok(())
    }
}

async fn lock_cleanup_loop(managers: Vec<LeaseLockManager>, every: Duration, cancel: CancellationToken) {
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for manager in &managers {
                    if let Err(e) = manager.cleanup_expired().await {
                        warn!(namespace = manager.namespace().as_str(), error = %e, "Lock cleanup failed");
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = Kernel::acquire_host_lock(dir.path()).unwrap();
        assert!(Kernel::acquire_host_lock(dir.path()).is_err());
        drop(first);
    }

    #[tokio::test]
    async fn start_and_shutdown_without_pools() {
        let kernel = Kernel::new(KernelContext::in_memory("test"), FleetKernelConfig::default());
        kernel.start().await.unwrap();
        kernel.health().register("a1", vec![], None).await.unwrap();
        kernel.shutdown().await;
        assert!(kernel.shutdown_coordinator().is_shutting_down());
    }
}
