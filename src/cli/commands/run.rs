use anyhow::Result;
use std::time::Duration;
use tracing::info;

use crate::config::FleetKernelConfig;
use crate::context::KernelContext;
use crate::kernel::Kernel;

pub struct RunCommand {
    pub duration: Option<u64>,
}

impl RunCommand {
    pub fn new(duration: Option<u64>) -> Self {
        Self { duration }
    }

    pub async fn execute(&self, config: &FleetKernelConfig) -> Result<()> {
        let _host_lock = Kernel::acquire_host_lock(&config.kernel.state_dir)?;

        let instance_id = config
            .kernel
            .instance_id
            .clone()
            .unwrap_or_else(KernelContext::default_instance_id);
        let kernel = Kernel::new(KernelContext::in_memory(instance_id), config.clone());

        for pool in &config.scaling.pools {
            info!(pool_id = %pool.pool_id, command = %pool.command, "Supervising pool");
        }

        kernel
            .run_until_shutdown(self.duration.map(Duration::from_secs))
            .await
    }
}
