use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the fleet kernel
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetKernelConfig {
    /// Instance identity and local state
    pub kernel: KernelConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Resource lock settings
    pub locks: LockConfig,
    /// Exclusive command coordination
    pub commands: CommandConfig,
    /// Agent health monitoring
    pub health: HealthConfig,
    /// Queue-driven auto-scaling
    pub scaling: ScalingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Name published on every event; derived from the host name when unset
    pub instance_id: Option<String>,
    /// Directory for the host lock file
    pub state_dir: String,
    /// Upper bound for the whole shutdown sequence
    pub shutdown_timeout_seconds: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            state_dir: ".fleet-kernel".to_string(),
            shutdown_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease applied when a caller does not pass one
    pub default_ttl_seconds: u64,
    /// Retry interval for wait_for
    pub wait_poll_interval_seconds: u64,
    /// Forced-acquisition audit entries kept
    pub audit_log_max: usize,
    /// How often stale lock metadata is swept
    pub cleanup_interval_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            wait_poll_interval_seconds: 5,
            audit_log_max: 1000,
            cleanup_interval_seconds: 60,
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_secs(self.wait_poll_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Prefixes/substrings that mark a command as unsafe to run concurrently
    pub exclusive_commands: Vec<String>,
    /// Lease for exclusive command locks
    pub lock_ttl_seconds: u64,
    /// Refresh period of the running-command heartbeat
    pub heartbeat_interval_seconds: u64,
    /// Execution log entries kept
    pub execution_log_max: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            exclusive_commands: [
                "npm install",
                "npm ci",
                "yarn install",
                "pnpm install",
                "pip install",
                "cargo install",
                "apt-get install",
                "apt install",
                "brew install",
                "docker-compose up",
                "docker-compose restart",
                "docker compose up",
                "docker restart",
                "kubectl rollout restart",
                "kubectl delete",
                "systemctl restart",
                "kill",
                "pkill",
                "killall",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            lock_ttl_seconds: 600,
            heartbeat_interval_seconds: 10,
            execution_log_max: 500,
        }
    }
}

impl CommandConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Sweep period
    pub health_check_interval_seconds: u64,
    /// Heartbeat age after which an agent is unresponsive
    pub unresponsive_threshold_seconds: u64,
    /// Ladder steps before automatic recovery stops
    pub max_recovery_attempts: u32,
    /// Run the recovery ladder automatically
    pub auto_recovery: bool,
    /// Alive/total ratio below which the system is considered unhealthy
    pub system_health_floor: f64,
    /// Capacity sampling period
    pub capacity_sample_interval_seconds: u64,
    /// Jobs one agent is expected to hold at full utilization
    pub max_capacity: u32,
    /// Utilization that raises a capacity alert
    pub capacity_alert_percent: f64,
    /// Per-agent error log entries kept
    pub error_log_max: usize,
    /// Recovery log entries kept
    pub recovery_log_max: usize,
    /// Log trimming period
    pub housekeeping_interval_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_check_interval_seconds: 30,
            unresponsive_threshold_seconds: 90,
            max_recovery_attempts: 3,
            auto_recovery: true,
            system_health_floor: 0.7,
            capacity_sample_interval_seconds: 60,
            max_capacity: 10,
            capacity_alert_percent: 90.0,
            error_log_max: 100,
            recovery_log_max: 500,
            housekeeping_interval_seconds: 3600,
        }
    }
}

impl HealthConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn unresponsive_threshold(&self) -> Duration {
        Duration::from_secs(self.unresponsive_threshold_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Run the scaling loop at all
    pub enabled: bool,
    /// Evaluation period
    pub evaluation_interval_seconds: u64,
    /// Queue depth above which pools grow
    pub scale_up_threshold: u32,
    /// Queue depth below which pools shrink
    pub scale_down_threshold: u32,
    /// Minimum time between executed decisions for one pool
    pub cooldown_seconds: u64,
    pub min_agents: u32,
    pub max_agents: u32,
    /// Time between graceful terminate and force kill
    pub termination_grace_seconds: u64,
    /// Delay before checking that a spawned agent registered
    pub liveness_check_delay_seconds: u64,
    /// Scaling decisions kept in history
    pub history_max: usize,
    /// Worker pools under supervision
    pub pools: Vec<PoolConfig>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_seconds: 30,
            scale_up_threshold: 20,
            scale_down_threshold: 5,
            cooldown_seconds: 300,
            min_agents: 1,
            max_agents: 10,
            termination_grace_seconds: 30,
            liveness_check_delay_seconds: 60,
            history_max: 100,
            pools: Vec::new(),
        }
    }
}

/// One worker class. Unset limits fall back to the global scaling settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PoolConfig {
    pub pool_id: String,
    /// Program started for each agent in this pool
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub min_agents: Option<u32>,
    #[serde(default)]
    pub max_agents: Option<u32>,
    #[serde(default)]
    pub scale_up_threshold: Option<u32>,
    #[serde(default)]
    pub scale_down_threshold: Option<u32>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
}

impl FleetKernelConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (fleet-kernel.toml, .fleet-kernel-rc)
    /// 3. Environment variables (prefixed with FLEET_KERNEL__)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if Path::new("fleet-kernel.toml").exists() {
            builder = builder.add_source(File::with_name("fleet-kernel"));
        }

        if Path::new(".fleet-kernel-rc").exists() {
            builder = builder.add_source(
                File::with_name(".fleet-kernel-rc").format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEET_KERNEL")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("commands.exclusive_commands")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load configuration from an explicit file on top of the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path.as_ref()))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<FleetKernelConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = FleetKernelConfig::load_env_file();
        FleetKernelConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static FleetKernelConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
