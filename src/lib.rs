// Fleet Kernel Library - Coordination kernel for a fleet of worker agents
// Lease locks, agent health supervision and queue-driven scaling over one shared store

pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod events;
pub mod health;
pub mod kernel;
pub mod locks;
pub mod retirement;
pub mod scaling;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{config, init_config, FleetKernelConfig, PoolConfig};
pub use context::KernelContext;
pub use events::{AgentEvent, ControlMessage, Envelope};
pub use health::{AgentHealthMonitor, AgentRecord, AgentStatus, HealthError, Severity};
pub use kernel::{HostLock, Kernel};
pub use locks::{
    ClaimOutcome, CommandCoordinator, CommandDecision, LeaseLockManager, LockError, LockNamespace,
    ReleaseOutcome,
};
pub use scaling::{
    make_scaling_decision, AutoScaler, PoolMetrics, ProcessSupervisor, ScalingAction,
    ScalingDecision, ScalingError, ScalingPolicy, TokioProcessSupervisor,
};
pub use retirement::AgentRetirement;
pub use session::{AgentSession, SessionSummary};
pub use shutdown::ShutdownCoordinator;
pub use store::{CoordinationStore, MemoryStore, StoreError};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
