//! Queue-depth driven scaling of agent pools.

pub mod autoscaler;
pub mod decision;
pub mod metrics;
pub mod supervisor;

use thiserror::Error;

use crate::store::StoreError;

pub use autoscaler::AutoScaler;
pub use decision::{make_scaling_decision, urgency_score, ScalingAction, ScalingDecision, ScalingPolicy, Urgency};
pub use metrics::{gather_metrics, record_job_outcome, PoolMetrics, QueueProbe, StoreQueueProbe};
pub use supervisor::{
    ExitNotice, ProcessSpec, ProcessSupervisor, SupervisedAgent, SupervisedTable, SupervisorError,
    TerminationOutcome, TokioProcessSupervisor,
};

#[derive(Debug, Error)]
pub enum ScalingError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("Unknown pool: {0}")]
    UnknownPool(String),
}
