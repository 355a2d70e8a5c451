//! Agent liveness tracking and failure recovery.

pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod types;

pub use monitor::AgentHealthMonitor;
pub use recovery::ladder_step;
pub use registry::{AgentRegistry, RecordChange};
pub use types::*;
