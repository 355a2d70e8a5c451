//! Lease locks over the coordination store.
//!
//! File locks and exclusive-command locks share one protocol in separate key
//! namespaces, so a command lock and a file lock never interact unless a caller chains
//! them explicitly.

pub mod command;
pub mod conflict;
pub mod manager;
pub mod types;

pub use command::{command_hash, normalize_command, CommandCoordinator, CommandDecision, CommandStatus};
pub use conflict::{ApprovalRequest, ConflictResolution, ConflictStrategy, QueuedRequest, ReplayOutcome};
pub use manager::LeaseLockManager;
pub use types::*;
