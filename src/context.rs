use serde::Serialize;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::events;
use crate::store::{CoordinationStore, MemoryStore, StoreError};

/// Handles every component shares: the coordination store, a clock and the name this
/// kernel instance publishes events under.
#[derive(Debug, Clone)]
pub struct KernelContext {
    pub store: Arc<dyn CoordinationStore>,
    pub clock: Arc<dyn Clock>,
    pub instance_id: String,
}

impl KernelContext {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: instance_id.into(),
        }
    }

    /// Fresh in-memory store with the system clock.
    pub fn in_memory(instance_id: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), instance_id)
    }

    /// Instance id derived from the host name, falling back to a random id.
    pub fn default_instance_id() -> String {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .map(|name| format!("kernel@{name}"))
            .unwrap_or_else(|| format!("kernel@{}", crate::telemetry::generate_correlation_id()))
    }

    pub async fn publish<T: Serialize>(&self, channel: &str, payload: T) -> Result<usize, StoreError> {
        events::publish(
            self.store.as_ref(),
            channel,
            &self.instance_id,
            self.clock.now(),
            payload,
        )
        .await
    }
}
