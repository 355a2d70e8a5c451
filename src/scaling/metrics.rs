//! Per-pool load metrics read from the coordination store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::store::keys;
use crate::store::{CoordinationStore, StoreError};

/// Number of recent job durations kept for the rolling average.
pub const DURATION_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool_id: String,
    pub queue_depth: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    /// Rolling average over the last [`DURATION_WINDOW`] jobs, in seconds.
    pub avg_processing_time: f64,
    pub error_rate: f64,
    pub current_agents: u32,
    pub timestamp: DateTime<Utc>,
}

impl PoolMetrics {
    /// Jobs waiting plus jobs in flight.
    pub fn total_load(&self) -> u64 {
        self.queue_depth + self.processing_count
    }

    pub fn idle(pool_id: &str, current_agents: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            queue_depth: 0,
            processing_count: 0,
            completed_count: 0,
            failed_count: 0,
            avg_processing_time: 0.0,
            error_rate: 0.0,
            current_agents,
            timestamp,
        }
    }
}

/// Reads queue lengths for a pool. The kernel never consumes jobs itself.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait QueueProbe: Send + Sync {
    async fn queue_depth(&self, pool_id: &str) -> Result<u64, StoreError>;
    async fn processing_count(&self, pool_id: &str) -> Result<u64, StoreError>;
}

/// Probe over the `queue:<pool>` and `processing:<pool>` lists.
#[derive(Debug, Clone)]
pub struct StoreQueueProbe {
    store: Arc<dyn CoordinationStore>,
}

impl StoreQueueProbe {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueueProbe for StoreQueueProbe {
    async fn queue_depth(&self, pool_id: &str) -> Result<u64, StoreError> {
        Ok(self.store.list_len(&keys::queue(pool_id)).await? as u64)
    }

    async fn processing_count(&self, pool_id: &str) -> Result<u64, StoreError> {
        Ok(self.store.list_len(&keys::processing(pool_id)).await? as u64)
    }
}

/// Record a finished job for a pool's rolling duration and error figures.
pub async fn record_job_outcome(
    store: &dyn CoordinationStore,
    pool_id: &str,
    duration: Duration,
    success: bool,
) -> Result<(), StoreError> {
    let durations = keys::pool_durations(pool_id);
    store
        .push(&durations, &duration.as_secs_f64().to_string())
        .await?;
    store.trim(&durations, DURATION_WINDOW).await?;

    let field = if success { "completed" } else { "failed" };
    store.hincr(&keys::pool_stats(pool_id), field, 1).await?;
    Ok(())
}

/// Assemble the metrics the scaling decision needs for one pool.
pub async fn gather_metrics(
    store: &dyn CoordinationStore,
    probe: &dyn QueueProbe,
    pool_id: &str,
    current_agents: u32,
    now: DateTime<Utc>,
) -> Result<PoolMetrics, StoreError> {
    let queue_depth = probe.queue_depth(pool_id).await?;
    let processing_count = probe.processing_count(pool_id).await?;

    let stats = store.hgetall(&keys::pool_stats(pool_id)).await?;
    let counter = |name: &str| {
        stats
            .get(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    let completed_count = counter("completed");
    let failed_count = counter("failed");
    let attempted = completed_count + failed_count;
    let error_rate = if attempted == 0 {
        0.0
    } else {
        failed_count as f64 / attempted as f64
    };

    let durations: Vec<f64> = store
        .list(&keys::pool_durations(pool_id))
        .await?
        .iter()
        .rev()
        .take(DURATION_WINDOW)
        .filter_map(|d| d.parse().ok())
        .collect();
    let avg_processing_time = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    Ok(PoolMetrics {
        pool_id: pool_id.to_string(),
        queue_depth,
        processing_count,
        completed_count,
        failed_count,
        avg_processing_time,
        error_rate,
        current_agents,
        timestamp: now,
    })
}
