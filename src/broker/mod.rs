//! Broker backends for task delivery.
//!
//! A broker keeps one record per task and moves it between states:
//! - **In-Memory**: process-local, used by default and in tests
//! - **Redis**: shared between processes (requires the `redis-broker` feature)
//!
//! Every backend provides FIFO delivery inside each [`Queue`], delayed
//! visibility for scheduled and retried tasks, and lookup by `(queue, id)`.

use crate::config::BrokerConfig;
use crate::error::RelayResult;
use crate::task::{Queue, TaskId, TaskInfo, TaskMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryBroker;

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
pub mod redis;

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
pub use self::redis::RedisBroker;

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// The leased message
    pub message: TaskMessage,
    /// Attempts charged before this lease
    pub retried: u32,
}

/// Trait that all broker backends must implement
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a new task. With a future `process_at` the record starts as
    /// scheduled, otherwise as pending.
    async fn enqueue(
        &self,
        message: TaskMessage,
        process_at: Option<DateTime<Utc>>,
    ) -> RelayResult<TaskInfo>;

    /// Lease the next pending task, trying `queues` in the given order.
    ///
    /// Due delayed tasks of those queues are promoted first. The leased
    /// record becomes active.
    async fn lease(&self, queues: &[Queue]) -> RelayResult<Option<Lease>>;

    /// Mark an active task completed.
    async fn complete(&self, message: &TaskMessage) -> RelayResult<()>;

    /// Return an active task to its queue without charging an attempt.
    async fn requeue(&self, message: &TaskMessage, delay: Duration) -> RelayResult<()>;

    /// Record a failed attempt and hold the task until `retry_at`.
    async fn retry(
        &self,
        message: &TaskMessage,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> RelayResult<()>;

    /// Record a failed attempt and archive the task.
    async fn archive(&self, message: &TaskMessage, error: &str) -> RelayResult<()>;

    /// Promote every due scheduled or retrying task to pending.
    async fn forward_due(&self) -> RelayResult<u64>;

    /// Delete terminal records whose retention has expired.
    async fn delete_expired(&self) -> RelayResult<u64>;

    /// Look up a record by queue and ID.
    async fn get_task_info(&self, queue: Queue, id: &TaskId) -> RelayResult<TaskInfo>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> RelayResult<()>;

    /// Release the backend's connections.
    async fn close(&self) -> RelayResult<()>;
}

/// Shared handle to a broker backend
pub type SharedBroker = Arc<dyn Broker>;

/// Factory methods for creating broker backends
pub struct BrokerFactory;

impl BrokerFactory {
    /// Connect to the backend described by `config`.
    ///
    /// The in-memory backend is a process-wide instance, so clients and
    /// workers built from the same configuration see the same tasks.
    pub async fn connect(config: &BrokerConfig) -> RelayResult<SharedBroker> {
        match config {
            BrokerConfig::InMemory => Ok(InMemoryBroker::shared()),
            #[cfg(feature = "redis-broker")]
            BrokerConfig::Redis(redis) => {
                let broker = RedisBroker::connect(redis.clone()).await?;
                Ok(Arc::new(broker))
            }
            #[cfg(not(feature = "redis-broker"))]
            BrokerConfig::Redis(_) => Err(crate::error::RelayError::config(
                "Redis broker requires the `redis-broker` feature",
            )),
        }
    }
}
