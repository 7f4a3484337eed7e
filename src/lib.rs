//! # taskrelay
//!
//! Background task pipeline: a client that enqueues tasks, a worker that runs
//! them through a fixed middleware chain, and a scheduler that enqueues tasks
//! on cron schedules.
//!
//! ## Features
//!
//! - **Priority queues**: `high`, `default` and `low`, served 6:3:1 or strictly
//! - **Middleware**: Prometheus metrics, a process-wide rate limiter and error logging
//! - **Retry control**: handlers mark errors as skip-retry to archive a task at once
//! - **System tasks**: health check and licence-expiry notification
//! - **Brokers**: in-memory by default, Redis behind the `redis-broker` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskrelay::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     // Unlimited admission; must happen before any worker is built.
//!     set_rate_limiter(0.0, 0);
//!
//!     let mut handlers = HandlerRegistry::new();
//!     handlers.register(TaskType::HealthCheck, HealthCheckHandler);
//!
//!     let worker = Arc::new(Worker::new(WorkerConfig::default(), Some(handlers)).await?);
//!     let running = Arc::clone(&worker);
//!     tokio::spawn(async move { running.start().await });
//!
//!     let client = Client::new(ClientConfig::default()).await?;
//!     client.ping_timeout(std::time::Duration::from_secs(5)).await?;
//!
//!     worker.shutdown().await;
//!     client.close().await
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod scheduler;
pub mod task;
pub mod tasks;
pub mod telemetry;

pub mod prelude {
    pub use crate::broker::{Broker, BrokerFactory, InMemoryBroker, SharedBroker};
    pub use crate::client::Client;
    pub use crate::config::*;
    pub use crate::core::{HandlerRegistry, Worker};
    pub use crate::error::{ErrorKind, RelayError, RelayResult};
    pub use crate::metrics::WorkerMetrics;
    pub use crate::middleware::{TaskContext, TaskHandler, handler_fn};
    pub use crate::rate_limit::{RateLimiter, rate_limiter, set_rate_limiter};
    pub use crate::scheduler::Scheduler;
    pub use crate::task::{Queue, Task, TaskId, TaskInfo, TaskOptions, TaskState, TaskType};
    pub use crate::tasks::{EmailSender, HealthCheckHandler, License, LicenseExpiryHandler};
    pub use async_trait::async_trait;
}

pub use crate::client::Client;
pub use crate::config::*;
pub use crate::core::{HandlerRegistry, Worker};
pub use crate::error::{ErrorKind, RelayError, RelayResult};
pub use crate::rate_limit::set_rate_limiter;
pub use crate::scheduler::Scheduler;
pub use crate::task::{Queue, Task, TaskId, TaskInfo, TaskOptions, TaskState, TaskType};
pub use async_trait::async_trait;
