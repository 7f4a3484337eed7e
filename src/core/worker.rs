//! The worker: leases tasks from the broker and runs them through the
//! middleware-wrapped handlers.
//!
//! # Examples
//!
//! ```rust,no_run
//! use taskrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     set_rate_limiter(0.0, 0);
//!
//!     let mut handlers = HandlerRegistry::new();
//!     handlers.register(TaskType::HealthCheck, HealthCheckHandler);
//!     let worker = std::sync::Arc::new(Worker::new(WorkerConfig::default(), Some(handlers)).await?);
//!
//!     let running = std::sync::Arc::clone(&worker);
//!     tokio::spawn(async move { running.start().await });
//!
//!     tokio::signal::ctrl_c().await?;
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```

use super::engine::{Engine, EngineSettings, stopped};
use super::registry::HandlerRegistry;
use crate::broker::{BrokerFactory, SharedBroker};
use crate::config::{LogLevel, WorkerConfig, validation_error};
use crate::error::{RelayError, RelayResult};
use crate::metrics::{WorkerMetrics, serve_metrics};
use crate::middleware::{MiddlewareChain, panic_message};
use crate::rate_limit::{self, RateLimiter};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;

/// Task worker.
///
/// Built once, started once. [`Worker::start`] blocks until
/// [`Worker::shutdown`] is called from another task or the broker becomes
/// unreachable.
pub struct Worker {
    config: WorkerConfig,
    level: LevelFilter,
    broker: SharedBroker,
    handlers: HandlerRegistry,
    limiter: Arc<RateLimiter>,
    metrics: WorkerMetrics,
    running: AtomicBool,
    healthy: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    active: watch::Sender<bool>,
}

/// Collaborators of a worker that passed validation.
struct Parts {
    level: LevelFilter,
    handlers: HandlerRegistry,
    limiter: Arc<RateLimiter>,
}

impl Parts {
    /// Checks run in order: rate limiter, log level, handlers, then the
    /// rest of the configuration.
    fn check(
        config: &WorkerConfig,
        handlers: Option<HandlerRegistry>,
        limiter: Option<Arc<RateLimiter>>,
    ) -> RelayResult<Self> {
        let limiter = limiter.ok_or(RelayError::NoRateLimiter)?;
        let level = LevelFilter::from(LogLevel::parse(&config.log_level)?);
        let handlers = handlers.ok_or(RelayError::NoTaskHandler)?;
        config.validate().map_err(validation_error)?;
        Ok(Self {
            level,
            handlers,
            limiter,
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("concurrency", &self.config.concurrency)
            .field("strict_priority", &self.config.strict_priority)
            .field("level", &self.level)
            .field("handlers", &self.handlers)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker connected to the broker named in `config`.
    ///
    /// Fails with `NoRateLimiter` unless [`rate_limit::set_rate_limiter`]
    /// was called first, with `InvalidLogLevel` for an unknown log level and
    /// with `NoTaskHandler` when `handlers` is `None`. An empty registry is
    /// accepted; such a worker never leases anything.
    pub async fn new(config: WorkerConfig, handlers: Option<HandlerRegistry>) -> RelayResult<Self> {
        let parts = Parts::check(&config, handlers, rate_limit::rate_limiter())?;
        let broker = BrokerFactory::connect(&config.broker).await?;
        Self::assemble(config, parts, broker)
    }

    /// Create a worker on an existing broker.
    pub fn with_broker(
        config: WorkerConfig,
        handlers: Option<HandlerRegistry>,
        broker: SharedBroker,
    ) -> RelayResult<Self> {
        Self::build(config, handlers, broker, rate_limit::rate_limiter())
    }

    fn build(
        config: WorkerConfig,
        handlers: Option<HandlerRegistry>,
        broker: SharedBroker,
        limiter: Option<Arc<RateLimiter>>,
    ) -> RelayResult<Self> {
        let parts = Parts::check(&config, handlers, limiter)?;
        Self::assemble(config, parts, broker)
    }

    fn assemble(config: WorkerConfig, parts: Parts, broker: SharedBroker) -> RelayResult<Self> {
        Ok(Self {
            config,
            level: parts.level,
            broker,
            handlers: parts.handlers,
            limiter: parts.limiter,
            metrics: WorkerMetrics::global()?,
            running: AtomicBool::new(false),
            healthy: Arc::new(AtomicBool::new(true)),
            stop: watch::channel(false).0,
            active: watch::channel(false).0,
        })
    }

    /// Use `limiter` instead of the process-wide one.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Record into `metrics` instead of the process-wide registry.
    pub fn with_metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics this worker records into.
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Broker this worker leases from.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Whether [`Worker::start`] is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Run until [`Worker::shutdown`] is called.
    ///
    /// Returns `Ok(())` on graceful termination and the broker error when
    /// the broker stays unreachable. Calling it while already running fails
    /// with `AlreadyRunning`; calling it after shutdown returns immediately.
    pub async fn start(&self) -> RelayResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        if *self.stop.borrow() {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.active.send_replace(true);

        tracing::info!(
            concurrency = self.config.concurrency,
            strict_priority = self.config.strict_priority,
            rate_limit = self.limiter.limit(),
            rate_burst = self.limiter.burst(),
            "Starting worker"
        );
        if self.level >= tracing::Level::DEBUG {
            tracing::debug!(
                group_grace_period_secs = self.config.group_grace_period_secs,
                group_max_delay_secs = self.config.group_max_delay_secs,
                group_max_size = self.config.group_max_size,
                "Task grouping settings"
            );
        }

        let metrics_server = self.config.metrics.enabled.then(|| {
            let config = self.config.metrics.clone();
            let metrics = self.metrics.clone();
            let stop = self.stop.subscribe();
            tokio::spawn(async move {
                match AssertUnwindSafe(serve_metrics(config, metrics, stop))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!(error = %e, "Metrics endpoint failed"),
                    Err(panic) => tracing::error!(
                        panic = %panic_message(&*panic),
                        "Metrics endpoint panicked"
                    ),
                }
            })
        });

        let chain = MiddlewareChain::new(self.metrics.clone(), Arc::clone(&self.limiter));
        let engine = Arc::new(Engine::new(
            EngineSettings::from_config(&self.config, self.level),
            Arc::clone(&self.broker),
            self.handlers.wrapped(&chain),
            Arc::clone(&self.healthy),
        ));

        let result = engine.run(self.stop.subscribe()).await;

        // A broker failure ends the run without a shutdown request.
        self.stop.send_replace(true);
        if let Some(server) = metrics_server {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Metrics endpoint task aborted");
            }
        }

        match &result {
            Ok(()) => tracing::info!("Worker stopped"),
            Err(e) => tracing::error!(error = %e, "Worker stopped on broker failure"),
        }

        self.running.store(false, Ordering::SeqCst);
        self.active.send_replace(false);
        result
    }

    /// Stop leasing, wait up to the shutdown timeout for in-flight tasks,
    /// cancel the rest and return once [`Worker::start`] has returned.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.stop.send_replace(true) {
            tracing::info!("Shutting down worker");
        }
        let mut active = self.active.subscribe();
        while *active.borrow_and_update() {
            if active.changed().await.is_err() {
                break;
            }
        }
    }

    /// Resolve once shutdown has been requested.
    pub async fn stopped(&self) {
        stopped(&mut self.stop.subscribe()).await;
    }

    /// Ping the broker now.
    pub async fn health_check(&self) -> RelayResult<()> {
        let result = self.broker.ping().await;
        self.healthy.store(result.is_ok(), Ordering::Relaxed);
        result
    }

    /// Outcome of the last broker health check.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
