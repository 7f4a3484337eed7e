//! The processing engine behind [`Worker`](crate::core::Worker).
//!
//! The engine coordinates the moving parts of a running worker:
//! - Processor loop: leases tasks while a concurrency permit is free
//! - Priority selection: strict or 6:3:1 weighted order over the queues
//! - Forwarder: promotes due scheduled and retrying tasks
//! - Janitor: deletes terminal records whose retention has expired
//! - Health monitor: pings the broker
//!
//! Every attempt ends in exactly one broker transition, picked by
//! `Engine::settle` from the handler result.

use super::registry::HandlerRegistry;
use crate::broker::{Lease, SharedBroker};
use crate::config::{DurationExt, RetryPolicy, WorkerConfig};
use crate::error::{RelayError, RelayResult};
use crate::middleware::{TaskContext, panic_message};
use crate::task::{Queue, TaskMessage};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep};
use tracing::Instrument;
use tracing::level_filters::LevelFilter;

/// Consecutive lease failures after which the processor gives up.
const MAX_LEASE_FAILURES: u32 = 5;

/// Timings and limits the engine runs with.
#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub concurrency: usize,
    pub strict_priority: bool,
    pub poll_interval: Duration,
    pub rate_limit_backoff: Duration,
    pub delayed_task_check_interval: Duration,
    pub janitor_interval: Duration,
    pub health_check_interval: Duration,
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
    pub level: LevelFilter,
}

impl EngineSettings {
    pub fn from_config(config: &WorkerConfig, level: LevelFilter) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            strict_priority: config.strict_priority,
            poll_interval: config.poll_interval_ms.millis(),
            rate_limit_backoff: config.rate_limit_backoff_ms.millis(),
            delayed_task_check_interval: config.delayed_task_check_interval_secs.secs(),
            janitor_interval: config.janitor_interval_secs.secs(),
            health_check_interval: config.health_check_interval_secs.secs(),
            shutdown_timeout: config.shutdown_timeout(),
            retry: config.retry.clone(),
            level,
        }
    }
}

/// Picks the order in which queues are tried for the next lease.
#[derive(Debug)]
pub(crate) struct QueueSelector {
    strict: bool,
    current: [i64; 3],
}

impl QueueSelector {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            current: [0; 3],
        }
    }

    /// Queue order for the next lease.
    ///
    /// In weighted mode a smooth weighted round-robin picks the preferred
    /// queue, so over ten leases with every queue busy the split is 6:3:1.
    /// The remaining queues follow in priority order, so an idle preferred
    /// queue never leaves a worker idle.
    pub fn next_order(&mut self) -> Vec<Queue> {
        if self.strict {
            return Queue::ALL.to_vec();
        }

        let total: i64 = Queue::ALL.iter().map(|q| i64::from(q.weight())).sum();
        let mut best = 0;
        for (i, queue) in Queue::ALL.iter().enumerate() {
            self.current[i] += i64::from(queue.weight());
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= total;

        let preferred = Queue::ALL[best];
        let mut order = Vec::with_capacity(Queue::ALL.len());
        order.push(preferred);
        order.extend(Queue::ALL.iter().copied().filter(|q| *q != preferred));
        order
    }
}

/// Outcome of one attempt, before it is written to the broker.
#[derive(Debug)]
enum Attempt {
    Finished(RelayResult<()>),
    Interrupted,
}

/// Resolve once `stop` turns true or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Leases tasks and runs them through the wrapped handlers.
pub(crate) struct Engine {
    settings: EngineSettings,
    broker: SharedBroker,
    handlers: HandlerRegistry,
    healthy: Arc<AtomicBool>,
}

impl Engine {
    /// `handlers` must already be wrapped in the middleware chain.
    pub fn new(
        settings: EngineSettings,
        broker: SharedBroker,
        handlers: HandlerRegistry,
        healthy: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            broker,
            handlers,
            healthy,
        }
    }

    fn enabled(&self, level: tracing::Level) -> bool {
        self.settings.level >= level
    }

    /// Run until `stop` turns true, then drain in-flight attempts.
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) -> RelayResult<()> {
        let mut background = JoinSet::new();
        background.spawn(Arc::clone(&self).forwarder(stop.clone()));
        background.spawn(Arc::clone(&self).janitor(stop.clone()));
        background.spawn(Arc::clone(&self).health_monitor(stop.clone()));

        let result = if self.handlers.is_empty() {
            tracing::warn!("No task handlers registered; worker will not lease tasks");
            let mut stop = stop;
            stopped(&mut stop).await;
            Ok(())
        } else {
            Arc::clone(&self).process(stop).await
        };

        background.shutdown().await;
        result
    }

    async fn process(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> RelayResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut in_flight = JoinSet::new();
        let mut selector = QueueSelector::new(self.settings.strict_priority);
        let mut lease_failures = 0u32;
        let mut outcome = Ok(());

        tracing::info!(
            concurrency = self.settings.concurrency,
            strict_priority = self.settings.strict_priority,
            task_types = ?self.handlers.task_types(),
            "Processor started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Task attempt aborted");
                }
            }

            let permit = tokio::select! {
                _ = stopped(&mut stop) => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let order = selector.next_order();
            match self.broker.lease(&order).await {
                Ok(Some(lease)) => {
                    lease_failures = 0;
                    let engine = Arc::clone(&self);
                    let cancel = cancel_rx.clone();
                    in_flight.spawn(async move {
                        engine.handle(lease, cancel).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    lease_failures = 0;
                    drop(permit);
                    tokio::select! {
                        _ = stopped(&mut stop) => break,
                        _ = sleep(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    lease_failures += 1;
                    tracing::error!(error = %e, failures = lease_failures, "Failed to lease task");
                    if lease_failures >= MAX_LEASE_FAILURES {
                        outcome = Err(e);
                        break;
                    }
                    tokio::select! {
                        _ = stopped(&mut stop) => break,
                        _ = sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Processor stopping");

        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                timeout_secs = self.settings.shutdown_timeout.as_secs(),
                "Shutdown timeout reached; cancelling in-flight tasks"
            );
            let _ = cancel_tx.send(true);
            while in_flight.join_next().await.is_some() {}
        }

        tracing::info!("Processor stopped");
        outcome
    }

    /// Run one leased attempt and write its outcome to the broker.
    async fn handle(&self, lease: Lease, cancel: watch::Receiver<bool>) {
        let Lease { message, retried } = lease;
        let max_retry = message.max_retry.unwrap_or(self.settings.retry.max_attempts);
        let timeout = message.timeout();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let ctx = TaskContext::new(
            message.id.clone(),
            message.queue,
            retried,
            max_retry,
            deadline,
            cancel,
        );
        let task = message.to_task();

        let span = tracing::info_span!(
            "task.process",
            task_id = %message.id,
            task_type = %message.task_type,
            queue = %message.queue,
            retried
        );

        let attempt = async {
            if self.enabled(tracing::Level::DEBUG) {
                tracing::debug!("Processing task");
            }

            let Some(handler) = self.handlers.resolve(&message.task_type) else {
                return Attempt::Finished(Err(RelayError::HandlerNotFound {
                    task_type: message.task_type.clone(),
                }));
            };

            // The chain bounds the handler by the deadline; this only keeps a
            // panicking layer from taking the worker down.
            let invocation = AssertUnwindSafe(handler.process(&ctx, &task)).catch_unwind();

            tokio::select! {
                biased;
                _ = ctx.cancelled() => Attempt::Interrupted,
                result = invocation => Attempt::Finished(result.unwrap_or_else(|panic| {
                    Err(RelayError::Panic {
                        message: panic_message(&*panic),
                    })
                })),
            }
        }
        .instrument(span.clone())
        .await;

        self.settle(&message, retried, max_retry, attempt)
            .instrument(span)
            .await;
    }

    /// Write the outcome of an attempt to the broker.
    ///
    /// - success: completed
    /// - rate-limited or interrupted by shutdown: back to the queue, uncharged
    /// - skip-retry: archived
    /// - anything else: retried with backoff until the budget is spent
    async fn settle(&self, message: &TaskMessage, retried: u32, max_retry: u32, attempt: Attempt) {
        let result = match attempt {
            Attempt::Finished(Ok(())) => {
                if self.enabled(tracing::Level::INFO) {
                    tracing::info!("Task completed");
                }
                self.broker.complete(message).await
            }
            Attempt::Interrupted => {
                tracing::warn!("Task interrupted by shutdown; returning it to the queue");
                self.broker.requeue(message, Duration::ZERO).await
            }
            Attempt::Finished(Err(e)) if e.is_rate_limited() => {
                if self.enabled(tracing::Level::DEBUG) {
                    tracing::debug!(
                        delay_ms = self.settings.rate_limit_backoff.as_millis() as u64,
                        "Rate limited; requeueing"
                    );
                }
                self.broker
                    .requeue(message, self.settings.rate_limit_backoff)
                    .await
            }
            Attempt::Finished(Err(e)) if e.is_skip_retry() => {
                tracing::warn!(error = %e, "Task failed permanently; archiving");
                self.broker.archive(message, &e.to_string()).await
            }
            Attempt::Finished(Err(e)) => {
                let attempts = retried + 1;
                if retried >= max_retry {
                    tracing::warn!(error = %e, attempts, "Retry budget exhausted; archiving");
                    self.broker.archive(message, &e.to_string()).await
                } else {
                    let delay = self.settings.retry.delay_for(attempts);
                    let retry_at = crate::task::add_duration(Utc::now(), delay);
                    tracing::warn!(
                        error = %e,
                        attempts,
                        max_retry,
                        delay_ms = delay.as_millis() as u64,
                        "Task failed; scheduling retry"
                    );
                    self.broker.retry(message, &e.to_string(), retry_at).await
                }
            }
        };

        if let Err(e) = result {
            tracing::error!(task_id = %message.id, error = %e, "Failed to record task outcome");
        }
    }

    async fn forwarder(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.delayed_task_check_interval);
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => match self.broker.forward_due().await {
                    Ok(0) => {}
                    Ok(moved) => {
                        if self.enabled(tracing::Level::DEBUG) {
                            tracing::debug!(moved, "Forwarded due tasks");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to forward due tasks"),
                },
            }
        }
    }

    async fn janitor(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.janitor_interval);
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => match self.broker.delete_expired().await {
                    Ok(0) => {}
                    Ok(deleted) => {
                        if self.enabled(tracing::Level::DEBUG) {
                            tracing::debug!(deleted, "Deleted expired tasks");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to delete expired tasks"),
                },
            }
        }
    }

    async fn health_monitor(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.health_check_interval);
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {
                    let healthy = match self.broker.ping().await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!(error = %e, "Broker health check failed");
                            false
                        }
                    };
                    let was_healthy = self.healthy.swap(healthy, Ordering::Relaxed);
                    if healthy && !was_healthy {
                        tracing::info!("Broker connection recovered");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::metrics::WorkerMetrics;
    use crate::middleware::{MiddlewareChain, handler_fn};
    use crate::rate_limit::RateLimiter;
    use crate::task::{Task, TaskOptions, TaskState};

    fn settings() -> EngineSettings {
        let mut config = WorkerConfig::testing();
        config.retry = RetryPolicy::fixed(2, 10);
        EngineSettings::from_config(&config, LevelFilter::DEBUG)
    }

    async fn settle_once(
        broker: &Arc<InMemoryBroker>,
        result: RelayResult<()>,
    ) -> crate::task::TaskInfo {
        let message = Task::new("test", b"{}".to_vec()).to_message();
        broker.enqueue(message.clone(), None).await.unwrap();
        let lease = broker.lease(&Queue::ALL).await.unwrap().unwrap();

        let engine = Engine::new(
            settings(),
            Arc::clone(broker) as SharedBroker,
            HandlerRegistry::new(),
            Arc::new(AtomicBool::new(true)),
        );
        engine
            .settle(&lease.message, lease.retried, 2, Attempt::Finished(result))
            .await;
        broker
            .get_task_info(message.queue, &message.id)
            .await
            .unwrap()
    }

    #[test]
    fn test_strict_order() {
        let mut selector = QueueSelector::new(true);
        for _ in 0..5 {
            assert_eq!(
                selector.next_order(),
                vec![Queue::High, Queue::Default, Queue::Low]
            );
        }
    }

    #[test]
    fn test_weighted_order_is_six_three_one() {
        let mut selector = QueueSelector::new(false);
        let mut counts = [0; 3];
        for _ in 0..100 {
            let order = selector.next_order();
            assert_eq!(order.len(), 3);
            let first = Queue::ALL.iter().position(|q| *q == order[0]).unwrap();
            counts[first] += 1;
        }
        assert_eq!(counts, [60, 30, 10]);
    }

    #[tokio::test]
    async fn test_settle_success() {
        let broker = Arc::new(InMemoryBroker::new());
        let info = settle_once(&broker, Ok(())).await;
        assert_eq!(info.state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_settle_skip_retry_archives_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let info = settle_once(&broker, Err(RelayError::handler("bad").skip_retry())).await;
        assert_eq!(info.state, TaskState::Archived);
        assert_eq!(info.attempt_count(), 1);
    }

    #[tokio::test]
    async fn test_settle_rate_limited_is_uncharged() {
        let broker = Arc::new(InMemoryBroker::new());
        let info = settle_once(&broker, Err(RelayError::RateLimitExceeded)).await;
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_settle_failure_retries() {
        let broker = Arc::new(InMemoryBroker::new());
        let info = settle_once(&broker, Err(RelayError::handler("smtp down"))).await;
        assert_eq!(info.state, TaskState::Retry);
        assert_eq!(info.attempt_count(), 1);
        assert!(info.last_error.unwrap().contains("smtp down"));
    }

    #[tokio::test]
    async fn test_panic_and_timeout_are_retryable_failures() {
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = WorkerMetrics::new().unwrap();
        let chain = MiddlewareChain::new(metrics.clone(), Arc::new(RateLimiter::unlimited()));

        let mut registry = HandlerRegistry::new();
        registry.register(
            "panics",
            handler_fn(|_| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
        );
        registry.register(
            "hangs",
            handler_fn(|_| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );

        let engine = Engine::new(
            settings(),
            Arc::clone(&broker) as SharedBroker,
            registry.wrapped(&chain),
            Arc::new(AtomicBool::new(true)),
        );
        let (_cancel_tx, cancel) = watch::channel(false);

        let panics = Task::new("panics", b"{}".to_vec()).to_message();
        let hangs = Task::new("hangs", b"{}".to_vec())
            .with_options(TaskOptions::default().timeout(Duration::from_millis(20)))
            .to_message();

        for message in [&panics, &hangs] {
            broker.enqueue(message.clone(), None).await.unwrap();
            let lease = broker.lease(&Queue::ALL).await.unwrap().unwrap();
            engine.handle(lease, cancel.clone()).await;

            let info = broker.get_task_info(Queue::Default, &message.id).await.unwrap();
            assert_eq!(info.state, TaskState::Retry);
            assert_eq!(info.attempt_count(), 1);
        }

        for task_type in ["panics", "hangs"] {
            assert_eq!(metrics.processed(task_type), 1);
            assert_eq!(metrics.failed(task_type), 1);
        }
        assert_eq!(metrics.in_progress_total(), 0);
        let hangs_info = broker.get_task_info(Queue::Default, &hangs.id).await.unwrap();
        assert!(hangs_info.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_retryable() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = HandlerRegistry::new();
        registry.register("known", handler_fn(|_| async { Ok(()) }));
        let engine = Engine::new(
            settings(),
            Arc::clone(&broker) as SharedBroker,
            registry,
            Arc::new(AtomicBool::new(true)),
        );
        let (_cancel_tx, cancel) = watch::channel(false);

        let message = Task::new("unknown", b"{}".to_vec()).to_message();
        broker.enqueue(message.clone(), None).await.unwrap();
        let lease = broker.lease(&Queue::ALL).await.unwrap().unwrap();
        engine.handle(lease, cancel).await;

        let info = broker.get_task_info(Queue::Default, &message.id).await.unwrap();
        assert_eq!(info.state, TaskState::Retry);
        assert!(info.last_error.unwrap().contains("unknown"));
    }

    #[tokio::test]
    async fn test_unknown_type_is_counted_through_the_chain() {
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = WorkerMetrics::new().unwrap();
        let chain = MiddlewareChain::new(metrics.clone(), Arc::new(RateLimiter::unlimited()));
        let mut registry = HandlerRegistry::new();
        registry.register("known", handler_fn(|_| async { Ok(()) }));
        let engine = Engine::new(
            settings(),
            Arc::clone(&broker) as SharedBroker,
            registry.wrapped(&chain),
            Arc::new(AtomicBool::new(true)),
        );
        let (_cancel_tx, cancel) = watch::channel(false);

        let message = Task::new("unknown", b"{}".to_vec()).to_message();
        broker.enqueue(message.clone(), None).await.unwrap();
        let lease = broker.lease(&Queue::ALL).await.unwrap().unwrap();
        engine.handle(lease, cancel).await;

        let info = broker.get_task_info(Queue::Default, &message.id).await.unwrap();
        assert_eq!(info.state, TaskState::Retry);
        assert_eq!(metrics.processed("unknown"), 1);
        assert_eq!(metrics.failed("unknown"), 1);
    }

    #[tokio::test]
    async fn test_cancelled_attempt_is_requeued() {
        let broker = Arc::new(InMemoryBroker::new());
        let mut registry = HandlerRegistry::new();
        registry.register(
            "slow",
            handler_fn(|_| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        );
        let engine = Arc::new(Engine::new(
            settings(),
            Arc::clone(&broker) as SharedBroker,
            registry,
            Arc::new(AtomicBool::new(true)),
        ));
        let (cancel_tx, cancel) = watch::channel(false);

        let message = Task::new("slow", b"{}".to_vec())
            .with_options(TaskOptions::default().timeout(Duration::from_secs(30)))
            .to_message();
        broker.enqueue(message.clone(), None).await.unwrap();
        let lease = broker.lease(&Queue::ALL).await.unwrap().unwrap();

        let handle = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.handle(lease, cancel).await }
        });
        sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).unwrap();
        handle.await.unwrap();

        let info = broker.get_task_info(Queue::Default, &message.id).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.attempt_count(), 0);
    }
}
