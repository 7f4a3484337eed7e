//! Handler trait and the middleware wrapped around every invocation.
//!
//! The worker never calls a handler directly. [`MiddlewareChain::wrap`] nests
//! it as `metrics(rate_limit(error_log(guard(handler))))`:
//!
//! 1. [`MetricsMiddleware`] tracks the in-progress gauge and the processed and
//!    failed counters. Rate-limit denials are not counted.
//! 2. [`RateLimitMiddleware`] asks the limiter for a token and fails with
//!    [`RelayError::RateLimitExceeded`] without calling the handler when none
//!    is left.
//! 3. [`ErrorLogMiddleware`] logs handler errors with the raw payload and
//!    passes them on unchanged.
//! 4. [`AttemptGuard`] bounds the handler by the context deadline and turns a
//!    panic into [`RelayError::Panic`], so both reach the outer layers as
//!    ordinary errors.
//!
//! Each layer runs inside its own span, which closes when the layer returns or
//! unwinds.

use crate::error::{RelayError, RelayResult};
use crate::metrics::WorkerMetrics;
use crate::rate_limit::RateLimiter;
use crate::task::{Queue, Task, TaskId};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::Instrument;

/// Per-attempt information passed to handlers.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: TaskId,
    queue: Queue,
    retried: u32,
    max_retry: u32,
    deadline: Option<Instant>,
    cancel: watch::Receiver<bool>,
}

impl TaskContext {
    /// Build a context for one attempt.
    pub fn new(
        task_id: impl Into<TaskId>,
        queue: Queue,
        retried: u32,
        max_retry: u32,
        deadline: Option<Instant>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            queue,
            retried,
            max_retry,
            deadline,
            cancel,
        }
    }

    /// Context that is never cancelled and has no deadline.
    pub fn background(task_id: impl Into<TaskId>) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self::new(task_id, Queue::Default, 0, 0, None, cancel)
    }

    /// ID of the task being processed.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Queue the task was leased from.
    pub fn queue(&self) -> Queue {
        self.queue
    }

    /// Charged attempts before this one.
    pub fn retry_count(&self) -> u32 {
        self.retried
    }

    /// Retry budget of the task.
    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    /// Deadline of this attempt.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the worker has asked in-flight tasks to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolve when the worker asks in-flight tasks to stop.
    ///
    /// Never resolves for a context whose sender is gone without cancelling.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return;
            }
            if cancel.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Something that can process a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one attempt of `task`.
    ///
    /// Return `Ok(())` on success, an error to have the attempt retried, or
    /// an error wrapped with [`RelayError::skip_retry`] to archive the task.
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()>;
}

#[async_trait]
impl<T: TaskHandler + ?Sized> TaskHandler for Arc<T> {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        (**self).process(ctx, task).await
    }
}

/// Handler built from an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = RelayResult<()>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = RelayResult<()>> + Send,
{
    async fn process(&self, _ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        (self.f)(task.clone()).await
    }
}

/// Records the task metrics around the inner handler.
pub struct MetricsMiddleware<H> {
    inner: H,
    metrics: WorkerMetrics,
}

impl<H: TaskHandler> MetricsMiddleware<H> {
    /// Wrap `inner`.
    pub fn new(inner: H, metrics: WorkerMetrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for MetricsMiddleware<H> {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        let task_type = task.task_type();
        let span = tracing::info_span!("middleware.metrics", task_type = %task_type);

        async {
            let in_progress = self.metrics.track_in_progress(task_type);
            let result = self.inner.process(ctx, task).await;
            drop(in_progress);

            if let Err(e) = &result {
                if e.is_rate_limited() {
                    return result;
                }
                self.metrics.record_failed(task_type);
            }
            self.metrics.record_processed(task_type);
            result
        }
        .instrument(span)
        .await
    }
}

/// Admits an attempt only if the limiter has a token.
pub struct RateLimitMiddleware<H> {
    inner: H,
    limiter: Arc<RateLimiter>,
}

impl<H: TaskHandler> RateLimitMiddleware<H> {
    /// Wrap `inner`.
    pub fn new(inner: H, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for RateLimitMiddleware<H> {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        let span = tracing::info_span!("middleware.rate_limit", task_type = %task.task_type());

        async {
            if !self.limiter.allow() {
                tracing::debug!(task_id = %ctx.task_id(), "Rate limit exceeded");
                return Err(RelayError::RateLimitExceeded);
            }
            self.inner.process(ctx, task).await
        }
        .instrument(span)
        .await
    }
}

/// Logs handler errors and passes them on unchanged.
pub struct ErrorLogMiddleware<H> {
    inner: H,
}

impl<H: TaskHandler> ErrorLogMiddleware<H> {
    /// Wrap `inner`.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for ErrorLogMiddleware<H> {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        let span = tracing::info_span!("middleware.error_log", task_type = %task.task_type());

        async {
            let result = self.inner.process(ctx, task).await;
            if let Err(e) = &result {
                tracing::error!(
                    task_id = %ctx.task_id(),
                    task_type = %task.task_type(),
                    payload = %String::from_utf8_lossy(task.payload()),
                    error = %e,
                    "Task handler failed"
                );
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Innermost layer: enforces the attempt deadline and catches panics.
pub struct AttemptGuard<H> {
    inner: H,
}

impl<H: TaskHandler> AttemptGuard<H> {
    /// Wrap `inner`.
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: TaskHandler> TaskHandler for AttemptGuard<H> {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        let invocation = AssertUnwindSafe(self.inner.process(ctx, task)).catch_unwind();
        let outcome = match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), invocation)
                .await
                .map_err(|_| RelayError::Timeout {
                    timeout_secs: task.options().timeout.as_secs(),
                })?,
            None => invocation.await,
        };

        outcome.unwrap_or_else(|panic| {
            Err(RelayError::Panic {
                message: panic_message(&*panic),
            })
        })
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Stands in for a task type nobody registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundHandler;

#[async_trait]
impl TaskHandler for NotFoundHandler {
    async fn process(&self, _ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        Err(RelayError::HandlerNotFound {
            task_type: task.task_type().to_string(),
        })
    }
}

/// Builds the fixed middleware stack around handlers.
#[derive(Debug, Clone)]
pub struct MiddlewareChain {
    metrics: WorkerMetrics,
    limiter: Arc<RateLimiter>,
}

impl MiddlewareChain {
    /// Chain recording into `metrics` and admitting through `limiter`.
    pub fn new(metrics: WorkerMetrics, limiter: Arc<RateLimiter>) -> Self {
        Self { metrics, limiter }
    }

    /// Wrap `handler` as `metrics(rate_limit(error_log(guard(handler))))`.
    pub fn wrap<H: TaskHandler + 'static>(&self, handler: H) -> Arc<dyn TaskHandler> {
        Arc::new(MetricsMiddleware::new(
            RateLimitMiddleware::new(
                ErrorLogMiddleware::new(AttemptGuard::new(handler)),
                Arc::clone(&self.limiter),
            ),
            self.metrics.clone(),
        ))
    }

    /// Metrics the chain records into.
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }
}
