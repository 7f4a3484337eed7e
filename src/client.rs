//! Producer side of the pipeline.
//!
//! A [`Client`] enqueues tasks, looks up their records and can ping the
//! worker fleet end to end by enqueueing a health check and waiting for it to
//! complete.
//!
//! # Examples
//!
//! ```rust,no_run
//! use taskrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> RelayResult<()> {
//!     let client = Client::new(ClientConfig::default()).await?;
//!
//!     let task = taskrelay::tasks::new_health_check_task()?;
//!     let info = client.enqueue(&task).await?;
//!     println!("enqueued {} on {}", info.id, info.queue);
//!
//!     client.ping_timeout(std::time::Duration::from_secs(5)).await?;
//!     client.close().await
//! }
//! ```

use crate::broker::{BrokerFactory, SharedBroker};
use crate::config::{ClientConfig, DurationExt, validation_error};
use crate::error::{RelayError, RelayResult};
use crate::task::{Queue, Task, TaskId, TaskInfo, TaskState};
use crate::tasks::new_health_check_task;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

/// Task producer.
pub struct Client {
    broker: SharedBroker,
    config: ClientConfig,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the broker named in `config`.
    pub async fn new(config: ClientConfig) -> RelayResult<Self> {
        config.validate().map_err(validation_error)?;
        let broker = BrokerFactory::connect(&config.broker).await?;
        Ok(Self::with_broker(config, broker))
    }

    /// Create a client on an existing broker.
    pub fn with_broker(config: ClientConfig, broker: SharedBroker) -> Self {
        Self {
            broker,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Broker this client talks to.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    fn ensure_open(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RelayError::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Hand `task` to the broker.
    ///
    /// The returned record is `pending`, or `scheduled` when the options
    /// carry a future `process_at`. Broker failures come back wrapped in
    /// `SendTask`.
    pub async fn enqueue(&self, task: &Task) -> RelayResult<TaskInfo> {
        self.ensure_open()?;

        let message = task.to_message();
        let process_at = task.options().process_at;
        let info = self
            .broker
            .enqueue(message, process_at)
            .await
            .map_err(RelayError::send_task)?;

        tracing::debug!(
            task_id = %info.id,
            task_type = %info.task_type,
            queue = %info.queue,
            state = %info.state,
            "Task enqueued"
        );
        Ok(info)
    }

    /// Enqueue a health check and wait until a worker has completed it.
    ///
    /// Polls the record every `ping_poll_interval_ms` with no upper bound;
    /// drop the future or use [`Client::ping_timeout`] to give up. The
    /// enqueued task is not revoked when the caller gives up. A record that
    /// ends archived, or completed with an error, fails with `ReceiveTask`.
    pub async fn ping(&self) -> RelayResult<()> {
        let task = new_health_check_task()?;
        let info = self.enqueue(&task).await?;

        let mut ticker = interval(self.config.ping_poll_interval_ms.max(1).millis());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let current = self.get_task_info(info.queue, &info.id).await?;
            match current.state {
                TaskState::Completed => {
                    return match current.last_error.filter(|e| !e.is_empty()) {
                        None => Ok(()),
                        Some(message) => Err(RelayError::ReceiveTask { message }),
                    };
                }
                TaskState::Archived => {
                    return Err(RelayError::ReceiveTask {
                        message: current
                            .last_error
                            .unwrap_or_else(|| "task archived".to_string()),
                    });
                }
                _ => {}
            }
        }
    }

    /// [`Client::ping`] bounded by `timeout`; fails with `Canceled` on expiry.
    pub async fn ping_timeout(&self, timeout: Duration) -> RelayResult<()> {
        tokio::time::timeout(timeout, self.ping())
            .await
            .map_err(|_| RelayError::Canceled)?
    }

    /// Current record of task `id` in `queue`. Broker errors are returned as-is.
    pub async fn get_task_info(&self, queue: Queue, id: &TaskId) -> RelayResult<TaskInfo> {
        self.ensure_open()?;
        self.broker.get_task_info(queue, id).await
    }

    /// Release the broker connection. Every later call fails with
    /// `ClientClosed`.
    pub async fn close(&self) -> RelayResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(RelayError::ClientClosed);
        }
        self.broker.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::error::ErrorKind;
    use crate::task::TaskOptions;
    use std::sync::Arc;

    fn client() -> (Arc<InMemoryBroker>, Client) {
        let broker = Arc::new(InMemoryBroker::new());
        let client = Client::with_broker(ClientConfig::default(), Arc::clone(&broker) as SharedBroker);
        (broker, client)
    }

    /// Lease one task and settle it with `settle`.
    fn settle_next<F, Fut>(broker: Arc<InMemoryBroker>, settle: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Arc<InMemoryBroker>, crate::task::TaskMessage) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            loop {
                if let Some(lease) = broker.lease(&Queue::ALL).await.unwrap() {
                    settle(broker, lease.message).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn test_enqueue_returns_pending_record() {
        let (_, client) = client();
        let task = Task::new("system:health_check", br#"{"message":"healthy"}"#.to_vec());

        let info = client.enqueue(&task).await.unwrap();
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.queue, Queue::Default);

        let fetched = client.get_task_info(info.queue, &info.id).await.unwrap();
        assert_eq!(fetched.id, info.id);
    }

    #[tokio::test]
    async fn test_enqueue_scheduled() {
        let (_, client) = client();
        let task = Task::new("system:health_check", b"{}".to_vec())
            .with_options(TaskOptions::default().process_in(Duration::from_secs(60)));

        let info = client.enqueue(&task).await.unwrap();
        assert_eq!(info.state, TaskState::Scheduled);
        assert!(info.next_process_at.is_some());
    }

    #[tokio::test]
    async fn test_enqueue_wraps_broker_errors() {
        let (_, client) = client();
        let task = Task::new("system:health_check", b"{}".to_vec())
            .with_options(TaskOptions::default().task_id("fixed-id"));

        client.enqueue(&task).await.unwrap();
        let err = client.enqueue(&task).await.unwrap_err();
        assert!(err.is(ErrorKind::SendTask));
        assert!(err.is(ErrorKind::Broker));
    }

    #[tokio::test]
    async fn test_ping_completes() {
        let (broker, client) = client();
        let consumer = settle_next(Arc::clone(&broker), |broker, message| async move {
            broker.complete(&message).await.unwrap();
        });

        client.ping_timeout(Duration::from_secs(2)).await.unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_archived_is_receive_error() {
        let (broker, client) = client();
        let consumer = settle_next(Arc::clone(&broker), |broker, message| async move {
            broker.archive(&message, "decode failed").await.unwrap();
        });

        let err = client.ping_timeout(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.is(ErrorKind::ReceiveTask));
        assert!(err.to_string().contains("decode failed"));
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_timeout_without_worker() {
        let (broker, client) = client();
        let err = client
            .ping_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Canceled));

        // The health check stays queued.
        assert_eq!(broker.pending_len(Queue::Default).await, 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let (_, client) = client();
        tokio_test::assert_ok!(client.close().await);

        let task = Task::new("system:health_check", b"{}".to_vec());
        assert!(matches!(
            client.enqueue(&task).await.unwrap_err(),
            RelayError::ClientClosed
        ));
        assert!(matches!(
            client.close().await.unwrap_err(),
            RelayError::ClientClosed
        ));
    }
}
