//! End-to-end runs of client, worker and scheduler on an in-memory broker.
//!
//! Every test builds its own broker, metrics registry and, where admission
//! matters, its own rate limiter. The process-wide limiter is only ever
//! installed as unlimited.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskrelay::error::BoxError;
use taskrelay::prelude::*;
use taskrelay::tasks::{new_health_check_task, new_license_expiry_task};
use tokio::task::JoinHandle;

type Sent = (String, String, String, DateTime<Utc>);

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<Sent>>,
}

#[async_trait]
impl EmailSender for RecordingSender {
    async fn send_system_license_expiry(
        &self,
        _ctx: &TaskContext,
        license_id: &str,
        email: &str,
        organization: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BoxError> {
        self.sent.lock().unwrap().push((
            license_id.to_string(),
            email.to_string(),
            organization.to_string(),
            expires_at,
        ));
        Ok(())
    }
}

struct Pipeline {
    broker: Arc<InMemoryBroker>,
    worker: Arc<Worker>,
    metrics: WorkerMetrics,
    client: Client,
    running: JoinHandle<RelayResult<()>>,
}

impl Pipeline {
    async fn start(config: WorkerConfig, handlers: HandlerRegistry, limiter: RateLimiter) -> Self {
        set_rate_limiter(0.0, 0);

        let broker = Arc::new(InMemoryBroker::new());
        let shared: SharedBroker = Arc::clone(&broker) as SharedBroker;
        let metrics = WorkerMetrics::new().unwrap();

        let worker = Arc::new(
            Worker::with_broker(config, Some(handlers), Arc::clone(&shared))
                .unwrap()
                .with_rate_limiter(Arc::new(limiter))
                .with_metrics(metrics.clone()),
        );
        let running = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.start().await }
        });

        let client = Client::with_broker(ClientConfig::default(), shared);

        Self {
            broker,
            worker,
            metrics,
            client,
            running,
        }
    }

    async fn stop(self) {
        self.worker.shutdown().await;
        self.running.await.unwrap().unwrap();
    }

    async fn wait_for(&self, info: &TaskInfo, state: TaskState) -> TaskInfo {
        tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                let current = self.client.get_task_info(info.queue, &info.id).await.unwrap();
                if current.state == state {
                    return current;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("task {} never reached {}", info.id, state))
    }
}

fn system_registry(sender: Arc<RecordingSender>, now: DateTime<Utc>) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::HealthCheck, HealthCheckHandler);
    handlers.register(
        TaskType::LicenseExpiry,
        LicenseExpiryHandler::new(Some(sender as Arc<dyn EmailSender>))
            .unwrap()
            .with_clock(move || now),
    );
    handlers
}

fn license(expires_at: DateTime<Utc>) -> License {
    License {
        id: "bvn6c05roa2mnak37ms0".to_string(),
        email: "info@example.com".to_string(),
        organization: "ACME Inc.".to_string(),
        expires_at,
    }
}

fn clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_health_round_trip() {
    let sender = Arc::new(RecordingSender::default());
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        system_registry(Arc::clone(&sender), clock()),
        RateLimiter::unlimited(),
    )
    .await;

    pipeline
        .client
        .ping_timeout(Duration::from_secs(10))
        .await
        .unwrap();

    let records = pipeline.broker.snapshot().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, TaskState::Completed);
    assert_eq!(records[0].task_type, "system:health_check");
    assert!(records[0].last_error.is_none());
    assert_eq!(pipeline.metrics.processed("system:health_check"), 1);
    assert!(sender.sent.lock().unwrap().is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_license_due_soon_sends_one_email() {
    let sender = Arc::new(RecordingSender::default());
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        system_registry(Arc::clone(&sender), clock()),
        RateLimiter::unlimited(),
    )
    .await;

    let expires_at = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
    let task = new_license_expiry_task(Some(&license(expires_at))).unwrap();
    let info = pipeline.client.enqueue(&task).await.unwrap();
    assert_eq!(info.queue, Queue::High);

    pipeline.wait_for(&info, TaskState::Completed).await;
    assert_eq!(
        *sender.sent.lock().unwrap(),
        vec![(
            "bvn6c05roa2mnak37ms0".to_string(),
            "info@example.com".to_string(),
            "ACME Inc.".to_string(),
            expires_at
        )]
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn test_license_far_future_sends_nothing() {
    let sender = Arc::new(RecordingSender::default());
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        system_registry(Arc::clone(&sender), clock()),
        RateLimiter::unlimited(),
    )
    .await;

    let expires_at = Utc.with_ymd_and_hms(2099, 12, 31, 0, 0, 0).unwrap();
    let task = new_license_expiry_task(Some(&license(expires_at))).unwrap();
    let info = pipeline.client.enqueue(&task).await.unwrap();

    let done = pipeline.wait_for(&info, TaskState::Completed).await;
    assert!(done.last_error.is_none());
    assert!(sender.sent.lock().unwrap().is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_malformed_payload_is_archived_after_one_attempt() {
    let sender = Arc::new(RecordingSender::default());
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        system_registry(Arc::clone(&sender), clock()),
        RateLimiter::unlimited(),
    )
    .await;

    let task = Task::new(TaskType::LicenseExpiry, b"{\"LicenseID\"".to_vec());
    let info = pipeline.client.enqueue(&task).await.unwrap();

    let archived = pipeline.wait_for(&info, TaskState::Archived).await;
    assert_eq!(archived.attempt_count(), 1);
    let last_error = archived.last_error.unwrap();
    assert!(last_error.contains("unmarshal"));
    assert!(last_error.contains("skip retry"));
    assert_eq!(pipeline.metrics.failed("system:license_expiry"), 1);
    assert!(sender.sent.lock().unwrap().is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_rate_limited_tasks_are_not_failures() {
    let sender = Arc::new(RecordingSender::default());
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        system_registry(Arc::clone(&sender), clock()),
        RateLimiter::new(1.0, 1),
    )
    .await;

    let mut infos = Vec::new();
    for _ in 0..5 {
        let task = new_health_check_task().unwrap();
        infos.push(pipeline.client.enqueue(&task).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for info in &infos {
        let done = pipeline.wait_for(info, TaskState::Completed).await;
        assert_eq!(done.attempt_count(), 0);
    }

    assert_eq!(pipeline.metrics.processed("system:health_check"), 5);
    assert_eq!(pipeline.metrics.failed("system:health_check"), 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_concurrency_ceiling_holds() {
    let mut config = WorkerConfig::testing();
    config.concurrency = 3;

    let finished = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register("test:slow", {
        let finished = Arc::clone(&finished);
        handler_fn(move |_task| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    });

    let pipeline = Pipeline::start(config, handlers, RateLimiter::unlimited()).await;

    let enqueues = (0..12).map(|_| {
        let task = Task::new("test:slow", b"{}".to_vec());
        let client = &pipeline.client;
        async move { client.enqueue(&task).await.unwrap() }
    });
    let infos = futures::future::join_all(enqueues).await;

    for info in &infos {
        pipeline.wait_for(info, TaskState::Completed).await;
    }

    assert_eq!(finished.load(Ordering::SeqCst), 12);
    assert!(pipeline.metrics.in_progress_peak() <= 3);
    assert!(pipeline.metrics.in_progress_peak() >= 1);
    assert_eq!(pipeline.metrics.in_progress_total(), 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_failures_retry_until_budget_is_spent() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register("test:flaky", {
        let attempts = Arc::clone(&attempts);
        handler_fn(move |_task| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RelayError::handler("smtp: 421 service not available"))
            }
        })
    });

    let pipeline = Pipeline::start(WorkerConfig::testing(), handlers, RateLimiter::unlimited()).await;

    let task = Task::new("test:flaky", b"{}".to_vec())
        .with_options(TaskOptions::default().max_retry(2));
    let info = pipeline.client.enqueue(&task).await.unwrap();

    let archived = pipeline.wait_for(&info, TaskState::Archived).await;
    assert_eq!(archived.attempt_count(), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(archived.last_error.unwrap().contains("421"));
    assert_eq!(pipeline.metrics.failed("test:flaky"), 3);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_empty_registry_leaves_tasks_pending() {
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        HandlerRegistry::new(),
        RateLimiter::unlimited(),
    )
    .await;

    let info = pipeline
        .client
        .enqueue(&new_health_check_task().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let current = pipeline
        .client
        .get_task_info(info.queue, &info.id)
        .await
        .unwrap();
    assert_eq!(current.state, TaskState::Pending);

    pipeline.stop().await;
}

#[tokio::test]
async fn test_scheduler_feeds_worker() {
    let sender = Arc::new(RecordingSender::default());
    let pipeline = Pipeline::start(
        WorkerConfig::testing(),
        system_registry(Arc::clone(&sender), clock()),
        RateLimiter::unlimited(),
    )
    .await;

    let scheduler = Arc::new(
        Scheduler::with_broker(
            SchedulerConfig::default(),
            Arc::clone(&pipeline.broker) as SharedBroker,
        )
        .unwrap(),
    );
    scheduler
        .with_scheduler_task("@every 100ms", Some(new_health_check_task().unwrap()))
        .unwrap();

    let running = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move { scheduler.start().await }
    });
    tokio::time::sleep(Duration::from_millis(550)).await;
    scheduler.shutdown().await;
    running.await.unwrap().unwrap();

    let seen = pipeline
        .broker
        .snapshot()
        .await
        .into_iter()
        .filter(|info| info.task_type == "system:health_check")
        .count();
    assert!((4..=6).contains(&seen), "saw {} health checks", seen);

    pipeline.stop().await;
}

#[test]
fn test_rate_limiter_first_writer_wins() {
    let first = set_rate_limiter(0.0, 0);
    let second = set_rate_limiter(3.0, 2);

    assert!(Arc::ptr_eq(&first, &second));
    let installed = rate_limiter().unwrap();
    assert_eq!(installed.limit(), 0.0);
    assert_eq!(installed.burst(), 0);
    assert!(installed.is_unlimited());
}
