use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use taskrelay::error::BoxError;
use taskrelay::prelude::*;
use taskrelay::telemetry::init_tracing;
use tokio::signal;

/// Mailer that only logs what it would send.
struct LogMailer;

#[async_trait]
impl EmailSender for LogMailer {
    async fn send_system_license_expiry(
        &self,
        _ctx: &TaskContext,
        license_id: &str,
        email: &str,
        organization: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BoxError> {
        tracing::info!(license_id, email, organization, %expires_at, "Would send licence expiry e-mail");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    init_tracing(&LoggingConfig::default())?;

    // No admission limit
    set_rate_limiter(0.0, 0);

    let mailer: Arc<dyn EmailSender> = Arc::new(LogMailer);
    let handlers = taskrelay::tasks::system_handlers(Some(mailer))?;

    let worker = Arc::new(Worker::new(WorkerConfig::development(), Some(handlers)).await?);
    let running = Arc::clone(&worker);
    let worker_task = tokio::spawn(async move { running.start().await });

    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()).await?);
    scheduler.with_scheduler_task("@every 10s", Some(taskrelay::tasks::new_health_check_task()?))?;
    let running = Arc::clone(&scheduler);
    let scheduler_task = tokio::spawn(async move { running.start().await });

    let client = Client::new(ClientConfig::default()).await?;
    client.ping_timeout(Duration::from_secs(5)).await?;
    tracing::info!("Pipeline is healthy");

    let license = License {
        id: "bvn6c05roa2mnak37ms0".to_string(),
        email: "info@example.com".to_string(),
        organization: "ACME Inc.".to_string(),
        expires_at: Utc::now() + chrono::Duration::days(3),
    };
    let info = client
        .enqueue(&taskrelay::tasks::new_license_expiry_task(Some(&license))?)
        .await?;
    tracing::info!(task_id = %info.id, queue = %info.queue, "Enqueued licence check");

    println!("Worker is running. Press Ctrl+C to stop...");
    signal::ctrl_c().await?;

    scheduler.shutdown().await;
    worker.shutdown().await;
    client.close().await?;

    for handle in [worker_task, scheduler_task] {
        if let Ok(Err(e)) = handle.await {
            tracing::error!(error = %e, "Component stopped with an error");
        }
    }

    println!("Worker stopped");
    Ok(())
}
