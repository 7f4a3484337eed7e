//! Health-check handler.

use super::HealthCheckPayload;
use crate::error::RelayResult;
use crate::middleware::{TaskContext, TaskHandler};
use crate::task::Task;
use async_trait::async_trait;

/// Accepts any health-check envelope whose payload decodes.
///
/// A payload that does not decode will never decode, so the error is marked
/// skip-retry and the task is archived on its first attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCheckHandler;

#[async_trait]
impl TaskHandler for HealthCheckHandler {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        let payload: HealthCheckPayload = task.decode().map_err(|e| e.skip_retry())?;
        tracing::debug!(task_id = %ctx.task_id(), message = %payload.message, "Health check received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tasks::new_health_check_task;

    #[tokio::test]
    async fn test_decodable_payload_succeeds_repeatedly() {
        let task = new_health_check_task().unwrap();
        let ctx = TaskContext::background("hc");
        for _ in 0..3 {
            tokio_test::assert_ok!(HealthCheckHandler.process(&ctx, &task).await);
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_skips_retry() {
        let task = Task::new("system:health_check", b"{\"message\"".to_vec());
        let err = HealthCheckHandler
            .process(&TaskContext::background("hc"), &task)
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::PayloadUnmarshal));
        assert!(err.is_skip_retry());
    }
}
