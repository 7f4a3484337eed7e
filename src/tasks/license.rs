//! Licence-expiry handler and its e-mail collaborator.

use super::LicenseExpiryPayload;
use crate::error::{BoxError, RelayError, RelayResult};
use crate::middleware::{TaskContext, TaskHandler};
use crate::task::Task;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// How far ahead of expiry the notification fires.
pub const NOTICE_WINDOW_DAYS: i64 = 7;

/// Sends the licence-expiry notification.
///
/// Implemented by the host's mailer; template rendering and SMTP belong there.
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Notify `email` that licence `license_id` of `organization` expires at `expires_at`.
    async fn send_system_license_expiry(
        &self,
        ctx: &TaskContext,
        license_id: &str,
        email: &str,
        organization: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), BoxError>;
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// E-mails the licence holder once expiry is within seven days.
///
/// Licences expiring strictly after `now + 7 days` are left alone. Anything
/// at or before that cut-off, including licences already expired, triggers the
/// e-mail. Mailer errors are returned as-is so the attempt is retried.
#[derive(Clone)]
pub struct LicenseExpiryHandler {
    email: Arc<dyn EmailSender>,
    clock: Clock,
}

impl std::fmt::Debug for LicenseExpiryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LicenseExpiryHandler").finish_non_exhaustive()
    }
}

impl LicenseExpiryHandler {
    /// Create the handler. Fails with `NoEmailService` without a sender.
    pub fn new(email: Option<Arc<dyn EmailSender>>) -> RelayResult<Self> {
        let email = email.ok_or(RelayError::NoEmailService)?;
        Ok(Self {
            email,
            clock: Arc::new(Utc::now),
        })
    }

    /// Replace the wall clock the cut-off is computed from.
    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }
}

#[async_trait]
impl TaskHandler for LicenseExpiryHandler {
    async fn process(&self, ctx: &TaskContext, task: &Task) -> RelayResult<()> {
        let payload: LicenseExpiryPayload = task.decode().map_err(|e| e.skip_retry())?;

        let cutoff = (self.clock)() + chrono::Duration::days(NOTICE_WINDOW_DAYS);
        if payload.expires_at > cutoff {
            tracing::debug!(
                license_id = %payload.license_id,
                expires_at = %payload.expires_at,
                "Licence not due for notification"
            );
            return Ok(());
        }

        self.email
            .send_system_license_expiry(
                ctx,
                &payload.license_id,
                &payload.email,
                &payload.organization,
                payload.expires_at,
            )
            .await
            .map_err(RelayError::Email)?;

        tracing::info!(
            license_id = %payload.license_id,
            expires_at = %payload.expires_at,
            "Licence expiry notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tasks::{License, new_license_expiry_task};
    use chrono::TimeZone;
    use std::sync::Mutex;

    type Sent = (String, String, String, DateTime<Utc>);

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<Sent>>,
        fail: bool,
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
            if self.fail {
                return Err("smtp: 421 service not available".into());
            }
            self.sent.lock().unwrap().push((
                license_id.to_string(),
                email.to_string(),
                organization.to_string(),
                expires_at,
            ));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap()
    }

    fn task_expiring_at(expires_at: DateTime<Utc>) -> Task {
        new_license_expiry_task(Some(&License {
            id: "bvn6c05roa2mnak37ms0".to_string(),
            email: "info@example.com".to_string(),
            organization: "ACME Inc.".to_string(),
            expires_at,
        }))
        .unwrap()
    }

    fn handler(sender: Arc<RecordingSender>) -> LicenseExpiryHandler {
        LicenseExpiryHandler::new(Some(sender as Arc<dyn EmailSender>))
            .unwrap()
            .with_clock(now)
    }

    async fn run(handler: &LicenseExpiryHandler, task: &Task) -> RelayResult<()> {
        handler.process(&TaskContext::background("lic"), task).await
    }

    #[test]
    fn test_requires_email_sender() {
        assert!(matches!(
            LicenseExpiryHandler::new(None).unwrap_err(),
            RelayError::NoEmailService
        ));
    }

    #[tokio::test]
    async fn test_due_soon_sends_once() {
        let sender = Arc::new(RecordingSender::default());
        let expires_at = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();

        run(&handler(Arc::clone(&sender)), &task_expiring_at(expires_at))
            .await
            .unwrap();

        let sent = sender.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![(
                "bvn6c05roa2mnak37ms0".to_string(),
                "info@example.com".to_string(),
                "ACME Inc.".to_string(),
                expires_at
            )]
        );
    }

    #[tokio::test]
    async fn test_far_future_sends_nothing() {
        let sender = Arc::new(RecordingSender::default());
        let expires_at = Utc.with_ymd_and_hms(2099, 12, 31, 0, 0, 0).unwrap();

        run(&handler(Arc::clone(&sender)), &task_expiring_at(expires_at))
            .await
            .unwrap();

        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cutoff_is_inclusive() {
        let sender = Arc::new(RecordingSender::default());
        let handler = handler(Arc::clone(&sender));

        let at_cutoff = now() + chrono::Duration::days(7);
        run(&handler, &task_expiring_at(at_cutoff)).await.unwrap();
        assert_eq!(sender.sent.lock().unwrap().len(), 1);

        let past_cutoff = at_cutoff + chrono::Duration::seconds(1);
        run(&handler, &task_expiring_at(past_cutoff)).await.unwrap();
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_licence_still_notifies() {
        let sender = Arc::new(RecordingSender::default());
        let expired = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();

        run(&handler(Arc::clone(&sender)), &task_expiring_at(expired))
            .await
            .unwrap();

        assert_eq!(sender.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_skips_retry() {
        let sender = Arc::new(RecordingSender::default());
        let task = Task::new("system:license_expiry", b"{\"LicenseID\"".to_vec());

        let err = run(&handler(Arc::clone(&sender)), &task).await.unwrap_err();

        assert!(err.is(ErrorKind::PayloadUnmarshal));
        assert!(err.is_skip_retry());
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mailer_error_is_retryable() {
        let sender = Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        });
        let task = task_expiring_at(now());

        let err = run(&handler(sender), &task).await.unwrap_err();

        assert!(err.is(ErrorKind::Email));
        assert!(!err.is_skip_retry());
        assert!(err.to_string().contains("421"));
    }
}
