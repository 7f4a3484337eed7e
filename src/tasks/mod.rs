//! Built-in system tasks.
//!
//! Two task types ship with the crate:
//! - `system:health_check`: a probe the client uses to check the pipeline end to end
//! - `system:license_expiry`: e-mails the licence holder when expiry is near
//!
//! Each has a payload type, an envelope constructor and a handler.

use crate::core::registry::HandlerRegistry;
use crate::error::{RelayError, RelayResult};
use crate::task::{Queue, Task, TaskOptions, TaskType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod health;
pub mod license;

pub use health::HealthCheckHandler;
pub use license::{EmailSender, LicenseExpiryHandler};

/// Message carried by every health-check envelope.
pub const HEALTHY_MESSAGE: &str = "healthy";

/// Payload of `system:health_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckPayload {
    /// Informational text
    pub message: String,
}

/// Licence fields the expiry notification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    /// Licence identifier
    pub id: String,
    /// Contact address of the licence holder
    pub email: String,
    /// Licensed organisation
    pub organization: String,
    /// End of validity
    pub expires_at: DateTime<Utc>,
}

/// Payload of `system:license_expiry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseExpiryPayload {
    /// Licence identifier
    #[serde(rename = "LicenseID")]
    pub license_id: String,
    /// Contact address of the licence holder
    #[serde(rename = "LicenseEmail")]
    pub email: String,
    /// Licensed organisation
    #[serde(rename = "LicenseOrganization")]
    pub organization: String,
    /// End of validity, RFC 3339 with second precision on the wire
    #[serde(rename = "LicenseExpiresAt", with = "rfc3339_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl From<&License> for LicenseExpiryPayload {
    fn from(license: &License) -> Self {
        Self {
            license_id: license.id.clone(),
            email: license.email.clone(),
            organization: license.organization.clone(),
            expires_at: license.expires_at,
        }
    }
}

mod rfc3339_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

/// Health-check envelope with the default options.
pub fn new_health_check_task() -> RelayResult<Task> {
    Task::json(
        TaskType::HealthCheck,
        &HealthCheckPayload {
            message: HEALTHY_MESSAGE.to_string(),
        },
    )
}

/// Licence-expiry envelope on the high queue with a five second timeout.
pub fn new_license_expiry_task(license: Option<&License>) -> RelayResult<Task> {
    let license = license.ok_or(RelayError::NoLicense)?;
    let task = Task::json(TaskType::LicenseExpiry, &LicenseExpiryPayload::from(license))?;
    Ok(task.with_options(
        TaskOptions::default()
            .timeout(Duration::from_secs(5))
            .queue(Queue::High),
    ))
}

/// Registry with both system handlers.
pub fn system_handlers(email: Option<Arc<dyn EmailSender>>) -> RelayResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(TaskType::HealthCheck, HealthCheckHandler);
    registry.register(TaskType::LicenseExpiry, LicenseExpiryHandler::new(email)?);
    Ok(registry)
}
