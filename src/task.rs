//! Task envelope, broker message and task record.
//!
//! A [`Task`] is what callers build and hand to the client: a type name, an
//! opaque payload and delivery options. On enqueue it becomes an immutable
//! [`TaskMessage`] with an ID, and the broker tracks it as a [`TaskInfo`].

use crate::error::{RelayError, RelayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unique identifier for a task
pub type TaskId = String;

/// Default deadline for a single attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default inspection window after a task reaches a terminal state.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Task types shipped with the crate.
///
/// Handlers are registered by name, so other types can be added without
/// touching this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Broker round-trip probe
    #[serde(rename = "system:health_check")]
    HealthCheck,
    /// Licence expiry notification
    #[serde(rename = "system:license_expiry")]
    LicenseExpiry,
}

impl TaskType {
    /// Wire name of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheck => "system:health_check",
            Self::LicenseExpiry => "system:license_expiry",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TaskType> for String {
    fn from(task_type: TaskType) -> Self {
        task_type.as_str().to_string()
    }
}

/// Priority bucket a task is delivered through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Queue {
    /// Served first (weight 6)
    High,
    /// Default bucket (weight 3)
    #[default]
    Default,
    /// Background work (weight 1)
    Low,
}

impl Queue {
    /// All queues, highest priority first.
    pub const ALL: [Queue; 3] = [Queue::High, Queue::Default, Queue::Low];

    /// Queue name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Default => "default",
            Self::Low => "low",
        }
    }

    /// Relative share of leases in weighted mode.
    pub fn weight(&self) -> u32 {
        match self {
            Self::High => 6,
            Self::Default => 3,
            Self::Low => 1,
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Queue {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "default" => Ok(Self::Default),
            "low" => Ok(Self::Low),
            other => Err(RelayError::config(format!("Unknown queue '{}'", other))),
        }
    }
}

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in its queue
    Pending,
    /// Leased by a worker
    Active,
    /// Failed, waiting for its retry delay
    Retry,
    /// Waiting for its process-at time
    Scheduled,
    /// Failed permanently
    Archived,
    /// Finished successfully
    Completed,
}

impl TaskState {
    /// Completed and archived records only wait for retention to expire.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Archived)
    }

    /// State name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Retry => "retry",
            Self::Scheduled => "scheduled",
            Self::Archived => "archived",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "retry" => Ok(Self::Retry),
            "scheduled" => Ok(Self::Scheduled),
            "archived" => Ok(Self::Archived),
            "completed" => Ok(Self::Completed),
            other => Err(RelayError::broker_msg(format!(
                "Unknown task state '{}'",
                other
            ))),
        }
    }
}

/// Delivery options attached to an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    /// Deadline for a single attempt
    pub timeout: Duration,
    /// How long a terminal record stays inspectable
    pub retention: Duration,
    /// Priority bucket
    pub queue: Queue,
    /// Retry budget; `None` uses the worker's default policy
    pub max_retry: Option<u32>,
    /// Hold the task until this instant
    pub process_at: Option<DateTime<Utc>>,
    /// Caller-chosen ID; a random UUID otherwise
    pub task_id: Option<TaskId>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retention: DEFAULT_RETENTION,
            queue: Queue::Default,
            max_retry: None,
            process_at: None,
            task_id: None,
        }
    }
}

impl TaskOptions {
    /// Set the attempt deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retention window.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the priority bucket.
    pub fn queue(mut self, queue: Queue) -> Self {
        self.queue = queue;
        self
    }

    /// Set the retry budget.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    /// Delay the task until `at`.
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Delay the task by `delay` from now.
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_at = Some(add_duration(Utc::now(), delay));
        self
    }

    /// Use a fixed task ID.
    pub fn task_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = Some(id.into());
        self
    }
}

/// Envelope handed to the client or scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
    options: TaskOptions,
}

impl Task {
    /// Create an envelope with default options.
    pub fn new(task_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            options: TaskOptions::default(),
        }
    }

    /// Create an envelope whose payload is `value` encoded as JSON.
    pub fn json<T: Serialize>(task_type: impl Into<String>, value: &T) -> RelayResult<Self> {
        let payload = serde_json::to_vec(value).map_err(RelayError::PayloadMarshal)?;
        Ok(Self::new(task_type, payload))
    }

    /// Replace the delivery options.
    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Task type name.
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Delivery options.
    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    /// Decode the payload as JSON.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> RelayResult<T> {
        serde_json::from_slice(&self.payload).map_err(RelayError::PayloadUnmarshal)
    }

    /// Freeze the envelope into a broker message.
    pub fn to_message(&self) -> TaskMessage {
        TaskMessage {
            id: self
                .options
                .task_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            queue: self.options.queue,
            max_retry: self.options.max_retry,
            timeout_ms: duration_ms(self.options.timeout),
            retention_ms: duration_ms(self.options.retention),
            enqueued_at: Utc::now(),
        }
    }
}

/// Immutable message stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Unique task identifier
    pub id: TaskId,
    /// Task type name
    pub task_type: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Priority bucket
    pub queue: Queue,
    /// Retry budget; `None` uses the worker's default policy
    pub max_retry: Option<u32>,
    /// Attempt deadline (in milliseconds)
    pub timeout_ms: u64,
    /// Retention window (in milliseconds)
    pub retention_ms: u64,
    /// When the client handed the task over
    pub enqueued_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Rebuild the envelope handlers see.
    pub fn to_task(&self) -> Task {
        Task {
            task_type: self.task_type.clone(),
            payload: self.payload.clone(),
            options: TaskOptions {
                timeout: self.timeout(),
                retention: self.retention(),
                queue: self.queue,
                max_retry: self.max_retry,
                process_at: None,
                task_id: Some(self.id.clone()),
            },
        }
    }

    /// Attempt deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retention window.
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Task record as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Unique task identifier
    pub id: TaskId,
    /// Priority bucket
    pub queue: Queue,
    /// Task type name
    pub task_type: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Current state
    pub state: TaskState,
    /// Retry budget, if the envelope set one
    pub max_retry: Option<u32>,
    /// Charged attempts so far
    pub retried: u32,
    /// Text of the last recorded failure
    pub last_error: Option<String>,
    /// When the last charged failure happened
    pub last_failed_at: Option<DateTime<Utc>>,
    /// When the task completed
    pub completed_at: Option<DateTime<Utc>>,
    /// When a scheduled or retrying task becomes pending again
    pub next_process_at: Option<DateTime<Utc>>,
    /// When the record may be deleted
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Fresh record for a message entering `state`.
    pub fn new(message: &TaskMessage, state: TaskState) -> Self {
        Self {
            id: message.id.clone(),
            queue: message.queue,
            task_type: message.task_type.clone(),
            payload: message.payload.clone(),
            state,
            max_retry: message.max_retry,
            retried: 0,
            last_error: None,
            last_failed_at: None,
            completed_at: None,
            next_process_at: None,
            expires_at: None,
        }
    }

    /// Alias used in the task record vocabulary.
    pub fn attempt_count(&self) -> u32 {
        self.retried
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Add a std duration to a UTC instant, saturating at the maximum.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
