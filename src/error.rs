//! Error types for the task pipeline.
//!
//! Errors compose: wrapping variants keep their cause in `#[source]`, so one
//! error can carry both a domain kind (for example [`ErrorKind::PayloadUnmarshal`])
//! and the [`ErrorKind::SkipRetry`] control bit. Use [`RelayError::is`] to ask
//! whether any layer of the chain has a given kind.

use std::error::Error as StdError;
use thiserror::Error;

/// Result type used throughout taskrelay.
pub type RelayResult<T> = Result<T, RelayError>;

/// Boxed error used for collaborator failures.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Main error type for taskrelay operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A required configuration block is missing or empty
    #[error("Configuration is required")]
    NoConfig,

    /// The process-wide rate limiter has not been installed
    #[error("Rate limiter is not installed")]
    NoRateLimiter,

    /// No handler registry was supplied to the worker
    #[error("Task handlers are required")]
    NoTaskHandler,

    /// The licence-expiry handler was built without an e-mail sender
    #[error("Email service is required")]
    NoEmailService,

    /// An empty schedule expression was registered
    #[error("Schedule expression is required")]
    NoSchedule,

    /// A scheduler entry was registered without a task
    #[error("Task is required")]
    NoTask,

    /// A licence-expiry task was requested without a licence
    #[error("License is required")]
    NoLicense,

    /// The configured log level is not one of debug, info, warn, error
    #[error("Invalid log level '{level}'")]
    InvalidLogLevel {
        /// The rejected value
        level: String,
    },

    /// A schedule expression could not be parsed
    #[error("Invalid schedule '{expression}': {message}")]
    InvalidSchedule {
        /// The rejected expression
        expression: String,
        /// Parser message
        message: String,
    },

    /// Configuration failed validation
    #[error("Configuration error: {message}")]
    Config {
        /// Joined validation messages
        message: String,
    },

    /// The broker refused or failed to accept a task
    #[error("Failed to send task: {0}")]
    SendTask(#[source] Box<RelayError>),

    /// A pinged task did not complete cleanly
    #[error("Failed to receive task: {message}")]
    ReceiveTask {
        /// Last error recorded on the task
        message: String,
    },

    /// A task payload could not be decoded
    #[error("Failed to unmarshal payload: {0}")]
    PayloadUnmarshal(#[source] serde_json::Error),

    /// A task payload could not be encoded
    #[error("Failed to marshal payload: {0}")]
    PayloadMarshal(#[source] serde_json::Error),

    /// The rate-limit middleware denied the attempt
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Marks the wrapped error as non-retryable
    #[error("{0} (skip retry)")]
    SkipRetry(#[source] Box<RelayError>),

    /// No handler is registered for a leased task type
    #[error("No handler registered for task type '{task_type}'")]
    HandlerNotFound {
        /// The unknown task type
        task_type: String,
    },

    /// A single attempt exceeded its deadline
    #[error("Task attempt timed out after {timeout_secs} seconds")]
    Timeout {
        /// Timeout duration in seconds
        timeout_secs: u64,
    },

    /// The operation was cancelled before it finished
    #[error("Operation cancelled")]
    Canceled,

    /// A handler panicked while processing a task
    #[error("Task handler panicked: {message}")]
    Panic {
        /// Panic payload rendered as text
        message: String,
    },

    /// The e-mail collaborator failed
    #[error(transparent)]
    Email(BoxError),

    /// A handler failed for a reason of its own
    #[error("Task execution failed: {message}")]
    Handler {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// Broker backend error
    #[error("Broker error: {message}")]
    Broker {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// No record exists for the given queue and ID
    #[error("Task '{id}' not found in queue '{queue}'")]
    TaskNotFound {
        /// Queue that was searched
        queue: String,
        /// Task identifier
        id: String,
    },

    /// The component is already running
    #[error("Already running")]
    AlreadyRunning,

    /// The client has been closed
    #[error("Client is closed")]
    ClientClosed,

    /// Prometheus registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error (metrics listener)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis connection error
    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Discriminant of a [`RelayError`], used with [`RelayError::is`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoConfig,
    NoRateLimiter,
    NoTaskHandler,
    NoEmailService,
    NoSchedule,
    NoTask,
    NoLicense,
    InvalidLogLevel,
    InvalidSchedule,
    Config,
    SendTask,
    ReceiveTask,
    PayloadUnmarshal,
    PayloadMarshal,
    RateLimitExceeded,
    SkipRetry,
    HandlerNotFound,
    Timeout,
    Canceled,
    Panic,
    Email,
    Handler,
    Broker,
    TaskNotFound,
    AlreadyRunning,
    ClientClosed,
    Metrics,
    Io,
    #[cfg(feature = "redis-broker")]
    Redis,
}

impl RelayError {
    /// Kind of the outermost layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoConfig => ErrorKind::NoConfig,
            Self::NoRateLimiter => ErrorKind::NoRateLimiter,
            Self::NoTaskHandler => ErrorKind::NoTaskHandler,
            Self::NoEmailService => ErrorKind::NoEmailService,
            Self::NoSchedule => ErrorKind::NoSchedule,
            Self::NoTask => ErrorKind::NoTask,
            Self::NoLicense => ErrorKind::NoLicense,
            Self::InvalidLogLevel { .. } => ErrorKind::InvalidLogLevel,
            Self::InvalidSchedule { .. } => ErrorKind::InvalidSchedule,
            Self::Config { .. } => ErrorKind::Config,
            Self::SendTask(_) => ErrorKind::SendTask,
            Self::ReceiveTask { .. } => ErrorKind::ReceiveTask,
            Self::PayloadUnmarshal(_) => ErrorKind::PayloadUnmarshal,
            Self::PayloadMarshal(_) => ErrorKind::PayloadMarshal,
            Self::RateLimitExceeded => ErrorKind::RateLimitExceeded,
            Self::SkipRetry(_) => ErrorKind::SkipRetry,
            Self::HandlerNotFound { .. } => ErrorKind::HandlerNotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Canceled => ErrorKind::Canceled,
            Self::Panic { .. } => ErrorKind::Panic,
            Self::Email(_) => ErrorKind::Email,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Broker { .. } => ErrorKind::Broker,
            Self::TaskNotFound { .. } => ErrorKind::TaskNotFound,
            Self::AlreadyRunning => ErrorKind::AlreadyRunning,
            Self::ClientClosed => ErrorKind::ClientClosed,
            Self::Metrics(_) => ErrorKind::Metrics,
            Self::Io(_) => ErrorKind::Io,
            #[cfg(feature = "redis-broker")]
            Self::Redis(_) => ErrorKind::Redis,
        }
    }

    /// Returns true if any error in the source chain has the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if as_relay(err).is_some_and(|relay| relay.kind() == kind) {
                return true;
            }
            current = err.source();
        }
        false
    }

    /// True when the chain carries the skip-retry marker.
    pub fn is_skip_retry(&self) -> bool {
        self.is(ErrorKind::SkipRetry)
    }

    /// True when the chain carries a rate-limit denial.
    pub fn is_rate_limited(&self) -> bool {
        self.is(ErrorKind::RateLimitExceeded)
    }

    /// Wrap this error so the worker archives the task instead of retrying it.
    pub fn skip_retry(self) -> Self {
        Self::SkipRetry(Box::new(self))
    }

    /// Wrap a broker failure raised while enqueueing.
    pub fn send_task(cause: RelayError) -> Self {
        Self::SendTask(Box::new(cause))
    }

    /// Create a broker error with an underlying cause.
    pub fn broker<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Broker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a broker error without a cause.
    pub fn broker_msg(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler failure without a cause.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

// `#[source] Box<RelayError>` surfaces as the box itself, so check both shapes.
fn as_relay<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a RelayError> {
    err.downcast_ref::<RelayError>()
        .or_else(|| err.downcast_ref::<Box<RelayError>>().map(|boxed| boxed.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unmarshal_error() -> RelayError {
        let err = serde_json::from_str::<serde_json::Value>("{\"LicenseID\"").unwrap_err();
        RelayError::PayloadUnmarshal(err)
    }

    #[test]
    fn test_chain_carries_both_kinds() {
        let err = unmarshal_error().skip_retry();

        assert_eq!(err.kind(), ErrorKind::SkipRetry);
        assert!(err.is(ErrorKind::SkipRetry));
        assert!(err.is(ErrorKind::PayloadUnmarshal));
        assert!(!err.is(ErrorKind::RateLimitExceeded));
    }

    #[test]
    fn test_send_task_wraps_broker_error() {
        let err = RelayError::send_task(RelayError::broker_msg("connection refused"));

        assert!(err.is(ErrorKind::SendTask));
        assert!(err.is(ErrorKind::Broker));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_rate_limit_predicate() {
        assert!(RelayError::RateLimitExceeded.is_rate_limited());
        assert!(!RelayError::RateLimitExceeded.is_skip_retry());
        assert!(!RelayError::handler("boom").is_rate_limited());
    }

    #[test]
    fn test_email_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "smtp reset");
        let err = RelayError::Email(Box::new(io));

        assert_eq!(err.to_string(), "smtp reset");
        assert!(err.is(ErrorKind::Email));
        assert!(!err.is_skip_retry());
    }
}
