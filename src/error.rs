//! Error taxonomy for the worker runtime
//!
//! Connection-level failures are fatal and surfaced to the caller. Per-message
//! failures (protocol, missing handler, task execution) are isolated to the
//! message that produced them and end up in the failure sink.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for worker runtime operations
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Channel error: {0}")]
    Channel(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Handler is already registered for task '{name}'")]
    DuplicateHandler { name: String },

    #[error("Invalid handler registration: {message}")]
    InvalidHandler { message: String },

    #[error("Handler registration is closed once the executor has started")]
    RegistrationClosed,

    #[error("Missing process handler for task '{name}'")]
    MissingHandler { name: String },

    #[error("Task execution failed: {0}")]
    TaskExecution(#[from] TaskError),

    #[error("{operation} is not implemented")]
    NotImplemented { operation: &'static str },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl WorkerError {
    /// Create fatal connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create invalid handler error
    pub fn invalid_handler<S: Into<String>>(message: S) -> Self {
        Self::InvalidHandler {
            message: message.into(),
        }
    }

    /// Whether the error leaves the broker connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Connection { .. })
    }
}

/// Failures raised by a broker driver
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Topology assertion failed for '{name}': {reason}")]
    Topology { name: String, reason: String },
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Acknowledgement failed: {0}")]
    AckFailed(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Not connected - current state: {state}")]
    NotConnected { state: String },
}

/// Wire-format violations found while validating or decoding a delivery
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("unsupported content type {0}")]
    UnsupportedContentType(String),
    #[error("unsupported content encoding {0}")]
    UnsupportedContentEncoding(String),
    #[error("message body is not valid JSON: {0}")]
    InvalidBody(String),
    #[error("malformed task headers: {0}")]
    InvalidHeaders(String),
    #[error("message carries no task name")]
    MissingTaskName,
}

/// Failure returned by a task handler
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("{message}")]
    Failed { message: String },
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },
    #[error("handler panicked: {message}")]
    Panicked { message: String },
}

impl TaskError {
    /// Create a generic handler failure
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Create an argument validation failure
    pub fn invalid_arguments<S: Into<String>>(message: S) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::invalid_arguments(err.to_string())
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static URL_CREDENTIALS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)([a-z][a-z0-9+.-]*://)[^/@\s:]+:[^/@\s]+@").ok());

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and cap length before an error leaves the process in logs or reports
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = SECRET_PATTERN.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = URL_CREDENTIALS.as_ref() {
        sanitized = re.replace_all(&sanitized, "${1}***@").to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
