use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Group and stream a destination appends to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogTarget {
    pub group: String,
    pub stream: String,
}

/// One event in a `put_events` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputLogEvent {
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The sink expects a different continuity token.
    #[error("invalid sequence token, expected {expected:?}")]
    InvalidSequenceToken { expected: Option<String> },

    /// The batch was already stored by an earlier submission.
    #[error("data already accepted")]
    DataAlreadyAccepted { next_token: Option<String> },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource already exists: {0}")]
    ResourceAlreadyExists(String),

    /// Retrying will not help (bad parameters, rejected credentials).
    #[error("sink misconfigured: {0}")]
    Misconfigured(String),

    #[error("transient sink error: {0}")]
    Transient(String),
}

/// Client surface of the remote append-only log service.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Names of groups starting with `prefix`.
    async fn describe_groups(&self, prefix: &str) -> Result<Vec<String>, SinkError>;

    async fn create_group(&self, group: &str) -> Result<(), SinkError>;

    async fn put_retention_policy(&self, group: &str, days: u32) -> Result<(), SinkError>;

    /// Names of streams in `group` starting with `prefix`.
    async fn describe_streams(&self, group: &str, prefix: &str) -> Result<Vec<String>, SinkError>;

    async fn create_stream(&self, group: &str, stream: &str) -> Result<(), SinkError>;

    /// Append events, returning the token for the next call.
    async fn put_events(
        &self,
        target: &LogTarget,
        events: &[InputLogEvent],
        token: Option<&str>,
    ) -> Result<Option<String>, SinkError>;
}
