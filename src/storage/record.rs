use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes the remote sink charges per event on top of the message itself.
pub const EXTRA_MSG_PAYLOAD_SIZE: usize = 26;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("message is empty")]
    Empty,

    #[error("message is not valid UTF-8: {0}")]
    NotEncodable(String),

    #[error("max message size {max} leaves no room for the {overhead} byte event overhead")]
    MaxSizeTooSmall { max: usize, overhead: usize },
}

/// A log line accepted from a producer but not yet written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLog {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Message bytes plus [`EXTRA_MSG_PAYLOAD_SIZE`].
    pub size: i64,
}

impl PendingLog {
    /// Build a pending log, cutting the message so that message bytes plus the
    /// per-event overhead never exceed `max_message_bytes`.
    pub fn new(
        message: &str,
        timestamp: DateTime<Utc>,
        max_message_bytes: usize,
    ) -> Result<Self, RecordError> {
        if message.is_empty() {
            return Err(RecordError::Empty);
        }
        if max_message_bytes <= EXTRA_MSG_PAYLOAD_SIZE {
            return Err(RecordError::MaxSizeTooSmall {
                max: max_message_bytes,
                overhead: EXTRA_MSG_PAYLOAD_SIZE,
            });
        }

        let message = if message.len() + EXTRA_MSG_PAYLOAD_SIZE > max_message_bytes {
            truncate_to_char_boundary(message, max_message_bytes - EXTRA_MSG_PAYLOAD_SIZE)
        } else {
            message
        };

        Ok(Self {
            message: message.to_string(),
            timestamp,
            size: (message.len() + EXTRA_MSG_PAYLOAD_SIZE) as i64,
        })
    }

    /// Same as [`PendingLog::new`] for raw producer bytes.
    pub fn from_bytes(
        bytes: &[u8],
        timestamp: DateTime<Utc>,
        max_message_bytes: usize,
    ) -> Result<Self, RecordError> {
        let message =
            std::str::from_utf8(bytes).map_err(|e| RecordError::NotEncodable(e.to_string()))?;
        Self::new(message, timestamp, max_message_bytes)
    }
}

fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// A row of the `log` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    /// 0 while pending, otherwise the id of the batch that claimed the row.
    pub batch_id: i64,
}

/// Result of a durable insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedLog {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}
