use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Smallest send interval the batching engine accepts, in seconds.
pub const MIN_SEND_INTERVAL_SECONDS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote log services to ship records to, keyed by destination name.
    #[serde(default)]
    pub destinations: HashMap<String, LogDestinationConfig>,
    /// Rotating files whose archives are uploaded to blob storage.
    #[serde(default)]
    pub archives: HashMap<String, ArchiveConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDestinationConfig {
    pub endpoint: String,
    pub group: String,
    /// Defaults to the host name.
    #[serde(default)]
    pub stream: Option<String>,
    pub store_path: PathBuf,
    #[serde(default = "default_send_interval_seconds")]
    pub send_interval_seconds: u64,
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: i64,
    #[serde(default = "default_max_batch_count")]
    pub max_batch_count: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default)]
    pub retention_days: RetentionDays,
    #[serde(default = "default_true")]
    pub create_group_if_missing: bool,
    #[serde(default = "default_true")]
    pub create_stream_if_missing: bool,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl LogDestinationConfig {
    /// Send interval with the lower bound applied.
    pub fn effective_send_interval_seconds(&self) -> u64 {
        self.send_interval_seconds.max(MIN_SEND_INTERVAL_SECONDS)
    }

    pub fn stream_name(&self) -> String {
        match &self.stream {
            Some(stream) if !stream.is_empty() => stream.clone(),
            _ => default_stream_name(),
        }
    }
}

pub fn default_stream_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_send_interval_seconds() -> u64 {
    60
}

fn default_max_batch_size_bytes() -> i64 {
    1024 * 1024
}

fn default_max_batch_count() -> usize {
    10_000
}

fn default_max_message_bytes() -> usize {
    262_114
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// Retention periods the remote log service accepts.
pub const RETENTION_DAYS: [u32; 22] = [
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct RetentionDays(u32);

impl RetentionDays {
    pub fn days(self) -> u32 {
        self.0
    }
}

impl Default for RetentionDays {
    fn default() -> Self {
        RetentionDays(180)
    }
}

impl TryFrom<u32> for RetentionDays {
    type Error = String;

    fn try_from(days: u32) -> Result<Self, Self::Error> {
        if RETENTION_DAYS.contains(&days) {
            Ok(RetentionDays(days))
        } else {
            Err(format!(
                "unsupported retention_days {}, expected one of {:?}",
                days, RETENTION_DAYS
            ))
        }
    }
}

impl From<RetentionDays> for u32 {
    fn from(days: RetentionDays) -> Self {
        days.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Live log file; archives are written next to it.
    pub path: PathBuf,
    pub endpoint: String,
    pub bucket: String,
    /// Blob key pattern, `@…@` segments are strftime formats of the rotation
    /// time.
    #[serde(default = "default_key_pattern")]
    pub key_pattern: String,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_rotation_check_interval_seconds")]
    pub rotation_check_interval_seconds: u64,
    /// 0 disables age-based rotation.
    #[serde(default)]
    pub max_file_age_seconds: u64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_key_pattern() -> String {
    "logs/@%Y/%m/%d@/@%Y-%m-%d-%H-%M-%S@.log".to_string()
}

fn default_max_file_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_rotation_check_interval_seconds() -> u64 {
    300
}
