use super::naming::{with_uploaded_postfix, ArchiveLayout};
use super::ArchiveError;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

const ROTATION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_file_size_bytes: u64,
    /// Minimum time between two rotations.
    pub rotation_check_interval: Duration,
    /// Rotate files older than this. Zero disables age-based rotation.
    pub max_file_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 10 * 1024 * 1024,
            rotation_check_interval: Duration::from_secs(300),
            max_file_age: Duration::ZERO,
        }
    }
}

/// Line-oriented log file that archives itself by size or age.
///
/// Each archived path is broadcast to subscribers.
pub struct RotatingFile {
    layout: ArchiveLayout,
    policy: RotationPolicy,
    file: File,
    written: u64,
    opened_at: DateTime<Utc>,
    last_rotated: Option<DateTime<Utc>>,
    rotations: broadcast::Sender<PathBuf>,
}

impl RotatingFile {
    /// Open (or create) the live file at `path`, appending to what is there.
    pub fn open(path: &Path, policy: RotationPolicy) -> Result<Self, ArchiveError> {
        let layout = ArchiveLayout::from_live_path(path);
        std::fs::create_dir_all(&layout.dir)?;

        let file = open_append(&layout.live_path())?;
        let written = file.metadata()?.len();
        let (rotations, _) = broadcast::channel(ROTATION_CHANNEL_CAPACITY);

        debug!(path = %path.display(), written, "Opened rotating file");

        Ok(Self {
            layout,
            policy,
            file,
            written,
            opened_at: Utc::now(),
            last_rotated: None,
            rotations,
        })
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.rotations.subscribe()
    }

    /// Append one line, then rotate if the policy says so.
    pub fn write_line(&mut self, line: &str) -> Result<Option<PathBuf>, ArchiveError> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += line.len() as u64 + 1;

        if self.should_rotate(Utc::now()) {
            self.rotate()
        } else {
            Ok(None)
        }
    }

    pub fn should_rotate(&self, now: DateTime<Utc>) -> bool {
        let age_limit = self.policy.max_file_age;
        let check_interval = self.policy.rotation_check_interval;

        // An age limit shorter than the check interval overrides the gate.
        let gated = age_limit.is_zero() || age_limit > check_interval;
        if gated {
            if let Some(last) = self.last_rotated {
                if elapsed(last, now) < check_interval {
                    return false;
                }
            }
        }

        self.written >= self.policy.max_file_size_bytes
            || (!age_limit.is_zero() && elapsed(self.opened_at, now) >= age_limit)
    }

    /// Archive the live file now. Returns `None` when there is nothing to
    /// archive.
    pub fn rotate(&mut self) -> Result<Option<PathBuf>, ArchiveError> {
        if self.written == 0 {
            return Ok(None);
        }
        self.file.flush()?;

        let now = Utc::now();
        let mut rotated_at = now;
        let mut target = self.layout.archive_path(rotated_at);
        // Names have second resolution; never clobber an earlier archive.
        while target.exists() || with_uploaded_postfix(&target).exists() {
            rotated_at += chrono::Duration::seconds(1);
            target = self.layout.archive_path(rotated_at);
        }

        let live = self.layout.live_path();
        std::fs::rename(&live, &target)?;
        self.file = open_append(&live)?;

        info!(
            archive = %target.display(),
            bytes = self.written,
            "Rotated log file"
        );

        self.written = 0;
        self.opened_at = now;
        self.last_rotated = Some(now);

        // No subscribers is fine; the feed replays the directory.
        let _ = self.rotations.send(target.clone());
        Ok(Some(target))
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
