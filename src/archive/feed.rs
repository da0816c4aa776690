use super::naming::{ArchiveFile, ArchiveLayout};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Stream of archived files: first every archive already on disk, then each
/// new rotation as it happens.
///
/// A file may show up twice (on disk at subscription time and announced
/// live); consumers skip files that moved away in between.
pub struct ArchiveFeed {
    layout: ArchiveLayout,
    rotations: broadcast::Receiver<PathBuf>,
    backlog: VecDeque<ArchiveFile>,
}

impl ArchiveFeed {
    /// `rotations` must be subscribed before this call so no rotation falls
    /// between the directory scan and the live stream.
    pub fn new(layout: ArchiveLayout, rotations: broadcast::Receiver<PathBuf>) -> Self {
        let mut feed = Self {
            layout,
            rotations,
            backlog: VecDeque::new(),
        };
        feed.replay();
        feed
    }

    /// Next archived file, or `None` once the rotating file is gone.
    pub async fn next(&mut self) -> Option<ArchiveFile> {
        loop {
            if let Some(file) = self.backlog.pop_front() {
                return Some(file);
            }

            match self.rotations.recv().await {
                Ok(path) => match self.layout.parse(&path) {
                    Some(file) => return Some(file),
                    None => debug!(path = %path.display(), "Ignoring unrecognized archive"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Archive feed fell behind, rescanning directory");
                    self.replay();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn replay(&mut self) {
        match self.layout.list() {
            Ok(files) => {
                debug!(count = files.len(), dir = %self.layout.dir.display(), "Replaying archives");
                self.backlog.extend(files);
            }
            Err(e) => warn!(dir = %self.layout.dir.display(), error = %e, "Failed to scan archives"),
        }
    }
}
