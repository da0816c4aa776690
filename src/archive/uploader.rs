use super::blob::BlobStore;
use super::feed::ArchiveFeed;
use super::naming::ArchiveFile;
use super::ArchiveError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Derives the blob key for an archived file.
pub type KeyNamer = Arc<dyn Fn(&ArchiveFile) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Uploaded and renamed to the returned path.
    Uploaded(PathBuf),
    /// Already uploaded, or no longer at its path.
    Skipped,
    Cancelled,
}

/// Uploads each archived file once, marking it with the uploaded postfix.
pub struct ArchiveUploader {
    store: Arc<dyn BlobStore>,
    namer: KeyNamer,
    retry_backoff: Duration,
    cancel: CancellationToken,
}

impl ArchiveUploader {
    pub fn new(
        store: Arc<dyn BlobStore>,
        namer: KeyNamer,
        retry_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            namer,
            retry_backoff,
            cancel,
        }
    }

    pub async fn run(self, mut feed: ArchiveFeed) {
        loop {
            let file = tokio::select! {
                _ = self.cancel.cancelled() => break,
                file = feed.next() => file,
            };
            match file {
                Some(file) => {
                    if self.upload(file).await == UploadOutcome::Cancelled {
                        break;
                    }
                }
                None => break,
            }
        }
        debug!("Archive uploader stopped");
    }

    /// Upload one file, retrying until it succeeds or the uploader is
    /// cancelled.
    pub async fn upload(&self, file: ArchiveFile) -> UploadOutcome {
        if file.uploaded {
            debug!(path = %file.path.display(), "Archive already uploaded");
            return UploadOutcome::Skipped;
        }

        let key = (self.namer)(&file);
        loop {
            if !file.path.exists() {
                debug!(path = %file.path.display(), "Archive moved away, skipping");
                return UploadOutcome::Skipped;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return UploadOutcome::Cancelled,
                result = self.try_upload(&file, &key) => result,
            };

            match result {
                Ok(uploaded) => {
                    info!(path = %file.path.display(), key = %key, "Uploaded archive");
                    return UploadOutcome::Uploaded(uploaded);
                }
                Err(e) => {
                    warn!(
                        path = %file.path.display(),
                        key = %key,
                        error = %e,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        "Failed to upload archive, will retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return UploadOutcome::Cancelled,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }
    }

    async fn try_upload(&self, file: &ArchiveFile, key: &str) -> Result<PathBuf, ArchiveError> {
        let body = tokio::fs::read(&file.path).await?;
        self.store.put_object(key, body).await?;

        let uploaded = file.uploaded_path();
        tokio::fs::rename(&file.path, &uploaded).await?;
        Ok(uploaded)
    }
}
