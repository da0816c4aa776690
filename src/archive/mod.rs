//! Rotating log files and the uploader that ships their archives to blob
//! storage.

pub mod blob;
pub mod feed;
pub mod key_format;
pub mod naming;
pub mod rotating;
pub mod uploader;

pub use blob::{BlobError, BlobStore, HttpBlobStore};
pub use feed::ArchiveFeed;
pub use key_format::{KeyFormatError, KeyFormatter};
pub use naming::{ArchiveFile, ArchiveLayout, UPLOADED_POSTFIX};
pub use rotating::{RotatingFile, RotationPolicy};
pub use uploader::{ArchiveUploader, KeyNamer, UploadOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload failed: {0}")]
    Blob(#[from] BlobError),

    #[error("invalid key pattern: {0}")]
    KeyFormat(#[from] KeyFormatError),
}
