use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("blob store returned status {status}: {message}")]
    Status { status: u16, message: String },
}

/// Object storage that archived log files are uploaded to.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), BlobError>;
}

/// Uploads objects with `PUT <endpoint>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    endpoint: String,
    bucket: String,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(endpoint: &str, bucket: &str, timeout: Duration) -> Result<Self, BlobError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
            client,
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            key.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), BlobError> {
        let url = self.object_url(key);
        debug!(url = %url, bytes = body.len(), "Uploading object");

        let response = self.client.put(&url).body(body).send().await?;

        if !response.status().is_success() {
            return Err(BlobError::Status {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}
