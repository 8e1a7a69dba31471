//! S3-compatible storage client
//!
//! Just enough of the AWS SDK to park encrypted archives in a bucket and take
//! them back out when an upload is rolled back.

use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};

use crate::config::S3Config;
use crate::error::{Result, StorageError};

const DEFAULT_REGION: &str = "us-east-1";

/// Content type recorded on stored archives; they are ciphertext, not zips
const ARCHIVE_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Connect to the configured endpoint.
    ///
    /// An unreachable bucket is only logged; the first upload reports the
    /// real error.
    pub async fn new(config: &S3Config) -> Result<Self> {
        let s3 = Self {
            client: build_client(config),
            bucket: config.bucket.clone(),
        };

        if let Err(e) = s3.verify_bucket().await {
            tracing::warn!(bucket = %s3.bucket, error = %e, "Archive bucket not reachable yet");
        } else {
            tracing::info!(bucket = %s3.bucket, "Archive bucket reachable");
        }

        Ok(s3)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn verify_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::BucketNotFound(format!("{}: {}", self.bucket, e)))?;
        Ok(())
    }

    /// Store an archive under `key`
    pub async fn upload_archive(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(ARCHIVE_CONTENT_TYPE)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::SdkError(format!("upload of {} failed: {}", key, e)))?;

        tracing::debug!(key = %key, size = size, "Archive uploaded");
        Ok(())
    }

    /// Remove the archive under `key`. S3 treats a missing key as success.
    pub async fn remove_archive(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::SdkError(format!("delete of {} failed: {}", key, e)))?;

        tracing::debug!(key = %key, "Archive removed");
        Ok(())
    }
}

fn build_client(config: &S3Config) -> Client {
    let credentials = Credentials::new(
        &config.access_key,
        &config.secret_key,
        None,
        None,
        "crash-report-server",
    );
    let region = config.region.as_deref().unwrap_or(DEFAULT_REGION).to_string();

    let conf = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(&config.endpoint)
        .region(Region::new(region))
        .credentials_provider(credentials)
        // MinIO and most self-hosted endpoints only do path-style addressing
        .force_path_style(true)
        .build();

    Client::from_conf(conf)
}
