//! Durable storage for uploaded report archives
//!
//! Supports the local filesystem and S3-compatible backends (MinIO, R2, B2, AWS S3).

mod archive_store;
mod s3_client;

pub use archive_store::{ArchiveStore, LocalArchiveStore, S3ArchiveStore};
pub use s3_client::S3Client;
