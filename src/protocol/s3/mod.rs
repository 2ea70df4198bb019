//! S3 protocol implementation for Ferry
//!
//! A small S3 client built directly on HTTP: requests are signed with
//! Signature Version 4 and sent through a pluggable [`HttpTransport`], so the
//! same code talks to AWS, MinIO or any S3-compatible endpoint.
//!
//! # Features
//!
//! - Multipart upload, ranged download and server-side copy for large objects
//! - Bounded concurrency per transfer through the stage pipeline
//! - Abort of unfinished multipart uploads on failure or cancellation
//! - Bulk upload, copy and delete with partial-failure reporting
//! - Presigned GET and PUT URLs
//!
//! # Example
//!
//! ```no_run
//! use ferry::config::{Credentials, TransferConfig};
//! use ferry::core::cancel::CancelToken;
//! use ferry::protocol::s3::{S3Client, UploadParams};
//! use ferry::protocol::uri::ObjectUri;
//!
//! # async fn run() -> ferry::Result<()> {
//! let config = TransferConfig {
//!     endpoint: Some("http://localhost:9000".to_string()),
//!     credentials: Some(Credentials::new("minioadmin", "minioadmin")),
//!     ..Default::default()
//! };
//! let client = S3Client::new(&config)?;
//! let params = UploadParams {
//!     source: "backup.tar".into(),
//!     destination: ObjectUri::parse("s3://my-bucket/backups/")?,
//!     content_type: None,
//!     storage_class: None,
//! };
//! let result = client.upload(&CancelToken::new(), &params).await?;
//! println!("uploaded {} in {} parts", result.uri, result.parts);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod copy;
pub mod delete;
pub mod download;
pub mod head;
pub mod http;
pub mod list;
pub mod multipart;
pub mod presign;
pub mod relocate;
pub mod signer;
pub mod upload;
pub mod xml;

#[cfg(test)]
mod mock;

pub use client::S3Client;
pub use copy::{CopyAllParams, CopyParams, CopyResult};
pub use delete::{DeleteAllParams, MAX_DELETE_BATCH};
pub use download::{DownloadAllParams, DownloadParams, DownloadResult};
pub use head::ObjectMetadata;
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use list::{BucketObject, ListEntry, ListParams};
pub use presign::{parse_duration, PresignMethod, PresignParams, DEFAULT_PRESIGN_EXPIRY};
pub use relocate::{MoveAllParams, MoveParams};
pub use signer::Signer;
pub use upload::{TransferStrategy, UploadDirParams, UploadParams, UploadResult};
