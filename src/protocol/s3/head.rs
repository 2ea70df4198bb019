//! Object metadata via HEAD

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use reqwest::Method;

use super::client::S3Client;
use super::http::HttpRequest;
use super::signer::SignOptions;
use crate::core::cancel::CancelToken;
use crate::error::{FerryError, Result};
use crate::protocol::uri::ObjectUri;

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub uri: ObjectUri,
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub storage_class: Option<String>,
    pub version_id: Option<String>,
}

impl ObjectMetadata {
    /// Build from HEAD/GET response headers; `Content-Length` is required
    pub fn from_headers(uri: ObjectUri, headers: &HeaderMap) -> Result<Self> {
        let get = |name| headers.get(name).and_then(|v| v.to_str().ok());

        let size = get(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                FerryError::InvalidResponse(format!("missing or invalid Content-Length for {}", uri))
            })?;

        let last_modified = get(LAST_MODIFIED)
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            size,
            etag: get(ETAG).map(str::to_string),
            content_type: get(CONTENT_TYPE).map(str::to_string),
            last_modified,
            storage_class: headers
                .get("x-amz-storage-class")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            version_id: headers
                .get("x-amz-version-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            uri,
        })
    }
}

impl S3Client {
    /// Fetch an object's metadata, optionally of a specific version
    pub async fn head(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        version_id: Option<&str>,
    ) -> Result<ObjectMetadata> {
        uri.require_key()?;
        let request = HttpRequest::new(Method::HEAD, self.object_url(uri)?)
            .query_opt("versionId", version_id);
        let response = self.send(cancel, request, &SignOptions::default()).await?;
        ObjectMetadata::from_headers(uri.clone(), &response.headers)
    }
}
