//! Multipart upload sessions
//!
//! An [`UploadSession`] owns one server-side multipart upload. The upload ID
//! is created lazily by whichever part worker asks for it first, and exactly
//! once: concurrent callers wait on the same initiation. A session that
//! started but did not complete is aborted so no parts are left behind.

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::client::S3Client;
use super::http::{unwrap_response, HttpRequest};
use super::signer::SignOptions;
use super::xml::{self, FromXml, S3_NAMESPACE};
use crate::core::cancel::CancelToken;
use crate::error::{FerryError, Result};
use crate::protocol::uri::ObjectUri;

/// Upper bound on the abort call issued after a failure
pub const ABORT_TIMEOUT: Duration = Duration::from_secs(30);

/// A transferred part, as listed in the completion request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionPart {
    /// 1-based
    pub part_number: u32,
    /// As returned by the server, quotes included
    pub etag: String,
}

/// Order parts by part number; servers reject unsorted lists
pub fn sort_parts(parts: &mut [CompletionPart]) {
    parts.sort_by_key(|part| part.part_number);
}

/// `CompleteMultipartUpload` request body for sorted `parts`.
///
/// ETags are written verbatim so their embedded quotes reach the server
/// exactly as it sent them.
pub fn complete_multipart_body(parts: &[CompletionPart]) -> String {
    let mut body = format!("<CompleteMultipartUpload xmlns=\"{}\">", S3_NAMESPACE);
    for part in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number, part.etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitiateMultipartUploadResult {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub key: String,
    pub upload_id: String,
}

impl FromXml for InitiateMultipartUploadResult {
    fn from_xml(doc: &str) -> Result<Self> {
        Ok(Self {
            bucket: xml::text(doc, "Bucket").unwrap_or_default(),
            key: xml::text(doc, "Key").unwrap_or_default(),
            upload_id: xml::require_text(doc, "UploadId")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteMultipartUploadResult {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

impl FromXml for CompleteMultipartUploadResult {
    fn from_xml(doc: &str) -> Result<Self> {
        Ok(Self {
            location: xml::text(doc, "Location"),
            bucket: xml::text(doc, "Bucket"),
            key: xml::text(doc, "Key"),
            etag: xml::text(doc, "ETag"),
        })
    }
}

/// Body of a part copy or single-request copy response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CopyPartResult {
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(default)]
    pub last_modified: Option<String>,
}

impl FromXml for CopyPartResult {
    fn from_xml(doc: &str) -> Result<Self> {
        Ok(Self {
            etag: xml::require_text(doc, "ETag")?,
            last_modified: xml::text(doc, "LastModified"),
        })
    }
}

/// One multipart upload to `uri`
#[derive(Debug)]
pub struct UploadSession {
    client: S3Client,
    uri: ObjectUri,
    mime_type: String,
    storage_class: Option<String>,
    total_parts: u64,
    upload_id: OnceCell<String>,
}

impl UploadSession {
    pub fn new(
        client: S3Client,
        uri: ObjectUri,
        mime_type: impl Into<String>,
        storage_class: Option<String>,
        total_parts: u64,
    ) -> Self {
        Self {
            client,
            uri,
            mime_type: mime_type.into(),
            storage_class,
            total_parts,
            upload_id: OnceCell::new(),
        }
    }

    pub fn uri(&self) -> &ObjectUri {
        &self.uri
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn total_parts(&self) -> u64 {
        self.total_parts
    }

    /// The upload ID, initiating the upload on first use
    pub async fn upload_id(&self, cancel: &CancelToken) -> Result<&str> {
        self.upload_id
            .get_or_try_init(|| self.initiate(cancel))
            .await
            .map(String::as_str)
    }

    /// The upload ID if initiation already succeeded
    pub fn started_id(&self) -> Option<&str> {
        self.upload_id.get().map(String::as_str)
    }

    async fn initiate(&self, cancel: &CancelToken) -> Result<String> {
        let request = HttpRequest::new(Method::POST, self.client.object_url(&self.uri)?)
            .query("uploads", "")
            .header("content-type", &self.mime_type)?
            .header_opt("x-amz-storage-class", self.storage_class.as_deref())?;
        let response = self.client.send(cancel, request, &SignOptions::default()).await?;
        let result: Option<InitiateMultipartUploadResult> = unwrap_response(response).await?;
        let result = result.ok_or_else(|| {
            FerryError::InvalidResponse("empty CreateMultipartUpload response".to_string())
        })?;
        info!(uri = %self.uri, upload_id = %result.upload_id, parts = self.total_parts, "initiated multipart upload");
        Ok(result.upload_id)
    }

    /// Sort `parts` and complete the upload
    pub async fn complete(
        &self,
        cancel: &CancelToken,
        mut parts: Vec<CompletionPart>,
    ) -> Result<CompleteMultipartUploadResult> {
        if parts.len() as u64 != self.total_parts {
            return Err(FerryError::InvalidResponse(format!(
                "multipart upload incomplete: expected {} parts, collected {}",
                self.total_parts,
                parts.len()
            )));
        }
        let upload_id = self.upload_id(cancel).await?;
        sort_parts(&mut parts);

        let request = HttpRequest::new(Method::POST, self.client.object_url(&self.uri)?)
            .query("uploadId", upload_id)
            .header("content-type", "application/xml")?
            .body(complete_multipart_body(&parts));
        let response = self
            .client
            .send(cancel, request, &SignOptions::completion())
            .await?;
        let result: Option<CompleteMultipartUploadResult> = unwrap_response(response).await?;
        info!(uri = %self.uri, parts = parts.len(), "completed multipart upload");
        Ok(result.unwrap_or_default())
    }

    /// Abort the upload if it was started. Runs on its own time-bounded
    /// token so it still goes out after the transfer was cancelled.
    pub async fn abort(&self) {
        let Some(upload_id) = self.started_id() else {
            return;
        };
        let cancel = CancelToken::new().with_timeout(ABORT_TIMEOUT);
        let _stop_timer = cancel.drop_guard();

        let url = match self.client.object_url(&self.uri) {
            Ok(url) => url,
            Err(err) => {
                warn!(uri = %self.uri, error = %err, "cannot abort multipart upload");
                return;
            }
        };
        let request = HttpRequest::new(Method::DELETE, url).query("uploadId", upload_id);
        match self.client.send(&cancel, request, &SignOptions::default()).await {
            Ok(_) => info!(uri = %self.uri, upload_id, "aborted multipart upload"),
            Err(err) => warn!(uri = %self.uri, upload_id, error = %err, "failed to abort multipart upload"),
        }
    }

    /// Pass `result` through, aborting the upload first when it failed
    pub async fn finish_or_abort<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!(uri = %self.uri, error = %err, "multipart transfer failed");
            self.abort().await;
        }
        result
    }
}
