//! S3 client: signing, sending and cancellation for every operation

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use reqwest::Method;
use tracing::debug;
use url::Url;

use super::http::{check_response, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use super::signer::{encode_path, SignOptions, Signer};
use crate::config::TransferConfig;
use crate::core::cancel::CancelToken;
use crate::core::progress::{ProgressAggregator, ReportProgress, Units};
use crate::error::{FerryError, Result};
use crate::protocol::uri::{check_path, ObjectUri};

/// Client for an S3-compatible endpoint.
///
/// Cheap to clone; clones share the signer and the transport. Objects are
/// addressed path-style (`endpoint/bucket/key`).
#[derive(Clone)]
pub struct S3Client {
    endpoint: Url,
    signer: Arc<Signer>,
    transport: Arc<dyn HttpTransport>,
    chunk_size: u64,
    workers: usize,
    timeout: Option<Duration>,
    progress: Option<Arc<dyn ReportProgress>>,
}

/// Limit on establishing a connection; transfers themselves are bounded by
/// the operation timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

impl S3Client {
    /// Create a client with the production HTTP transport
    ///
    /// # Example
    ///
    /// ```no_run
    /// use ferry::config::{Credentials, TransferConfig};
    /// use ferry::protocol::s3::S3Client;
    ///
    /// let config = TransferConfig {
    ///     credentials: Some(Credentials::new("AKID", "SECRET")),
    ///     ..Default::default()
    /// };
    /// let client = S3Client::new(&config)?;
    /// # Ok::<(), ferry::FerryError>(())
    /// ```
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(Some(CONNECT_TIMEOUT))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client sending through `transport`
    pub fn with_transport(config: &TransferConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        let credentials = config.require_credentials()?.clone();
        let endpoint_str = config.endpoint_url();
        let endpoint = Url::parse(&endpoint_str)
            .map_err(|e| FerryError::Config(format!("invalid endpoint '{}': {}", endpoint_str, e)))?;
        if endpoint.cannot_be_a_base() {
            return Err(FerryError::Config(format!(
                "endpoint is not a base URL: {}",
                endpoint_str
            )));
        }

        debug!(endpoint = %endpoint, region = %config.region, "creating client");
        Ok(Self {
            endpoint,
            signer: Arc::new(Signer::new(credentials, config.region.clone())),
            transport,
            chunk_size: config.chunk_size_bytes(),
            workers: config.workers,
            timeout: config.timeout(),
            progress: None,
        })
    }

    /// Override the chunk size, in bytes
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Bound every operation by `timeout`; `None` lets them run until done
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Report progress of every transfer to `reporter`
    pub fn with_progress(mut self, reporter: Arc<dyn ReportProgress>) -> Self {
        self.progress = Some(reporter);
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Token for one operation: a child of `cancel` that also fires with
    /// [`FerryError::Timeout`] once the configured timeout elapses.
    ///
    /// Callers hold a drop guard on it so the timer stops with the operation.
    pub(crate) fn operation_token(&self, cancel: &CancelToken) -> CancelToken {
        match self.timeout {
            Some(timeout) => cancel.with_timeout(timeout),
            None => cancel.child(),
        }
    }

    /// Start a progress aggregator for one transfer
    pub(crate) fn progress(&self, name: impl Into<String>, total: u64, units: Units) -> ProgressAggregator {
        ProgressAggregator::start(self.progress.clone(), name, total, units)
    }

    /// URL of a bucket
    pub fn bucket_url(&self, bucket: &str) -> Result<Url> {
        self.path_url(&format!("{}/", bucket))
    }

    /// URL of an object
    pub fn object_url(&self, uri: &ObjectUri) -> Result<Url> {
        self.path_url(&format!("{}/{}", uri.bucket, uri.key))
    }

    fn path_url(&self, path: &str) -> Result<Url> {
        check_path(path)?;
        let base = self.endpoint.as_str().trim_end_matches('/');
        let raw = format!("{}/{}", base, encode_path(path));
        Url::parse(&raw).map_err(|e| FerryError::Usage(format!("invalid object path '{}': {}", path, e)))
    }

    /// Sign and send `request`, failing on non-2xx responses.
    ///
    /// The exchange races `cancel`: once it fires the pending request is
    /// dropped, which closes the connection, and the cancellation cause is
    /// returned.
    pub async fn send(
        &self,
        cancel: &CancelToken,
        mut request: HttpRequest,
        options: &SignOptions,
    ) -> Result<HttpResponse> {
        cancel.check()?;
        self.signer.sign_request(&mut request, options, Utc::now())?;
        debug!(method = %request.method, url = %request.url, "sending request");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancel.error()),
            response = self.transport.send(request) => response?,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancel.error()),
            checked = check_response(response) => checked,
        }
    }

    /// Buffer a response body, racing `cancel`
    pub async fn read_body(&self, cancel: &CancelToken, response: HttpResponse) -> Result<Bytes> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancel.error()),
            body = response.bytes() => body,
        }
    }

    /// Presigned URL for `method` on `uri`
    pub(crate) fn presign_url(
        &self,
        method: &Method,
        uri: &ObjectUri,
        query: &[(String, String)],
        expires: Duration,
    ) -> Result<Url> {
        let url = self.object_url(uri)?;
        self.signer.presign(method, &url, query, expires, Utc::now())
    }
}

impl fmt::Debug for S3Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Client")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.signer.region())
            .field("chunk_size", &self.chunk_size)
            .field("workers", &self.workers)
            .field("timeout", &self.timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
