//! Server-side copies
//!
//! Bytes never pass through the client: small objects are copied with one
//! `x-amz-copy-source` PUT, larger ones as a multipart upload whose parts are
//! filled from `x-amz-copy-source-range` slices of the source.

use std::sync::Arc;

use reqwest::Method;
use tracing::{debug, info, info_span, warn, Instrument};

use super::client::S3Client;
use super::http::{unwrap_response, HttpRequest};
use super::list::BucketObject;
use super::multipart::{CompletionPart, CopyPartResult, UploadSession};
use super::signer::{encode_path, uri_encode, SignOptions};
use super::upload::{guess_mime_type, select_strategy, TransferStrategy};
use crate::core::cancel::CancelToken;
use crate::core::chunk::{chunk_count, range_chunks, ByteRange};
use crate::core::filter::FilterParams;
use crate::core::generator::slice_item_consumer;
use crate::core::pipeline::{parallel_process, ProcessStatus};
use crate::core::progress::{ProgressHandle, Units};
use crate::error::{FerryError, MultiError, Result};
use crate::protocol::uri::ObjectUri;

#[derive(Debug, Clone)]
pub struct CopyParams {
    pub source: ObjectUri,
    /// A key, or a prefix the source's file name is appended to
    pub destination: ObjectUri,
    pub version_id: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResult {
    pub source: ObjectUri,
    pub destination: ObjectUri,
    pub size: u64,
    pub etag: Option<String>,
    pub strategy: TransferStrategy,
}

#[derive(Debug, Clone)]
pub struct CopyAllParams {
    pub source: ObjectUri,
    pub destination: ObjectUri,
    pub filters: FilterParams,
    pub storage_class: Option<String>,
}

/// `x-amz-copy-source` value: `bucket/key`, path-encoded, with an optional version
pub fn copy_source_header(source: &ObjectUri, version_id: Option<&str>) -> String {
    let mut header = encode_path(&format!("{}/{}", source.bucket, source.key));
    if let Some(version_id) = version_id {
        header.push_str("?versionId=");
        header.push_str(&uri_encode(version_id));
    }
    header
}

impl S3Client {
    /// Copy one object
    pub async fn copy(&self, cancel: &CancelToken, params: &CopyParams) -> Result<CopyResult> {
        params.source.require_key()?;
        let destination = if params.destination.is_prefix() {
            params.destination.join(params.source.file_name())
        } else {
            params.destination.clone()
        };

        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let metadata = self
            .head(&cancel, &params.source, params.version_id.as_deref())
            .await?;
        let progress = self.progress(destination.to_string(), metadata.size, Units::Bytes);
        let content_type = metadata
            .content_type
            .unwrap_or_else(|| guess_mime_type(&destination.key));
        let result = self
            .copy_object(
                &cancel,
                params,
                &destination,
                metadata.size,
                Some(content_type),
                progress.handle(),
            )
            .await;
        progress.finish(&result).await;
        result
    }

    /// Copy `params.source` to `destination`.
    ///
    /// `content_type` is the source's, when already known; a multipart copy
    /// does not carry it over on its own.
    async fn copy_object(
        &self,
        cancel: &CancelToken,
        params: &CopyParams,
        destination: &ObjectUri,
        size: u64,
        content_type: Option<String>,
        progress: ProgressHandle,
    ) -> Result<CopyResult> {
        let cancel = cancel.child();
        let strategy = select_strategy(size, self.chunk_size());
        let span = info_span!("copy", source = %params.source, destination = %destination, size, ?strategy);

        async {
            let etag = match strategy {
                TransferStrategy::Single => {
                    self.copy_single(&cancel, params, destination, size, &progress).await?
                }
                TransferStrategy::Multipart => {
                    self.copy_multipart(&cancel, params, destination, size, content_type, progress)
                        .await?
                }
            };
            info!("copy complete");
            Ok::<_, FerryError>(CopyResult {
                source: params.source.clone(),
                destination: destination.clone(),
                size,
                etag,
                strategy,
            })
        }
        .instrument(span)
        .await
        .inspect_err(|err: &FerryError| warn!(error = %err, "copy failed"))
    }

    async fn copy_single(
        &self,
        cancel: &CancelToken,
        params: &CopyParams,
        destination: &ObjectUri,
        size: u64,
        progress: &ProgressHandle,
    ) -> Result<Option<String>> {
        let request = HttpRequest::new(Method::PUT, self.object_url(destination)?)
            .header(
                "x-amz-copy-source",
                &copy_source_header(&params.source, params.version_id.as_deref()),
            )?
            .header_opt("x-amz-storage-class", params.storage_class.as_deref())?;
        let response = self.send(cancel, request, &SignOptions::default()).await?;
        let result: Option<CopyPartResult> = unwrap_response(response).await?;
        progress.advance(size);
        Ok(result.map(|r| r.etag))
    }

    async fn copy_multipart(
        &self,
        cancel: &CancelToken,
        params: &CopyParams,
        destination: &ObjectUri,
        size: u64,
        content_type: Option<String>,
        progress: ProgressHandle,
    ) -> Result<Option<String>> {
        let content_type = match content_type {
            Some(content_type) => content_type,
            None => self
                .head(cancel, &params.source, params.version_id.as_deref())
                .await?
                .content_type
                .unwrap_or_else(|| guess_mime_type(&destination.key)),
        };
        let chunk_size = self.chunk_size();
        let session = Arc::new(UploadSession::new(
            self.clone(),
            destination.clone(),
            content_type,
            params.storage_class.clone(),
            chunk_count(size, chunk_size),
        ));
        let copy_source = copy_source_header(&params.source, params.version_id.as_deref());

        let result = async {
            let ranges = range_chunks(cancel, size, chunk_size);
            let client = self.clone();
            let worker_session = Arc::clone(&session);
            let parts = parallel_process(
                cancel,
                self.workers(),
                ranges,
                move |cancel: CancelToken, range: ByteRange| {
                    let client = client.clone();
                    let session = Arc::clone(&worker_session);
                    let copy_source = copy_source.clone();
                    let progress = progress.clone();
                    async move {
                        match client.copy_part(&cancel, &session, &copy_source, range).await {
                            Ok(part) => {
                                progress.advance(range.len());
                                ProcessStatus::Output(part)
                            }
                            Err(err) => {
                                cancel.cancel(err);
                                ProcessStatus::Abort
                            }
                        }
                    }
                },
                None,
            );
            let parts = slice_item_consumer(cancel, parts).await?;
            let completed = session.complete(cancel, parts).await?;
            Ok::<_, FerryError>(completed.etag)
        }
        .await;

        session.finish_or_abort(result).await
    }

    async fn copy_part(
        &self,
        cancel: &CancelToken,
        session: &UploadSession,
        copy_source: &str,
        range: ByteRange,
    ) -> Result<CompletionPart> {
        let upload_id = session.upload_id(cancel).await?;
        let part_number = range.part_number(self.chunk_size());
        let request = HttpRequest::new(Method::PUT, self.object_url(session.uri())?)
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .header("x-amz-copy-source", copy_source)?
            .header("x-amz-copy-source-range", &range.header_value())?;
        let options = SignOptions {
            unsigned_payload: true,
            ..Default::default()
        };
        let response = self.send(cancel, request, &options).await?;
        let result: Option<CopyPartResult> = unwrap_response(response).await?;
        let etag = result
            .ok_or_else(|| {
                FerryError::InvalidResponse(format!("empty response copying part {}", part_number))
            })?
            .etag;

        debug!(part_number, %range, "copied part");
        Ok(CompletionPart { part_number, etag })
    }

    /// Copy every object under a prefix to another prefix.
    ///
    /// Objects are copied concurrently and independently; failures are
    /// collected and returned together. Returns the number copied.
    pub async fn copy_all(&self, cancel: &CancelToken, params: &CopyAllParams) -> Result<u64> {
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let progress = self.progress(params.destination.to_string(), 0, Units::Objects);
        let result = async {
            let outcome = self.copy_tree(&cancel, params, progress.handle()).await?;
            outcome.errors.into_result()?;
            Ok(outcome.copied.len() as u64)
        }
        .await;
        progress.finish(&result).await;
        result
    }

    pub(crate) async fn copy_tree(
        &self,
        cancel: &CancelToken,
        params: &CopyAllParams,
        progress: ProgressHandle,
    ) -> Result<CopyOutcome> {
        check_disjoint(&params.source, &params.destination)?;
        let cancel = cancel.child();
        let source_prefix = params.source.dir_prefix();
        let destination = ObjectUri::new(
            params.destination.bucket.clone(),
            params.destination.dir_prefix(),
        );

        let objects = self.object_generator(&cancel, &params.source, progress.clone());
        let objects = params.filters.apply(&cancel, objects)?;

        let client = self.clone();
        let bucket = params.source.bucket.clone();
        let storage_class = params.storage_class.clone();
        let outcomes = parallel_process(
            &cancel,
            self.workers(),
            objects,
            move |cancel: CancelToken, object: BucketObject| {
                let relative = object
                    .key
                    .strip_prefix(&source_prefix)
                    .unwrap_or(&object.key)
                    .to_string();
                let params = CopyParams {
                    source: ObjectUri::new(bucket.clone(), object.key.clone()),
                    destination: destination.join(&relative),
                    version_id: None,
                    storage_class: storage_class.clone(),
                };
                let client = client.clone();
                let progress = progress.clone();
                async move {
                    let outcome = client
                        .copy_object(
                            &cancel,
                            &params,
                            &params.destination,
                            object.size,
                            None,
                            ProgressHandle::disabled(),
                        )
                        .await;
                    match outcome {
                        Ok(_) => {
                            progress.advance(1);
                            ProcessStatus::Output(Ok(object))
                        }
                        Err(err) => {
                            progress.fail(err.clone());
                            ProcessStatus::Output(Err(err.for_object(params.source.to_string())))
                        }
                    }
                }
            },
            None,
        );

        let mut copied = Vec::new();
        let mut errors = MultiError::new();
        for outcome in slice_item_consumer(&cancel, outcomes).await? {
            match outcome {
                Ok(object) => copied.push(object),
                Err(err) => errors.push(err),
            }
        }
        info!(copied = copied.len(), failed = errors.len(), "bulk copy finished");
        Ok(CopyOutcome { copied, errors })
    }
}

/// Objects a bulk copy finished, and the ones it could not
pub(crate) struct CopyOutcome {
    pub copied: Vec<BucketObject>,
    pub errors: MultiError,
}

/// A destination inside the source prefix would be listed while it is written
fn check_disjoint(source: &ObjectUri, destination: &ObjectUri) -> Result<()> {
    if source.bucket == destination.bucket
        && destination.dir_prefix().starts_with(&source.dir_prefix())
    {
        return Err(FerryError::Usage(format!(
            "destination {} is inside source {}",
            destination, source
        )));
    }
    Ok(())
}
