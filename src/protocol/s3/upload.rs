//! Upload of local files
//!
//! Files smaller than one chunk go up in a single PUT. Larger files are
//! partitioned into chunks that a worker pool uploads as multipart parts;
//! the first part to fail cancels the transfer and the upload is aborted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use reqwest::Method;
use tracing::{debug, info, info_span, warn, Instrument};
use walkdir::WalkDir;

use super::client::S3Client;
use super::http::HttpRequest;
use super::multipart::{CompletionPart, UploadSession};
use super::signer::SignOptions;
use crate::core::cancel::CancelToken;
use crate::core::chunk::{chunk_count, read_chunks, Chunk, ReadAt};
use crate::core::filter::{base_name, EntryName, FilterParams};
use crate::core::generator::{blocking_generator, error_consumer, slice_item_consumer};
use crate::core::pipeline::{filter_some, parallel_process, process, ProcessStatus};
use crate::core::progress::{ProgressHandle, Units};
use crate::error::{FerryError, Result};
use crate::protocol::uri::ObjectUri;

/// How an object is moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// One request
    Single,
    /// Parallel parts or ranges
    Multipart,
}

/// Objects of at least one chunk go multipart
pub fn select_strategy(size: u64, chunk_size: u64) -> TransferStrategy {
    if size >= chunk_size {
        TransferStrategy::Multipart
    } else {
        TransferStrategy::Single
    }
}

/// MIME type guessed from a path's extension
pub fn guess_mime_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct UploadParams {
    pub source: PathBuf,
    /// A key, or a prefix (ending in `/`) the file name is appended to
    pub destination: ObjectUri,
    /// Overrides extension sniffing
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub uri: ObjectUri,
    pub size: u64,
    pub etag: Option<String>,
    pub strategy: TransferStrategy,
    pub parts: usize,
}

#[derive(Debug, Clone)]
pub struct UploadDirParams {
    pub source: PathBuf,
    pub destination: ObjectUri,
    pub filters: FilterParams,
    pub storage_class: Option<String>,
}

/// A file found under an uploaded directory
#[derive(Debug, Clone)]
struct LocalFile {
    path: PathBuf,
    /// `/`-separated path relative to the walked root
    relative: String,
}

impl EntryName for LocalFile {
    fn entry_name(&self) -> &str {
        base_name(&self.relative)
    }
}

impl S3Client {
    /// Upload one file
    pub async fn upload(&self, cancel: &CancelToken, params: &UploadParams) -> Result<UploadResult> {
        let destination = if params.destination.is_prefix() {
            let name = params
                .source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    FerryError::Usage(format!("cannot name object after {}", params.source.display()))
                })?;
            params.destination.join(name)
        } else {
            params.destination.clone()
        };

        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let size = file_size(&params.source).await?;
        let progress = self.progress(destination.to_string(), size, Units::Bytes);
        let result = self
            .upload_file(&cancel, params, &destination, size, progress.handle())
            .await;
        progress.finish(&result).await;
        result
    }

    async fn upload_file(
        &self,
        cancel: &CancelToken,
        params: &UploadParams,
        destination: &ObjectUri,
        size: u64,
        progress: ProgressHandle,
    ) -> Result<UploadResult> {
        let cancel = cancel.child();
        let mime_type = params
            .content_type
            .clone()
            .unwrap_or_else(|| guess_mime_type(&params.source.to_string_lossy()));
        let strategy = select_strategy(size, self.chunk_size());
        let span = info_span!("upload", uri = %destination, size, ?strategy);

        async {
            debug!(source = %params.source.display(), %mime_type, "starting upload");
            let result = match strategy {
                TransferStrategy::Single => {
                    self.upload_single(&cancel, params, destination, &mime_type, progress)
                        .await
                }
                TransferStrategy::Multipart => {
                    self.upload_multipart(&cancel, params, destination, size, mime_type, progress)
                        .await
                }
            };
            match &result {
                Ok(done) => info!(parts = done.parts, "upload complete"),
                Err(err) => warn!(error = %err, "upload failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn upload_single(
        &self,
        cancel: &CancelToken,
        params: &UploadParams,
        destination: &ObjectUri,
        mime_type: &str,
        progress: ProgressHandle,
    ) -> Result<UploadResult> {
        let body = Bytes::from(tokio::fs::read(&params.source).await?);
        let size = body.len() as u64;
        let request = HttpRequest::new(Method::PUT, self.object_url(destination)?)
            .header("content-type", mime_type)?
            .header_opt("x-amz-storage-class", params.storage_class.as_deref())?
            .body(body);
        let response = self.send(cancel, request, &SignOptions::default()).await?;
        progress.advance(size);

        Ok(UploadResult {
            uri: destination.clone(),
            size,
            etag: response.header_str("etag").map(str::to_string),
            strategy: TransferStrategy::Single,
            parts: 1,
        })
    }

    async fn upload_multipart(
        &self,
        cancel: &CancelToken,
        params: &UploadParams,
        destination: &ObjectUri,
        size: u64,
        mime_type: String,
        progress: ProgressHandle,
    ) -> Result<UploadResult> {
        let chunk_size = self.chunk_size();
        let session = Arc::new(UploadSession::new(
            self.clone(),
            destination.clone(),
            mime_type,
            params.storage_class.clone(),
            chunk_count(size, chunk_size),
        ));

        let result = async {
            let file = std::fs::File::open(&params.source)?;
            let source: Arc<dyn ReadAt> = Arc::new(file);
            let chunks = read_chunks(cancel, source, size, chunk_size);

            let client = self.clone();
            let worker_session = Arc::clone(&session);
            let parts = parallel_process(
                cancel,
                self.workers(),
                chunks,
                move |cancel: CancelToken, chunk: Chunk| {
                    let client = client.clone();
                    let session = Arc::clone(&worker_session);
                    let progress = progress.clone();
                    async move {
                        match client.upload_part(&cancel, &session, &chunk).await {
                            Ok(part) => {
                                progress.advance(chunk.reader.len());
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
            let count = parts.len();
            let completed = session.complete(cancel, parts).await?;
            Ok::<_, FerryError>(UploadResult {
                uri: destination.clone(),
                size,
                etag: completed.etag,
                strategy: TransferStrategy::Multipart,
                parts: count,
            })
        }
        .await;

        session.finish_or_abort(result).await
    }

    async fn upload_part(
        &self,
        cancel: &CancelToken,
        session: &UploadSession,
        chunk: &Chunk,
    ) -> Result<CompletionPart> {
        let upload_id = session.upload_id(cancel).await?;
        let part_number = chunk.range().part_number(self.chunk_size());
        let body = chunk.reader.read_all_async().await?;

        let request = HttpRequest::new(Method::PUT, self.object_url(session.uri())?)
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id)
            .header("content-type", session.mime_type())?
            .body(body);
        let options = SignOptions {
            unsigned_payload: true,
            ..Default::default()
        };
        let response = self.send(cancel, request, &options).await?;
        let etag = response
            .header_str("etag")
            .ok_or_else(|| {
                FerryError::InvalidResponse(format!("part {} response has no ETag", part_number))
            })?
            .to_string();

        debug!(part_number, bytes = chunk.reader.len(), "uploaded part");
        Ok(CompletionPart { part_number, etag })
    }

    /// Upload every file under a directory, keeping relative paths.
    ///
    /// Files upload concurrently and independently; failures are collected
    /// and returned together once the walk is done. Returns the number of
    /// files uploaded.
    pub async fn upload_dir(&self, cancel: &CancelToken, params: &UploadDirParams) -> Result<u64> {
        let root = params.source.clone();
        if !tokio::fs::metadata(&root).await?.is_dir() {
            return Err(FerryError::Usage(format!("not a directory: {}", root.display())));
        }
        let destination = ObjectUri::new(
            params.destination.bucket.clone(),
            params.destination.dir_prefix(),
        );

        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let progress = self.progress(destination.to_string(), 0, Units::Objects);
        let result = self
            .upload_tree(&cancel, params, root, destination, progress.handle())
            .await;
        progress.finish(&result).await;
        result
    }

    async fn upload_tree(
        &self,
        cancel: &CancelToken,
        params: &UploadDirParams,
        root: PathBuf,
        destination: ObjectUri,
        progress: ProgressHandle,
    ) -> Result<u64> {
        let cancel = cancel.child();
        let files = blocking_generator(&cancel, move || walk_files(root));
        let files = params.filters.apply(&cancel, files)?;

        let counter = progress.clone();
        let files = process(
            &cancel,
            files,
            move |_cancel, file: LocalFile| {
                counter.grow(1);
                async move { ProcessStatus::Output(file) }
            },
            None,
        );

        let uploaded = Arc::new(AtomicU64::new(0));
        let client = self.clone();
        let storage_class = params.storage_class.clone();
        let done = Arc::clone(&uploaded);
        let errors = parallel_process(
            &cancel,
            self.workers(),
            files,
            move |cancel: CancelToken, file: LocalFile| {
                let client = client.clone();
                let progress = progress.clone();
                let done = Arc::clone(&done);
                let params = UploadParams {
                    source: file.path.clone(),
                    destination: destination.join(&file.relative),
                    content_type: None,
                    storage_class: storage_class.clone(),
                };
                async move {
                    let outcome = async {
                        let size = file_size(&params.source).await?;
                        client
                            .upload_file(&cancel, &params, &params.destination, size, ProgressHandle::disabled())
                            .await
                    }
                    .await;
                    match outcome {
                        Ok(_) => {
                            done.fetch_add(1, Ordering::Relaxed);
                            progress.advance(1);
                            ProcessStatus::Output(None)
                        }
                        Err(err) => {
                            progress.fail(err.clone());
                            ProcessStatus::Output(Some(err.for_object(file.path.display().to_string())))
                        }
                    }
                }
            },
            None,
        );
        let errors = filter_some(&cancel, errors);
        error_consumer(&cancel, errors).await?;
        Ok(uploaded.load(Ordering::Relaxed))
    }
}

async fn file_size(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| FerryError::Io(format!("{}: {}", path.display(), e)))?;
    if !metadata.is_file() {
        return Err(FerryError::Usage(format!("not a regular file: {}", path.display())));
    }
    Ok(metadata.len())
}

fn walk_files(root: PathBuf) -> impl Iterator<Item = LocalFile> {
    WalkDir::new(&root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(move |entry| {
            let relative = entry.path().strip_prefix(&root).ok()?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some(LocalFile {
                path: entry.into_path(),
                relative,
            })
        })
}
