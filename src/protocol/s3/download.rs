//! Download of objects to local files
//!
//! Small objects stream straight into the destination. Larger objects are
//! fetched as ranged GETs by a worker pool, each range written at its own
//! offset of a pre-sized file, so ranges complete in any order. Whole
//! prefixes are mirrored into a local directory by [`S3Client::download_all`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::Method;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::client::S3Client;
use super::http::HttpRequest;
use super::list::BucketObject;
use super::signer::SignOptions;
use super::upload::{select_strategy, TransferStrategy};
use crate::core::cancel::CancelToken;
use crate::core::chunk::{prepare_write_chunks, WriteAt, WriteableChunk};
use crate::core::filter::FilterParams;
use crate::core::generator::{error_consumer, slice_item_consumer};
use crate::core::pipeline::{filter_some, parallel_process, ProcessStatus};
use crate::core::progress::{ProgressHandle, Units};
use crate::error::{FerryError, Result};
use crate::protocol::uri::{check_path, ObjectUri};

#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub source: ObjectUri,
    /// File or directory; the current directory when absent
    pub destination: Option<PathBuf>,
    pub version_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadAllParams {
    /// Bucket and prefix to download
    pub source: ObjectUri,
    /// Local directory; the current directory when absent
    pub destination: Option<PathBuf>,
    pub filters: FilterParams,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub size: u64,
    pub etag: Option<String>,
    pub strategy: TransferStrategy,
}

/// Local path an object is written to.
///
/// No destination means the current directory. A destination that is an
/// existing directory, or ends with a path separator, gets the object's
/// file name appended.
pub fn resolve_destination(source: &ObjectUri, destination: Option<&Path>) -> Result<PathBuf> {
    let file_name = source.file_name();
    if file_name.is_empty() {
        return Err(FerryError::Usage(format!("no object name in {}", source)));
    }
    let Some(destination) = destination else {
        return Ok(PathBuf::from(file_name));
    };
    let text = destination.to_string_lossy();
    if destination.is_dir() || text.ends_with('/') || text.ends_with(std::path::MAIN_SEPARATOR) {
        Ok(destination.join(file_name))
    } else {
        Ok(destination.to_path_buf())
    }
}

impl S3Client {
    /// Download one object
    pub async fn download(&self, cancel: &CancelToken, params: &DownloadParams) -> Result<DownloadResult> {
        params.source.require_key()?;
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let path = resolve_destination(&params.source, params.destination.as_deref())?;
        let version_id = params.version_id.as_deref();
        let metadata = self.head(&cancel, &params.source, version_id).await?;

        let size = metadata.size;
        let progress = self.progress(params.source.to_string(), size, Units::Bytes);
        let result = self
            .download_object(&cancel, &params.source, version_id, &path, size, progress.handle())
            .await
            .map(|strategy| DownloadResult {
                path,
                size,
                etag: metadata.etag,
                strategy,
            });
        progress.finish(&result).await;
        result
    }

    /// Write `size` bytes of `source` to `path`, creating parent directories
    async fn download_object(
        &self,
        cancel: &CancelToken,
        source: &ObjectUri,
        version_id: Option<&str>,
        path: &Path,
        size: u64,
        progress: ProgressHandle,
    ) -> Result<TransferStrategy> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cancel = cancel.child();
        let strategy = select_strategy(size, self.chunk_size());
        let result = async {
            match strategy {
                TransferStrategy::Single => {
                    self.download_single(&cancel, source, version_id, path, progress)
                        .await
                }
                TransferStrategy::Multipart => {
                    self.download_multipart(&cancel, source, version_id, path, size, progress)
                        .await
                }
            }
        }
        .instrument(info_span!("download", uri = %source, size, ?strategy))
        .await;

        match &result {
            Ok(()) => info!(uri = %source, path = %path.display(), size, "download complete"),
            Err(err) => warn!(uri = %source, error = %err, "download failed"),
        }
        result.map(|()| strategy)
    }

    fn get_request(&self, uri: &ObjectUri, version_id: Option<&str>) -> Result<HttpRequest> {
        Ok(HttpRequest::new(Method::GET, self.object_url(uri)?).query_opt("versionId", version_id))
    }

    async fn download_single(
        &self,
        cancel: &CancelToken,
        source: &ObjectUri,
        version_id: Option<&str>,
        path: &Path,
        progress: ProgressHandle,
    ) -> Result<()> {
        let request = self.get_request(source, version_id)?;
        let response = self.send(cancel, request, &SignOptions::default()).await?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut body = response.into_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancel.error()),
                next = body.next() => next,
            };
            let Some(data) = next else {
                break;
            };
            let data = data?;
            file.write_all(&data).await?;
            progress.advance(data.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn download_multipart(
        &self,
        cancel: &CancelToken,
        source: &ObjectUri,
        version_id: Option<&str>,
        path: &Path,
        size: u64,
        progress: ProgressHandle,
    ) -> Result<()> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size)?;
        let file = Arc::new(file);
        let sink: Arc<dyn WriteAt> = file.clone();

        let chunks = prepare_write_chunks(cancel, sink, size, self.chunk_size());
        let client = self.clone();
        let source = source.clone();
        let version_id = version_id.map(str::to_string);
        let done = parallel_process(
            cancel,
            self.workers(),
            chunks,
            move |cancel: CancelToken, chunk: WriteableChunk| {
                let client = client.clone();
                let source = source.clone();
                let version_id = version_id.clone();
                let progress = progress.clone();
                async move {
                    match client
                        .download_range(&cancel, &source, version_id.as_deref(), chunk, &progress)
                        .await
                    {
                        Ok(()) => ProcessStatus::Output(()),
                        Err(err) => {
                            cancel.cancel(err);
                            ProcessStatus::Abort
                        }
                    }
                }
            },
            None,
        );
        let ranges = slice_item_consumer(cancel, done).await?;
        debug!(ranges = ranges.len(), "all ranges written");

        tokio::task::spawn_blocking(move || file.sync_all()).await??;
        Ok(())
    }

    /// Fetch one range and write it at its offset
    async fn download_range(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        version_id: Option<&str>,
        chunk: WriteableChunk,
        progress: &ProgressHandle,
    ) -> Result<()> {
        let range = chunk.range();
        let request = self
            .get_request(uri, version_id)?
            .header("range", &range.header_value())?;
        let response = self.send(cancel, request, &SignOptions::default()).await?;

        let WriteableChunk { mut writer, .. } = chunk;
        let mut body = response.into_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancel.error()),
                next = body.next() => next,
            };
            let Some(data) = next else {
                break;
            };
            let data = data?;
            let len = data.len() as u64;
            writer = tokio::task::spawn_blocking(move || {
                writer.write_all(&data)?;
                Ok::<_, std::io::Error>(writer)
            })
            .await??;
            progress.advance(len);
        }

        if writer.remaining() > 0 {
            return Err(FerryError::InvalidResponse(format!(
                "short body for range {}: {} bytes missing",
                range,
                writer.remaining()
            )));
        }
        debug!(%range, "range written");
        Ok(())
    }

    /// Download every object under a prefix into a local directory.
    ///
    /// Keys keep their path below the prefix. Objects are downloaded
    /// concurrently and independently; failures are collected and returned
    /// together. Returns the number downloaded.
    pub async fn download_all(&self, cancel: &CancelToken, params: &DownloadAllParams) -> Result<u64> {
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let root = params
            .destination
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        if root.exists() && !root.is_dir() {
            return Err(FerryError::Usage(format!("not a directory: {}", root.display())));
        }

        let progress = self.progress(params.source.to_string(), 0, Units::Objects);
        let result = self.download_tree(&cancel, params, root, progress.handle()).await;
        progress.finish(&result).await;
        result
    }

    async fn download_tree(
        &self,
        cancel: &CancelToken,
        params: &DownloadAllParams,
        root: PathBuf,
        progress: ProgressHandle,
    ) -> Result<u64> {
        let cancel = cancel.child();
        let source_prefix = params.source.dir_prefix();
        let objects = self.object_generator(&cancel, &params.source, progress.clone());
        let objects = params.filters.apply(&cancel, objects)?;

        let downloaded = Arc::new(AtomicU64::new(0));
        let done = Arc::clone(&downloaded);
        let client = self.clone();
        let bucket = params.source.bucket.clone();
        let errors = parallel_process(
            &cancel,
            self.workers(),
            objects,
            move |cancel: CancelToken, object: BucketObject| {
                let source = ObjectUri::new(bucket.clone(), object.key.clone());
                let relative = object
                    .key
                    .strip_prefix(&source_prefix)
                    .unwrap_or(&object.key)
                    .to_string();
                let root = root.clone();
                let client = client.clone();
                let progress = progress.clone();
                let done = Arc::clone(&done);
                async move {
                    // Folder placeholders have no file to write
                    if object.key.ends_with('/') {
                        progress.advance(1);
                        return ProcessStatus::Output(None);
                    }
                    let outcome = async {
                        let path = local_path(&root, &relative)?;
                        client
                            .download_object(&cancel, &source, None, &path, object.size, ProgressHandle::disabled())
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
                            ProcessStatus::Output(Some(err.for_object(source.to_string())))
                        }
                    }
                }
            },
            None,
        );
        let errors = filter_some(&cancel, errors);
        error_consumer(&cancel, errors).await?;
        Ok(downloaded.load(Ordering::Relaxed))
    }
}

/// File under `root` for a `/`-separated key suffix.
///
/// Empty segments are dropped; `.` and `..` segments would leave `root` and
/// are rejected.
pub fn local_path(root: &Path, relative: &str) -> Result<PathBuf> {
    check_path(relative)?;
    let mut path = root.to_path_buf();
    let mut segments = relative.split('/').filter(|s| !s.is_empty()).peekable();
    if segments.peek().is_none() {
        return Err(FerryError::Usage(format!("no file name in key suffix '{}'", relative)));
    }
    segments.for_each(|segment| path.push(segment));
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_destination_rules() {
        let uri = ObjectUri::new("b", "dir/file.bin");
        assert_eq!(resolve_destination(&uri, None).unwrap(), PathBuf::from("file.bin"));

        let dir = tempdir().unwrap();
        assert_eq!(
            resolve_destination(&uri, Some(dir.path())).unwrap(),
            dir.path().join("file.bin")
        );

        let explicit = dir.path().join("renamed.bin");
        assert_eq!(resolve_destination(&uri, Some(explicit.as_path())).unwrap(), explicit);

        let slash = PathBuf::from("not-yet-created/");
        assert_eq!(
            resolve_destination(&uri, Some(slash.as_path())).unwrap(),
            PathBuf::from("not-yet-created/file.bin")
        );
    }

    #[test]
    fn test_local_path_stays_under_root() {
        let root = Path::new("out");
        assert_eq!(local_path(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
        assert_eq!(local_path(root, "/a//b.txt").unwrap(), root.join("a").join("b.txt"));
        assert!(matches!(local_path(root, "../etc/passwd"), Err(FerryError::Usage(_))));
        assert!(matches!(local_path(root, "a/./b"), Err(FerryError::Usage(_))));
        assert!(matches!(local_path(root, ""), Err(FerryError::Usage(_))));
    }

    #[test]
    fn test_resolve_destination_needs_object_name() {
        let uri = ObjectUri::new("b", "");
        assert!(matches!(resolve_destination(&uri, None), Err(FerryError::Usage(_))));
    }
}
