//! Moves between locations in object storage
//!
//! A move is a server-side copy followed by deletion of the source. Sources
//! are only deleted once their copy has completed, so a failed move leaves
//! the original in place.

use tracing::{info, warn};

use super::client::S3Client;
use super::copy::{CopyAllParams, CopyParams, CopyResult};
use super::delete::check_batch_size;
use crate::core::cancel::CancelToken;
use crate::core::filter::FilterParams;
use crate::core::generator::slice_item_generator;
use crate::core::progress::{ProgressHandle, Units};
use crate::error::{FerryError, Result};
use crate::protocol::uri::ObjectUri;

#[derive(Debug, Clone)]
pub struct MoveParams {
    pub source: ObjectUri,
    /// A key, or a prefix the source's file name is appended to
    pub destination: ObjectUri,
    pub version_id: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MoveAllParams {
    pub source: ObjectUri,
    pub destination: ObjectUri,
    pub filters: FilterParams,
    pub storage_class: Option<String>,
    /// Keys per DeleteObjects request when removing the sources
    pub batch_size: usize,
}

impl S3Client {
    /// Move one object: copy it, then delete the source
    pub async fn move_object(&self, cancel: &CancelToken, params: &MoveParams) -> Result<CopyResult> {
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        params.source.require_key()?;
        let destination = if params.destination.is_prefix() {
            params.destination.join(params.source.file_name())
        } else {
            params.destination.clone()
        };
        if destination == params.source {
            return Err(FerryError::Usage(format!(
                "source and destination are the same object: {}",
                params.source
            )));
        }

        let copy = CopyParams {
            source: params.source.clone(),
            destination,
            version_id: params.version_id.clone(),
            storage_class: params.storage_class.clone(),
        };
        let copied = self.copy(&cancel, &copy).await?;
        self.delete(&cancel, &params.source, params.version_id.as_deref())
            .await?;
        info!(source = %params.source, destination = %copied.destination, "moved");
        Ok(copied)
    }

    /// Move every object under a prefix to another prefix.
    ///
    /// Objects are copied as by [`S3Client::copy_all`]; the sources of the
    /// successful copies are then deleted in batches. Failures of either
    /// step are returned together. Returns the number of objects moved.
    pub async fn move_all(&self, cancel: &CancelToken, params: &MoveAllParams) -> Result<u64> {
        check_batch_size(params.batch_size)?;
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let progress = self.progress(params.source.to_string(), 0, Units::Objects);
        let result = async {
            let copy = CopyAllParams {
                source: params.source.clone(),
                destination: params.destination.clone(),
                filters: params.filters.clone(),
                storage_class: params.storage_class.clone(),
            };
            let outcome = self.copy_tree(&cancel, &copy, progress.handle()).await?;
            let mut errors = outcome.errors;
            if !errors.is_empty() {
                warn!(failed = errors.len(), "some copies failed, their sources are kept");
            }

            let sources = slice_item_generator(&cancel, outcome.copied);
            let (moved, failures) = self
                .delete_stream(
                    &cancel,
                    &params.source.bucket,
                    sources,
                    params.batch_size,
                    ProgressHandle::disabled(),
                )
                .await?;
            errors.extend(failures);
            info!(moved, failed = errors.len(), "bulk move finished");
            errors.into_result()?;
            Ok(moved)
        }
        .await;
        progress.finish(&result).await;
        result
    }
}
