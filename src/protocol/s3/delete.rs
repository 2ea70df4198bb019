//! Single and bulk deletion

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::client::S3Client;
use super::http::{unwrap_response, HttpRequest};
use super::list::BucketObject;
use super::signer::SignOptions;
use super::xml::{self, FromXml, S3_NAMESPACE};
use crate::core::cancel::CancelToken;
use crate::core::filter::FilterParams;
use crate::core::generator::slice_item_consumer;
use crate::core::pipeline::{batch, parallel_process, ProcessStatus, Stage};
use crate::core::progress::{ProgressHandle, Units};
use crate::error::{FerryError, HttpError, MultiError, Result};
use crate::protocol::uri::ObjectUri;

/// Most keys one DeleteObjects request may carry
pub const MAX_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub struct DeleteAllParams {
    /// Bucket and prefix to empty
    pub prefix: ObjectUri,
    /// Keys per DeleteObjects request, `1..=1000`
    pub batch_size: usize,
    pub filters: FilterParams,
}

/// A key the server refused to delete
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteFailure {
    pub key: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// DeleteObjects response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteResult {
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(rename = "Error", default)]
    pub errors: Vec<DeleteFailure>,
}

impl FromXml for DeleteResult {
    fn from_xml(doc: &str) -> Result<Self> {
        let deleted = xml::elements(doc, "Deleted")
            .into_iter()
            .filter_map(|el| xml::text(el, "Key"))
            .collect();
        let errors = xml::elements(doc, "Error")
            .into_iter()
            .map(|el| {
                Ok(DeleteFailure {
                    key: xml::require_text(el, "Key")?,
                    code: xml::text(el, "Code").unwrap_or_default(),
                    message: xml::text(el, "Message").unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { deleted, errors })
    }
}

/// `Delete` request body; quiet mode returns only failures
pub fn delete_objects_body(keys: &[String]) -> String {
    let mut body = format!("<Delete xmlns=\"{}\"><Quiet>true</Quiet>", S3_NAMESPACE);
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&xml::escape(key));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    body
}

fn failure_error(bucket: &str, failure: DeleteFailure) -> FerryError {
    let mut err = HttpError::new(200, "200 OK");
    err.slug = failure.code;
    err.message = failure.message;
    FerryError::Http(err).for_object(ObjectUri::new(bucket, failure.key).to_string())
}

impl S3Client {
    /// Delete one object, optionally a specific version
    pub async fn delete(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        version_id: Option<&str>,
    ) -> Result<()> {
        uri.require_key()?;
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let request = HttpRequest::new(Method::DELETE, self.object_url(uri)?)
            .query_opt("versionId", version_id);
        self.send(&cancel, request, &SignOptions::default()).await?;
        info!(uri = %uri, "deleted");
        Ok(())
    }

    /// Delete a batch of keys in one request, returning per-key failures
    pub async fn delete_objects(
        &self,
        cancel: &CancelToken,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<FerryError>> {
        let request = HttpRequest::new(Method::POST, self.bucket_url(bucket)?)
            .query("delete", "")
            .header("content-type", "application/xml")?
            .body(delete_objects_body(keys));
        let response = self.send(cancel, request, &SignOptions::default()).await?;
        let result: Option<DeleteResult> = unwrap_response(response).await?;
        let failures = result.map(|r| r.errors).unwrap_or_default();
        debug!(keys = keys.len(), failed = failures.len(), "deleted batch");
        Ok(failures
            .into_iter()
            .map(|failure| failure_error(bucket, failure))
            .collect())
    }

    /// Delete every object under a prefix.
    ///
    /// Keys are listed, filtered and grouped into DeleteObjects batches sent
    /// concurrently. A failing key or batch does not stop the others; every
    /// failure is returned together. Returns the number of objects deleted.
    pub async fn delete_all(&self, cancel: &CancelToken, params: &DeleteAllParams) -> Result<u64> {
        check_batch_size(params.batch_size)?;
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let progress = self.progress(params.prefix.to_string(), 0, Units::Objects);
        let result = self.delete_tree(&cancel, params, progress.handle()).await;
        progress.finish(&result).await;
        result
    }

    async fn delete_tree(
        &self,
        cancel: &CancelToken,
        params: &DeleteAllParams,
        progress: ProgressHandle,
    ) -> Result<u64> {
        let cancel = cancel.child();
        let objects = self.object_generator(&cancel, &params.prefix, progress.clone());
        let objects = params.filters.apply(&cancel, objects)?;
        let (deleted, errors) = self
            .delete_stream(&cancel, &params.prefix.bucket, objects, params.batch_size, progress)
            .await?;
        errors.into_result()?;
        Ok(deleted)
    }

    /// Delete a stream of objects from `bucket` in concurrent batches.
    ///
    /// Returns the number deleted and the keys or batches that failed.
    pub(crate) async fn delete_stream(
        &self,
        cancel: &CancelToken,
        bucket: &str,
        objects: Stage<BucketObject>,
        batch_size: usize,
        progress: ProgressHandle,
    ) -> Result<(u64, MultiError)> {
        let batches = batch(cancel, objects, batch_size);

        let client = self.clone();
        let bucket = bucket.to_string();
        let outcomes = parallel_process(
            cancel,
            self.workers(),
            batches,
            move |cancel: CancelToken, objects: Vec<BucketObject>| {
                let client = client.clone();
                let bucket = bucket.clone();
                let progress = progress.clone();
                async move {
                    let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
                    let (deleted, failures) = match client.delete_objects(&cancel, &bucket, &keys).await {
                        Ok(failures) => (keys.len().saturating_sub(failures.len()), failures),
                        Err(err) => {
                            warn!(batch = keys.len(), error = %err, "delete batch failed");
                            let first = keys.first().map(String::as_str).unwrap_or_default();
                            let label = format!(
                                "batch of {} keys from {}",
                                keys.len(),
                                ObjectUri::new(bucket.as_str(), first)
                            );
                            (0, vec![err.for_object(label)])
                        }
                    };
                    progress.advance(deleted as u64);
                    if let Some(err) = failures.first() {
                        progress.fail(err.clone());
                    }
                    ProcessStatus::Output((deleted as u64, failures))
                }
            },
            None,
        );

        let outcomes = slice_item_consumer(cancel, outcomes).await?;
        let mut deleted = 0u64;
        let mut errors = MultiError::new();
        for (count, failures) in outcomes {
            deleted += count;
            failures.into_iter().for_each(|err| errors.push(err));
        }
        info!(deleted, failed = errors.len(), "bulk delete finished");
        Ok((deleted, errors))
    }
}

/// Keys per DeleteObjects request must be within `1..=MAX_DELETE_BATCH`
pub fn check_batch_size(batch_size: usize) -> Result<()> {
    if !(1..=MAX_DELETE_BATCH).contains(&batch_size) {
        return Err(FerryError::Usage(format!(
            "batch size must be between 1 and {}, got {}",
            MAX_DELETE_BATCH, batch_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_body_escapes_keys() {
        let body = delete_objects_body(&["a&b.txt".to_string(), "c<d".to_string()]);
        assert_eq!(
            body,
            "<Delete xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"><Quiet>true</Quiet>\
             <Object><Key>a&amp;b.txt</Key></Object>\
             <Object><Key>c&lt;d</Key></Object></Delete>"
        );
    }

    #[test]
    fn test_parse_delete_result() {
        let doc = r#"<DeleteResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Deleted><Key>sample1.txt</Key></Deleted>
  <Error><Key>sample2.txt</Key><Code>AccessDenied</Code><Message>Access Denied</Message></Error>
</DeleteResult>"#;
        let result = DeleteResult::from_xml(doc).unwrap();
        assert_eq!(result.deleted, vec!["sample1.txt"]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].code, "AccessDenied");

        let err = failure_error("b", result.errors[0].clone());
        assert_eq!(err.to_string(), "s3://b/sample2.txt: 200 OK (AccessDenied): Access Denied");
    }
}
