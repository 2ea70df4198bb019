//! Paginated ListObjectsV2

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};

use super::client::S3Client;
use super::http::{unwrap_response, HttpRequest};
use super::signer::SignOptions;
use super::xml::{self, FromXml};
use crate::core::cancel::CancelToken;
use crate::core::filter::{base_name, EntryName};
use crate::core::generator::slice_item_consumer;
use crate::core::pipeline::{emit, process, stage_channel, ProcessStatus, Stage};
use crate::core::progress::ProgressHandle;
use crate::error::{FerryError, Result};
use crate::protocol::uri::ObjectUri;

/// Largest page the service returns
pub const MAX_KEYS: u32 = 1000;

/// One object in a listing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BucketObject {
    pub key: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl BucketObject {
    fn from_xml_element(doc: &str) -> Result<Self> {
        let size = match xml::text(doc, "Size") {
            Some(size) => size
                .parse()
                .map_err(|_| FerryError::InvalidResponse(format!("invalid object size '{}'", size)))?,
            None => 0,
        };
        Ok(Self {
            key: xml::require_text(doc, "Key")?,
            size,
            etag: xml::text(doc, "ETag"),
            last_modified: xml::text(doc, "LastModified"),
            storage_class: xml::text(doc, "StorageClass"),
        })
    }
}

impl EntryName for BucketObject {
    fn entry_name(&self) -> &str {
        base_name(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonPrefix {
    pub prefix: String,
}

/// One ListObjectsV2 response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListPage {
    #[serde(default)]
    pub contents: Vec<BucketObject>,
    #[serde(default)]
    pub common_prefixes: Vec<CommonPrefix>,
    #[serde(default)]
    pub is_truncated: bool,
    #[serde(default)]
    pub next_continuation_token: Option<String>,
}

impl FromXml for ListPage {
    fn from_xml(doc: &str) -> Result<Self> {
        let contents = xml::elements(doc, "Contents")
            .into_iter()
            .map(BucketObject::from_xml_element)
            .collect::<Result<Vec<_>>>()?;
        let common_prefixes = xml::elements(doc, "CommonPrefixes")
            .into_iter()
            .filter_map(|el| xml::text(el, "Prefix"))
            .map(|prefix| CommonPrefix { prefix })
            .collect();
        Ok(Self {
            contents,
            common_prefixes,
            is_truncated: xml::text(doc, "IsTruncated").is_some_and(|v| v == "true"),
            next_continuation_token: xml::text(doc, "NextContinuationToken")
                .filter(|t| !t.is_empty()),
        })
    }
}

/// An object or, in non-recursive listings, a "directory"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry {
    Object(BucketObject),
    Prefix(String),
}

impl ListEntry {
    pub fn key(&self) -> &str {
        match self {
            ListEntry::Object(object) => &object.key,
            ListEntry::Prefix(prefix) => prefix,
        }
    }
}

impl EntryName for ListEntry {
    fn entry_name(&self) -> &str {
        base_name(self.key())
    }
}

/// Listing options
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// List every key under the prefix instead of one level
    pub recursive: bool,
    /// Page size, capped at [`MAX_KEYS`]
    pub max_keys: Option<u32>,
}

impl S3Client {
    /// Fetch one page of keys under `uri`'s prefix
    pub async fn list_page(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        params: &ListParams,
        continuation_token: Option<&str>,
    ) -> Result<ListPage> {
        let max_keys = params.max_keys.unwrap_or(MAX_KEYS).clamp(1, MAX_KEYS);
        let mut request = HttpRequest::new(Method::GET, self.bucket_url(&uri.bucket)?)
            .query("list-type", "2")
            .query("max-keys", max_keys.to_string())
            .query("prefix", uri.dir_prefix())
            .query_opt("continuation-token", continuation_token);
        if !params.recursive {
            request = request.query("delimiter", "/");
        }

        let response = self.send(cancel, request, &SignOptions::default()).await?;
        let page: Option<ListPage> = unwrap_response(response).await?;
        Ok(page.unwrap_or_default())
    }

    /// Stream every entry under `uri`'s prefix, fetching pages lazily.
    ///
    /// Each page grows `progress`'s total by its object count. A failed page
    /// cancels `cancel` with the error, so the consumer reports it.
    pub fn list_generator(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        params: ListParams,
        progress: ProgressHandle,
    ) -> Stage<ListEntry> {
        let (tx, rx) = stage_channel();
        let client = self.clone();
        let cancel = cancel.clone();
        let uri = uri.clone();

        tokio::spawn(async move {
            let mut token: Option<String> = None;
            let mut pages = 0usize;
            loop {
                let page = match client
                    .list_page(&cancel, &uri, &params, token.as_deref())
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(uri = %uri, error = %err, "listing failed");
                        cancel.cancel(err.for_object(uri.to_string()));
                        return;
                    }
                };
                pages += 1;
                progress.grow(page.contents.len() as u64);

                let prefixes = page.common_prefixes.into_iter().map(|p| ListEntry::Prefix(p.prefix));
                let objects = page.contents.into_iter().map(ListEntry::Object);
                for entry in prefixes.chain(objects) {
                    if !emit(&cancel, &tx, entry).await {
                        debug!("listing stopped early");
                        return;
                    }
                }

                match page.next_continuation_token {
                    Some(next) if page.is_truncated => token = Some(next),
                    _ => break,
                }
            }
            debug!(uri = %uri, pages, "listing complete");
        });

        rx
    }

    /// Stream every object under `uri`'s prefix, recursively
    pub fn object_generator(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        progress: ProgressHandle,
    ) -> Stage<BucketObject> {
        let params = ListParams {
            recursive: true,
            ..Default::default()
        };
        let entries = self.list_generator(cancel, uri, params, progress);
        process(
            cancel,
            entries,
            |_cancel, entry: ListEntry| async move {
                match entry {
                    ListEntry::Object(object) => ProcessStatus::Output(object),
                    ListEntry::Prefix(_) => ProcessStatus::Skip,
                }
            },
            None,
        )
    }

    /// Collect every entry under `uri`'s prefix
    pub async fn list_all(
        &self,
        cancel: &CancelToken,
        uri: &ObjectUri,
        params: ListParams,
    ) -> Result<Vec<ListEntry>> {
        let cancel = self.operation_token(cancel);
        let _timer = cancel.drop_guard();
        let entries = self.list_generator(&cancel, uri, params, ProgressHandle::disabled());
        slice_item_consumer(&cancel, entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bucket</Name>
  <Prefix>photos/</Prefix>
  <KeyCount>2</KeyCount>
  <MaxKeys>2</MaxKeys>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents>
    <Key>photos/2006/a&amp;b.jpg</Key>
    <LastModified>2009-10-12T17:50:30.000Z</LastModified>
    <ETag>&quot;fba9dede5f27731c9771645a39863328&quot;</ETag>
    <Size>434234</Size>
    <StorageClass>STANDARD</StorageClass>
  </Contents>
  <CommonPrefixes>
    <Prefix>photos/2007/</Prefix>
  </CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn test_parse_list_page() {
        let page = ListPage::from_xml(PAGE).unwrap();
        assert!(page.is_truncated);
        assert_eq!(
            page.next_continuation_token.as_deref(),
            Some("1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=")
        );
        assert_eq!(page.contents.len(), 1);
        let object = &page.contents[0];
        assert_eq!(object.key, "photos/2006/a&b.jpg");
        assert_eq!(object.size, 434234);
        assert_eq!(object.etag.as_deref(), Some("\"fba9dede5f27731c9771645a39863328\""));
        assert_eq!(
            page.common_prefixes,
            vec![CommonPrefix {
                prefix: "photos/2007/".to_string()
            }]
        );
    }

    #[test]
    fn test_empty_listing() {
        let page = ListPage::from_xml("<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>")
            .unwrap();
        assert!(page.contents.is_empty());
        assert!(!page.is_truncated);
        assert!(page.next_continuation_token.is_none());
    }

    #[test]
    fn test_entry_names() {
        let prefix = ListEntry::Prefix("photos/2007/".to_string());
        assert_eq!(prefix.entry_name(), "2007");
        let page = ListPage::from_xml(PAGE).unwrap();
        let object = ListEntry::Object(page.contents[0].clone());
        assert_eq!(object.entry_name(), "a&b.jpg");
    }
}
