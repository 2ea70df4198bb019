//! In-memory S3-compatible service for tests
//!
//! Implements the subset of the API the engine uses: object PUT/GET/HEAD/
//! DELETE with ranges, multipart initiate/part/copy-part/complete/abort,
//! DeleteObjects and ListObjectsV2. Failures and part latency can be injected.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, RANGE};
use reqwest::{Method, StatusCode};

use super::http::{HttpRequest, HttpResponse, HttpTransport};
use super::xml;
use crate::error::Result;

/// Size of the pieces a response body is streamed in
const BODY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub etag: String,
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    storage_class: Option<String>,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    completions: Vec<Vec<u32>>,
    aborted: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockS3 {
    state: Mutex<State>,
    initiate_calls: AtomicUsize,
    requests: AtomicUsize,
    fail_parts: Mutex<HashSet<u32>>,
    deny_deletes: Mutex<HashSet<String>>,
    part_delay: Option<Duration>,
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

fn decode(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

fn response(status: StatusCode, headers: HeaderMap, data: Bytes) -> HttpResponse {
    let pieces: Vec<Result<Bytes>> = (0..data.len())
        .step_by(BODY_CHUNK)
        .map(|start| Ok(data.slice(start..(start + BODY_CHUNK).min(data.len()))))
        .collect();
    HttpResponse::new(status, headers, stream::iter(pieces).boxed())
}

fn empty(status: StatusCode) -> HttpResponse {
    response(status, HeaderMap::new(), Bytes::new())
}

fn xml_response(status: StatusCode, body: String) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
    response(status, headers, Bytes::from(body))
}

fn error(status: StatusCode, code: &str, message: &str) -> HttpResponse {
    xml_response(
        status,
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{}</Message></Error>",
            code,
            xml::escape(message)
        ),
    )
}

fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

/// `bytes=start-end`, clamped to `len`
fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = end.parse().ok()?;
    let end = end.min(len.checked_sub(1)?);
    (start <= end).then_some((start, end))
}

impl MockS3 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay part uploads so that lower part numbers finish last
    pub fn with_part_delay(mut self, step: Duration) -> Self {
        self.part_delay = Some(step);
        self
    }

    /// Make every attempt to upload or copy part `n` fail with a 500
    pub fn fail_part(&self, n: u32) {
        self.fail_parts.lock().unwrap().insert(n);
    }

    /// Refuse to delete `key` in DeleteObjects requests
    pub fn deny_delete(&self, key: &str) {
        self.deny_deletes.lock().unwrap().insert(key.to_string());
    }

    pub fn put_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.store(bucket, key, data.into(), None);
    }

    pub fn put_typed_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>, content_type: &str) {
        self.store(bucket, key, data.into(), Some(content_type.to_string()));
    }

    fn store(&self, bucket: &str, key: &str, data: Bytes, content_type: Option<String>) {
        let object = StoredObject {
            etag: etag_of(&data),
            data,
            content_type,
            storage_class: None,
        };
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), object);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Part numbers of each completion request, in the order received
    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.state.lock().unwrap().completions.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        if header(request, AUTHORIZATION.as_str()).is_none() {
            return error(StatusCode::FORBIDDEN, "AccessDenied", "request is not signed");
        }
        if let Some(md5) = header(request, "content-md5") {
            if md5 != BASE64.encode(Md5::digest(&request.body)) {
                return error(StatusCode::BAD_REQUEST, "BadDigest", "Content-MD5 mismatch");
            }
        }

        let path = request.url.path().trim_start_matches('/');
        let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
        let (bucket, key) = (decode(bucket), decode(key));
        let query: HashMap<&str, &str> = request
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let method = &request.method;
        if key.is_empty() {
            return match *method {
                Method::GET if query.contains_key("list-type") => self.list(&bucket, &query),
                Method::POST if query.contains_key("delete") => self.delete_objects(&bucket, request),
                _ => error(StatusCode::BAD_REQUEST, "InvalidRequest", "unsupported bucket request"),
            };
        }

        match (method, query.get("uploadId")) {
            (&Method::POST, _) if query.contains_key("uploads") => self.initiate(&bucket, &key, request),
            (&Method::PUT, Some(id)) => self.upload_part(id, &query, request),
            (&Method::POST, Some(id)) => self.complete(id, request),
            (&Method::DELETE, Some(id)) => self.abort(id),
            (&Method::PUT, None) => self.put(&bucket, &key, request),
            (&Method::GET, None) => self.get(&bucket, &key, request),
            (&Method::HEAD, None) => self.head(&bucket, &key),
            (&Method::DELETE, None) => {
                self.state
                    .lock()
                    .unwrap()
                    .objects
                    .remove(&(bucket, key));
                empty(StatusCode::NO_CONTENT)
            }
            _ => error(StatusCode::BAD_REQUEST, "InvalidRequest", "unsupported request"),
        }
    }

    /// Source object named by `x-amz-copy-source`, its data cut to `x-amz-copy-source-range`
    fn copy_source(&self, request: &HttpRequest) -> std::result::Result<StoredObject, HttpResponse> {
        let Some(source) = header(request, "x-amz-copy-source") else {
            return Err(error(StatusCode::BAD_REQUEST, "InvalidRequest", "no copy source"));
        };
        let source = source.split('?').next().unwrap_or(source);
        let source = decode(source);
        let (bucket, key) = source.split_once('/').unwrap_or((&source, ""));
        let Some(object) = self
            .state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
        else {
            return Err(error(StatusCode::NOT_FOUND, "NoSuchKey", "copy source does not exist"));
        };
        match header(request, "x-amz-copy-source-range") {
            Some(range) => match parse_range(range, object.data.len()) {
                Some((start, end)) => Ok(StoredObject {
                    data: object.data.slice(start..=end),
                    ..object
                }),
                None => Err(error(StatusCode::RANGE_NOT_SATISFIABLE, "InvalidRange", range)),
            },
            None => Ok(object),
        }
    }

    fn put(&self, bucket: &str, key: &str, request: &HttpRequest) -> HttpResponse {
        let copying = request.headers.contains_key("x-amz-copy-source");
        // A copy keeps the source's content type
        let (data, content_type) = if copying {
            match self.copy_source(request) {
                Ok(source) => (source.data, source.content_type),
                Err(response) => return response,
            }
        } else {
            (
                request.body.clone(),
                header(request, "content-type").map(str::to_string),
            )
        };
        let object = StoredObject {
            etag: etag_of(&data),
            data,
            content_type,
            storage_class: header(request, "x-amz-storage-class").map(str::to_string),
        };
        let etag = object.etag.clone();
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), object);

        if copying {
            return xml_response(
                StatusCode::OK,
                format!(
                    "<CopyObjectResult><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>{}</ETag></CopyObjectResult>",
                    xml::escape(&etag)
                ),
            );
        }
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_str(&etag).unwrap());
        response(StatusCode::OK, headers, Bytes::new())
    }

    fn get(&self, bucket: &str, key: &str, request: &HttpRequest) -> HttpResponse {
        let Some(object) = self.object(bucket, key) else {
            return error(StatusCode::NOT_FOUND, "NoSuchKey", "The specified key does not exist.");
        };
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_str(&object.etag).unwrap());
        match header(request, RANGE.as_str()) {
            Some(range) => match parse_range(range, object.data.len()) {
                Some((start, end)) => response(
                    StatusCode::PARTIAL_CONTENT,
                    headers,
                    object.data.slice(start..=end),
                ),
                None => error(StatusCode::RANGE_NOT_SATISFIABLE, "InvalidRange", range),
            },
            None => response(StatusCode::OK, headers, object.data),
        }
    }

    fn head(&self, bucket: &str, key: &str) -> HttpResponse {
        let Some(object) = self.object(bucket, key) else {
            return empty(StatusCode::NOT_FOUND);
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(object.data.len()));
        headers.insert(ETAG, HeaderValue::from_str(&object.etag).unwrap());
        headers.insert(
            "last-modified",
            HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"),
        );
        if let Some(content_type) = &object.content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        }
        if let Some(class) = &object.storage_class {
            headers.insert("x-amz-storage-class", HeaderValue::from_str(class).unwrap());
        }
        response(StatusCode::OK, headers, Bytes::new())
    }

    fn initiate(&self, bucket: &str, key: &str, request: &HttpRequest) -> HttpResponse {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: header(request, "content-type").map(str::to_string),
                storage_class: header(request, "x-amz-storage-class").map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        xml_response(
            StatusCode::OK,
            format!(
                "<InitiateMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                xml::escape(bucket),
                xml::escape(key),
                upload_id
            ),
        )
    }

    fn upload_part(&self, upload_id: &str, query: &HashMap<&str, &str>, request: &HttpRequest) -> HttpResponse {
        let Some(part_number) = query.get("partNumber").and_then(|n| n.parse::<u32>().ok()) else {
            return error(StatusCode::BAD_REQUEST, "InvalidArgument", "bad part number");
        };
        if self.fail_parts.lock().unwrap().contains(&part_number) {
            return error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", "injected part failure");
        }
        let copying = request.headers.contains_key("x-amz-copy-source");
        let data = if copying {
            match self.copy_source(request) {
                Ok(source) => source.data,
                Err(response) => return response,
            }
        } else {
            request.body.clone()
        };

        let etag = etag_of(&data);
        let mut state = self.state.lock().unwrap();
        let Some(upload) = state.uploads.get_mut(upload_id) else {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload", "upload does not exist");
        };
        upload.parts.insert(part_number, (etag.clone(), data));

        if copying {
            return xml_response(
                StatusCode::OK,
                format!(
                    "<CopyPartResult><LastModified>2024-01-01T00:00:00.000Z</LastModified><ETag>{}</ETag></CopyPartResult>",
                    xml::escape(&etag)
                ),
            );
        }
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, HeaderValue::from_str(&etag).unwrap());
        response(StatusCode::OK, headers, Bytes::new())
    }

    fn complete(&self, upload_id: &str, request: &HttpRequest) -> HttpResponse {
        let body = String::from_utf8_lossy(&request.body).into_owned();
        let listed: Vec<(u32, String)> = xml::elements(&body, "Part")
            .into_iter()
            .filter_map(|part| {
                let number = xml::text(part, "PartNumber")?.parse().ok()?;
                Some((number, xml::text(part, "ETag")?))
            })
            .collect();
        if listed.is_empty() {
            return error(StatusCode::BAD_REQUEST, "MalformedXML", "no parts");
        }
        if listed.windows(2).any(|w| w[0].0 >= w[1].0) {
            return error(StatusCode::BAD_REQUEST, "InvalidPartOrder", "parts are not in ascending order");
        }

        let mut state = self.state.lock().unwrap();
        let Some(upload) = state.uploads.get(upload_id) else {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload", "upload does not exist");
        };
        let mut data = Vec::new();
        for (number, etag) in &listed {
            match upload.parts.get(number) {
                Some((stored, bytes)) if stored == etag => data.extend_from_slice(bytes),
                _ => return error(StatusCode::BAD_REQUEST, "InvalidPart", "unknown part or ETag"),
            }
        }
        let Some(upload) = state.uploads.remove(upload_id) else {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload", "upload does not exist");
        };

        let etag = format!("\"{}-{}\"", hex::encode(Md5::digest(&data)), listed.len());
        state.completions.push(listed.iter().map(|(n, _)| *n).collect());
        state.objects.insert(
            (upload.bucket.clone(), upload.key.clone()),
            StoredObject {
                data: Bytes::from(data),
                etag: etag.clone(),
                content_type: upload.content_type,
                storage_class: upload.storage_class,
            },
        );
        xml_response(
            StatusCode::OK,
            format!(
                "<CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><ETag>{}</ETag></CompleteMultipartUploadResult>",
                xml::escape(&upload.bucket),
                xml::escape(&upload.key),
                xml::escape(&etag)
            ),
        )
    }

    fn abort(&self, upload_id: &str) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        if state.uploads.remove(upload_id).is_none() {
            return error(StatusCode::NOT_FOUND, "NoSuchUpload", "upload does not exist");
        }
        state.aborted.push(upload_id.to_string());
        empty(StatusCode::NO_CONTENT)
    }

    fn delete_objects(&self, bucket: &str, request: &HttpRequest) -> HttpResponse {
        let body = String::from_utf8_lossy(&request.body).into_owned();
        let keys: Vec<String> = xml::elements(&body, "Object")
            .into_iter()
            .filter_map(|object| xml::text(object, "Key"))
            .collect();
        let denied = self.deny_deletes.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();

        let mut result = String::from("<DeleteResult>");
        for key in keys {
            if denied.contains(&key) {
                result.push_str(&format!(
                    "<Error><Key>{}</Key><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
                    xml::escape(&key)
                ));
            } else {
                state.objects.remove(&(bucket.to_string(), key));
            }
        }
        result.push_str("</DeleteResult>");
        xml_response(StatusCode::OK, result)
    }

    fn list(&self, bucket: &str, query: &HashMap<&str, &str>) -> HttpResponse {
        let prefix = query.get("prefix").copied().unwrap_or("");
        let delimiter = query.get("delimiter").copied();
        let max_keys: usize = query
            .get("max-keys")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);
        let after = query.get("continuation-token").copied().unwrap_or("");

        let state = self.state.lock().unwrap();
        // Entries sorted by name; a common prefix is an entry of its own
        let mut entries: BTreeMap<String, Option<StoredObject>> = BTreeMap::new();
        let mut prefixes: BTreeSet<String> = BTreeSet::new();
        for ((b, key), object) in &state.objects {
            if b != bucket || !key.starts_with(prefix) {
                continue;
            }
            let rest = &key[prefix.len()..];
            match delimiter.and_then(|d| rest.find(d).map(|i| i + d.len())) {
                Some(end) => {
                    prefixes.insert(format!("{}{}", prefix, &rest[..end]));
                }
                None => {
                    entries.insert(key.clone(), Some(object.clone()));
                }
            }
        }
        for common in prefixes {
            entries.insert(common, None);
        }

        let remaining: Vec<_> = entries
            .into_iter()
            .filter(|(name, _)| name.as_str() > after)
            .collect();
        let truncated = remaining.len() > max_keys;
        let page = &remaining[..remaining.len().min(max_keys)];

        let mut body = format!(
            "<ListBucketResult><Name>{}</Name><Prefix>{}</Prefix><KeyCount>{}</KeyCount><IsTruncated>{}</IsTruncated>",
            xml::escape(bucket),
            xml::escape(prefix),
            page.len(),
            truncated
        );
        if truncated {
            if let Some((last, _)) = page.last() {
                body.push_str(&format!(
                    "<NextContinuationToken>{}</NextContinuationToken>",
                    xml::escape(last)
                ));
            }
        }
        for (name, object) in page {
            match object {
                Some(object) => body.push_str(&format!(
                    "<Contents><Key>{}</Key><Size>{}</Size><ETag>{}</ETag><StorageClass>STANDARD</StorageClass></Contents>",
                    xml::escape(name),
                    object.data.len(),
                    xml::escape(&object.etag)
                )),
                None => body.push_str(&format!(
                    "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
                    xml::escape(name)
                )),
            }
        }
        body.push_str("</ListBucketResult>");
        xml_response(StatusCode::OK, body)
    }
}

#[async_trait]
impl HttpTransport for MockS3 {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(step) = self.part_delay {
            let part = request
                .query
                .iter()
                .find(|(k, _)| k == "partNumber")
                .and_then(|(_, v)| v.parse::<u32>().ok());
            if let Some(part) = part {
                tokio::time::sleep(step * 16u32.saturating_sub(part.min(16))).await;
            }
        }
        Ok(self.handle(&request))
    }
}
