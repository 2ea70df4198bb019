//! HTTP request/response contract between the engine and the network
//!
//! The engine builds [`HttpRequest`] values, signs them, and hands them to an
//! [`HttpTransport`]. Response bodies are streams so ranged downloads can be
//! written as they arrive. Dropping a pending `send` future or a body stream
//! aborts the underlying connection, which is what lets cancellation reach
//! in-flight requests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::trace;
use url::Url;

use super::signer::encode_query;
use super::xml::{self, FromXml};
use crate::error::{FerryError, HttpError, Result};

/// Streaming response body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An outgoing request. The query is kept apart from the URL so the signer
/// and the wire use the same encoding.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a query parameter when `value` is present
    pub fn query_opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    /// Set a header; `name` must be a lowercase static header name
    pub fn header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            FerryError::Usage(format!("invalid value for header {}: {}", name, e))
        })?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    /// Set a header when `value` is present
    pub fn header_opt(self, name: &'static str, value: Option<&str>) -> Result<Self> {
        match value {
            Some(value) => self.header(name, value),
            None => Ok(self),
        }
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// URL with the query string appended, encoded the way it is signed
    pub fn full_url(&self) -> Url {
        let mut url = self.url.clone();
        if self.query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&encode_query(&self.query)));
        }
        url
    }
}

/// A received response with a streaming body
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ByteStream,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ByteStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response with a fully buffered body
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let body = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self::new(status, headers, body)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Media type without parameters, lowercased
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
    }

    /// e.g. "404 Not Found"
    pub fn status_line(&self) -> String {
        match self.status.canonical_reason() {
            Some(reason) => format!("{} {}", self.status.as_u16(), reason),
            None => self.status.as_u16().to_string(),
        }
    }

    pub fn into_stream(self) -> ByteStream {
        self.body
    }

    /// Buffer the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// Sends requests. Implementations must abort the exchange when the returned
/// future or the body stream is dropped.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production transport over `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Client with an optional connect timeout
    pub fn new(connect_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ));
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FerryError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.full_url();
        let response = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FerryError::from))
            .boxed();
        Ok(HttpResponse::new(status, headers, body))
    }
}

#[derive(Debug, Deserialize)]
struct JsonErrorBody {
    #[serde(alias = "Code", alias = "slug")]
    code: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

fn is_xml_type(content_type: &str) -> bool {
    content_type == "application/xml" || content_type == "text/xml"
}

/// Build a structured error from a failed response.
///
/// Some servers label XML error documents as JSON, so XML is tried for XML,
/// JSON and missing content types alike.
pub fn parse_http_error(
    status: u16,
    status_line: String,
    content_type: Option<&str>,
    body: &[u8],
) -> HttpError {
    let mut err = HttpError::new(status, status_line);
    let text = String::from_utf8_lossy(body);

    let try_xml = content_type.is_none_or(|ct| is_xml_type(ct) || ct == "application/json");
    if try_xml {
        let code = xml::text(&text, "Code").filter(|c| !c.is_empty());
        let message = xml::text(&text, "Message").filter(|m| !m.is_empty());
        if code.is_some() || message.is_some() {
            if let Some(code) = code {
                err.slug = code;
            }
            if let Some(message) = message {
                err.message = message;
            }
            return err;
        }
    }

    if content_type == Some("application/json") {
        if let Ok(parsed) = serde_json::from_slice::<JsonErrorBody>(body) {
            if let Some(code) = parsed.code {
                err.slug = code;
            }
            if let Some(message) = parsed.message {
                err.message = message;
            }
        }
    }
    err
}

/// Pass 2xx responses through; turn anything else into [`FerryError::Http`]
pub async fn check_response(response: HttpResponse) -> Result<HttpResponse> {
    if response.status.is_success() {
        return Ok(response);
    }
    let status = response.status.as_u16();
    let status_line = response.status_line();
    let content_type = response.content_type();
    let body = response.bytes().await.unwrap_or_default();
    let err = parse_http_error(status, status_line, content_type.as_deref(), &body);
    trace!(status, slug = %err.slug, "request failed");
    Err(err.into())
}

/// True when an XML body's root element is `<Error>`
pub fn is_error_document(text: &str) -> bool {
    let mut rest = text.trim_start();
    if rest.starts_with("<?xml") {
        rest = match rest.find("?>") {
            Some(end) => rest[end + 2..].trim_start(),
            None => rest,
        };
    }
    rest.starts_with("<Error>") || rest.starts_with("<Error ")
}

/// Decode a successful response body.
///
/// `204 No Content` and empty bodies yield `None`. JSON is decoded when the
/// server says so; anything else, including a missing Content-Type, is read
/// as XML. An XML `<Error>` document is a failure even under a 2xx status.
pub async fn unwrap_response<T>(response: HttpResponse) -> Result<Option<T>>
where
    T: FromXml + DeserializeOwned,
{
    if response.status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let status = response.status.as_u16();
    let status_line = response.status_line();
    let content_type = response.content_type();
    let body = response.bytes().await?;
    if body.is_empty() {
        return Ok(None);
    }

    if content_type.as_deref() == Some("application/json") {
        return serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FerryError::InvalidResponse(format!("invalid JSON body: {}", e)));
    }

    let text = std::str::from_utf8(&body)
        .map_err(|e| FerryError::InvalidResponse(format!("response is not UTF-8: {}", e)))?;
    if is_error_document(text) {
        return Err(parse_http_error(status, status_line, Some("application/xml"), &body).into());
    }
    T::from_xml(text).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        #[serde(rename = "Value")]
        value: String,
    }

    impl FromXml for Sample {
        fn from_xml(doc: &str) -> Result<Self> {
            Ok(Self {
                value: xml::require_text(doc, "Value")?,
            })
        }
    }

    fn response(status: u16, content_type: Option<&str>, body: &str) -> HttpResponse {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        }
        HttpResponse::from_bytes(
            StatusCode::from_u16(status).unwrap(),
            headers,
            Bytes::from(body.to_string()),
        )
    }

    #[test]
    fn test_full_url_encodes_query() {
        let req = HttpRequest::new(Method::GET, Url::parse("https://h/b").unwrap())
            .query("prefix", "a b/c")
            .query("list-type", "2");
        assert_eq!(
            req.full_url().as_str(),
            "https://h/b?list-type=2&prefix=a%20b%2Fc"
        );
    }

    #[test]
    fn test_header_rejects_invalid_value() {
        let req = HttpRequest::new(Method::GET, Url::parse("https://h/").unwrap());
        assert!(matches!(
            req.header("x-amz-meta-bad", "line\nbreak"),
            Err(FerryError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn test_xml_error_body() {
        let resp = response(
            404,
            Some("application/xml"),
            "<Error><Code>NoSuchKey</Code><Message>The key does not exist</Message></Error>",
        );
        let err = check_response(resp).await.err().unwrap();
        match err {
            FerryError::Http(http) => {
                assert_eq!(http.status, 404);
                assert_eq!(http.slug, "NoSuchKey");
                assert_eq!(http.message, "The key does not exist");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_xml_error_labelled_json() {
        let resp = response(
            403,
            Some("application/json; charset=utf-8"),
            "<Error><Code>AccessDenied</Code><Message>denied</Message></Error>",
        );
        let err = check_response(resp).await.err().unwrap();
        assert!(matches!(err, FerryError::Http(h) if h.slug == "AccessDenied"));
    }

    #[tokio::test]
    async fn test_json_error_body() {
        let resp = response(
            400,
            Some("application/json"),
            r#"{"slug":"invalid","message":"bad input"}"#,
        );
        let err = check_response(resp).await.err().unwrap();
        assert!(matches!(err, FerryError::Http(h) if h.slug == "invalid" && h.message == "bad input"));
    }

    #[tokio::test]
    async fn test_unparseable_error_uses_status_line() {
        let resp = response(502, Some("text/html"), "<html>bad gateway</html>");
        let err = check_response(resp).await.err().unwrap();
        assert_eq!(err.to_string(), "502 Bad Gateway");
    }

    #[tokio::test]
    async fn test_unwrap_defaults_to_xml_without_content_type() {
        let resp = response(200, None, "<R><Value>42</Value></R>");
        let sample: Option<Sample> = unwrap_response(resp).await.unwrap();
        assert_eq!(sample.unwrap().value, "42");
    }

    #[tokio::test]
    async fn test_unwrap_json() {
        let resp = response(200, Some("application/json"), r#"{"Value":"7"}"#);
        let sample: Option<Sample> = unwrap_response(resp).await.unwrap();
        assert_eq!(sample.unwrap().value, "7");
    }

    #[tokio::test]
    async fn test_unwrap_no_content() {
        let resp = response(204, None, "");
        let sample: Option<Sample> = unwrap_response(resp).await.unwrap();
        assert!(sample.is_none());
    }

    #[tokio::test]
    async fn test_unwrap_error_document_under_200() {
        let resp = response(
            200,
            Some("application/xml"),
            "<?xml version=\"1.0\"?>\n<Error><Code>InternalError</Code><Message>retry</Message></Error>",
        );
        let result: Result<Option<Sample>> = unwrap_response(resp).await;
        assert!(matches!(result, Err(FerryError::Http(h)) if h.status == 200 && h.slug == "InternalError"));
    }
}
