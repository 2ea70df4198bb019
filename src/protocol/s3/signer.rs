//! AWS Signature Version 4 request signing
//!
//! Two forms are produced from the same canonicalization:
//!
//! - an `Authorization` header, for requests sent by the engine
//! - a presigned URL, carrying the signature in its query string
//!
//! The canonical request is
//! `method \n path \n query \n headers \n signed-names \n payload-hash`, the
//! string to sign is `algorithm \n timestamp \n scope \n sha256(canonical)`,
//! and the signing key is an HMAC chain over date, region, service and the
//! `aws4_request` terminator.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use md5::Md5;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tracing::trace;
use url::Url;

use super::http::HttpRequest;
use crate::config::Credentials;
use crate::error::{FerryError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// SHA-256 of the empty string
pub const EMPTY_PAYLOAD_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
pub const SERVICE: &str = "s3";

pub const MIN_PRESIGN_EXPIRY: Duration = Duration::from_secs(1);
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const LONG_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const SHORT_DATE_FORMAT: &str = "%Y%m%d";
const SCOPE_TERMINATOR: &str = "aws4_request";
const KEY_PREFIX: &str = "AWS4";

const X_AMZ_DATE: &str = "x-amz-date";
const X_AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";
const CONTENT_MD5: &str = "content-md5";

/// Headers never included in a signature; proxies and clients rewrite them
const UNSIGNED_HEADERS: &[&str] = &[
    "authorization",
    "accept-encoding",
    "amz-sdk-invocation-id",
    "amz-sdk-request",
    "user-agent",
    "x-amzn-trace-id",
    "expect",
    "content-length",
];

/// Everything but the RFC 3986 unreserved characters
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// As [`URI_ENCODE_SET`], keeping path separators
const PATH_ENCODE_SET: &AsciiSet = &URI_ENCODE_SET.remove(b'/');

/// AWS URI encoding of a single query key or value
pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

/// AWS URI encoding of an object path, keeping `/`
pub fn encode_path(path: &str) -> String {
    utf8_percent_encode(path, PATH_ENCODE_SET).to_string()
}

/// Encode and sort query pairs by key, then value
pub fn encode_query(pairs: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// `Host` header value for `url`, with the port only when it is explicit
pub fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| FerryError::Signing(format!("URL has no host: {}", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| FerryError::Signing(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Per-request signing inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParameters {
    pub algorithm: &'static str,
    pub access_key: String,
    pub scope: String,
    pub date: String,
    pub short_date: String,
    pub payload_hash: String,
    /// Lowercase, sorted, deduplicated
    pub signed_headers: Vec<String>,
}

impl SignatureParameters {
    pub fn new(
        access_key: &str,
        region: &str,
        time: DateTime<Utc>,
        payload_hash: impl Into<String>,
        mut signed_headers: Vec<String>,
    ) -> Self {
        let short_date = time.format(SHORT_DATE_FORMAT).to_string();
        signed_headers.iter_mut().for_each(|h| *h = h.to_ascii_lowercase());
        signed_headers.sort();
        signed_headers.dedup();
        Self {
            algorithm: ALGORITHM,
            access_key: access_key.to_string(),
            scope: format!("{}/{}/{}/{}", short_date, region, SERVICE, SCOPE_TERMINATOR),
            date: time.format(LONG_DATE_FORMAT).to_string(),
            short_date,
            payload_hash: payload_hash.into(),
            signed_headers,
        }
    }

    /// `access-key/scope`
    pub fn credential(&self) -> String {
        format!("{}/{}", self.access_key, self.scope)
    }

    /// Semicolon-joined signed header names
    pub fn signed_header_names(&self) -> String {
        self.signed_headers.join(";")
    }
}

/// `name:values\n` for each signed header; repeated values are comma-joined
pub fn canonical_headers(headers: &HeaderMap, names: &[String]) -> Result<String> {
    let mut out = String::new();
    for name in names {
        let values = headers
            .get_all(name.as_str())
            .iter()
            .map(|v| {
                v.to_str().map(str::trim).map_err(|_| {
                    FerryError::Signing(format!("header {} is not valid ASCII", name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        out.push_str(name);
        out.push(':');
        out.push_str(&values.join(","));
        out.push('\n');
    }
    Ok(out)
}

/// Canonical request string
pub fn canonical_request(
    method: &Method,
    path: &str,
    query: &str,
    headers: &str,
    params: &SignatureParameters,
) -> String {
    let path = if path.is_empty() { "/" } else { path };
    [
        method.as_str(),
        path,
        query,
        headers,
        &params.signed_header_names(),
        &params.payload_hash,
    ]
    .join("\n")
}

/// String to sign for a canonical request
pub fn string_to_sign(params: &SignatureParameters, canonical_request: &str) -> String {
    [
        params.algorithm,
        &params.date,
        &params.scope,
        &sha256_hex(canonical_request.as_bytes()),
    ]
    .join("\n")
}

/// Derive the signing key for one day, region and service
pub fn signing_key(secret: &str, short_date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let date_key = hmac_sha256(format!("{}{}", KEY_PREFIX, secret).as_bytes(), short_date.as_bytes())?;
    let region_key = hmac_sha256(&date_key, region.as_bytes())?;
    let service_key = hmac_sha256(&region_key, service.as_bytes())?;
    hmac_sha256(&service_key, SCOPE_TERMINATOR.as_bytes())
}

/// Validate a presigned URL lifetime
pub fn validate_expiry(expires: Duration) -> Result<()> {
    if expires < MIN_PRESIGN_EXPIRY || expires > MAX_PRESIGN_EXPIRY {
        return Err(FerryError::Usage(format!(
            "expiry must be between 1s and 7 days, got {:?}",
            expires
        )));
    }
    Ok(())
}

/// Per-request signing switches
#[derive(Debug, Clone)]
pub struct SignOptions {
    /// Sign `UNSIGNED-PAYLOAD` instead of hashing the body
    pub unsigned_payload: bool,
    /// Set `Content-MD5` when a body is present
    pub content_md5: bool,
    /// Extra lowercase header names to leave unsigned
    pub excluded_headers: Vec<&'static str>,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            unsigned_payload: false,
            content_md5: true,
            excluded_headers: Vec::new(),
        }
    }
}

impl SignOptions {
    /// Options for multipart completion requests, whose body type and digest
    /// some servers rewrite
    pub fn completion() -> Self {
        Self {
            unsigned_payload: false,
            content_md5: false,
            excluded_headers: vec!["content-type", CONTENT_MD5],
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        UNSIGNED_HEADERS.contains(&name) || self.excluded_headers.contains(&name)
    }
}

/// Signs requests with one credential pair and region
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    region: String,
}

impl Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn sign(&self, params: &SignatureParameters, canonical: &str) -> Result<String> {
        trace!(canonical_request = %canonical, "signing");
        let to_sign = string_to_sign(params, canonical);
        let key = signing_key(
            &self.credentials.secret_access_key,
            &params.short_date,
            &self.region,
            SERVICE,
        )?;
        Ok(hex::encode(hmac_sha256(&key, to_sign.as_bytes())?))
    }

    /// Add the signing headers and `Authorization` to `request`
    pub fn sign_request(
        &self,
        request: &mut HttpRequest,
        options: &SignOptions,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let payload_hash = if options.unsigned_payload {
            UNSIGNED_PAYLOAD.to_string()
        } else if request.body.is_empty() {
            EMPTY_PAYLOAD_HASH.to_string()
        } else {
            sha256_hex(&request.body)
        };

        let headers = &mut request.headers;
        headers.insert(X_AMZ_CONTENT_SHA256, header_value(&payload_hash)?);
        if !headers.contains_key(HOST) {
            headers.insert(HOST, header_value(&host_header(&request.url)?)?);
        }
        if !request.body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
        }
        headers.insert(X_AMZ_DATE, header_value(&now.format(LONG_DATE_FORMAT).to_string())?);
        if options.content_md5
            && !request.body.is_empty()
            && !options.is_excluded(CONTENT_MD5)
            && !headers.contains_key(CONTENT_MD5)
        {
            let digest = Md5::digest(&request.body);
            headers.insert(CONTENT_MD5, header_value(&BASE64.encode(digest))?);
        }

        let signed_headers: Vec<String> = headers
            .keys()
            .map(|name| name.as_str().to_string())
            .filter(|name| !options.is_excluded(name))
            .collect();
        let params = SignatureParameters::new(
            &self.credentials.access_key_id,
            &self.region,
            now,
            payload_hash,
            signed_headers,
        );

        let canonical = canonical_request(
            &request.method,
            request.url.path(),
            &encode_query(&request.query),
            &canonical_headers(&request.headers, &params.signed_headers)?,
            &params,
        );
        let signature = self.sign(&params, &canonical)?;

        let authorization = format!(
            "{} Credential={}, SignedHeaders={}, Signature={}",
            params.algorithm,
            params.credential(),
            params.signed_header_names(),
            signature
        );
        request
            .headers
            .insert(AUTHORIZATION, header_value(&authorization)?);
        Ok(())
    }

    /// Presigned URL granting `method` on `url` for `expires`
    pub fn presign(
        &self,
        method: &Method,
        url: &Url,
        query: &[(String, String)],
        expires: Duration,
        now: DateTime<Utc>,
    ) -> Result<Url> {
        validate_expiry(expires)?;

        let host = host_header(url)?;
        let params = SignatureParameters::new(
            &self.credentials.access_key_id,
            &self.region,
            now,
            UNSIGNED_PAYLOAD,
            vec!["host".to_string()],
        );

        let mut pairs = query.to_vec();
        pairs.push(("X-Amz-Algorithm".to_string(), params.algorithm.to_string()));
        pairs.push(("X-Amz-Credential".to_string(), params.credential()));
        pairs.push(("X-Amz-Date".to_string(), params.date.clone()));
        pairs.push(("X-Amz-Expires".to_string(), expires.as_secs().to_string()));
        pairs.push(("X-Amz-SignedHeaders".to_string(), params.signed_header_names()));
        let canonical_query = encode_query(&pairs);

        let canonical = canonical_request(
            method,
            url.path(),
            &canonical_query,
            &format!("host:{}\n", host),
            &params,
        );
        let signature = self.sign(&params, &canonical)?;

        let mut signed = url.clone();
        signed.set_query(Some(&format!(
            "{}&X-Amz-Signature={}",
            canonical_query, signature
        )));
        Ok(signed)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| FerryError::Signing(format!("invalid header value: {}", e)))
}
