//! Presigned object URLs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Method;
use tracing::debug;
use url::Url;

use super::client::S3Client;
use super::signer::validate_expiry;
use crate::core::cancel::CancelToken;
use crate::error::{FerryError, Result};
use crate::protocol::uri::ObjectUri;

/// Lifetime used when none is given
pub const DEFAULT_PRESIGN_EXPIRY: &str = "5m";

/// Parse a duration such as `30s`, `5m`, `2h`, `1h30m` or `7d`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = || FerryError::Usage(format!("invalid duration '{}'", text));
    if text.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 60 * 60,
            'd' => 24 * 60 * 60,
            _ => return Err(invalid()),
        };
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

/// Operation a presigned URL grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresignMethod {
    #[default]
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_method(self) -> Method {
        match self {
            PresignMethod::Get => Method::GET,
            PresignMethod::Put => Method::PUT,
        }
    }
}

impl FromStr for PresignMethod {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(PresignMethod::Get),
            "PUT" => Ok(PresignMethod::Put),
            _ => Err(FerryError::Usage(format!(
                "unsupported presign method '{}', expected GET or PUT",
                s
            ))),
        }
    }
}

impl fmt::Display for PresignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_method().as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PresignParams {
    pub uri: ObjectUri,
    pub method: PresignMethod,
    pub expires: Duration,
    pub version_id: Option<String>,
}

impl S3Client {
    /// Presigned URL for one object.
    ///
    /// The lifetime is checked before anything else; a GET URL is only
    /// issued for an object that exists.
    pub async fn presign(&self, cancel: &CancelToken, params: &PresignParams) -> Result<Url> {
        validate_expiry(params.expires)?;
        params.uri.require_key()?;

        if params.method == PresignMethod::Get {
            self.head(cancel, &params.uri, params.version_id.as_deref())
                .await?;
        }

        let query: Vec<(String, String)> = params
            .version_id
            .iter()
            .map(|v| ("versionId".to_string(), v.clone()))
            .collect();
        let url = self.presign_url(&params.method.as_method(), &params.uri, &query, params.expires)?;
        debug!(uri = %params.uri, method = %params.method, expires = ?params.expires, "presigned");
        Ok(url)
    }
}
