/*!
 * Error types for Ferry
 */

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FerryError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Errors produced by the transfer engine.
///
/// The type is `Clone` because a single cancellation cause is shared by every
/// worker that observes it.
#[derive(Error, Debug, Clone)]
pub enum FerryError {
    /// Invalid parameters, detected before any network call
    #[error("usage error: {0}")]
    Usage(String),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Request could not be signed
    #[error("signing error: {0}")]
    Signing(String),

    /// Non-2xx response from the storage service
    #[error(transparent)]
    Http(#[from] HttpError),

    /// HTTP client failure (connection, TLS, body stream)
    #[error("transport error: {0}")]
    Transport(String),

    /// A 2xx response whose body could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Failure of one item in a multi-object operation
    #[error("{uri}: {source}")]
    Object {
        uri: String,
        source: Box<FerryError>,
    },

    /// Partial-failure aggregate
    #[error("{0}")]
    Multi(MultiError),

    /// Operation cancelled without a more specific cause
    #[error("operation cancelled")]
    Cancelled,

    /// Operation deadline exceeded
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl FerryError {
    /// Attach the object URI an error relates to
    pub fn for_object<S: Into<String>>(self, uri: S) -> Self {
        FerryError::Object {
            uri: uri.into(),
            source: Box::new(self),
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FerryError::Usage(_) | FerryError::Config(_) => EXIT_FATAL,
            FerryError::Object { source, .. } => source.exit_code(),
            _ => EXIT_PARTIAL,
        }
    }

    /// True for cancellation or deadline errors
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FerryError::Cancelled | FerryError::Timeout(_))
    }

    /// HTTP status code, if this error came from a service response
    pub fn status(&self) -> Option<u16> {
        match self {
            FerryError::Http(err) => Some(err.status),
            FerryError::Object { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<io::Error> for FerryError {
    fn from(err: io::Error) -> Self {
        FerryError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for FerryError {
    fn from(err: reqwest::Error) -> Self {
        FerryError::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FerryError {
    fn from(err: tokio::task::JoinError) -> Self {
        FerryError::Io(format!("background task failed: {}", err))
    }
}

/// Structured error parsed from a non-2xx service response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// Numeric status code
    pub status: u16,
    /// Raw status line, e.g. "404 Not Found"
    pub status_line: String,
    /// Machine-readable error code from the body, "unknown" when absent
    pub slug: String,
    /// Human-readable message from the body, the status line when absent
    pub message: String,
}

impl HttpError {
    pub fn new(status: u16, status_line: impl Into<String>) -> Self {
        let status_line = status_line.into();
        Self {
            status,
            message: status_line.clone(),
            status_line,
            slug: "unknown".to_string(),
        }
    }

    /// True when the body supplied a message or code
    pub fn is_parsed(&self) -> bool {
        self.slug != "unknown" || self.message != self.status_line
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_parsed() {
            write!(f, "{} ({}): {}", self.status_line, self.slug, self.message)
        } else {
            write!(f, "{}", self.status_line)
        }
    }
}

/// A sequence of per-item errors reported together
#[derive(Debug, Clone, Default)]
pub struct MultiError(Vec<FerryError>);

impl MultiError {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: FerryError) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn errors(&self) -> &[FerryError] {
        &self.0
    }

    /// `Ok(())` when empty, the lone error when there is one, otherwise the aggregate
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(FerryError::Multi(self)),
        }
    }
}

impl Extend<FerryError> for MultiError {
    fn extend<I: IntoIterator<Item = FerryError>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for MultiError {
    type Item = FerryError;
    type IntoIter = std::vec::IntoIter<FerryError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<FerryError>> for MultiError {
    fn from(errors: Vec<FerryError>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_display_unparsed() {
        let err = HttpError::new(404, "404 Not Found");
        assert_eq!(err.to_string(), "404 Not Found");
        assert!(!err.is_parsed());
    }

    #[test]
    fn test_http_error_display_parsed() {
        let mut err = HttpError::new(403, "403 Forbidden");
        err.slug = "AccessDenied".to_string();
        err.message = "Access Denied".to_string();
        assert_eq!(
            err.to_string(),
            "403 Forbidden (AccessDenied): Access Denied"
        );
    }

    #[test]
    fn test_multi_error_numbered_list() {
        let multi = MultiError::from(vec![
            FerryError::Io("disk full".to_string()),
            FerryError::Cancelled,
        ]);
        let text = multi.to_string();
        assert_eq!(
            text,
            "2 errors occurred:\n  1. I/O error: disk full\n  2. operation cancelled"
        );
    }

    #[test]
    fn test_multi_error_into_result() {
        assert!(MultiError::new().into_result().is_ok());

        let single = MultiError::from(vec![FerryError::Cancelled]).into_result();
        assert!(matches!(single, Err(FerryError::Cancelled)));

        let many =
            MultiError::from(vec![FerryError::Cancelled, FerryError::Cancelled]).into_result();
        assert!(matches!(many, Err(FerryError::Multi(m)) if m.len() == 2));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(FerryError::Usage("x".into()).exit_code(), EXIT_FATAL);
        assert_eq!(FerryError::Config("x".into()).exit_code(), EXIT_FATAL);
        assert_eq!(FerryError::Cancelled.exit_code(), EXIT_PARTIAL);
        assert_eq!(
            FerryError::Usage("x".into())
                .for_object("s3://b/k")
                .exit_code(),
            EXIT_FATAL
        );
    }

    #[test]
    fn test_object_error_display() {
        let err = FerryError::Http(HttpError::new(500, "500 Internal Server Error"))
            .for_object("s3://bucket/key");
        assert_eq!(err.to_string(), "s3://bucket/key: 500 Internal Server Error");
        assert_eq!(err.status(), Some(500));
    }
}
