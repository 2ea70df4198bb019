/*!
 * Object URI parsing
 */

use std::fmt;
use std::str::FromStr;

use crate::core::filter::{base_name, EntryName};
use crate::error::{FerryError, Result};

/// `bucket/key` address of an object or prefix.
///
/// Accepts `s3://bucket/key`, `bucket/key` and `bucket`. An empty key
/// addresses the bucket root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let rest = match uri.split_once("://") {
            Some(("s3", rest)) => rest,
            Some((scheme, _)) => {
                return Err(FerryError::Usage(format!(
                    "unsupported URI scheme '{}': {}",
                    scheme, uri
                )))
            }
            None => uri,
        };
        let rest = rest.trim_start_matches('/');
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(FerryError::Usage(format!("missing bucket name: {}", uri)));
        }
        check_path(key)?;
        Ok(Self::new(bucket, key))
    }

    /// True when the key is empty or ends with `/`
    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }

    /// Last component of the key
    pub fn file_name(&self) -> &str {
        base_name(&self.key)
    }

    /// Append a relative path to the key, inserting `/` when needed
    pub fn join(&self, rel: &str) -> Self {
        let rel = rel.trim_start_matches('/');
        let key = if self.key.is_empty() || self.key.ends_with('/') {
            format!("{}{}", self.key, rel)
        } else {
            format!("{}/{}", self.key, rel)
        };
        Self::new(self.bucket.clone(), key)
    }

    /// Key used as a listing prefix: empty, or ending with `/`
    pub fn dir_prefix(&self) -> String {
        if self.key.is_empty() || self.key.ends_with('/') {
            self.key.clone()
        } else {
            format!("{}/", self.key)
        }
    }

    /// Require a non-empty key
    pub fn require_key(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(FerryError::Usage(format!(
                "an object key is required, got bucket only: {}",
                self
            )));
        }
        Ok(())
    }
}

/// Reject `.` and `..` segments.
///
/// URL parsing resolves them, so such a key would silently address a
/// different object.
pub fn check_path(path: &str) -> Result<()> {
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(FerryError::Usage(format!(
            "object keys with '.' or '..' segments are not supported: {}",
            path
        )));
    }
    Ok(())
}

impl FromStr for ObjectUri {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl EntryName for ObjectUri {
    fn entry_name(&self) -> &str {
        self.file_name()
    }
}
