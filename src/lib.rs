/*!
 * Ferry - chunked, concurrent transfers for S3-compatible storage
 *
 * - Multipart uploads, ranged downloads and server-side copies
 * - SigV4 request signing and presigned URLs
 * - Cancellation with cause propagation and abort of unfinished uploads
 * - Bulk operations with partial-failure reporting
 * - Progress aggregation decoupled from the transfer path
 */

pub mod cli_progress;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod protocol;

// Re-export commonly used types
pub use config::{Credentials, TransferConfig};
pub use error::{FerryError, Result};
pub use protocol::s3::S3Client;
pub use protocol::uri::ObjectUri;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
