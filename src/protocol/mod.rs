/*!
 * Storage protocols for Ferry
 *
 * - `s3`: S3-compatible object storage over signed HTTP
 * - `uri`: `s3://bucket/key` addressing shared by every operation
 */

pub mod s3;
pub mod uri;

pub use uri::ObjectUri;
