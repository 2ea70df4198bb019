/*!
 * Integration tests for presigned URLs through the public client API
 */

use std::time::Duration;

use ferry::config::{Credentials, TransferConfig};
use ferry::core::cancel::CancelToken;
use ferry::error::FerryError;
use ferry::protocol::s3::{parse_duration, PresignMethod, PresignParams, S3Client};
use ferry::protocol::uri::ObjectUri;

fn client() -> S3Client {
    let config = TransferConfig {
        endpoint: Some("https://storage.example.com".to_string()),
        region: "eu-central-1".to_string(),
        credentials: Some(Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY")),
        ..Default::default()
    };
    S3Client::new(&config).unwrap()
}

fn put_params(uri: &str, expires: &str) -> PresignParams {
    PresignParams {
        uri: ObjectUri::parse(uri).unwrap(),
        method: PresignMethod::Put,
        expires: parse_duration(expires).unwrap(),
        version_id: None,
    }
}

#[tokio::test]
async fn test_presigned_put_url_shape() {
    let url = client()
        .presign(&CancelToken::new(), &put_params("s3://uploads/in box/report 1.pdf", "15m"))
        .await
        .unwrap();

    assert_eq!(url.host_str(), Some("storage.example.com"));
    assert_eq!(url.path(), "/uploads/in%20box/report%201.pdf");

    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let get = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or_default()
    };
    assert_eq!(get("X-Amz-Algorithm"), "AWS4-HMAC-SHA256");
    assert_eq!(get("X-Amz-Expires"), "900");
    assert_eq!(get("X-Amz-SignedHeaders"), "host");
    assert!(get("X-Amz-Credential").starts_with("AKIDEXAMPLE/"));
    assert!(get("X-Amz-Credential").ends_with("/eu-central-1/s3/aws4_request"));
    assert_eq!(get("X-Amz-Signature").len(), 64);
}

#[tokio::test]
async fn test_presign_carries_version_id() {
    let mut params = put_params("s3://bucket/key.txt", "1h");
    params.version_id = Some("v/1".to_string());
    let url = client().presign(&CancelToken::new(), &params).await.unwrap();
    assert!(url
        .query_pairs()
        .any(|(k, v)| k == "versionId" && v == "v/1"));
}

#[tokio::test]
async fn test_presign_rejects_bad_input_before_any_request() {
    let client = client();
    let cancel = CancelToken::new();

    let too_long = put_params("s3://bucket/key.txt", "8d");
    assert!(matches!(
        client.presign(&cancel, &too_long).await,
        Err(FerryError::Usage(_))
    ));

    let no_key = put_params("s3://bucket", "5m");
    assert!(matches!(
        client.presign(&cancel, &no_key).await,
        Err(FerryError::Usage(_))
    ));

    let zero = PresignParams {
        expires: Duration::ZERO,
        ..put_params("s3://bucket/key.txt", "5m")
    };
    assert!(client.presign(&cancel, &zero).await.is_err());
}

#[tokio::test]
async fn test_longest_allowed_expiry() {
    let url = client()
        .presign(&CancelToken::new(), &put_params("s3://bucket/key.txt", "7d"))
        .await
        .unwrap();
    assert!(url.query().unwrap().contains("X-Amz-Expires=604800"));
}
