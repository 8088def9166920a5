//! S3-compatible blob store (MinIO in the local stack).
//!
//! Keys are opaque strings; `put` returns a `blob://<bucket>/<key>` locator
//! that the metadata rows carry instead of raw endpoint URLs.

use std::time::Duration;

use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use super::StorageError;

const BLOB_SCHEME: &str = "blob://";
// MinIO ignores the region but the SDK requires one.
const PLACEHOLDER_REGION: &str = "us-east-1";

#[derive(Debug, Clone)]
pub struct BlobStore {
    client: Client,
    bucket: String,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub bucket: String,
}

impl BlobStore {
    pub fn new(config: &BlobConfig) -> Self {
        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            let scheme = if config.use_ssl { "https" } else { "http" };
            format!("{scheme}://{}", config.endpoint)
        };

        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "paragon-static",
        );

        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(PLACEHOLDER_REGION))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Store bytes under `key` and return the `blob://` locator.
    pub async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| blob_error("put", key, err))?;

        Ok(format!("{BLOB_SCHEME}{}/{key}", self.bucket))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| blob_error("get", key, err))?;

        let data = object
            .body
            .collect()
            .await
            .map_err(|err| blob_error("read", key, err))?;

        Ok(data.into_bytes().to_vec())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| blob_error("delete", key, err))?;
        Ok(())
    }

    /// Time-limited GET URL for direct download by external consumers.
    pub async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let presigning =
            PresigningConfig::expires_in(ttl).map_err(|err| blob_error("presign", key, err))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| blob_error("presign", key, err))?;

        Ok(request.uri().to_string())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Extract the object key from a `blob://<bucket>/<key>` locator.
pub fn key_from_locator(locator: &str) -> Option<&str> {
    let rest = locator.strip_prefix(BLOB_SCHEME)?;
    let (_bucket, key) = rest.split_once('/')?;
    if key.is_empty() { None } else { Some(key) }
}

fn blob_error(op: &str, key: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Blob {
        message: format!("{op} `{key}`: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_parsing_extracts_key() {
        assert_eq!(
            key_from_locator("blob://receipts/abc-original.jpg"),
            Some("abc-original.jpg")
        );
        assert_eq!(
            key_from_locator("blob://receipts/nested/key.png"),
            Some("nested/key.png")
        );
    }

    #[test]
    fn locator_parsing_rejects_malformed_input() {
        assert_eq!(key_from_locator("s3://receipts/key"), None);
        assert_eq!(key_from_locator("blob://receipts"), None);
        assert_eq!(key_from_locator("blob://receipts/"), None);
        assert_eq!(key_from_locator(""), None);
    }
}
