//! Object-store client trait and its S3 implementation, used by the
//! remote-cache and remote-store tiers.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub name: String,
    pub size: u64,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn list(&self, container: &str) -> Result<Vec<ObjectInfo>>;
    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>>;
    async fn put(&self, container: &str, name: &str, bytes: &[u8], content_type: &str)
        -> Result<()>;
    async fn delete(&self, container: &str, name: &str) -> Result<()>;
    async fn stat(&self, container: &str, name: &str) -> Result<Option<ObjectStat>>;
    async fn post_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;
    async fn sign_url(
        &self,
        container: &str,
        name: &str,
        lifetime: Duration,
    ) -> Result<String>;
}

/// S3-backed object store, used for both the remote-cache and remote-store
/// tiers (distinguished only by which bucket/prefix a `Master` points them
/// at).
pub struct S3ObjectStoreClient {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStoreClient {
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        let client = aws_sdk_s3::Client::new(&config);
        S3ObjectStoreClient { client }
    }

    pub fn with_client(client: aws_sdk_s3::Client) -> Self {
        S3ObjectStoreClient { client }
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStoreClient {
    async fn list(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        let mut continuation = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(container);
            if let Some(token) = continuation.clone() {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.context("failed to list bucket")?;
            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                out.push(ObjectInfo {
                    name: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    content_type: None,
                });
            }
            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        debug!(container = %container, count = out.len(), "listed objects");
        Ok(out)
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(container)
            .key(name)
            .send()
            .await
            .context("failed to get object")?;
        let bytes = resp
            .body
            .collect()
            .await
            .context("failed to read object body")?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn put(
        &self,
        container: &str,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(container)
            .key(name)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .context("failed to put object")?;
        debug!(container = %container, key = %name, size = bytes.len(), "object written");
        Ok(())
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(container)
            .key(name)
            .send()
            .await
            .context("failed to delete object")?;
        Ok(())
    }

    async fn stat(&self, container: &str, name: &str) -> Result<Option<ObjectStat>> {
        let resp = self
            .client
            .head_object()
            .bucket(container)
            .key(name)
            .send()
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(aws_sdk_s3::error::SdkError::ServiceError(e))
                if e.err().is_not_found() =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e).context("failed to stat object"),
        };
        Ok(Some(ObjectStat {
            name: name.to_string(),
            size: resp.content_length().unwrap_or(0).max(0) as u64,
            metadata: resp.metadata().cloned().unwrap_or_default(),
        }))
    }

    async fn post_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .copy_object()
            .bucket(container)
            .copy_source(format!("{container}/{name}"))
            .key(name)
            .set_metadata(Some(metadata))
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
            .send()
            .await
            .context("failed to update object metadata")?;
        Ok(())
    }

    async fn sign_url(&self, container: &str, name: &str, lifetime: Duration) -> Result<String> {
        let presign_config =
            PresigningConfig::expires_in(lifetime).context("invalid presign lifetime")?;
        let presigned = self
            .client
            .get_object()
            .bucket(container)
            .key(name)
            .presigned(presign_config)
            .await
            .context("failed to presign url")?;
        Ok(presigned.uri().to_string())
    }
}
