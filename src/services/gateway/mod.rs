//! Object Store Gateway.
//!
//! Every object-store call the service makes goes through [`ObjectStoreGateway`],
//! so session logic never sees credentials or SDK types. Providers:
//!
//! - [`local::LocalObjectStore`]: objects on local disk, presigned URLs served
//!   by this process.
//! - `s3::S3Gateway` (feature `s3`): AWS S3 or any S3-compatible endpoint.
//!
//! [`BoundedGateway`] wraps a provider with per-call timeouts and bounded
//! retries for idempotent reads. Calls that move object bytes get their own,
//! longer bound.

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use crate::config::{StorageConfig, StorageProvider, UploadPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::warn;

/// Provider-neutral classification of object store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error("object store call `{0}` timed out")]
    Timeout(&'static str),
    #[error("multipart upload `{0}` does not exist")]
    InvalidUploadId(String),
    #[error("object store rejected the part list: {0}")]
    PartMismatch(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// ETags travel quoted in HTTP headers and unquoted elsewhere; compare and
/// store them unquoted.
pub fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

/// A part reference used to finalize a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// A part the store reports as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub key: String,
    pub size: Option<u64>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    /// Start a multipart upload at `key` and return its upload id.
    async fn initiate_multipart_upload(&self, key: &str, content_type: &str)
    -> GatewayResult<String>;

    /// URL a client can `PUT` one part to. Stateless: any instance can presign
    /// any part given only the key and upload id.
    async fn presign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> GatewayResult<String>;

    /// Assemble the parts (ascending part numbers) into the object at `key`.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<ObjectMetadata>;

    /// Discard an upload. A missing upload counts as success.
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> GatewayResult<()>;

    /// Parts the store has received, ascending by part number.
    async fn list_upload_parts(&self, key: &str, upload_id: &str)
    -> GatewayResult<Vec<UploadedPart>>;

    /// Object metadata, or `None` when the key does not exist.
    async fn head_object(&self, key: &str) -> GatewayResult<Option<ObjectMetadata>>;

    /// Copy `source_key` to `dest_key`. Never touches the source on failure.
    async fn copy_object(&self, source_key: &str, dest_key: &str) -> GatewayResult<()>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> GatewayResult<()>;
}

/// Bounds every call of the wrapped gateway by `timeout` and retries the
/// idempotent reads (`list_upload_parts`, `head_object`) up to
/// `read_attempts` times. Multipart completion and copies run under
/// `transfer_timeout` instead. Writes are attempted exactly once.
pub struct BoundedGateway {
    inner: Arc<dyn ObjectStoreGateway>,
    timeout: Duration,
    transfer_timeout: Duration,
    read_attempts: u32,
}

impl BoundedGateway {
    pub fn new(inner: Arc<dyn ObjectStoreGateway>, timeout: Duration, read_attempts: u32) -> Self {
        Self {
            inner,
            timeout,
            transfer_timeout: timeout,
            read_attempts: read_attempts.max(1),
        }
    }

    pub fn with_transfer_timeout(mut self, transfer_timeout: Duration) -> Self {
        self.transfer_timeout = transfer_timeout;
        self
    }

    pub fn from_policy(inner: Arc<dyn ObjectStoreGateway>, policy: &UploadPolicy) -> Self {
        Self::new(inner, policy.storage_timeout, policy.read_attempts)
            .with_transfer_timeout(policy.transfer_timeout)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        within(self.timeout, op, fut).await
    }

    async fn bounded_transfer<T, F>(&self, op: &'static str, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        within(self.transfer_timeout, op, fut).await
    }

    async fn bounded_read<T, F, Fut>(&self, op: &'static str, mut call: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match self.bounded(op, call()).await {
                Err(err @ (GatewayError::Unavailable(_) | GatewayError::Timeout(_)))
                    if attempt < self.read_attempts =>
                {
                    warn!(op, attempt, error = %err, "retrying object store read");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl ObjectStoreGateway for BoundedGateway {
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> GatewayResult<String> {
        self.bounded(
            "initiate_multipart_upload",
            self.inner.initiate_multipart_upload(key, content_type),
        )
        .await
    }

    async fn presign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> GatewayResult<String> {
        self.bounded(
            "presign_part_upload",
            self.inner
                .presign_part_upload(key, upload_id, part_number, ttl),
        )
        .await
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<ObjectMetadata> {
        self.bounded_transfer(
            "complete_multipart_upload",
            self.inner.complete_multipart_upload(key, upload_id, parts),
        )
        .await
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        self.bounded(
            "abort_multipart_upload",
            self.inner.abort_multipart_upload(key, upload_id),
        )
        .await
    }

    async fn list_upload_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<Vec<UploadedPart>> {
        self.bounded_read("list_upload_parts", || {
            self.inner.list_upload_parts(key, upload_id)
        })
        .await
    }

    async fn head_object(&self, key: &str) -> GatewayResult<Option<ObjectMetadata>> {
        self.bounded_read("head_object", || self.inner.head_object(key))
            .await
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> GatewayResult<()> {
        self.bounded_transfer("copy_object", self.inner.copy_object(source_key, dest_key))
            .await
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        self.bounded("delete_object", self.inner.delete_object(key))
            .await
    }
}

async fn within<T, F>(limit: Duration, op: &'static str, fut: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(op)),
    }
}

/// Gateway handles built once at startup from [`StorageConfig`].
pub struct StorageClient {
    /// Gateway used by the session manager, already bounded.
    pub gateway: Arc<dyn ObjectStoreGateway>,
    /// Set for the local provider, whose data plane is served by this process.
    pub local: Option<Arc<local::LocalObjectStore>>,
}

impl StorageClient {
    pub async fn connect(config: &StorageConfig, policy: &UploadPolicy) -> anyhow::Result<Self> {
        match config.provider {
            StorageProvider::Local => {
                let store = Arc::new(
                    local::LocalObjectStore::new(
                        &config.local_root,
                        &config.public_base_url,
                        config.signing_secret.as_bytes(),
                    )
                    .await?,
                );
                let gateway = BoundedGateway::from_policy(store.clone(), policy);
                Ok(Self {
                    gateway: Arc::new(gateway),
                    local: Some(store),
                })
            }
            #[cfg(feature = "s3")]
            StorageProvider::S3 => {
                let store = Arc::new(s3::S3Gateway::connect(config).await);
                let gateway = BoundedGateway::from_policy(store, policy);
                Ok(Self {
                    gateway: Arc::new(gateway),
                    local: None,
                })
            }
            #[cfg(not(feature = "s3"))]
            StorageProvider::S3 => {
                anyhow::bail!("the S3 provider requires building with the `s3` feature")
            }
        }
    }
}
