//! S3 provider (AWS or any S3-compatible endpoint).

use super::{
    CompletedPart, GatewayError, GatewayResult, ObjectMetadata, ObjectStoreGateway, UploadedPart,
    normalize_etag,
};
use crate::config::StorageConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::{RetryConfig, RetryMode};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Clone)]
pub struct S3Gateway {
    client: Client,
    bucket: String,
}

impl S3Gateway {
    /// Build the client once from config. Static credentials are used when
    /// both keys are configured, the default provider chain otherwise.
    pub async fn connect(config: &StorageConfig) -> Self {
        let region_provider =
            RegionProviderChain::first_try(aws_config::Region::new(config.region.clone()));
        let retry_config = RetryConfig::standard()
            .with_max_attempts(3)
            .with_retry_mode(RetryMode::Adaptive);

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .retry_config(retry_config.clone());
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                id,
                secret,
                None,
                None,
                "video-upload-sessions",
            ));
        }
        let shared = loader.load().await;

        let client = match &config.endpoint_url {
            Some(endpoint) => {
                // S3-compatible stores generally need path-style addressing.
                let mut builder = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .endpoint_url(endpoint)
                    .region(shared.region().cloned())
                    .retry_config(retry_config)
                    .force_path_style(true);
                if let Some(provider) = shared.credentials_provider() {
                    builder = builder.credentials_provider(provider);
                }
                Client::from_conf(builder.build())
            }
            None => Client::new(&shared),
        };

        info!(bucket = %config.bucket, endpoint = ?config.endpoint_url, "S3 gateway ready");
        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }
}

/// Map an SDK failure onto the provider-neutral error set. `subject` names the
/// upload id or key the call was about.
fn classify<E, R>(op: &'static str, subject: &str, err: SdkError<E, R>) -> GatewayError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => return GatewayError::Timeout(op),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            return GatewayError::Timeout(op);
        }
        SdkError::ServiceError(service) => match service.err().code() {
            Some("NoSuchUpload") => return GatewayError::InvalidUploadId(subject.to_string()),
            Some("InvalidPart" | "InvalidPartOrder" | "EntityTooSmall") => {
                let message = service.err().message().unwrap_or("rejected part list");
                return GatewayError::PartMismatch(message.to_string());
            }
            Some("NoSuchKey" | "NotFound") => return GatewayError::NotFound(subject.to_string()),
            _ => {}
        },
        _ => {}
    }
    let detail = DisplayErrorContext(&err).to_string();
    error!(op, subject, error = %detail, "S3 call failed");
    GatewayError::Unavailable(detail)
}

#[async_trait]
impl ObjectStoreGateway for S3Gateway {
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> GatewayResult<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify("initiate_multipart_upload", key, e))?;
        let upload_id = output.upload_id().ok_or_else(|| {
            GatewayError::Unavailable("no upload id returned from S3".to_string())
        })?;
        info!(bucket = %self.bucket, key, upload_id, "initiated multipart upload");
        Ok(upload_id.to_string())
    }

    async fn presign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> GatewayResult<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let request = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .presigned(presigning)
            .await
            .map_err(|e| classify("presign_part_upload", upload_id, e))?;
        Ok(request.uri().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<ObjectMetadata> {
        let start = Instant::now();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        S3CompletedPart::builder()
                            .part_number(p.part_number as i32)
                            .e_tag(format!("\"{}\"", normalize_etag(&p.etag)))
                            .build()
                    })
                    .collect(),
            ))
            .build();

        // Completion is never retried blindly: its outcome may be unknown.
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .customize()
            .config_override(aws_sdk_s3::Config::builder().retry_config(RetryConfig::disabled()))
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", upload_id, e))?;

        info!(
            bucket = %self.bucket,
            key,
            upload_id,
            parts = parts.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "completed multipart upload"
        );
        Ok(ObjectMetadata {
            key: key.to_string(),
            size: None,
            etag: output.e_tag().map(normalize_etag),
        })
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", upload_id, e))
        {
            Ok(_) | Err(GatewayError::InvalidUploadId(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn list_upload_parts(
        &self,
        key: &str,
        upload_id: &str,
    ) -> GatewayResult<Vec<UploadedPart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("list_upload_parts", upload_id, e))?;

            for part in page.parts() {
                let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) else {
                    continue;
                };
                parts.push(UploadedPart {
                    part_number: number.max(0) as u32,
                    etag: normalize_etag(etag),
                    size: part.size().unwrap_or(0).max(0) as u64,
                });
            }

            match (page.is_truncated(), page.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn head_object(&self, key: &str) -> GatewayResult<Option<ObjectMetadata>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(ObjectMetadata {
                key: key.to_string(),
                size: output.content_length().map(|len| len.max(0) as u64),
                etag: output.e_tag().map(normalize_etag),
            })),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(None),
            Err(err) => Err(classify("head_object", key, err)),
        }
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> GatewayResult<()> {
        let start = Instant::now();
        let copy_source = format!("{}/{}", self.bucket, urlencoding::encode(source_key));
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(&copy_source)
            .key(dest_key)
            .send()
            .await
            .map_err(|e| classify("copy_object", source_key, e))?;
        info!(
            source_key,
            dest_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 copy successful"
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("delete_object", key, e))
        {
            Ok(_) | Err(GatewayError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
