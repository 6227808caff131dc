// crates/db/src/blob.rs
//! S3-compatible blob store for uploaded log files.

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;
use uuid::Uuid;

use crate::{BlobStore, DbError, DbResult};

const COMPONENT: &str = "s3";

/// Object key convention: `tenants/<tenant>/files/<file>/<filename>`.
pub fn object_key(tenant_id: Uuid, file_id: Uuid, filename: &str) -> String {
    format!("tenants/{tenant_id}/files/{file_id}/{filename}")
}

/// Blob store configuration.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Custom endpoint for S3-compatible stores (MinIO in dev).
    pub endpoint: Option<String>,
    /// MinIO does not always expose bucket-existence checks; skip them.
    pub skip_bucket_check: bool,
}

fn classify<E>(err: SdkError<E>) -> DbError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            DbError::transient(COMPONENT, err)
        }
        _ => DbError::permanent(COMPONENT, err),
    }
}

/// Blob store over a shared S3 client.
#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    /// Build the client from ambient AWS configuration plus the given
    /// overrides, verifying the bucket exists unless configured not to.
    pub async fn connect(config: S3Config) -> DbResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        // Path-style addressing keeps bucket names out of DNS, which is what
        // MinIO and most self-hosted S3 endpoints expect.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);

        if !config.skip_bucket_check {
            client
                .head_bucket()
                .bucket(&config.bucket)
                .send()
                .await
                .map_err(|e| {
                    DbError::permanent(COMPONENT, format!("bucket {}: {e}", config.bucket))
                })?;
        }

        info!(bucket = %config.bucket, "s3 blob store ready");
        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> DbResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> DbResult<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| match &err {
                SdkError::ServiceError(service) if service.err().is_no_such_key() => {
                    DbError::not_found(COMPONENT, key.to_string())
                }
                _ => classify(err),
            })?;
        let data = output
            .body
            .collect()
            .await
            .map_err(|e| DbError::transient(COMPONENT, e))?;
        Ok(data.into_bytes().to_vec())
    }
}
