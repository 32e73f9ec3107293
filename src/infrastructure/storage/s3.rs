use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::{config::BehaviorVersion, config::Credentials, config::Region, Client};
use tracing::{debug, info};

use super::{ObjectMeta, ObjectStore, StoreError};

// DeleteObjects accepts at most 1000 keys per request.
const DELETE_BATCH: usize = 1000;

#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    pub bucket: String,
    endpoint: String,
    public_base_url: Option<String>,
}

impl StorageService {
    pub async fn new(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str,
        region: &str,
        public_base_url: Option<String>,
    ) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO
            .build();

        let client = Client::from_conf(config);

        info!("✅ Connected to S3 (MinIO) bucket '{}'", bucket);

        Self {
            client,
            bucket: bucket.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            public_base_url,
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(classify)?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(str::to_string)),
            );

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn put_file(&self, key: &str, path: &Path, meta: &ObjectMeta) -> Result<(), StoreError> {
        debug!("Uploading {} to {}", path.display(), key);

        // A fresh body per attempt; ByteStream is consumed by send().
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StoreError::permanent(format!("failed to read {}: {}", path.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(meta.content_type)
            .cache_control(meta.cache_control)
            .send()
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        let keys = self.list_keys(&prefix).await?;

        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::permanent(e.to_string()))?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StoreError::permanent(e.to_string()))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(classify)?;
        }

        if !keys.is_empty() {
            info!("🗑️ Deleted {} objects under {}", keys.len(), prefix);
        }
        Ok(keys.len())
    }

    fn public_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base, key),
            None => format!("{}/{}/{}", self.endpoint, self.bucket, key),
        }
    }
}

/// Network-level failures, throttling and 5xx are worth retrying; auth and
/// other 4xx responses are not.
fn classify<E>(err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => is_retryable_status(ctx.raw().status().as_u16()),
        _ => false,
    };
    let message = DisplayErrorContext(&err).to_string();

    StoreError { message, transient }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
