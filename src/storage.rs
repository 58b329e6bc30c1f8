use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhotoStoreError {
    #[error("duplicate")]
    Duplicate,
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), PhotoStoreError>;
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), PhotoStoreError>;
    async fn delete(&self, key: &str) -> Result<(), PhotoStoreError>;
}

/// Extract the storage key from a photo reference. References are normally
/// bare keys, but profile records imported from the legacy system carry full
/// download URLs with a percent-encoded `/o/<path>` segment.
pub fn photo_key_from_ref(photo_ref: &str) -> Option<String> {
    let trimmed = photo_ref.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(idx) = trimmed.find("/o/") {
        let tail = &trimmed[idx + 3..];
        let path = tail.split('?').next().unwrap_or(tail);
        return urlencoding::decode(path).ok().map(|p| p.into_owned());
    }
    Some(trimmed.to_string())
}

// ---------------- S3 Implementation (MinIO compatible) ----------------
pub struct S3PhotoStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3PhotoStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "sonet-photos".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Path-style addressing is required for most MinIO/local endpoints
        // without wildcard DNS.
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("Initialized S3/MinIO photo store (path-style addressing enabled)");

        // Ensure bucket exists (create if missing)
        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) => {
                        if attempt >= max_attempts {
                            error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                            return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                        }
                        let backoff_ms = 200 * attempt.pow(2); // quadratic backoff
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64))
                            .await;
                    }
                }
            }
        }

        Ok(Self {
            bucket,
            client,
            prefix: "photos".into(),
        })
    }

    fn key_for(&self, key: &str) -> String {
        // shard by the first two hash chars; legacy keys may be shorter
        let shard = key.get(0..2).unwrap_or("00");
        format!("{}/{}/{}", self.prefix, shard, key)
    }
}

#[async_trait]
impl PhotoStore for S3PhotoStore {
    async fn save(&self, key: &str, _mime: &str, bytes: &[u8]) -> Result<(), PhotoStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let object_key = self.key_for(key);
        // HEAD first: content-addressed uploads are idempotent
        if self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .is_ok()
        {
            return Err(PhotoStoreError::Duplicate);
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(
                infer::get(bytes)
                    .map(|t| t.mime_type().to_string())
                    .unwrap_or_else(|| "application/octet-stream".into()),
            );
        if let Err(e) = put.send().await {
            error!(
                "put_object failed key={object_key} bucket={} err={:?}",
                self.bucket, e
            );
            let hint = if e.to_string().contains("NoSuchBucket") {
                " (bucket missing or not yet propagated)"
            } else if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(PhotoStoreError::Other(format!("{e}{hint}")));
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), PhotoStoreError> {
        let object_key = self.key_for(key);
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|_| PhotoStoreError::NotFound)?;
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| PhotoStoreError::Other(e.to_string()))?;
        // ContentType may be absent; fall back to sniffing
        let bytes = Vec::from(data.into_bytes().as_ref());
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok((bytes, mime))
    }

    async fn delete(&self, key: &str) -> Result<(), PhotoStoreError> {
        let object_key = self.key_for(key);
        // Best-effort delete: treat not found as success
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;
        Ok(())
    }
}

/// Best-effort removal of a referenced photo. Failures are logged and
/// dropped; storage cleanup never fails the operation that scheduled it.
pub async fn discard_photo(store: &dyn PhotoStore, photo_ref: &str) {
    let Some(key) = photo_key_from_ref(photo_ref) else {
        return;
    };
    if let Err(e) = store.delete(&key).await {
        warn!("failed to delete photo '{key}': {e}");
    }
}

// Factory helper used in main; panic early if misconfigured
pub async fn build_photo_store() -> Arc<dyn PhotoStore> {
    match S3PhotoStore::new().await {
        Ok(store) => Arc::new(store),
        Err(e) => panic!("Failed to initialize S3 photo store: {e}"),
    }
}
