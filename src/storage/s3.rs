use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use tracing::{debug, info};

use super::{validate_key, ObjectInfo, StorageProvider};
use crate::config::S3Config;
use crate::errors::{BackupError, Result};

/// S3 and S3-compatible services (DigitalOcean Spaces, MinIO).
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3Storage {
    /// Builds the client and checks the bucket with a HEAD request.
    pub async fn connect(config: &S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        // Without static keys the default credential chain applies.
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, None, "Static",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint_url.is_some())
            .build();
        let client = s3::Client::from_conf(s3_config);

        client
            .head_bucket()
            .bucket(&config.bucket)
            .send()
            .await
            .map_err(|e| {
                BackupError::ProviderUnavailable(format!(
                    "S3 bucket '{}' is not accessible: {}",
                    config.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        info!(bucket = %config.bucket, "S3 bucket is accessible");

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            folder_prefix: config
                .folder_prefix
                .as_ref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }

    fn strip_folder<'a>(&self, full_key: &'a str) -> &'a str {
        match &self.folder_prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(full_key),
            None => full_key,
        }
    }
}

#[async_trait]
impl StorageProvider for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        validate_key(key)?;
        let size = data.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| BackupError::upload(key, DisplayErrorContext(&e)))?;
        debug!(bucket = %self.bucket, key, bytes = size, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        validate_key(key)?;
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    BackupError::NotFound(key.to_string())
                } else {
                    BackupError::download(key, DisplayErrorContext(&e))
                }
            })?;
        let body = object
            .body
            .collect()
            .await
            .map_err(|e| BackupError::download(key, e))?;
        Ok(body.into_bytes())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let full_prefix = self.full_key(prefix);
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| BackupError::download(prefix, DisplayErrorContext(&e)))?;

            for obj in page.contents() {
                let Some(full_key) = obj.key() else { continue };
                let last_modified = obj
                    .last_modified()
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos()))
                    .unwrap_or_else(Utc::now);
                objects.push(ObjectInfo {
                    key: self.strip_folder(full_key).to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                });
            }

            if page.is_truncated().unwrap_or(false) {
                continuation = page.next_continuation_token().map(str::to_string);
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| BackupError::delete(key, DisplayErrorContext(&e)))?;
        Ok(())
    }
}
