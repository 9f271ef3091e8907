use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::ObjectStore;
use std::sync::Arc;

use super::cloud::{CloudKind, CloudStorage};
use crate::config::GcsConfig;
use crate::errors::{BackupError, Result};

/// Google Cloud Storage. Credentials come from a service-account file when
/// configured, otherwise from the environment (`GOOGLE_APPLICATION_CREDENTIALS`
/// or instance metadata).
pub async fn connect_gcs(config: &GcsConfig) -> Result<CloudStorage> {
    let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&config.bucket);
    if let Some(path) = &config.service_account_path {
        builder = builder.with_service_account_path(path.to_string_lossy());
    }
    let store = builder
        .build()
        .map_err(|e| BackupError::ProviderUnavailable(format!("GCS: {}", e)))?;
    CloudStorage::probe(
        CloudKind::Gcs,
        Arc::new(store) as Arc<dyn ObjectStore>,
        config.bucket.clone(),
    )
    .await
}
