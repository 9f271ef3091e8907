use object_store::azure::MicrosoftAzureBuilder;
use object_store::ObjectStore;
use std::sync::Arc;

use super::cloud::{CloudKind, CloudStorage};
use crate::config::AzureConfig;
use crate::errors::{BackupError, Result};

/// Azure Blob Storage, authenticated with a storage account key when one is
/// configured, otherwise with whatever `AZURE_*` variables are set.
pub async fn connect_azure(config: &AzureConfig) -> Result<CloudStorage> {
    let mut builder = MicrosoftAzureBuilder::from_env()
        .with_account(&config.account)
        .with_container_name(&config.container);
    if let Some(key) = &config.access_key {
        builder = builder.with_access_key(key);
    }
    let store = builder
        .build()
        .map_err(|e| BackupError::ProviderUnavailable(format!("Azure: {}", e)))?;
    CloudStorage::probe(
        CloudKind::Azure,
        Arc::new(store) as Arc<dyn ObjectStore>,
        format!("{}/{}", config.account, config.container),
    )
    .await
}
