//! Object-store abstraction and the per-account registry.

use crate::config::SecretConfiguration;
use crate::errors::DeployError;
use crate::secrets::{SecretCache, SecretsProvider};
use async_trait::async_trait;
use shared::clock::Clock;
use shared::lazy::LazyFuture;
use shared::volatile_map::VolatileMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

/// Container holding every content-addressed deployment file.
pub const DEPLOYMENT_CONTAINER: &str = "deploymentfiles";

/// External object-store abstraction.
#[async_trait]
pub trait CentralStorage: Send + Sync {
    async fn startup(&self, cancel: &CancellationToken) -> Result<(), DeployError>;

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), DeployError>;

    /// `Ok(None)` specifically means the object is not present; transport and
    /// credential failures are `Err`.
    async fn try_get_sas_url(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        expiry: SystemTime,
    ) -> Result<Option<String>, DeployError>;
}

/// Constructor seam so tests and embedders can swap the concrete store.
/// Arguments are the resolved connection string and the container name.
pub type StorageFactory =
    Arc<dyn Fn(&str, &str) -> Result<Arc<dyn CentralStorage>, DeployError> + Send + Sync>;

/// Opens and caches one started [`CentralStorage`] per storage secret name.
pub struct StorageRegistry {
    secrets: Arc<SecretCache>,
    factory: StorageFactory,
    cache: VolatileMap<String, LazyFuture<Arc<dyn CentralStorage>, DeployError>>,
}

impl StorageRegistry {
    pub fn new(secrets: Arc<SecretCache>, factory: StorageFactory, clock: Arc<dyn Clock>) -> Self {
        StorageRegistry {
            secrets,
            factory,
            cache: VolatileMap::new(clock),
        }
    }

    pub async fn load_storage(
        &self,
        provider: &Arc<dyn SecretsProvider>,
        storage_secret_info: &SecretConfiguration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn CentralStorage>, DeployError> {
        let name = storage_secret_info.name.clone().ok_or_else(|| {
            DeployError::Malformed("azureStorageSecretInfo requires a secret name".to_string())
        })?;
        let ttl = storage_secret_info.time_to_live();
        let kind = storage_secret_info.kind;

        let secrets = self.secrets.clone();
        let provider = provider.clone();
        let factory = self.factory.clone();
        let cancel = cancel.clone();
        let producer_name = name.clone();
        self.cache
            .get_or_compute(name, ttl, async move {
                let connection_string = secrets
                    .get_secret(&provider, &producer_name, kind, ttl, &cancel)
                    .await?;
                let storage = (factory)(&connection_string, DEPLOYMENT_CONTAINER)?;
                storage.startup(&cancel).await?;
                tracing::info!(account = %producer_name, "central storage opened");
                Ok(storage)
            })
            .await
    }
}
