//! Vault access with TTL-bound, deduplicated caching.

use crate::config::SecretKind;
use crate::errors::DeployError;
use crate::metrics_defs::SECRET_FETCHES;
use async_trait::async_trait;
use metrics::counter;
use shared::clock::Clock;
use shared::lazy::LazyFuture;
use shared::volatile_map::VolatileMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// External vault abstraction.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Fails with `NotFound`, `Unauthorized`, or `Transient`.
    async fn get_plain_secret(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError>;
}

const CONNECTION_STRING_PREFIX: &str = "DefaultEndpointsProtocol=";
const SAS_NAME_SUFFIX: &str = "-sas";

/// Deduplicated, TTL-bound secret retrieval. Storage secrets are returned as
/// full connection strings; plain secrets verbatim.
pub struct SecretCache {
    cache: VolatileMap<(String, SecretKind), LazyFuture<String, DeployError>>,
}

impl SecretCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        SecretCache {
            cache: VolatileMap::new(clock),
        }
    }

    pub async fn get_secret(
        &self,
        provider: &Arc<dyn SecretsProvider>,
        name: &str,
        kind: SecretKind,
        time_to_live: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        if kind == SecretKind::SasToken && !name.to_ascii_lowercase().ends_with(SAS_NAME_SUFFIX) {
            return Err(DeployError::Malformed(format!(
                "storage secret name '{name}' must end in '{SAS_NAME_SUFFIX}'"
            )));
        }

        let provider = provider.clone();
        let owned_name = name.to_string();
        let cancel = cancel.clone();
        self.cache
            .get_or_compute((owned_name.clone(), kind), time_to_live, async move {
                counter!(SECRET_FETCHES.name).increment(1);
                if cancel.is_cancelled() {
                    return Err(DeployError::Cancelled);
                }
                let value = provider.get_plain_secret(&owned_name, &cancel).await?;
                Ok(match kind {
                    SecretKind::PlainText => value,
                    SecretKind::SasToken => format_connection_string(&owned_name, value),
                })
            })
            .await
    }
}

/// The vault stores a raw account access key under `<account>-sas`; a value
/// that is not already a full connection string gets wrapped as one.
fn format_connection_string(name: &str, value: String) -> String {
    if value.starts_with(CONNECTION_STRING_PREFIX) {
        return value;
    }
    let account = &name[..name.len() - SAS_NAME_SUFFIX.len()];
    format!(
        "DefaultEndpointsProtocol=https;AccountName={account};AccountKey={value};EndpointSuffix=core.windows.net"
    )
}
