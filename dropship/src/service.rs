//! The deployment service facade: the stable surface the transport layer
//! drives.

use crate::config::{
    DeploymentParameters, DeploymentServiceSettings, FileSpec, LauncherManifest, SecretKind,
};
use crate::errors::DeployError;
use crate::manifest::ManifestLoader;
use crate::secrets::{SecretCache, SecretsProvider};
use crate::storage::{StorageFactory, StorageRegistry};
use crate::tokens::TokenRegistry;
use crate::topology::ProxyManager;
use crate::upload::UploadCoordinator;
use shared::clock::Clock;
use shared::hash;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

pub struct DeploymentService {
    provider: Arc<dyn SecretsProvider>,
    loader: ManifestLoader,
    secrets: Arc<SecretCache>,
    storages: StorageRegistry,
    uploads: Arc<UploadCoordinator>,
    tokens: Arc<TokenRegistry>,
    proxies: ProxyManager,
}

impl DeploymentService {
    pub fn new(
        settings: DeploymentServiceSettings,
        provider: Arc<dyn SecretsProvider>,
        storage_factory: StorageFactory,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let secrets = Arc::new(SecretCache::new(clock.clone()));
        let tokens = Arc::new(TokenRegistry::new(clock.clone()));
        DeploymentService {
            provider,
            loader: ManifestLoader::new(
                settings.deployment_root.clone(),
                settings.manifest_cache_ttl(),
                clock.clone(),
            ),
            secrets: secrets.clone(),
            storages: StorageRegistry::new(secrets, storage_factory, clock.clone()),
            uploads: Arc::new(UploadCoordinator::new(
                settings.deployment_root,
                settings.upload_concurrency,
                tokens.clone(),
                clock.clone(),
            )),
            tokens,
            proxies: ProxyManager::new(clock),
        }
    }

    /// Single boolean; which check failed is deliberately not surfaced.
    /// Only infrastructure failures (vault or deployment root unreachable)
    /// are errors.
    pub async fn is_authorized(
        &self,
        parameters: &DeploymentParameters,
        cancel: &CancellationToken,
    ) -> Result<bool, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let loaded = self.loader.load(&parameters.host).await?;
        let configuration = loaded.configuration;

        if !configuration
            .authorization_secret_names
            .iter()
            .any(|name| name == &parameters.authorization_secret_name)
        {
            return Ok(false);
        }

        let expected = match self
            .secrets
            .get_secret(
                &self.provider,
                &parameters.authorization_secret_name,
                SecretKind::PlainText,
                configuration.authorization_secret_time_to_live(),
                cancel,
            )
            .await
        {
            Ok(expected) => expected,
            Err(DeployError::NotFound(_)) | Err(DeployError::Unauthorized) => return Ok(false),
            Err(error) => return Err(error),
        };

        Ok(bool::from(
            expected
                .as_bytes()
                .ct_eq(parameters.authorization_secret.as_bytes()),
        ))
    }

    /// Returns the launcher manifest for this caller, guaranteeing a download
    /// URL for every referenced file. With `wait_for_completion` unset the
    /// manifest may be partial (`is_complete = false`) while uploads continue
    /// in the background; the caller polls again.
    pub async fn upload_files_and_get_manifest(
        &self,
        parameters: &DeploymentParameters,
        wait_for_completion: bool,
        cancel: &CancellationToken,
    ) -> Result<LauncherManifest, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let loaded = self.loader.load(&parameters.host).await?;
        let manifest = loaded.manifest;
        let configuration = Arc::new(loaded.configuration);
        let mut content_id = loaded.content_id;

        // Resolve secret environment variables into the tool block; their
        // values become part of what the launcher materialises, so the content
        // id picks up a suffix derived from the resolved environment.
        let mut tool = configuration.tool.clone();
        if let Some(secret_variables) = &configuration.tool.secret_environment_variables
            && !secret_variables.is_empty()
        {
            for (variable, secret) in secret_variables {
                let name = secret.name.as_deref().unwrap_or(variable);
                let value = self
                    .secrets
                    .get_secret(&self.provider, name, secret.kind, secret.time_to_live(), cancel)
                    .await?;
                tool.environment_variables.insert(variable.clone(), value);
                if secret.kind == SecretKind::SasToken {
                    tool.environment_variables
                        .insert(format!("{variable}_ResourceType"), "storagekey".to_string());
                }
            }
            let rendered = serde_json::to_string(&tool.environment_variables)
                .map_err(|e| DeployError::json("tool environment", &e))?;
            content_id = format!("{}_{}", content_id, hash::content_id(rendered.as_bytes()));
        }

        let storage = self
            .storages
            .load_storage(&self.provider, &configuration.azure_storage_secret_info, cancel)
            .await?;

        let proxy_base = configuration
            .proxy
            .as_ref()
            .and_then(|proxy| self.proxies.get_base_address(&parameters.host, proxy));

        // Every file the caller must materialise: each drop's entries under
        // their target prefix, plus the deployment configuration itself when a
        // proxy needs it on disk.
        let mut pending: Vec<(String, FileSpec)> = Vec::new();
        for drop in &configuration.drops {
            let Some(url) = &drop.url else { continue };
            let files = manifest.drops.get(url).ok_or_else(|| {
                DeployError::NotFound(format!("drop '{url}' is not listed in the manifest"))
            })?;
            let prefix = drop.target_relative_path.as_deref().unwrap_or("");
            for (relative_path, file) in files {
                pending.push((join_relative(prefix, relative_path), file.clone()));
            }
        }
        if let Some(proxy) = &configuration.proxy {
            pending.push((
                proxy.target_relative_path.clone(),
                manifest.configuration.clone(),
            ));
        }

        let mut deployment = HashMap::new();
        let mut jobs = Vec::new();
        for (target_path, file) in pending {
            if parameters.get_content_info_only {
                deployment.insert(
                    target_path,
                    FileSpec {
                        download_url: None,
                        ..file
                    },
                );
                continue;
            }

            let uploads = self.uploads.clone();
            let configuration = configuration.clone();
            let storage = storage.clone();
            let proxy_base = proxy_base.clone();
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                let info = uploads
                    .ensure_uploaded(&file, &configuration, storage, &cancel)
                    .await?;
                let download_url = match &proxy_base {
                    Some(base) => proxied_download_url(base, &file.hash, &info.access_token),
                    None => info.download_url,
                };
                Ok(FileSpec {
                    download_url: Some(download_url),
                    ..file
                })
            });
            jobs.push((target_path, handle));
        }

        if !wait_for_completion && !jobs.is_empty() {
            // Let jobs that can finish without suspending (cache hits) settle
            // before the partial harvest.
            tokio::task::yield_now().await;
        }

        let mut pending_jobs = 0usize;
        for (target_path, handle) in jobs {
            if wait_for_completion || handle.is_finished() {
                match handle.await {
                    Ok(Ok(file)) => {
                        deployment.insert(target_path, file);
                    }
                    Ok(Err(error)) => return Err(error),
                    Err(join_error) => {
                        return Err(DeployError::Fatal(format!(
                            "deployment job panicked: {join_error}"
                        )));
                    }
                }
            } else {
                // The job keeps running detached; a later poll finds its
                // result in the upload cache.
                pending_jobs += 1;
            }
        }

        Ok(LauncherManifest {
            content_id,
            tool,
            drops: configuration.drops.clone(),
            deployment,
            is_complete: pending_jobs == 0,
        })
    }

    /// `None` when no proxy is configured or the caller is a seed.
    pub async fn get_proxy_base_address(
        &self,
        parameters: &DeploymentParameters,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        let loaded = self.loader.load(&parameters.host).await?;
        Ok(loaded
            .configuration
            .proxy
            .as_ref()
            .and_then(|proxy| self.proxies.get_base_address(&parameters.host, proxy)))
    }

    /// Resolves a proxied download token back to the real signed URL.
    pub fn try_get_download_url(&self, access_token: &str) -> Result<String, DeployError> {
        self.tokens.try_get_download_url(access_token)
    }
}

/// Deterministic rewrite understood by the peer-proxy content endpoint.
fn proxied_download_url(base: &str, content_hash: &str, access_token: &str) -> String {
    format!(
        "{}/content?hash={content_hash}&token={access_token}",
        base.trim_end_matches('/')
    )
}

fn join_relative(prefix: &str, relative_path: &str) -> String {
    if prefix.is_empty() {
        relative_path.to_string()
    } else {
        format!("{}/{relative_path}", prefix.trim_end_matches('/'))
    }
}
