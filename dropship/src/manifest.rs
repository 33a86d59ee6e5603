//! Deployment-root reading and the preprocessed-configuration pipeline.

use crate::config::{DeploymentConfiguration, DeploymentManifest, HostParameters};
use crate::errors::DeployError;
use crate::preprocess::preprocess;
use shared::clock::Clock;
use shared::hash;
use shared::lazy::LazyFuture;
use shared::volatile_map::VolatileMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const MANIFEST_FILE_NAME: &str = "DeploymentManifest.json";

/// Content-addressed relative path sharded by the first two hex chars,
/// `hh/hhhh…`.
pub fn content_relative_path(hash: &str) -> String {
    match hash.get(..2) {
        Some(prefix) => format!("{prefix}/{hash}"),
        None => hash.to_string(),
    }
}

/// The manifest plus the caller-specific preprocessed configuration.
#[derive(Debug)]
pub struct LoadedDeployment {
    pub manifest: Arc<DeploymentManifest>,
    pub configuration: DeploymentConfiguration,
    /// 16 hex chars identifying what this caller will see.
    pub content_id: String,
}

#[derive(Clone)]
struct ManifestSnapshot {
    manifest: Arc<DeploymentManifest>,
    raw_configuration: Arc<String>,
}

/// Read-through loader over the deployment root. The on-disk manifest and raw
/// configuration are cached as a single entry; preprocessing runs per call
/// because it depends on the caller's host parameters.
pub struct ManifestLoader {
    root: PathBuf,
    cache_ttl: Duration,
    cache: VolatileMap<(), LazyFuture<ManifestSnapshot, DeployError>>,
}

impl ManifestLoader {
    pub fn new(root: PathBuf, cache_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        ManifestLoader {
            root,
            cache_ttl,
            cache: VolatileMap::new(clock),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn load(&self, parameters: &HostParameters) -> Result<LoadedDeployment, DeployError> {
        let root = self.root.clone();
        let snapshot = self
            .cache
            .get_or_compute((), self.cache_ttl, async move { read_snapshot(&root).await })
            .await?;

        let preprocessed = preprocess(&snapshot.raw_configuration, parameters)?;
        let content_id = hash::content_id(preprocessed.as_bytes());
        let configuration: DeploymentConfiguration = serde_json::from_str(&preprocessed)
            .map_err(|e| DeployError::json("deployment configuration", &e))?;

        Ok(LoadedDeployment {
            manifest: snapshot.manifest,
            configuration,
            content_id,
        })
    }
}

async fn read_snapshot(root: &Path) -> Result<ManifestSnapshot, DeployError> {
    let manifest_path = root.join(MANIFEST_FILE_NAME);
    let manifest_text = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| DeployError::io(&format!("reading {}", manifest_path.display()), &e))?;
    let manifest: DeploymentManifest = serde_json::from_str(&manifest_text)
        .map_err(|e| DeployError::json("deployment manifest", &e))?;

    let configuration_path = root.join(content_relative_path(&manifest.configuration.hash));
    let raw_configuration = tokio::fs::read_to_string(&configuration_path)
        .await
        .map_err(|e| DeployError::io(&format!("reading {}", configuration_path.display()), &e))?;

    tracing::info!(manifest = %manifest_path.display(), "deployment manifest refreshed");

    Ok(ManifestSnapshot {
        manifest: Arc::new(manifest),
        raw_configuration: Arc::new(raw_configuration),
    })
}
