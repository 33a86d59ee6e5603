//! In-memory collaborators for tests: a vault, an object store with failure
//! injection and call counters, and a deployment-root builder.

use crate::config::{DeploymentManifest, FileSpec};
use crate::errors::DeployError;
use crate::manifest::{MANIFEST_FILE_NAME, content_relative_path};
use crate::secrets::SecretsProvider;
use crate::storage::CentralStorage;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared::hash;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Vault backed by a map, counting round-trips.
#[derive(Default)]
pub struct MemoryVault {
    secrets: RwLock<HashMap<String, String>>,
    fetches: AtomicUsize,
}

impl MemoryVault {
    pub fn put(&self, name: &str, value: &str) {
        self.secrets
            .write()
            .insert(name.to_string(), value.to_string());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretsProvider for MemoryVault {
    async fn get_plain_secret(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.secrets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("secret '{name}'")))
    }
}

/// Object store backed by a set of remote paths. Presence drives
/// `try_get_sas_url`; uploads read the local file so a missing source fails
/// the way a real store client would.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashSet<String>>,
    startups: AtomicUsize,
    uploads: AtomicUsize,
    sas_requests: AtomicUsize,
    fail_startup: AtomicBool,
    fail_uploads: AtomicBool,
    last_sas_expiry: Mutex<Option<SystemTime>>,
}

impl MemoryStorage {
    pub fn startups(&self) -> usize {
        self.startups.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn sas_requests(&self) -> usize {
        self.sas_requests.load(Ordering::SeqCst)
    }

    pub fn seed_object(&self, remote_path: &str) {
        self.objects.write().insert(remote_path.to_string());
    }

    pub fn contains_object(&self, remote_path: &str) -> bool {
        self.objects.read().contains(remote_path)
    }

    pub fn fail_startup(&self, fail: bool) {
        self.fail_startup.store(fail, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn last_sas_expiry(&self) -> Option<SystemTime> {
        *self.last_sas_expiry.lock()
    }
}

#[async_trait]
impl CentralStorage for MemoryStorage {
    async fn startup(&self, cancel: &CancellationToken) -> Result<(), DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        self.startups.fetch_add(1, Ordering::SeqCst);
        if self.fail_startup.load(Ordering::SeqCst) {
            return Err(DeployError::Transient("storage unreachable".to_string()));
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        cancel: &CancellationToken,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(DeployError::Transient("upload refused".to_string()));
        }
        tokio::fs::read(local_path)
            .await
            .map_err(|e| DeployError::io(&format!("reading {}", local_path.display()), &e))?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.objects.write().insert(remote_path.to_string());
        Ok(())
    }

    async fn try_get_sas_url(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        expiry: SystemTime,
    ) -> Result<Option<String>, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        self.sas_requests.fetch_add(1, Ordering::SeqCst);
        *self.last_sas_expiry.lock() = Some(expiry);
        if !self.objects.read().contains(remote_path) {
            return Ok(None);
        }
        let expiry_seconds = expiry
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Ok(Some(format!(
            "https://blob.test/deploymentfiles/{remote_path}?sv=stub&se={expiry_seconds}&sig=stub"
        )))
    }
}

/// Builds a deployment root on disk: content-addressed files, the
/// configuration blob, and `DeploymentManifest.json` tying them together.
#[derive(Default)]
pub struct DeploymentRootBuilder {
    files: Vec<(String, String, Vec<u8>)>,
}

impl DeploymentRootBuilder {
    pub fn new() -> Self {
        DeploymentRootBuilder::default()
    }

    pub fn with_file(mut self, drop_url: &str, relative_path: &str, contents: &[u8]) -> Self {
        self.files
            .push((drop_url.to_string(), relative_path.to_string(), contents.to_vec()));
        self
    }

    pub fn finish(self, configuration_json: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("creating deployment root");
        self.finish_into(dir, configuration_json)
    }

    /// Writes the root into an existing directory, for tests that fix up a
    /// previously broken root in place.
    pub fn finish_into(
        self,
        dir: tempfile::TempDir,
        configuration_json: &str,
    ) -> tempfile::TempDir {
        let root = dir.path();
        let mut drops: HashMap<String, HashMap<String, FileSpec>> = HashMap::new();

        for (drop_url, relative_path, contents) in &self.files {
            let file_hash = hash::content_id(contents);
            write_content(root, &file_hash, contents);
            drops.entry(drop_url.clone()).or_default().insert(
                relative_path.clone(),
                FileSpec {
                    hash: file_hash,
                    size: contents.len() as i64,
                    download_url: None,
                },
            );
        }

        let configuration_hash = hash::content_id(configuration_json.as_bytes());
        write_content(root, &configuration_hash, configuration_json.as_bytes());

        let manifest = DeploymentManifest {
            drops,
            configuration: FileSpec {
                hash: configuration_hash,
                size: configuration_json.len() as i64,
                download_url: None,
            },
        };
        std::fs::write(
            root.join(MANIFEST_FILE_NAME),
            serde_json::to_vec(&manifest).expect("serializing manifest"),
        )
        .expect("writing manifest");

        dir
    }
}

fn write_content(root: &Path, content_hash: &str, contents: &[u8]) {
    let path = root.join(content_relative_path(content_hash));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("creating shard directory");
    }
    std::fs::write(path, contents).expect("writing content file");
}
