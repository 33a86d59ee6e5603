//! At-most-once upload pipeline producing signed download URLs.
//!
//! Concurrent callers for the same `(account, hash)` pair share one producer
//! through the cache; the action queue bounds how many distinct hashes upload
//! at once.

use crate::config::{DeploymentConfiguration, DownloadInfo, FileSpec};
use crate::errors::DeployError;
use crate::manifest::content_relative_path;
use crate::metrics_defs::{FILES_UPLOADED, SAS_URLS_REUSED};
use crate::storage::CentralStorage;
use crate::tokens::TokenRegistry;
use metrics::counter;
use rand::Rng;
use shared::action_queue::ActionQueue;
use shared::clock::Clock;
use shared::lazy::LazyFuture;
use shared::volatile_map::VolatileMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Issued SAS expiry is twice the cache TTL: a URL handed out just before its
/// cache entry lapses still has a full `sasUrlTimeToLive` remaining.
const SAS_EXPIRY_FACTOR: u32 = 2;

/// Token entries strictly outlive the URL's effective TTL.
fn token_time_to_live(sas_ttl: Duration) -> Duration {
    sas_ttl + sas_ttl / 2
}

pub struct UploadCoordinator {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    queue: ActionQueue,
    tokens: Arc<TokenRegistry>,
    cache: VolatileMap<(String, String), LazyFuture<DownloadInfo, DeployError>>,
}

impl UploadCoordinator {
    pub fn new(
        root: PathBuf,
        upload_concurrency: usize,
        tokens: Arc<TokenRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        UploadCoordinator {
            root,
            clock: clock.clone(),
            queue: ActionQueue::new(upload_concurrency),
            tokens,
            cache: VolatileMap::new(clock),
        }
    }

    /// Guarantees the file is retrievable from storage and returns its signed
    /// URL together with a fresh access token. At most one upload happens per
    /// `(account, hash)` per TTL epoch; failures and cancellations evict the
    /// entry so the next caller retries.
    pub async fn ensure_uploaded(
        &self,
        file: &FileSpec,
        configuration: &DeploymentConfiguration,
        storage: Arc<dyn CentralStorage>,
        cancel: &CancellationToken,
    ) -> Result<DownloadInfo, DeployError> {
        let account = configuration
            .azure_storage_secret_info
            .name
            .clone()
            .ok_or_else(|| {
                DeployError::Malformed("azureStorageSecretInfo requires a secret name".to_string())
            })?;
        let sas_ttl = configuration.sas_url_time_to_live();
        let key = (account, file.hash.clone());

        let queue = self.queue.clone();
        let job = upload_job(
            self.root.clone(),
            self.clock.clone(),
            self.tokens.clone(),
            storage,
            file.clone(),
            sas_ttl,
            cancel.clone(),
        );
        self.cache
            .get_or_compute(key, sas_ttl, async move { queue.run(job).await })
            .await
    }
}

async fn upload_job(
    root: PathBuf,
    clock: Arc<dyn Clock>,
    tokens: Arc<TokenRegistry>,
    storage: Arc<dyn CentralStorage>,
    file: FileSpec,
    sas_ttl: Duration,
    cancel: CancellationToken,
) -> Result<DownloadInfo, DeployError> {
    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled);
    }

    let relative_path = content_relative_path(&file.hash);
    let expiry = clock.utc_now() + SAS_EXPIRY_FACTOR * sas_ttl;

    let download_url = match storage
        .try_get_sas_url(&cancel, &relative_path, expiry)
        .await?
    {
        Some(url) => {
            counter!(SAS_URLS_REUSED.name).increment(1);
            url
        }
        None => {
            let local_path = root.join(&relative_path);
            tracing::info!(hash = %file.hash, size = file.size, "uploading deployment file");
            storage
                .upload_file(&cancel, &local_path, &relative_path)
                .await?;
            counter!(FILES_UPLOADED.name).increment(1);
            storage
                .try_get_sas_url(&cancel, &relative_path, expiry)
                .await?
                .ok_or_else(|| {
                    DeployError::Transient(format!(
                        "uploaded object {relative_path} is not visible in storage"
                    ))
                })?
        }
    };

    let access_token = random_hex_token();
    tokens.register(
        access_token.clone(),
        download_url.clone(),
        token_time_to_live(sas_ttl),
    );

    Ok(DownloadInfo {
        download_url,
        access_token,
    })
}

/// 32 hex chars of thread-local randomness.
fn random_hex_token() -> String {
    let token: u128 = rand::rng().random();
    format!("{token:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{DeploymentRootBuilder, MemoryStorage};
    use shared::clock::ManualClock;
    use shared::hash;
    use std::time::SystemTime;

    fn configuration(sas_ttl_seconds: u64) -> DeploymentConfiguration {
        serde_json::from_str(&format!(
            r#"{{
                "azureStorageSecretInfo": {{"name": "acct-sas", "timeToLiveSeconds": 300, "kind": "SasToken"}},
                "sasUrlTimeToLiveSeconds": {sas_ttl_seconds}
            }}"#
        ))
        .unwrap()
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        tokens: Arc<TokenRegistry>,
        storage: Arc<MemoryStorage>,
        coordinator: UploadCoordinator,
        _root: tempfile::TempDir,
        file: FileSpec,
    }

    fn fixture() -> Fixture {
        fixture_with_width(1)
    }

    fn fixture_with_width(width: usize) -> Fixture {
        let contents = b"payload".to_vec();
        let root = DeploymentRootBuilder::new()
            .with_file("drop1", "file.txt", &contents)
            .finish(
                r#"{
                    "azureStorageSecretInfo": {"name": "acct-sas", "timeToLiveSeconds": 300, "kind": "SasToken"},
                    "sasUrlTimeToLiveSeconds": 600
                }"#,
            );
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let tokens = Arc::new(TokenRegistry::new(clock.clone()));
        let storage = Arc::new(MemoryStorage::default());
        let coordinator = UploadCoordinator::new(
            root.path().to_path_buf(),
            width,
            tokens.clone(),
            clock.clone(),
        );
        let file = FileSpec {
            hash: hash::content_id(&contents),
            size: contents.len() as i64,
            download_url: None,
        };
        Fixture {
            clock,
            tokens,
            storage,
            coordinator,
            _root: root,
            file,
        }
    }

    #[tokio::test]
    async fn uploads_once_and_returns_signed_url() {
        let f = fixture();
        let info = f
            .coordinator
            .ensure_uploaded(
                &f.file,
                &configuration(600),
                f.storage.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(info.download_url.contains("?sv="));
        assert_eq!(info.access_token.len(), 32);
        assert_eq!(f.storage.uploads(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_upload() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let cfg = configuration(600);

        let (a, b, c) = tokio::join!(
            f.coordinator
                .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel),
            f.coordinator
                .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel),
            f.coordinator
                .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel),
        );
        let a = a.unwrap();
        assert_eq!(a, b.unwrap());
        assert_eq!(a, c.unwrap());
        assert_eq!(f.storage.uploads(), 1);
    }

    #[tokio::test]
    async fn present_object_skips_upload() {
        let f = fixture();
        f.storage
            .seed_object(&content_relative_path(&f.file.hash));

        let info = f
            .coordinator
            .ensure_uploaded(
                &f.file,
                &configuration(600),
                f.storage.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(info.download_url.contains("?sv="));
        assert_eq!(f.storage.uploads(), 0);
    }

    #[tokio::test]
    async fn sas_expiry_is_twice_the_ttl() {
        let f = fixture();
        f.coordinator
            .ensure_uploaded(
                &f.file,
                &configuration(600),
                f.storage.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let expiry = f.storage.last_sas_expiry().unwrap();
        assert_eq!(
            expiry,
            f.clock.utc_now() + Duration::from_secs(1200)
        );
    }

    #[tokio::test]
    async fn access_token_outlives_the_url_window() {
        let f = fixture();
        let info = f
            .coordinator
            .ensure_uploaded(
                &f.file,
                &configuration(600),
                f.storage.clone(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Still resolvable at the full sasUrlTimeToLive mark...
        f.clock.advance(Duration::from_secs(600));
        assert!(f.tokens.try_get_download_url(&info.access_token).is_ok());

        // ...but not beyond one and a half times it.
        f.clock.advance(Duration::from_secs(301));
        assert!(f.tokens.try_get_download_url(&info.access_token).is_err());
    }

    #[tokio::test]
    async fn expired_cache_entry_mints_a_fresh_token() {
        let f = fixture();
        let cfg = configuration(600);
        let cancel = CancellationToken::new();

        let first = f
            .coordinator
            .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel)
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(601));
        let second = f
            .coordinator
            .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel)
            .await
            .unwrap();

        assert_ne!(first.access_token, second.access_token);
        // The object was already in storage, so no second upload happened.
        assert_eq!(f.storage.uploads(), 1);
    }

    #[tokio::test]
    async fn failed_upload_is_invalidated_and_retried() {
        let f = fixture();
        f.storage.fail_uploads(true);
        let cfg = configuration(600);
        let cancel = CancellationToken::new();

        let error = f
            .coordinator
            .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, DeployError::Transient(_)));

        f.storage.fail_uploads(false);
        f.coordinator
            .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel)
            .await
            .unwrap();
        assert_eq!(f.storage.uploads(), 1);
    }

    #[tokio::test]
    async fn cancelled_request_is_invalidated_and_retried() {
        let f = fixture();
        let cfg = configuration(600);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let error = f
            .coordinator
            .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancelled)
            .await
            .unwrap_err();
        assert_eq!(error, DeployError::Cancelled);

        f.coordinator
            .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn distinct_hashes_upload_independently() {
        let f = fixture_with_width(4);
        let cfg = configuration(600);
        let cancel = CancellationToken::new();

        let other = FileSpec {
            hash: "00ff00ff00ff00ff".to_string(),
            size: 1,
            download_url: None,
        };
        // Second file does not exist locally, but the object is already
        // present remotely so no upload is attempted for it.
        f.storage.seed_object(&content_relative_path(&other.hash));

        let (a, b) = tokio::join!(
            f.coordinator
                .ensure_uploaded(&f.file, &cfg, f.storage.clone(), &cancel),
            f.coordinator
                .ensure_uploaded(&other, &cfg, f.storage.clone(), &cancel),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_ne!(a.access_token, b.access_token);
        assert_eq!(f.storage.uploads(), 1);
    }
}
