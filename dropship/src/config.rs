//! Wire and in-memory model for the deployment service.
//!
//! Everything parsed from disk is parsed leniently: unknown fields are
//! ignored, optional blocks default. Nothing here is mutated after
//! construction; refresh is insert-replace in the owning cache.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Parameters identifying the calling host.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct HostParameters {
    pub machine: String,
    pub stamp: String,
    pub ring: String,
    pub environment: String,
    pub configuration_id: String,
    /// Extra preprocessor substitutions supplied by the caller.
    pub properties: HashMap<String, String>,
}

/// Host parameters plus the authorization material and upload switches carried
/// by a deployment request.
#[derive(Clone, Debug)]
pub struct DeploymentParameters {
    pub host: HostParameters,
    pub authorization_secret_name: String,
    pub authorization_secret: String,
    /// Suppresses uploads; manifest entries come back without download URLs.
    pub get_content_info_only: bool,
}

/// One content-addressed file enumerated by the deployment manifest.
/// `hash` is the primary key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    pub hash: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// On-disk manifest enumerating each drop's files, plus the
/// deployment-configuration blob which is itself stored as a
/// content-addressed entry under the deployment root.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentManifest {
    #[serde(default)]
    pub drops: HashMap<String, HashMap<String, FileSpec>>,
    pub configuration: FileSpec,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SecretKind {
    PlainText,
    SasToken,
}

/// Reference to a named secret in the external vault.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretConfiguration {
    /// May be omitted for secret environment variables, in which case the
    /// variable name doubles as the secret name.
    #[serde(default)]
    pub name: Option<String>,
    pub time_to_live_seconds: u64,
    pub kind: SecretKind,
}

impl SecretConfiguration {
    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(self.time_to_live_seconds)
    }
}

/// Launch command for the deployed tool.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfiguration {
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Ordered map: the content-id suffix is derived from this map's JSON
    /// rendering, which must be identical across processes.
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_environment_variables: Option<BTreeMap<String, SecretConfiguration>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DropConfiguration {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub target_relative_path: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServiceConfiguration {
    pub port: u16,
    /// Address of the deployment service itself, used when a machine has no
    /// peer cohort to draw from.
    #[serde(default)]
    pub deployment_service_url: Option<String>,
    pub proxy_address_time_to_live_seconds: u64,
}

impl ProxyServiceConfiguration {
    pub fn proxy_address_time_to_live(&self) -> Duration {
        Duration::from_secs(self.proxy_address_time_to_live_seconds)
    }
}

/// Peer-proxy fan-out settings for a stamp.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfiguration {
    pub domain: String,
    pub seeds: usize,
    pub fan_out_factor: usize,
    /// Target path at which the deployment-configuration file itself is
    /// materialised for proxy nodes.
    pub target_relative_path: String,
    pub service_configuration: ProxyServiceConfiguration,
}

/// Preprocessed, per-caller view of the deployment configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfiguration {
    #[serde(default)]
    pub tool: ToolConfiguration,
    #[serde(default)]
    pub drops: Vec<DropConfiguration>,
    pub azure_storage_secret_info: SecretConfiguration,
    #[serde(default)]
    pub authorization_secret_names: Vec<String>,
    #[serde(default = "default_authorization_secret_ttl_seconds")]
    pub authorization_secret_time_to_live_seconds: u64,
    #[serde(default)]
    pub key_vault_uri: String,
    pub sas_url_time_to_live_seconds: u64,
    #[serde(default)]
    pub proxy: Option<ProxyConfiguration>,
}

fn default_authorization_secret_ttl_seconds() -> u64 {
    5 * 60
}

impl DeploymentConfiguration {
    pub fn sas_url_time_to_live(&self) -> Duration {
        Duration::from_secs(self.sas_url_time_to_live_seconds)
    }

    pub fn authorization_secret_time_to_live(&self) -> Duration {
        Duration::from_secs(self.authorization_secret_time_to_live_seconds)
    }
}

/// Content-addressed catalogue returned to the launcher.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LauncherManifest {
    pub content_id: String,
    pub tool: ToolConfiguration,
    pub drops: Vec<DropConfiguration>,
    /// Target relative path → file, with a signed (or proxied) download URL
    /// unless the request asked for content info only.
    pub deployment: HashMap<String, FileSpec>,
    /// False when background jobs are still producing URLs; the client is
    /// expected to poll again.
    pub is_complete: bool,
}

/// Signed download URL plus the short-lived token under which a peer proxy
/// may retrieve it through the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadInfo {
    pub download_url: String,
    pub access_token: String,
}

/// Embedder-facing settings for constructing the service.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentServiceSettings {
    /// Directory holding `DeploymentManifest.json` and the content-addressed
    /// files available for upload. Read-only during service operation.
    pub deployment_root: PathBuf,
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    #[serde(default = "default_manifest_cache_ttl_seconds")]
    pub manifest_cache_ttl_seconds: u64,
}

fn default_upload_concurrency() -> usize {
    1
}

fn default_manifest_cache_ttl_seconds() -> u64 {
    5 * 60
}

impl DeploymentServiceSettings {
    pub fn new(deployment_root: PathBuf) -> Self {
        DeploymentServiceSettings {
            deployment_root,
            upload_concurrency: default_upload_concurrency(),
            manifest_cache_ttl_seconds: default_manifest_cache_ttl_seconds(),
        }
    }

    pub fn manifest_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.manifest_cache_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips() {
        let mut files = HashMap::new();
        files.insert(
            "bin/tool.exe".to_string(),
            FileSpec {
                hash: "ab12".to_string(),
                size: 10,
                download_url: None,
            },
        );
        let mut drops = HashMap::new();
        drops.insert("https://drop/one".to_string(), files);
        let manifest = DeploymentManifest {
            drops,
            configuration: FileSpec {
                hash: "cd34".to_string(),
                size: 4,
                download_url: None,
            },
        };

        let text = serde_json::to_string(&manifest).unwrap();
        let parsed: DeploymentManifest = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"{
            "azureStorageSecretInfo": {"name": "acct-sas", "timeToLiveSeconds": 60, "kind": "SasToken"},
            "sasUrlTimeToLiveSeconds": 120,
            "futureExtension": {"nested": true}
        }"#;
        let configuration: DeploymentConfiguration = serde_json::from_str(text).unwrap();
        assert_eq!(configuration.sas_url_time_to_live(), Duration::from_secs(120));
        assert!(configuration.drops.is_empty());
        assert!(configuration.proxy.is_none());
    }

    #[test]
    fn settings_defaults_apply() {
        let settings: DeploymentServiceSettings =
            serde_json::from_str(r#"{"deploymentRoot": "/var/deploy"}"#).unwrap();
        assert_eq!(settings.upload_concurrency, 1);
        assert_eq!(settings.manifest_cache_ttl(), Duration::from_secs(300));
    }
}
