//! Settings file management

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Logging section shared by both settings files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,

    /// Directory for rolling log files
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub json: bool,
}

/// HTTP listen address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenSettings {
    pub host: String,
    pub port: u16,
}

/// Node agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub log: LogSettings,

    /// Coordinator base URL used for outcome reports
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,

    /// Artifact download endpoint used when a directive carries no URL
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    /// Path of the binary replaced by upgrades
    #[serde(default = "default_installed_binary")]
    pub installed_binary: PathBuf,

    /// Service unit restarted after replacement
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Local API of the managed service; its `GET /version` confirms a restart
    #[serde(default = "default_status_url")]
    pub status_url: String,

    /// Ed25519 public keys (base64) trusted to sign artifacts, by key id.
    /// When empty, artifacts are checked against their SHA-256 digest only.
    #[serde(default)]
    pub trusted_keys: HashMap<String, String>,

    /// Local directive API
    #[serde(default = "default_agent_listen")]
    pub listen: ListenSettings,

    /// Download attempts before a transient failure becomes permanent
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    /// Base delay for exponential backoff between download attempts
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Delay between restart and running-version verification
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,

    /// How often unreported outcomes are re-sent
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_coordinator_url() -> String {
    "http://localhost:7400/api/v1".to_string()
}

fn default_download_base_url() -> String {
    "http://localhost:7400".to_string()
}

fn default_installed_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/fleetup")
}

fn default_service_name() -> String {
    "fleetup".to_string()
}

fn default_status_url() -> String {
    "http://127.0.0.1:7420".to_string()
}

fn default_agent_listen() -> ListenSettings {
    ListenSettings {
        host: "0.0.0.0".to_string(),
        port: 7420,
    }
}

fn default_download_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_settle_delay_secs() -> u64 {
    5
}

fn default_report_interval_secs() -> u64 {
    15
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            coordinator_url: default_coordinator_url(),
            download_base_url: default_download_base_url(),
            installed_binary: default_installed_binary(),
            service_name: default_service_name(),
            status_url: default_status_url(),
            trusted_keys: HashMap::new(),
            listen: default_agent_listen(),
            download_attempts: default_download_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    #[serde(default)]
    pub log: LogSettings,

    /// Control API address
    #[serde(default = "default_coordinator_listen")]
    pub listen: ListenSettings,

    /// JSON file listing the fleet (node id, platform, endpoint, token hash)
    #[serde(default = "default_inventory_file")]
    pub inventory_file: PathBuf,

    /// Base URL of the artifact source
    #[serde(default = "default_download_base_url")]
    pub artifact_base_url: String,

    /// Key id of the artifact signatures published next to the binaries.
    /// When set, every directive carries the artifact's `.sig`.
    #[serde(default)]
    pub signing_key_id: Option<String>,

    /// Global cap on concurrent directive deliveries
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Delivery attempts per directive before the node counts as unreachable
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,

    #[serde(default = "default_dispatch_retry_delay_secs")]
    pub dispatch_retry_delay_secs: u64,

    /// Control loop tick
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Lower bound on a phase's report window
    #[serde(default = "default_min_report_window_secs")]
    pub min_report_window_secs: u64,

    /// How long compensating directives may take to report
    #[serde(default = "default_rollback_window_secs")]
    pub rollback_window_secs: u64,
}

fn default_coordinator_listen() -> ListenSettings {
    ListenSettings {
        host: "0.0.0.0".to_string(),
        port: 7400,
    }
}

fn default_inventory_file() -> PathBuf {
    PathBuf::from("/var/lib/fleetup/inventory.json")
}

fn default_max_concurrent_dispatches() -> usize {
    64
}

fn default_dispatch_attempts() -> u32 {
    3
}

fn default_dispatch_retry_delay_secs() -> u64 {
    5
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_min_report_window_secs() -> u64 {
    600
}

fn default_rollback_window_secs() -> u64 {
    1800
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            listen: default_coordinator_listen(),
            inventory_file: default_inventory_file(),
            artifact_base_url: default_download_base_url(),
            signing_key_id: None,
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            dispatch_attempts: default_dispatch_attempts(),
            dispatch_retry_delay_secs: default_dispatch_retry_delay_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            min_report_window_secs: default_min_report_window_secs(),
            rollback_window_secs: default_rollback_window_secs(),
        }
    }
}

/// Read a settings file, falling back to defaults when it does not exist
pub async fn load_or_default<T>(file: &File) -> Result<T, FleetError>
where
    T: DeserializeOwned + Default,
{
    if !file.exists().await {
        return Ok(T::default());
    }

    file.read_json().await.map_err(|e| {
        FleetError::ConfigError(format!("Unable to read settings {:?}: {}", file.path(), e))
    })
}
