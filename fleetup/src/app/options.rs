//! Application configuration options

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::campaign::coordinator::CoordinatorOptions;
use crate::campaign::dispatch::DispatchOptions;
use crate::node::executor::ExecutorSettings;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{AgentSettings, CoordinatorSettings, ListenSettings};
use crate::utils::CooldownOptions;
use crate::workers::reporter;

/// Node agent options
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Local HTTP server configuration
    pub server: ServerOptions,

    /// Coordinator API base URL, outcome reports go to `{coordinator_url}/reports`
    pub coordinator_url: String,

    /// Download endpoint used when a directive carries no artifact URL
    pub download_base_url: String,

    /// Path of the binary being upgraded
    pub installed_binary: PathBuf,

    /// Service manager unit running the installed binary
    pub service_name: String,

    /// Base URL of the managed service's local API
    pub status_url: String,

    /// Base64 Ed25519 keys trusted to sign artifacts, by key id
    pub trusted_keys: HashMap<String, String>,

    /// Timeout for coordinator requests
    pub http_timeout: Duration,

    /// Timeout for a whole artifact download
    pub download_timeout: Duration,

    /// Executor tuning
    pub executor: ExecutorSettings,

    /// Reporter worker options
    pub reporter: reporter::Options,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::from_settings(StorageLayout::default(), &AgentSettings::default())
    }
}

impl AgentOptions {
    pub fn from_settings(layout: StorageLayout, settings: &AgentSettings) -> Self {
        let retry_cooldown = CooldownOptions {
            base_delay: Duration::from_secs(settings.retry_base_delay_secs),
            ..Default::default()
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions::from(&settings.listen),
            coordinator_url: settings.coordinator_url.clone(),
            download_base_url: settings.download_base_url.clone(),
            installed_binary: settings.installed_binary.clone(),
            service_name: settings.service_name.clone(),
            status_url: settings.status_url.clone(),
            trusted_keys: settings.trusted_keys.clone(),
            http_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(600),
            executor: ExecutorSettings {
                download_attempts: settings.download_attempts.max(1),
                download_backoff: retry_cooldown.clone(),
                settle_delay: Duration::from_secs(settings.settle_delay_secs),
            },
            reporter: reporter::Options {
                interval: Duration::from_secs(settings.report_interval_secs),
                cooldown: retry_cooldown,
                ..Default::default()
            },
        }
    }
}

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorAppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Control API server configuration
    pub server: ServerOptions,

    /// Fleet inventory file
    pub inventory_file: PathBuf,

    /// Base URL of the artifact download endpoint
    pub artifact_base_url: String,

    /// Key id attached to published artifact signatures, if artifacts are signed
    pub signing_key_id: Option<String>,

    /// Timeout for requests to nodes and the artifact endpoint
    pub http_timeout: Duration,

    /// Dispatch pool options
    pub dispatch: DispatchOptions,

    /// Control loop options
    pub coordinator: CoordinatorOptions,
}

impl Default for CoordinatorAppOptions {
    fn default() -> Self {
        Self::from_settings(&CoordinatorSettings::default())
    }
}

impl CoordinatorAppOptions {
    pub fn from_settings(settings: &CoordinatorSettings) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions::from(&settings.listen),
            inventory_file: settings.inventory_file.clone(),
            artifact_base_url: settings.artifact_base_url.clone(),
            signing_key_id: settings.signing_key_id.clone(),
            http_timeout: Duration::from_secs(10),
            dispatch: DispatchOptions {
                max_concurrent: settings.max_concurrent_dispatches.max(1),
                attempts: settings.dispatch_attempts.max(1),
                cooldown: CooldownOptions {
                    base_delay: Duration::from_secs(settings.dispatch_retry_delay_secs),
                    ..Default::default()
                },
            },
            coordinator: CoordinatorOptions {
                tick_interval: Duration::from_millis(settings.tick_interval_ms.max(10)),
                min_report_window: Duration::from_secs(settings.min_report_window_secs),
                rollback_window: Duration::from_secs(settings.rollback_window_secs),
                ..Default::default()
            },
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}

impl From<&ListenSettings> for ServerOptions {
    fn from(listen: &ListenSettings) -> Self {
        Self {
            host: listen.host.clone(),
            port: listen.port,
        }
    }
}
