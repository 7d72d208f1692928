//! Host service manager integration

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::FleetError;
use crate::http::client::HttpClient;
use crate::utils::VersionInfo;

/// Restarts and inspects the managed service
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Restart the running instance
    async fn restart(&self) -> Result<(), FleetError>;

    /// Whether the service manager reports the service as active
    async fn is_active(&self) -> Result<bool, FleetError>;

    /// Version reported by the running instance
    async fn running_version(&self) -> Result<String, FleetError>;
}

/// systemd-backed service manager.
///
/// The version comes from the live instance's `GET /version`, so a restart
/// that left the old process in place is caught even though the file on disk
/// is already the new build.
pub struct SystemdServiceManager {
    service_name: String,
    instance: HttpClient,
}

impl SystemdServiceManager {
    pub fn new(service_name: impl Into<String>, instance: HttpClient) -> Self {
        Self {
            service_name: service_name.into(),
            instance,
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn restart(&self) -> Result<(), FleetError> {
        info!("Restarting service {}", self.service_name);

        let output = Command::new("systemctl")
            .args(["restart", &self.service_name])
            .output()
            .await
            .map_err(|e| FleetError::ServiceError(format!("failed to run systemctl: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FleetError::ServiceError(format!(
                "systemctl restart {} failed: {}",
                self.service_name,
                stderr.trim()
            )));
        }

        Ok(())
    }

    async fn is_active(&self) -> Result<bool, FleetError> {
        // `is-active` exits non-zero for inactive units, so only stdout matters.
        let output = Command::new("systemctl")
            .args(["is-active", &self.service_name])
            .output()
            .await
            .map_err(|e| FleetError::ServiceError(format!("failed to run systemctl: {}", e)))?;

        let state = String::from_utf8_lossy(&output.stdout);
        debug!("Service {} is {}", self.service_name, state.trim());
        Ok(state.trim() == "active")
    }

    async fn running_version(&self) -> Result<String, FleetError> {
        let info: VersionInfo = self.instance.get("/version", None).await.map_err(|e| {
            FleetError::ServiceError(format!(
                "{} did not report its version at {}: {}",
                self.service_name,
                self.instance.base_url(),
                e
            ))
        })?;
        Ok(info.version.trim_start_matches('v').to_string())
    }
}
