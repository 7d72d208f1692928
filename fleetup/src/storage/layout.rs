//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::FleetError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout shared by the agent and the coordinator
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Node identity written by the registration service
    pub fn identity_file(&self) -> File {
        File::new(self.base_dir.join("node.json"))
    }

    /// Agent settings file
    pub fn agent_settings_file(&self) -> File {
        File::new(self.base_dir.join("agent.json"))
    }

    /// Coordinator settings file
    pub fn coordinator_settings_file(&self) -> File {
        File::new(self.base_dir.join("coordinator.json"))
    }

    /// Dedicated upgrade work directory; the only place the executor writes
    /// besides the installed binary
    pub fn upgrade_dir(&self) -> UpgradeDir {
        UpgradeDir::new(self.base_dir.join("upgrade"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), FleetError> {
        self.upgrade_dir().dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/fleetup");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".fleetup");

        Self::new(base_dir)
    }
}

/// Files used by a single upgrade
#[derive(Debug, Clone)]
pub struct UpgradeDir {
    dir: Dir,
}

impl UpgradeDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            dir: Dir::new(path),
        }
    }

    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Downloaded artifact awaiting verification
    pub fn staged_binary(&self) -> File {
        self.dir.file("staged.bin")
    }

    /// Copy of the binary installed before the upgrade
    pub fn backup_binary(&self) -> File {
        self.dir.file("backup.bin")
    }

    /// Persisted node upgrade state
    pub fn state_file(&self) -> File {
        self.dir.file("state.json")
    }

    /// Remove the per-upgrade artifacts, keeping the state file
    pub async fn cleanup(&self) -> Result<(), FleetError> {
        self.staged_binary().delete().await?;
        self.backup_binary().delete().await?;
        Ok(())
    }
}
