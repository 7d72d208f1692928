//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::FleetError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, FleetError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read the whole file
    pub async fn read_bytes(&self) -> Result<Vec<u8>, FleetError> {
        Ok(fs::read(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, FleetError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write bytes to file
    pub async fn write_bytes(&self, contents: &[u8]) -> Result<(), FleetError> {
        self.ensure_parent().await?;

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write JSON to file, replacing any previous contents atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), FleetError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), FleetError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    /// Mark the file executable (0o755) on Unix.
    ///
    /// A no-op on non-Unix platforms.
    pub async fn set_executable(&self) -> Result<(), FleetError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = fs::metadata(&self.path).await?;
            let mut perms = meta.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }

    /// Stream the file through SHA-256 and return the lowercase hex digest
    pub async fn sha256_hex(&self) -> Result<String, FleetError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Copy this file to `dest`, preserving permissions
    pub async fn copy_to(&self, dest: &File) -> Result<u64, FleetError> {
        dest.ensure_parent().await?;
        let copied = fs::copy(&self.path, dest.path()).await?;
        Ok(copied)
    }

    /// Move this file over `dest` with a single rename.
    ///
    /// Both paths must live on the same filesystem for the replace to be atomic.
    pub async fn rename_over(&self, dest: &File) -> Result<(), FleetError> {
        fs::rename(&self.path, dest.path()).await?;
        Ok(())
    }

    /// Atomic write using a temporary file
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), FleetError> {
        self.ensure_parent().await?;
        let temp = self.sibling("tmp");

        let mut file = fs::File::create(temp.path()).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        temp.rename_over(self).await
    }

    /// A file next to this one with `suffix` appended to its name
    pub fn sibling(&self, suffix: &str) -> File {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}", suffix));
        File::new(self.path.with_file_name(name))
    }

    async fn ensure_parent(&self) -> Result<(), FleetError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}
