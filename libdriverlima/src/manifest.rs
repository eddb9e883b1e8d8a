//! The manifest handed to `limactl create`, and where per-machine copies
//! of it live.

use std::path::{Path, PathBuf};

use crate::error::{DriverError, Result};
use crate::log::*;

const MANIFEST_TEMPLATE: &str = include_str!("../assets/knode.yaml");
const IMAGE_SOURCE_PLACEHOLDER: &str = "{{ .ImageSourceUrl }}";

/// Cache subdirectory holding one manifest per machine.
pub const MACHINES_SUBDIR: &str = "driver-lima-machines";

/// Render the node manifest for an image.
pub fn render(image_source_url: &str) -> String {
    MANIFEST_TEMPLATE.replacen(IMAGE_SOURCE_PLACEHOLDER, image_source_url, 1)
}

/// Directory of machine manifests, created on first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// The store under the user's cache directory.
    pub fn in_user_cache() -> Result<Self> {
        let dirs = directories::ProjectDirs::from("", "", "kutti")
            .ok_or_else(|| DriverError::Config("could not determine the user cache directory".into()))?;
        Ok(Self::new(dirs.cache_dir().join(MACHINES_SUBDIR)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the manifest for a machine, by qualified name.
    pub fn path_for(&self, qualified_name: &str) -> PathBuf {
        self.dir.join(format!("{qualified_name}.yaml"))
    }

    /// Write the manifest for `qualified_name`, replacing any earlier one.
    #[tracing::instrument(skip(self))]
    pub async fn write(&self, qualified_name: &str, image_source_url: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DriverError::io("machine file not accessible", &self.dir, e))?;

        let path = self.path_for(qualified_name);
        debug!("writing manifest {}", path.display());
        tokio::fs::write(&path, render(image_source_url))
            .await
            .map_err(|e| DriverError::io("machine file not written", &path, e))?;
        Ok(path)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, qualified_name: &str) -> Result<()> {
        let path = self.path_for(qualified_name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| DriverError::io("machine file not deleted", &path, e))
    }
}
