//! Node images. Lima downloads and caches images by itself when a machine
//! is created, so an [`Image`] is little more than the location of a
//! pre-built cloud image for a Kubernetes version.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};
use crate::log::*;

/// File name of the image list, both upstream and in the local config dir.
pub const IMAGES_CONFIG_FILE: &str = "limaimages.json";

/// Image repository version for this version of the driver.
pub const IMAGES_VERSION: &str = "0.1";

/// Where the master list of images is published.
pub fn images_source_url() -> String {
    format!(
        "https://github.com/kuttiproject/driver-lima-images/releases/download/v{IMAGES_VERSION}/{IMAGES_CONFIG_FILE}"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImageStatus {
    NotDownloaded,
    Downloaded,
    #[default]
    Unknown,
}

#[derive(Getters, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "ImageK8sVersion")]
    k8s_version: String,
    #[serde(rename = "ImageSourceURL")]
    source_url: String,
    #[serde(rename = "ImageStatus", default)]
    status: ImageStatus,
    #[serde(rename = "ImageDeprecated", default)]
    deprecated: bool,
}

impl Image {
    pub fn new<S: Into<String>>(k8s_version: S, source_url: S) -> Self {
        Self {
            k8s_version: k8s_version.into(),
            source_url: source_url.into(),
            status: ImageStatus::NotDownloaded,
            deprecated: false,
        }
    }

    pub fn deprecate(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// Lima fetches the image itself on create, so this only records it as
    /// available.
    pub fn fetch(&mut self) {
        self.status = ImageStatus::Downloaded;
    }

    /// Like [`Image::fetch`]; reports completion in one step.
    pub fn fetch_with_progress<F: FnMut(u64, u64)>(&mut self, mut progress: F) {
        progress(100, 100);
        self.status = ImageStatus::Downloaded;
    }

    /// Local image files are not imported; Lima reads the source URL.
    pub fn import_file(&mut self, path: &Path) {
        debug!("ignoring local image file {}", path.display());
        self.status = ImageStatus::Downloaded;
    }

    pub fn purge_local(&mut self) {
        self.status = ImageStatus::NotDownloaded;
    }
}

/// Known images, keyed by Kubernetes version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageCatalog {
    images: BTreeMap<String, Image>,
}

impl ImageCatalog {
    pub fn from_images<I: IntoIterator<Item = Image>>(images: I) -> Self {
        Self {
            images: images
                .into_iter()
                .map(|image| (image.k8s_version.clone(), image))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| DriverError::Config(format!("malformed image list: {e}")))
    }

    /// `limaimages.json` in the user's kutti configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "kutti")
            .map(|dirs| dirs.config_dir().join(IMAGES_CONFIG_FILE))
    }

    /// Load a `limaimages.json` file. A missing file is an empty catalog.
    #[tracing::instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("image list {} not found, no images known", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(DriverError::io("reading image list", path, e)),
        }
    }

    pub fn get(&self, k8s_version: &str) -> Option<&Image> {
        self.images.get(k8s_version)
    }

    pub fn get_mut(&mut self, k8s_version: &str) -> Option<&mut Image> {
        self.images.get_mut(k8s_version)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}
