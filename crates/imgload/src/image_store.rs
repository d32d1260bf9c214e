//! File-backed image store.
//!
//! Image records live in `images/images.json`. Each image's config blob is
//! stored byte for byte in `images/<image-id>/=<base64("sha256:<id>")>`, so
//! the image ID can always be recomputed from what is on disk.

use std::sync::{Arc, Mutex, PoisonError};

use base64::{Engine, engine::general_purpose::STANDARD};
use cap_std::fs::Dir;
use serde::{Deserialize, Serialize};

use crate::digest::{ChainId, Digest, ImageId};
use crate::error::{Result, StorageError};
use crate::image::{Image, ImageConfig};
use crate::layer_store::FileLayerStore;
use crate::storage::{read_json, write_json_atomic};
use crate::store::{ImageStore, LayerStore};

const IMAGES_FILE: &str = "images.json";

/// An image record as stored in `images.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ImageRecord {
    /// Image ID, the digest of the config blob.
    pub id: ImageId,

    /// Chain ID of the top layer, absent for images without layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<ChainId>,

    /// Parent image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ImageId>,

    /// Creation timestamp in RFC3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Size of the config blob in bytes.
    #[serde(default)]
    pub config_size: u64,
}

/// File name of a config blob inside its image directory.
fn config_file_name(id: &ImageId) -> String {
    format!("={}", STANDARD.encode(id.as_str().as_bytes()))
}

/// Image store backed by `images.json` and per-image directories.
#[derive(Debug)]
pub struct FileImageStore {
    dir: Dir,
    layers: Arc<FileLayerStore>,
    lock: Mutex<()>,
}

impl FileImageStore {
    /// Create a store over an opened `images/` directory.
    pub fn new(dir: Dir, layers: Arc<FileLayerStore>) -> Self {
        Self {
            dir,
            layers,
            lock: Mutex::new(()),
        }
    }

    /// List all image records.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_images()
    }

    /// Get an image record.
    pub fn record(&self, id: &ImageId) -> Result<ImageRecord> {
        self.list()?
            .into_iter()
            .find(|i| &i.id == id)
            .ok_or_else(|| StorageError::ImageNotFound(id.to_string()))
    }

    /// Read an image's raw config blob.
    pub fn config(&self, id: &ImageId) -> Result<Vec<u8>> {
        let image_dir = self
            .dir
            .open_dir(id.hex())
            .map_err(|_| StorageError::ImageNotFound(id.to_string()))?;
        Ok(image_dir.read(config_file_name(id))?)
    }

    fn write_config(&self, id: &ImageId, config: &[u8]) -> Result<()> {
        self.dir.create_dir_all(id.hex())?;
        self.dir
            .open_dir(id.hex())?
            .write(config_file_name(id), config)?;
        Ok(())
    }

    /// Load images from `images.json`.
    fn load_images(&self) -> Result<Vec<ImageRecord>> {
        Ok(read_json(&self.dir, IMAGES_FILE)?.unwrap_or_default())
    }

    /// Save images to `images.json` atomically.
    fn save_images(&self, images: &[ImageRecord]) -> Result<()> {
        write_json_atomic(&self.dir, IMAGES_FILE, images)
    }
}

impl ImageStore for FileImageStore {
    fn create(&self, config: &[u8]) -> Result<ImageId> {
        let id = ImageId::new(Digest::from_bytes(config));
        let parsed = ImageConfig::from_json(config)?;
        let top = parsed.rootfs.as_ref().and_then(|r| r.chain_id());

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut images = self.load_images()?;
        if images.iter().any(|i| i.id == id) {
            return Ok(id);
        }

        // Keep the top layer alive for as long as the image exists
        let layer = match &top {
            Some(top) => Some(
                self.layers
                    .get(top)?
                    .ok_or_else(|| StorageError::LayerNotFound(top.to_string()))?,
            ),
            None => None,
        };

        images.push(ImageRecord {
            id: id.clone(),
            layer: top,
            parent: None,
            created: Some(chrono::Utc::now().to_rfc3339()),
            config_size: config.len() as u64,
        });
        let stored = self
            .write_config(&id, config)
            .and_then(|()| self.save_images(&images));
        if let Err(e) = stored {
            if let Some(layer) = layer
                && let Err(release) = self.layers.release(&layer)
            {
                tracing::warn!("failed to release layer {layer}: {release}");
            }
            return Err(e);
        }

        tracing::debug!("created image {id}");
        Ok(id)
    }

    fn get(&self, id: &ImageId) -> Result<Image> {
        let record = self.record(id)?;
        let config = ImageConfig::from_json(&self.config(id)?)?;
        Ok(Image {
            id: record.id,
            config,
            parent: record.parent,
        })
    }

    fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut images = self.load_images()?;
        if !images.iter().any(|i| &i.id == parent) {
            return Err(StorageError::ImageNotFound(parent.to_string()));
        }
        let record = images
            .iter_mut()
            .find(|i| &i.id == id)
            .ok_or_else(|| StorageError::ImageNotFound(id.to_string()))?;
        record.parent = Some(parent.clone());
        self.save_images(&images)
    }
}
