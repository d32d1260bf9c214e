//! Interfaces of the stores the loader writes into.
//!
//! The loader never touches storage directly. It talks to a [`LayerStore`]
//! for layer content, an [`ImageStore`] for image configs and parent edges,
//! and a [`ReferenceStore`] for tags. File-backed implementations live in
//! [`crate::layer_store`], [`crate::image_store`] and
//! [`crate::reference_store`]; tests and embedders may provide their own.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::digest::{ChainId, DiffId, ImageId};
use crate::error::Result;
use crate::image::Image;
use crate::reference::TaggedReference;

/// Descriptor of a layer whose content is distributed from elsewhere.
///
/// Recorded with the layer and otherwise not interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignSource {
    /// Media type of the original blob.
    pub media_type: String,
    /// Size of the original blob.
    #[serde(default)]
    pub size: i64,
    /// Digest of the original blob.
    pub digest: String,
    /// Locations the blob may be fetched from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

/// A layer known to a [`LayerStore`].
///
/// Holding a `Layer` obtained from [`LayerStore::get`] or
/// [`LayerStore::register`] means holding one reference on it, which must be
/// given back with [`LayerStore::release`]. [`LayerGuard`] does that
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Identity of the stack ending in this layer.
    pub chain_id: ChainId,
    /// Identity of this layer's own content.
    pub diff_id: DiffId,
    /// The stack below this layer.
    pub parent: Option<ChainId>,
    /// Size of the uncompressed content.
    pub size: u64,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain_id.fmt(f)
    }
}

/// Description of a layer that was removed from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMetadata {
    /// Identity of the removed stack.
    pub chain_id: ChainId,
    /// Identity of the removed layer content.
    pub diff_id: DiffId,
    /// Size of the removed content.
    pub size: u64,
}

/// A storage backend for layer content.
pub trait GraphDriver: fmt::Debug + Send + Sync {
    /// Driver name.
    fn name(&self) -> &str;

    /// Key/value status pairs. Includes `Root Dir` for file-backed drivers.
    fn status(&self) -> Vec<(String, String)>;

    /// Create an empty layer directory.
    fn create(&self, id: &str, parent: Option<&str>) -> Result<()>;

    /// Apply a layer tar stream to a created layer. Returns the number of
    /// bytes consumed.
    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> Result<u64>;

    /// Delete a layer directory.
    fn remove(&self, id: &str) -> Result<()>;
}

/// Reference-counted layer storage keyed by chain ID.
pub trait LayerStore: Send + Sync {
    /// Look up a layer, taking a reference on it when found.
    fn get(&self, chain_id: &ChainId) -> Result<Option<Layer>>;

    /// Store an uncompressed layer tar stream on top of `parent`.
    ///
    /// The returned layer carries one reference. If the resulting chain is
    /// already stored, the new content is discarded and the existing layer is
    /// returned instead.
    fn register(
        &self,
        content: &mut dyn Read,
        parent: Option<&ChainId>,
        foreign: Option<&ForeignSource>,
    ) -> Result<Layer>;

    /// Drop one reference. Returns the layers that were removed as a result.
    fn release(&self, layer: &Layer) -> Result<Vec<LayerMetadata>>;

    /// The graph driver's storage key for a layer.
    fn cache_id(&self, chain_id: &ChainId) -> Result<String>;

    /// The graph driver backing this store.
    fn driver(&self) -> &dyn GraphDriver;
}

/// Content-addressed image config storage.
pub trait ImageStore: Send + Sync {
    /// Store a config blob. The image ID is the digest of `config`.
    ///
    /// Creating an image that already exists returns its ID. A new image
    /// takes a reference on its top layer, which must already be stored.
    fn create(&self, config: &[u8]) -> Result<ImageId>;

    /// Fetch an image.
    fn get(&self, id: &ImageId) -> Result<Image>;

    /// Record `parent` as the parent of `id`.
    fn set_parent(&self, id: &ImageId, parent: &ImageId) -> Result<()>;
}

/// Tag to image mapping.
pub trait ReferenceStore: Send + Sync {
    /// The image a tag points at.
    fn get(&self, reference: &TaggedReference) -> Result<Option<ImageId>>;

    /// Point a tag at an image. Retargeting an existing tag requires `force`.
    fn add_tag(&self, reference: &TaggedReference, id: &ImageId, force: bool) -> Result<()>;
}

/// Log layers removed by a release.
pub fn log_release_metadata(metadata: &[LayerMetadata]) {
    for m in metadata {
        tracing::info!(
            "Layer {} cleaned up (diff {}, {} bytes)",
            m.chain_id,
            m.diff_id,
            m.size
        );
    }
}

/// Owns one acquired layer reference and releases it when dropped.
pub struct LayerGuard<'a> {
    store: &'a dyn LayerStore,
    layer: Option<Layer>,
}

impl fmt::Debug for LayerGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerGuard")
            .field("layer", &self.layer)
            .finish()
    }
}

impl<'a> LayerGuard<'a> {
    /// Take ownership of a reference on `layer` obtained from `store`.
    pub fn new(store: &'a dyn LayerStore, layer: Layer) -> Self {
        Self {
            store,
            layer: Some(layer),
        }
    }

    /// The guarded layer.
    pub fn layer(&self) -> Option<&Layer> {
        self.layer.as_ref()
    }

    /// Release now and report the outcome.
    pub fn release(mut self) -> Result<Vec<LayerMetadata>> {
        match self.layer.take() {
            Some(layer) => self.store.release(&layer),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for LayerGuard<'_> {
    fn drop(&mut self) {
        if let Some(layer) = self.layer.take() {
            match self.store.release(&layer) {
                Ok(metadata) => log_release_metadata(&metadata),
                Err(e) => tracing::warn!("failed to release layer {}: {}", layer, e),
            }
        }
    }
}
