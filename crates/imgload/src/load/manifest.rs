//! Loading archives that carry a `manifest.json`.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Deserializer};

use super::{LayerBlob, LoadOptions, Loader};
use crate::digest::{ChainId, DiffId, ImageId, verify};
use crate::error::LoadError;
use crate::image::ImageConfig;
use crate::intake::ScratchDir;
use crate::parent::{ParentLink, validated_parent_links};
use crate::reference::TaggedReference;
use crate::store::{ForeignSource, LayerGuard};

/// One image entry of `manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestItem {
    /// Archive path of the image config.
    pub config: String,

    /// Tags to apply, as `name:tag`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub repo_tags: Vec<String>,

    /// Archive paths of the layer blobs, base layer first.
    #[serde(default, deserialize_with = "null_as_default")]
    pub layers: Vec<String>,

    /// Declared parent image.
    #[serde(default)]
    pub parent: Option<String>,

    /// Foreign layer descriptors by diff ID.
    #[serde(default, deserialize_with = "null_as_default")]
    pub layer_sources: BTreeMap<DiffId, ForeignSource>,
}

impl ManifestItem {
    /// The declared parent, ignoring empty or malformed values.
    pub fn parent_id(&self) -> Option<ImageId> {
        self.parent
            .as_deref()
            .filter(|p| !p.is_empty())
            .and_then(|p| ImageId::parse(p).ok())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Loader<'_> {
    pub(super) fn load_manifest<R: Read>(
        &self,
        manifest: R,
        scratch: &ScratchDir,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<(), LoadError> {
        let manifest: Vec<ManifestItem> = serde_json::from_reader(manifest)?;

        let mut parent_links = Vec::with_capacity(manifest.len());
        let mut image_ids = String::new();
        let mut tagged = 0usize;

        for item in &manifest {
            let (id, _layers) = self.load_manifest_image(item, scratch, out, opts)?;
            image_ids.push_str(&format!("Loaded image ID: {id}\n"));

            for repo_tag in &item.repo_tags {
                let reference = TaggedReference::parse(repo_tag)?;
                self.set_loaded_tag(&reference, &id, out)?;
                writeln!(out, "Loaded image: {}", reference.familiar())?;
                tagged += 1;
            }

            parent_links.push(ParentLink {
                id: id.clone(),
                parent: item.parent_id(),
            });
            tracing::info!(image = %id, action = "load", "Loaded image {id}");
        }

        for link in validated_parent_links(&parent_links) {
            if let Some(parent) = &link.parent {
                self.set_parent_id(&link.id, parent)?;
            }
        }

        if tagged == 0 {
            out.write_all(image_ids.as_bytes())?;
        }
        Ok(())
    }

    /// Restore the layers of one manifest entry and create its image.
    ///
    /// The returned guards hold the image's layers until the caller is done
    /// tagging it.
    fn load_manifest_image(
        &self,
        item: &ManifestItem,
        scratch: &ScratchDir,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<(ImageId, Vec<LayerGuard<'_>>), LoadError> {
        let config = scratch.read(&item.config)?;
        let image = ImageConfig::from_json(&config)
            .map_err(|e| LoadError::InvalidConfig(format!("{}: {e}", item.config)))?;
        let rootfs = image
            .rootfs
            .as_ref()
            .ok_or_else(|| LoadError::InvalidConfig(format!("{}: missing rootfs", item.config)))?;

        if item.layers.len() != rootfs.diff_ids.len() {
            return Err(LoadError::ManifestMismatch {
                expected: item.layers.len(),
                actual: rootfs.diff_ids.len(),
            });
        }

        let mut guards = Vec::with_capacity(rootfs.diff_ids.len());
        let mut parent: Option<ChainId> = None;
        for (i, (diff_id, path)) in rootfs.diff_ids.iter().zip(&item.layers).enumerate() {
            let chain_id = match &parent {
                Some(parent) => parent.extend(diff_id),
                None => ChainId::from(diff_id.clone()),
            };

            let layer = match self.layers.get(&chain_id)? {
                Some(layer) => {
                    tracing::debug!("layer {chain_id} already present");
                    layer
                }
                None => self.load_layer(
                    scratch,
                    LayerBlob {
                        path,
                        progress_id: diff_id.as_str(),
                        parent: parent.as_ref(),
                        foreign: item.layer_sources.get(diff_id),
                    },
                    out,
                    opts.quiet,
                )?,
            };
            let actual = layer.diff_id.clone();
            guards.push(LayerGuard::new(self.layers, layer));
            verify(diff_id, &actual).map_err(|source| LoadError::Integrity { layer: i, source })?;
            parent = Some(chain_id);
        }

        let id = self.images.create(&config)?;
        Ok((id, guards))
    }
}
