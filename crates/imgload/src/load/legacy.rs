//! Loading pre-manifest archives.
//!
//! A legacy archive has one directory per image, named by a legacy image ID
//! and holding a v1 config (`json`) and the layer blob (`layer.tar`). Each
//! config names its parent by legacy ID. Tags come from a `repositories`
//! file at the archive root.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;

use super::{LayerBlob, LoadOptions, Loader};
use crate::digest::ImageId;
use crate::error::LoadError;
use crate::image::{RootFs, config_from_v1_config, history_from_v1_config, v1_parent};
use crate::intake::ScratchDir;
use crate::reference::TaggedReference;
use crate::store::{LayerGuard, log_release_metadata};

/// Tag file at the root of a legacy archive.
pub const LEGACY_REPOSITORIES_FILE: &str = "repositories";
/// Per-image v1 config file.
pub const LEGACY_CONFIG_FILE: &str = "json";
/// Per-image layer blob.
pub const LEGACY_LAYER_FILE: &str = "layer.tar";

/// `{name: {tag: legacy id}}`
type LegacyRepositories = BTreeMap<String, BTreeMap<String, String>>;

fn invalid_config(legacy_id: &str, e: serde_json::Error) -> LoadError {
    LoadError::InvalidConfig(format!("{legacy_id}/{LEGACY_CONFIG_FILE}: {e}"))
}

impl Loader<'_> {
    pub(super) fn load_legacy(
        &self,
        scratch: &ScratchDir,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<(), LoadError> {
        let mut loaded = HashMap::new();
        for legacy_id in scratch.subdirectories()? {
            self.load_legacy_image(&legacy_id, scratch, &mut loaded, out, opts)?;
        }

        let repositories: LegacyRepositories =
            serde_json::from_slice(&scratch.read(LEGACY_REPOSITORIES_FILE)?)?;
        for (name, tags) in &repositories {
            for (tag, legacy_id) in tags {
                let id = loaded
                    .get(legacy_id)
                    .ok_or_else(|| LoadError::UnknownParent(legacy_id.clone()))?;
                let reference = TaggedReference::with_tag(name, tag)?;
                self.set_loaded_tag(&reference, id, out)?;
            }
        }
        Ok(())
    }

    /// Load one legacy image, loading its ancestors first.
    fn load_legacy_image(
        &self,
        legacy_id: &str,
        scratch: &ScratchDir,
        loaded: &mut HashMap<String, ImageId>,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<(), LoadError> {
        let mut stack = vec![legacy_id.to_string()];
        let mut waiting = HashSet::new();

        while let Some(current) = stack.last().cloned() {
            if loaded.contains_key(&current) {
                stack.pop();
                continue;
            }

            let config = scratch.read(&format!("{current}/{LEGACY_CONFIG_FILE}"))?;
            let parent = v1_parent(&config).map_err(|e| invalid_config(&current, e))?;

            let parent_id = match parent {
                Some(parent) => match loaded.get(&parent) {
                    Some(id) => Some(id.clone()),
                    None => {
                        if waiting.contains(&parent) {
                            return Err(LoadError::InvalidParent {
                                image: current,
                                parent,
                            });
                        }
                        waiting.insert(current);
                        stack.push(parent);
                        continue;
                    }
                },
                None => None,
            };

            let id = self.import_legacy_image(&current, &config, parent_id, scratch, out, opts)?;
            waiting.remove(&current);
            loaded.insert(current, id);
            stack.pop();
        }
        Ok(())
    }

    /// Register the layer of a legacy image and create the image on top of
    /// its already loaded parent.
    fn import_legacy_image(
        &self,
        legacy_id: &str,
        v1_config: &[u8],
        parent_id: Option<ImageId>,
        scratch: &ScratchDir,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<ImageId, LoadError> {
        let (mut rootfs, mut history) = match &parent_id {
            Some(parent) => {
                let parent = self.images.get(parent)?;
                (parent.rootfs(), parent.history().to_vec())
            }
            None => (RootFs::new(), Vec::new()),
        };

        let parent_chain = rootfs.chain_id();
        let layer_path = format!("{legacy_id}/{LEGACY_LAYER_FILE}");
        let layer = self.load_layer(
            scratch,
            LayerBlob {
                path: &layer_path,
                progress_id: legacy_id,
                parent: parent_chain.as_ref(),
                foreign: None,
            },
            out,
            opts.quiet,
        )?;
        rootfs.append(layer.diff_id.clone());
        let guard = LayerGuard::new(self.layers, layer);

        history.push(
            history_from_v1_config(v1_config, false).map_err(|e| invalid_config(legacy_id, e))?,
        );
        let config = config_from_v1_config(v1_config, &rootfs, &history)
            .map_err(|e| invalid_config(legacy_id, e))?;
        let id = self.images.create(&config)?;

        let metadata = guard.release()?;
        log_release_metadata(&metadata);

        if let Some(parent) = &parent_id {
            self.images.set_parent(&id, parent)?;
        }
        tracing::debug!("loaded legacy image {legacy_id} as {id}");
        Ok(id)
    }
}
