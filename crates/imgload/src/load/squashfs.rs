//! Loading a single filesystem blob.
//!
//! The blob is not unpacked. It is copied next to the graph driver's layers
//! under `squashfs/`, and a one-file layer naming the blob's hash stands in
//! for it in the layer store. The copy is finally renamed to the layer's
//! cache ID so the two can be found from each other.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use super::{LayerBlob, LoadOptions, Loader};
use crate::digest::{ChainId, DiffIdReader, compute_diff_id, verify};
use crate::driver::{SQUASHFS_DIR, STATUS_ROOT_DIR};
use crate::error::LoadError;
use crate::image::{ImageConfig, RootFs};
use crate::intake::ScratchDir;
use crate::store::LayerGuard;

/// Synthetic layer archive written to the scratch directory.
const CONTENT_TAR: &str = "content.tar";
/// The single entry of the synthetic layer.
const CONTENT_ENTRY: &str = "SQUASHFS";
const BLOB_PREFIX: &str = "import-";

impl Loader<'_> {
    pub(super) fn load_single_blob<R: Read>(
        &self,
        input: R,
        scratch: &ScratchDir,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<(), LoadError> {
        let root = self
            .layers
            .driver()
            .status()
            .into_iter()
            .find(|(key, value)| key == STATUS_ROOT_DIR && !value.is_empty())
            .map(|(_, value)| PathBuf::from(value))
            .ok_or_else(|| {
                LoadError::Configuration("cannot get root dir from graph driver".to_string())
            })?;
        let blob_dir = root.join(SQUASHFS_DIR);
        std::fs::create_dir_all(&blob_dir)?;

        // Copy the blob aside, hashing it on the way
        let mut blob = tempfile::Builder::new()
            .prefix(BLOB_PREFIX)
            .tempfile_in(&blob_dir)?;
        let mut hashing = DiffIdReader::new(input);
        io::copy(&mut hashing, blob.as_file_mut())?;
        let (blob_digest, blob_size) = hashing.finish()?;
        tracing::debug!("received single-blob image of {blob_size} bytes");

        write_content_tar(scratch, blob_digest.hex())?;
        let diff_id = compute_diff_id(scratch.open(CONTENT_TAR)?)?;
        writeln!(out, "diffID:{diff_id}")?;

        let chain_id = ChainId::from(diff_id.clone());
        let existing = self.layers.get(&chain_id)?;
        writeln!(out, "chainID:{chain_id}")?;
        let layer = match existing {
            Some(layer) => layer,
            None => self.load_layer(
                scratch,
                LayerBlob {
                    path: CONTENT_TAR,
                    progress_id: diff_id.as_str(),
                    parent: None,
                    foreign: None,
                },
                out,
                opts.quiet,
            )?,
        };
        writeln!(out, "layer:{layer}")?;
        let actual = layer.diff_id.clone();
        let _guard = LayerGuard::new(self.layers, layer);

        let cache_id = self.layers.cache_id(&chain_id)?;
        let destination = blob_dir.join(cache_id);
        writeln!(out, "destination:{}", destination.display())?;
        blob.persist(&destination).map_err(io::Error::from)?;

        verify(&diff_id, &actual).map_err(|source| LoadError::Integrity { layer: 0, source })?;

        let mut rootfs = RootFs::new();
        rootfs.append(diff_id);
        let config = serde_json::to_vec(&ImageConfig::with_rootfs(rootfs))?;
        let id = self.images.create(&config)?;
        writeln!(out, "Loaded image ID: {id}")?;
        Ok(())
    }
}

/// Write the stand-in layer: a tar with one entry holding the blob's hash.
fn write_content_tar(scratch: &ScratchDir, blob_hex: &str) -> io::Result<()> {
    let file = scratch.dir().create(CONTENT_TAR)?;
    let mut builder = tar::Builder::new(file);
    let mut header = tar::Header::new_ustar();
    header.set_mode(0o600);
    header.set_size(blob_hex.len() as u64);
    builder.append_data(&mut header, CONTENT_ENTRY, blob_hex.as_bytes())?;
    builder.into_inner()?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StorageError};
    use crate::storage::Storage;
    use crate::store::{ForeignSource, GraphDriver, Layer, LayerMetadata, LayerStore};

    /// A driver whose status lacks a root directory.
    #[derive(Debug)]
    struct StatuslessDriver;

    impl GraphDriver for StatuslessDriver {
        fn name(&self) -> &str {
            "statusless"
        }

        fn status(&self) -> Vec<(String, String)> {
            vec![("Backing Filesystem".to_string(), "tmpfs".to_string())]
        }

        fn create(&self, id: &str, _: Option<&str>) -> Result<()> {
            Err(StorageError::InvalidStorage(format!("cannot create {id}")))
        }

        fn apply_diff(&self, id: &str, _: &mut dyn Read) -> Result<u64> {
            Err(StorageError::InvalidStorage(format!("cannot apply to {id}")))
        }

        fn remove(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct StatuslessLayers(StatuslessDriver);

    impl LayerStore for StatuslessLayers {
        fn get(&self, _: &ChainId) -> Result<Option<Layer>> {
            Ok(None)
        }

        fn register(
            &self,
            _: &mut dyn Read,
            _: Option<&ChainId>,
            _: Option<&ForeignSource>,
        ) -> Result<Layer> {
            Err(StorageError::InvalidStorage("read-only".to_string()))
        }

        fn release(&self, _: &Layer) -> Result<Vec<LayerMetadata>> {
            Ok(Vec::new())
        }

        fn cache_id(&self, chain_id: &ChainId) -> Result<String> {
            Err(StorageError::LayerNotFound(chain_id.to_string()))
        }

        fn driver(&self) -> &dyn GraphDriver {
            &self.0
        }
    }

    #[test]
    fn test_single_blob_needs_driver_root() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::open(tmp.path().join("storage")).unwrap();
        let layers = StatuslessLayers(StatuslessDriver);
        let loader = Loader::new(&layers, storage.image_store(), storage.reference_store());

        let mut blob = b"hsqs".to_vec();
        blob.extend_from_slice(&[0u8; 512]);
        let mut out = Vec::new();
        let opts = LoadOptions {
            quiet: false,
            tmp_dir: Some(tmp.path().to_path_buf()),
        };
        let err = loader.load(&blob[..], &mut out, &opts).unwrap_err();
        match err {
            LoadError::Configuration(msg) => {
                assert_eq!(msg, "cannot get root dir from graph driver")
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(out.is_empty());
        assert!(!tmp.path().join(SQUASHFS_DIR).exists());

        assert!(storage.image_store().list().unwrap().is_empty());
    }

    #[test]
    fn test_content_tar() {
        let scratch = ScratchDir::new(None).unwrap();
        let hex = "ab".repeat(32);
        write_content_tar(&scratch, &hex).unwrap();

        let mut archive = tar::Archive::new(scratch.open(CONTENT_TAR).unwrap());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some(CONTENT_ENTRY));
        assert_eq!(entry.header().mode().unwrap(), 0o600);
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, hex);
        drop(entry);
        assert!(entries.next().is_none());

        // Same input, same diff ID.
        let first = compute_diff_id(scratch.open(CONTENT_TAR).unwrap()).unwrap();
        write_content_tar(&scratch, &hex).unwrap();
        let second = compute_diff_id(scratch.open(CONTENT_TAR).unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
