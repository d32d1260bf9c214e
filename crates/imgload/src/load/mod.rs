//! The load pipeline.
//!
//! [`Loader::load`] reads one archive and restores everything in it:
//!
//! 1. The first bytes of the input pick the format. A single filesystem blob
//!    goes to the single-blob loader.
//! 2. Anything else is unpacked, decompressing it first when needed, into a
//!    scratch directory that is removed again on every exit path.
//! 3. With a `manifest.json` at the archive root the manifest loader runs,
//!    otherwise the legacy per-directory loader.
//!
//! Every layer's content is hashed while it is stored and compared with the
//! identity the archive claims for it. A mismatch aborts the load. Images that
//! were fully created before a failure stay in the stores.
//!
//! Progress and results are written as plain text lines to a caller-supplied
//! writer.

mod legacy;
mod manifest;
mod squashfs;

use std::io::{self, Read, Write};
use std::path::PathBuf;

pub use manifest::ManifestItem;

use crate::decompress::decompress_stream;
use crate::digest::{ChainId, ImageId};
use crate::error::{LoadError, StorageError};
use crate::intake::{self, ArchiveFormat, ScratchDir};
use crate::parent::check_valid_parent;
use crate::progress::ProgressReader;
use crate::reference::TaggedReference;
use crate::storage::Storage;
use crate::store::{ForeignSource, ImageStore, Layer, LayerStore, ReferenceStore};

/// Name of the manifest at the root of an archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Options for one load.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Suppress per-layer progress lines.
    pub quiet: bool,
    /// Parent directory for the scratch directory. Defaults to the system
    /// temporary directory.
    pub tmp_dir: Option<PathBuf>,
}

/// Restores image archives into a set of stores.
#[derive(Clone, Copy)]
pub struct Loader<'a> {
    layers: &'a dyn LayerStore,
    images: &'a dyn ImageStore,
    references: &'a dyn ReferenceStore,
}

impl std::fmt::Debug for Loader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("driver", &self.layers.driver().name())
            .finish_non_exhaustive()
    }
}

/// A layer blob inside the scratch directory, about to be registered.
struct LayerBlob<'p> {
    /// Archive-relative path of the blob.
    path: &'p str,
    /// Identifier shown in progress lines.
    progress_id: &'p str,
    /// The stack the layer goes on top of.
    parent: Option<&'p ChainId>,
    foreign: Option<&'p ForeignSource>,
}

impl<'a> Loader<'a> {
    /// A loader writing into the given stores.
    pub fn new(
        layers: &'a dyn LayerStore,
        images: &'a dyn ImageStore,
        references: &'a dyn ReferenceStore,
    ) -> Self {
        Self {
            layers,
            images,
            references,
        }
    }

    /// A loader writing into the stores of a storage root.
    pub fn from_storage(storage: &'a Storage) -> Self {
        Self::new(
            storage.layer_store(),
            storage.image_store(),
            storage.reference_store(),
        )
    }

    /// Load one archive from `input`, writing progress and results to `out`.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed archives, on layer content that does
    /// not match its declared identity, on inconsistent parent declarations
    /// and on any store failure. See [`LoadError`].
    pub fn load<R: Read>(
        &self,
        input: R,
        out: &mut dyn Write,
        opts: &LoadOptions,
    ) -> Result<(), LoadError> {
        let scratch = ScratchDir::new(opts.tmp_dir.as_deref())?;
        tracing::debug!("using scratch directory {}", scratch.path().display());

        let (format, input) = intake::sniff(input)?;
        match format {
            ArchiveFormat::SingleBlob => self.load_single_blob(input, &scratch, out, opts),
            ArchiveFormat::Structured => {
                scratch.unpack(decompress_stream(input)?)?;
                match scratch.open(MANIFEST_FILE) {
                    Ok(manifest) => self.load_manifest(manifest, &scratch, out, opts),
                    Err(LoadError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::debug!("no {MANIFEST_FILE}, loading legacy archive");
                        self.load_legacy(&scratch, out, opts)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Register one layer blob, decompressing it and reporting progress.
    fn load_layer(
        &self,
        scratch: &ScratchDir,
        blob: LayerBlob<'_>,
        out: &mut dyn Write,
        quiet: bool,
    ) -> Result<Layer, LoadError> {
        let layer_io = |source: io::Error| LoadError::LayerIo {
            path: PathBuf::from(blob.path),
            source,
        };
        let file = scratch.open(blob.path)?;

        let raw: Box<dyn Read + '_> = if quiet {
            Box::new(file)
        } else {
            let size = file.metadata().map_err(|e| {
                tracing::debug!("error statting {}: {e}", blob.path);
                layer_io(e)
            })?;
            Box::new(ProgressReader::new(file, out, blob.progress_id, size.len()))
        };
        let mut content = SourceReader::new(decompress_stream(raw).map_err(layer_io)?);

        match self.layers.register(&mut content, blob.parent, blob.foreign) {
            Ok(layer) => Ok(layer),
            Err(StorageError::Io(e)) if content.failed => Err(layer_io(e)),
            Err(e) => Err(e.into()),
        }
    }

    /// Point a tag at a freshly loaded image, noting when it moves.
    fn set_loaded_tag(
        &self,
        reference: &TaggedReference,
        id: &ImageId,
        out: &mut dyn Write,
    ) -> Result<(), LoadError> {
        if let Some(previous) = self.references.get(reference)?
            && &previous != id
        {
            writeln!(
                out,
                "The image {} already exists, renaming the old one with ID {} to empty string",
                reference.familiar(),
                previous
            )?;
        }
        self.references.add_tag(reference, id, true)?;
        Ok(())
    }

    /// Record `parent` as the parent of `id` after checking their histories.
    fn set_parent_id(&self, id: &ImageId, parent: &ImageId) -> Result<(), LoadError> {
        let image = self.images.get(id)?;
        let parent_image = self.images.get(parent)?;
        if !check_valid_parent(&image, &parent_image) {
            return Err(LoadError::InvalidParent {
                image: id.to_string(),
                parent: parent.to_string(),
            });
        }
        self.images.set_parent(id, parent)?;
        Ok(())
    }
}

/// Remembers whether a read error came from the layer blob itself.
struct SourceReader<R> {
    inner: R,
    failed: bool,
}

impl<R: Read> SourceReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            failed: false,
        }
    }
}

impl<R: Read> Read for SourceReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| self.failed = true)
    }
}
