//! Error types for the imgload library.
//!
//! Two layers of errors are used throughout the crate:
//!
//! - [`StorageError`] is returned by the storage collaborators (layer store,
//!   image store, reference store, graph driver). All store operations return
//!   [`Result<T>`], an alias for `Result<T, StorageError>`.
//! - [`LoadError`] is returned by the load pipeline. It wraps storage errors
//!   and adds the load-specific failure taxonomy.
//!
//! # Error Categories
//!
//! Load failures fall into these groups:
//!
//! - **Structure**: [`ManifestMismatch`], [`InvalidConfig`], [`InvalidReference`]
//! - **Content integrity**: [`Integrity`] (always fatal, never retried)
//! - **Archive access**: [`LayerIo`], [`PathEscape`]
//! - **Ancestry**: [`InvalidParent`], [`UnknownParent`]
//! - **Backend**: [`Configuration`], [`Storage`]
//!
//! [`ManifestMismatch`]: LoadError::ManifestMismatch
//! [`InvalidConfig`]: LoadError::InvalidConfig
//! [`InvalidReference`]: LoadError::InvalidReference
//! [`Integrity`]: LoadError::Integrity
//! [`LayerIo`]: LoadError::LayerIo
//! [`PathEscape`]: LoadError::PathEscape
//! [`InvalidParent`]: LoadError::InvalidParent
//! [`UnknownParent`]: LoadError::UnknownParent
//! [`Configuration`]: LoadError::Configuration
//! [`Storage`]: LoadError::Storage
//!
//! # Error Handling Example
//!
//! ```no_run
//! use imgload::{LoadError, Loader, LoadOptions, Storage};
//!
//! # fn example() -> Result<(), LoadError> {
//! let storage = Storage::open("/var/lib/imgload/storage")?;
//! let loader = Loader::from_storage(&storage);
//! let archive = std::fs::File::open("busybox.tar")?;
//! match loader.load(archive, &mut std::io::stdout(), &LoadOptions::default()) {
//!     Err(LoadError::Integrity { layer, source }) => {
//!         eprintln!("layer {layer} is corrupted: {source}");
//!     }
//!     other => other?,
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use crate::digest::DigestMismatch;

/// Result type alias for operations that may return a StorageError.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Storage root directory was not found at the specified path.
    #[error("storage root not found at {0}")]
    RootNotFound(PathBuf),

    /// Storage validation failed with the provided reason.
    #[error("invalid storage: {0}")]
    InvalidStorage(String),

    /// The requested layer was not found.
    #[error("layer not found: {0}")]
    LayerNotFound(String),

    /// The requested image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// A string could not be parsed as a content digest.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A tag already points at another image and overwriting was not requested.
    #[error("tag {reference} is already set to image {existing}")]
    TagConflict {
        /// The conflicting reference.
        reference: String,
        /// The image the tag currently points at.
        existing: String,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Error types for the load pipeline.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The manifest's layer list disagrees with the config's diff list.
    #[error("invalid manifest, layers length mismatch: expected {expected}, got {actual}")]
    ManifestMismatch {
        /// Number of layers listed in the manifest.
        expected: usize,
        /// Number of diff IDs in the image config.
        actual: usize,
    },

    /// The content of a layer does not hash to the identity claimed for it.
    #[error("invalid diffID for layer {layer}: {source}")]
    Integrity {
        /// Position of the layer in the image's root filesystem.
        layer: usize,
        /// The expected and actual digests.
        source: DigestMismatch,
    },

    /// A layer blob in the archive could not be read or decompressed.
    #[error("failed to read layer {path}: {source}")]
    LayerIo {
        /// Path of the layer blob relative to the archive root.
        path: PathBuf,
        /// The underlying I/O failure.
        source: std::io::Error,
    },

    /// A parent edge is structurally inconsistent with the child image.
    #[error("image {parent} is not a valid parent for {image}")]
    InvalidParent {
        /// The child image.
        image: String,
        /// The rejected parent.
        parent: String,
    },

    /// A legacy tag references an image that was never loaded.
    #[error("invalid target ID: {0}")]
    UnknownParent(String),

    /// Required storage backend metadata is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An image config blob could not be interpreted.
    #[error("invalid image config: {0}")]
    InvalidConfig(String),

    /// A repository tag could not be parsed as a tagged reference.
    #[error("invalid tag {0:?}")]
    InvalidReference(String),

    /// An archive path resolves outside of the archive root.
    #[error("path {0} escapes the archive root")]
    PathEscape(PathBuf),

    /// A storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// I/O error while reading the archive.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error in an archive metadata file.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}
