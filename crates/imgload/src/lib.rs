#![forbid(unsafe_code)]
//! Restore container images and their layer graphs from exported archives.
//!
//! An exported image archive is a tar stream holding image configs, layer
//! blobs and tags. This library reads such a stream once, re-creates every
//! layer in a layer store, verifies each layer against the content identity
//! the archive claims for it, creates the images and applies their tags.
//!
//! # Key Features
//!
//! - **Three archive layouts**: manifest-driven archives, legacy
//!   per-directory archives and single filesystem blobs
//! - **Content verification**: layer diff IDs are recomputed while unpacking
//! - **Layer sharing**: layers already present are reused, never unpacked twice
//! - **Confined archive access**: all reads from the unpacked archive go
//!   through `cap_std::fs::Dir` handles
//! - **Pluggable stores**: the loader only sees the traits in [`store`]
//!
//! # Example
//!
//! ```no_run
//! use imgload::{LoadOptions, Loader, Storage};
//!
//! let storage = Storage::open("/var/lib/imgload/storage")?;
//! let archive = std::fs::File::open("busybox.tar")?;
//!
//! Loader::from_storage(&storage).load(archive, &mut std::io::stdout(), &LoadOptions::default())?;
//! # Ok::<(), imgload::LoadError>(())
//! ```
//!
//! # Command-Line Tool
//!
//! The `imgload` binary wraps the library:
//! ```bash
//! # Load an archive
//! imgload load -i busybox.tar
//!
//! # List what is stored
//! imgload image list
//! imgload layer list --format json
//! ```

// Identities and models
pub mod digest;
pub mod error;
pub mod image;
pub mod parent;
pub mod reference;

// Archive handling
pub mod decompress;
pub mod intake;
pub mod progress;

// Stores
pub mod config;
pub mod driver;
pub mod image_store;
pub mod layer_store;
pub mod reference_store;
pub mod storage;
pub mod store;

// Loading
pub mod load;

// Re-export commonly used types
pub use config::ConfigFile;
pub use digest::{ChainId, DiffId, Digest, ImageId};
pub use error::{LoadError, Result, StorageError};
pub use image::{Image, ImageConfig, RootFs};
pub use load::{LoadOptions, Loader};
pub use reference::TaggedReference;
pub use storage::Storage;

// Store implementations
pub use driver::DirDriver;
pub use image_store::{FileImageStore, ImageRecord};
pub use layer_store::{FileLayerStore, LayerRecord};
pub use reference_store::FileReferenceStore;
