//! Storage root holding the file-backed stores.
//!
//! # Storage Structure
//!
//! ```text
//! <root>/
//! ├── layers/layers.json           # layer records
//! ├── images/images.json           # image records
//! ├── images/<image-id>/=<b64key>  # config blob, key = base64("sha256:<id>")
//! ├── images/repositories.json     # tags
//! └── dir/                         # graph driver root
//!     ├── <cache-id>/diff/         # unpacked layer content
//!     └── squashfs/                # single-blob images
//! ```
//!
//! All metadata files are JSON and rewritten atomically. Each store
//! serializes its own read-modify-write cycles, so a [`Storage`] can be
//! shared between threads.
//!
//! # Discovery
//!
//! ```no_run
//! use imgload::Storage;
//!
//! // Automatic discovery from default locations
//! let storage = Storage::discover()?;
//!
//! // Or open at specific path
//! let storage = Storage::open("/var/lib/imgload/storage")?;
//! # Ok::<(), imgload::StorageError>(())
//! ```

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ConfigFile;
use crate::driver::DirDriver;
use crate::error::{Result, StorageError};
use crate::image_store::FileImageStore;
use crate::layer_store::FileLayerStore;
use crate::reference_store::FileReferenceStore;

/// Environment variable overriding the storage root.
pub const STORAGE_ROOT_ENV: &str = "IMGLOAD_STORAGE_ROOT";

const LAYERS_DIR: &str = "layers";
const IMAGES_DIR: &str = "images";
const DRIVER_DIR: &str = "dir";

/// Read and parse a JSON file, `None` when it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(dir: &Dir, name: &str) -> Result<Option<T>> {
    match dir.read(name) {
        Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Write a JSON file atomically.
///
/// This writes to a temporary file first, then renames it into place.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(
    dir: &Dir,
    name: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let temp_name = format!("{name}.{}.tmp", std::process::id());
    dir.write(&temp_name, &json)?;
    dir.rename(&temp_name, dir, name)?;
    Ok(())
}

/// Handle on a storage root and its stores.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    layers: Arc<FileLayerStore>,
    images: FileImageStore,
    references: FileReferenceStore,
}

impl Storage {
    /// Open storage at the given root path, creating the layout when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the root or one of its subdirectories cannot be
    /// created or opened.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use imgload::Storage;
    ///
    /// let storage = Storage::open("/var/lib/imgload/storage")?;
    /// # Ok::<(), imgload::StorageError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in [LAYERS_DIR, IMAGES_DIR] {
            std::fs::create_dir_all(root.join(sub))?;
        }

        let root_dir = Dir::open_ambient_dir(&root, ambient_authority()).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::RootNotFound(root.clone())
            } else {
                StorageError::Io(e)
            }
        })?;

        let driver = DirDriver::open(root.join(DRIVER_DIR))?;
        let layers = Arc::new(FileLayerStore::new(root_dir.open_dir(LAYERS_DIR)?, driver));
        let images = FileImageStore::new(root_dir.open_dir(IMAGES_DIR)?, Arc::clone(&layers));
        let references = FileReferenceStore::new(root_dir.open_dir(IMAGES_DIR)?);

        tracing::debug!("opened storage at {}", root.display());
        Ok(Self {
            root,
            layers,
            images,
            references,
        })
    }

    /// Discover the storage root from default locations.
    ///
    /// Searches in the following order:
    /// 1. `$IMGLOAD_STORAGE_ROOT`
    /// 2. `root` from the configuration file
    /// 3. `$XDG_DATA_HOME/imgload/storage` or `~/.local/share/imgload/storage`
    /// 4. `/var/lib/imgload/storage`
    ///
    /// The first location that exists is opened. When none exists yet, the
    /// first candidate is created.
    pub fn discover() -> Result<Self> {
        let search_paths = Self::default_search_paths()?;
        let path = search_paths
            .iter()
            .find(|p| p.exists())
            .or_else(|| search_paths.first())
            .ok_or_else(|| {
                StorageError::InvalidStorage("no storage location candidates".to_string())
            })?;
        Self::open(path)
    }

    /// Candidate storage roots, in search order.
    pub fn default_search_paths() -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();

        if let Some(root) = env::var_os(STORAGE_ROOT_ENV) {
            paths.push(PathBuf::from(root));
        }

        if let Some(config) = ConfigFile::load()?
            && let Some(root) = config.storage.root
        {
            paths.push(root);
        }

        if let Some(data_home) = env::var_os("XDG_DATA_HOME") {
            paths.push(PathBuf::from(data_home).join("imgload/storage"));
        } else if let Some(home) = env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".local/share/imgload/storage"));
        }

        paths.push(PathBuf::from("/var/lib/imgload/storage"));
        Ok(paths)
    }

    /// Host path of the storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The layer store.
    pub fn layer_store(&self) -> &FileLayerStore {
        &self.layers
    }

    /// The image store.
    pub fn image_store(&self) -> &FileImageStore {
        &self.images
    }

    /// The tag store.
    pub fn reference_store(&self) -> &FileReferenceStore {
        &self.references
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("storage");
        let storage = Storage::open(&root).unwrap();
        assert_eq!(storage.root(), root);
        for sub in ["layers", "images", "dir", "dir/squashfs"] {
            assert!(root.join(sub).is_dir(), "{sub} missing");
        }
        assert!(storage.layer_store().list().unwrap().is_empty());
        assert!(storage.image_store().list().unwrap().is_empty());

        // Reopening an existing root works.
        Storage::open(&root).unwrap();
    }

    #[test]
    fn test_json_helpers() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        assert_eq!(read_json::<Vec<u32>>(&dir, "x.json").unwrap(), None);

        write_json_atomic(&dir, "x.json", &[1u32, 2, 3][..]).unwrap();
        assert_eq!(read_json::<Vec<u32>>(&dir, "x.json").unwrap(), Some(vec![1, 2, 3]));

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("x.json")]);

        std::fs::write(tmp.path().join("bad.json"), b"{").unwrap();
        assert!(matches!(
            read_json::<Vec<u32>>(&dir, "bad.json"),
            Err(StorageError::JsonParse(_))
        ));
    }
}
