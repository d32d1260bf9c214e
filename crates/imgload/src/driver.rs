//! A plain-directory graph driver.
//!
//! Each layer gets `<root>/<cache-id>/diff/` holding that layer's own
//! unpacked content. Nothing is mounted or merged; the driver only keeps the
//! content around so it can be inspected and removed again.
//!
//! Single-blob images are kept beside the layers in `<root>/squashfs/`.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::error::{Result, StorageError};
use crate::store::GraphDriver;

/// Name reported by [`DirDriver`].
pub const DRIVER_NAME: &str = "dir";

/// Subdirectory of the driver root holding single-blob images.
pub const SQUASHFS_DIR: &str = "squashfs";

/// Status key naming the driver's root directory.
pub const STATUS_ROOT_DIR: &str = "Root Dir";

const DIFF_DIR: &str = "diff";

/// Graph driver storing each layer as a plain directory.
#[derive(Debug)]
pub struct DirDriver {
    root: PathBuf,
    dir: Dir,
}

impl DirDriver {
    /// Open the driver rooted at `root`, creating it when missing.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(SQUASHFS_DIR))?;
        let dir = Dir::open_ambient_dir(&root, ambient_authority())?;
        Ok(Self { root, dir })
    }

    /// Host path of the driver root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a layer's content directory.
    pub fn diff_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(DIFF_DIR)
    }

    /// Cache IDs of all stored layers.
    pub fn layer_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.dir.entries()? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name != SQUASHFS_DIR && entry.file_type()?.is_dir() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn check_id(id: &str) -> Result<()> {
        if id.is_empty() || id == SQUASHFS_DIR || id.contains(['/', '.']) {
            return Err(StorageError::InvalidStorage(format!(
                "invalid layer directory name {id:?}"
            )));
        }
        Ok(())
    }
}

impl GraphDriver for DirDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn status(&self) -> Vec<(String, String)> {
        let layers = self.layer_ids().map(|ids| ids.len()).unwrap_or(0);
        vec![
            (
                STATUS_ROOT_DIR.to_string(),
                self.root.to_string_lossy().into_owned(),
            ),
            ("Layers".to_string(), layers.to_string()),
        ]
    }

    fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        Self::check_id(id)?;
        if let Some(parent) = parent
            && !self.dir.try_exists(parent)?
        {
            return Err(StorageError::LayerNotFound(parent.to_string()));
        }
        self.dir.create_dir(id)?;
        self.dir.open_dir(id)?.create_dir(DIFF_DIR)?;
        Ok(())
    }

    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> Result<u64> {
        Self::check_id(id)?;
        let mut counted = CountingReader { inner: diff, count: 0 };
        let mut archive = tar::Archive::new(&mut counted);
        archive.set_preserve_mtime(true);
        archive.set_unpack_xattrs(false);
        archive.unpack(self.diff_path(id))?;
        Ok(counted.count)
    }

    fn remove(&self, id: &str) -> Result<()> {
        Self::check_id(id)?;
        match self.dir.remove_dir_all(id) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }
}

struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    count: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
