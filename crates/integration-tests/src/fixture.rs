//! Test fixtures: isolated storage roots and synthetic image archives.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tempfile::TempDir;

use imgload::digest::Digest;
use imgload::{DiffId, ImageId, LoadError, LoadOptions, Loader, Storage};

/// An isolated storage root in a temporary directory.
///
/// The storage is removed when dropped.
pub struct TestStorage {
    /// Root temporary directory containing the storage.
    temp_dir: TempDir,
    /// Path to the storage root.
    root_path: PathBuf,
    /// The opened storage instance.
    storage: Storage,
}

impl TestStorage {
    /// Create and open an empty storage root.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let root_path = temp_dir.path().join("storage");
        let storage = Storage::open(&root_path)?;

        Ok(Self {
            temp_dir,
            root_path,
            storage,
        })
    }

    /// Get a reference to the storage.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Get the root path of the test storage.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Directory of the graph driver's single-blob copies.
    pub fn squashfs_path(&self) -> PathBuf {
        self.root_path.join("dir").join("squashfs")
    }

    /// Load `archive`, returning everything the loader printed.
    pub fn load(&self, archive: &[u8], quiet: bool) -> Result<String, LoadError> {
        let opts = LoadOptions {
            quiet,
            tmp_dir: Some(self.temp_dir.path().to_path_buf()),
        };
        let mut out = Vec::new();
        Loader::from_storage(&self.storage).load(archive, &mut out, &opts)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Load `archive`, returning the error and the partial output.
    pub fn load_err(&self, archive: &[u8]) -> (LoadError, String) {
        let mut out = Vec::new();
        let err = match Loader::from_storage(&self.storage).load(
            archive,
            &mut out,
            &LoadOptions {
                quiet: true,
                tmp_dir: None,
            },
        ) {
            Ok(()) => panic!("load unexpectedly succeeded"),
            Err(e) => e,
        };
        (err, String::from_utf8_lossy(&out).into_owned())
    }
}

impl std::fmt::Debug for TestStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStorage")
            .field("root_path", &self.root_path)
            .finish()
    }
}

/// A tar archive assembled in memory.
pub struct TarBuilder {
    inner: tar::Builder<Vec<u8>>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self {
            inner: tar::Builder::new(Vec::new()),
        }
    }

    /// Append a regular file.
    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        let mut header = tar::Header::new_ustar();
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        header.set_mtime(1_700_000_000);
        self.inner
            .append_data(&mut header, path, content)
            .expect("append file");
        self
    }

    /// Append a directory.
    pub fn dir(mut self, path: &str) -> Self {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(1_700_000_000);
        self.inner
            .append_data(&mut header, path, std::io::empty())
            .expect("append dir");
        self
    }

    /// Append a symbolic link.
    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        self.inner
            .append_link(&mut header, path, target)
            .expect("append symlink");
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.inner.into_inner().expect("finish tar")
    }
}

impl Default for TarBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A layer tar holding one file.
pub fn layer_tar(name: &str, content: &[u8]) -> Vec<u8> {
    TarBuilder::new().file(name, content).finish()
}

/// Gzip `data`.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip");
    encoder.finish().expect("gzip")
}

/// Description of one image of a manifest archive.
#[derive(Debug, Clone, Default)]
pub struct TestImage {
    /// Uncompressed layer tars, base first.
    pub layers: Vec<Vec<u8>>,
    /// Diff IDs written to the config, defaulting to the real ones.
    pub diff_ids: Option<Vec<DiffId>>,
    /// One history entry per item.
    pub history: Vec<String>,
    pub repo_tags: Vec<String>,
    pub parent: Option<ImageId>,
    /// Store layer blobs gzip-compressed.
    pub compress: bool,
}

impl TestImage {
    /// An image with the given layers and one history entry per layer.
    pub fn with_layers(layers: Vec<Vec<u8>>) -> Self {
        let history = (0..layers.len()).map(|i| format!("step {i}")).collect();
        Self {
            layers,
            history,
            ..Default::default()
        }
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.repo_tags.push(tag.to_string());
        self
    }

    /// The real diff IDs of the layers.
    pub fn real_diff_ids(&self) -> Vec<DiffId> {
        self.layers.iter().map(|l| DiffId::from_content(l)).collect()
    }

    /// The config blob.
    pub fn config(&self) -> Vec<u8> {
        let diff_ids = self.diff_ids.clone().unwrap_or_else(|| self.real_diff_ids());
        let history: Vec<Value> = self
            .history
            .iter()
            .map(|h| json!({ "created_by": h }))
            .collect();
        serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Cmd": ["/bin/sh"] },
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
            "history": history,
        }))
        .expect("config json")
    }

    /// The ID the image gets once loaded.
    pub fn id(&self) -> ImageId {
        ImageId::new(Digest::from_bytes(&self.config()))
    }
}

/// Build a manifest-driven archive.
pub fn manifest_archive(images: &[TestImage]) -> Vec<u8> {
    let mut tar = TarBuilder::new();
    let mut manifest = Vec::new();
    for image in images {
        let config = image.config();
        let config_path = format!("{}.json", image.id().hex());
        tar = tar.file(&config_path, &config);

        let mut layer_paths = Vec::new();
        for layer in &image.layers {
            let dir = Digest::from_bytes(layer).hex().to_string();
            let path = format!("{dir}/layer.tar");
            let blob = if image.compress { gzip(layer) } else { layer.clone() };
            tar = tar.dir(&dir).file(&path, &blob);
            layer_paths.push(path);
        }

        manifest.push(json!({
            "Config": config_path,
            "RepoTags": image.repo_tags,
            "Layers": layer_paths,
            "Parent": image.parent.as_ref().map(|p| p.to_string()).unwrap_or_default(),
        }));
    }
    let manifest = serde_json::to_vec(&manifest).expect("manifest json");
    tar.file("manifest.json", &manifest).finish()
}

/// One image of a legacy archive.
#[derive(Debug, Clone)]
pub struct LegacyImage {
    pub id: String,
    pub parent: Option<String>,
    pub layer: Vec<u8>,
    pub cmd: String,
}

impl LegacyImage {
    pub fn new(id: &str, parent: Option<&str>, cmd: &str) -> Self {
        Self {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            layer: layer_tar(&format!("{id}.txt"), cmd.as_bytes()),
            cmd: cmd.to_string(),
        }
    }

    fn v1_config(&self) -> Vec<u8> {
        let mut config = json!({
            "id": self.id,
            "created": "2015-06-01T12:00:00Z",
            "docker_version": "1.10.0",
            "os": "linux",
            "container_config": { "Cmd": ["/bin/sh", "-c", self.cmd] },
        });
        if let Some(parent) = &self.parent {
            config["parent"] = json!(parent);
        }
        serde_json::to_vec(&config).expect("v1 config")
    }
}

/// Build a legacy per-directory archive. `repositories` maps
/// `name -> tag -> legacy id`.
pub fn legacy_archive(images: &[LegacyImage], repositories: Value) -> Vec<u8> {
    let mut tar = TarBuilder::new();
    for image in images {
        tar = tar
            .dir(&image.id)
            .file(&format!("{}/VERSION", image.id), b"1.0")
            .file(&format!("{}/json", image.id), &image.v1_config())
            .file(&format!("{}/layer.tar", image.id), &image.layer);
    }
    let repositories = serde_json::to_vec(&repositories).expect("repositories json");
    tar.file("repositories", &repositories).finish()
}

/// A fake single filesystem blob: squashfs magic followed by `body`.
pub fn squashfs_blob(body: &[u8]) -> Vec<u8> {
    let mut blob = b"hsqs".to_vec();
    blob.extend_from_slice(body);
    blob
}

/// A legacy image ID made of `c` repeated.
pub fn legacy_id(c: char) -> String {
    std::iter::repeat_n(c, 64).collect()
}
