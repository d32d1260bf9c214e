//! File-backed, reference-counted layer store.
//!
//! Layer records live in `layers/layers.json`, one record per chain ID. The
//! content of each layer is kept by a [`DirDriver`] under a random cache ID.
//!
//! # Reference counting
//!
//! Every [`LayerStore::get`] and [`LayerStore::register`] takes a reference
//! and every [`LayerStore::release`] drops one. A layer also holds one
//! reference on its parent for as long as it exists. When a layer's count
//! reaches zero its record and content are removed and the reference it held
//! on its parent is released in turn.
//!
//! # Example
//!
//! ```no_run
//! use imgload::Storage;
//! use imgload::store::LayerStore;
//!
//! let storage = Storage::open("/var/lib/imgload/storage")?;
//! let layers = storage.layer_store();
//!
//! let tar = std::fs::File::open("layer.tar")?;
//! let layer = layers.register(&mut &tar, None, None)?;
//! println!("Registered layer: {}", layer.chain_id);
//!
//! for record in layers.list()? {
//!     println!("{} ({} refs)", record.id, record.references);
//! }
//!
//! layers.release(&layer)?;
//! # Ok::<(), imgload::StorageError>(())
//! ```

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use cap_std::fs::Dir;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::{ChainId, DiffId, DiffIdReader};
use crate::driver::DirDriver;
use crate::error::{Result, StorageError};
use crate::storage::{read_json, write_json_atomic};
use crate::store::{ForeignSource, GraphDriver, Layer, LayerMetadata, LayerStore};

const LAYERS_FILE: &str = "layers.json";

/// A layer record as stored in `layers.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LayerRecord {
    /// Chain ID of the stack ending in this layer.
    pub id: ChainId,

    /// Digest of the uncompressed layer content.
    pub diff_id: DiffId,

    /// Chain ID of the stack below, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ChainId>,

    /// Graph driver directory name.
    pub cache_id: String,

    /// Size of the uncompressed content in bytes.
    #[serde(default)]
    pub diff_size: u64,

    /// Number of outstanding references.
    #[serde(default)]
    pub references: u64,

    /// Creation timestamp in RFC3339 format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    /// Where the content was originally distributed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_source: Option<ForeignSource>,
}

impl LayerRecord {
    /// The loader's view of this record.
    pub fn to_layer(&self) -> Layer {
        Layer {
            chain_id: self.id.clone(),
            diff_id: self.diff_id.clone(),
            parent: self.parent.clone(),
            size: self.diff_size,
        }
    }

    fn metadata(&self) -> LayerMetadata {
        LayerMetadata {
            chain_id: self.id.clone(),
            diff_id: self.diff_id.clone(),
            size: self.diff_size,
        }
    }
}

/// Generate a random 64-character hex cache ID.
///
/// Mixes the current time, the process ID and a per-process counter, so IDs
/// generated in a tight loop still differ.
pub fn generate_cache_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(now.as_nanos().to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Layer store backed by `layers.json` and a [`DirDriver`].
#[derive(Debug)]
pub struct FileLayerStore {
    dir: Dir,
    driver: DirDriver,
    lock: Mutex<()>,
}

impl FileLayerStore {
    /// Create a store over an opened `layers/` directory and its driver.
    pub fn new(dir: Dir, driver: DirDriver) -> Self {
        Self {
            dir,
            driver,
            lock: Mutex::new(()),
        }
    }

    /// List all layer records.
    pub fn list(&self) -> Result<Vec<LayerRecord>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_layers()
    }

    /// Get a layer record without taking a reference.
    pub fn record(&self, chain_id: &ChainId) -> Result<Option<LayerRecord>> {
        Ok(self.list()?.into_iter().find(|l| &l.id == chain_id))
    }

    /// The concrete driver.
    pub fn dir_driver(&self) -> &DirDriver {
        &self.driver
    }

    /// Load layers from `layers.json`.
    fn load_layers(&self) -> Result<Vec<LayerRecord>> {
        Ok(read_json(&self.dir, LAYERS_FILE)?.unwrap_or_default())
    }

    /// Save layers to `layers.json` atomically.
    fn save_layers(&self, layers: &[LayerRecord]) -> Result<()> {
        write_json_atomic(&self.dir, LAYERS_FILE, layers)
    }

    /// Remove a driver directory no record points to.
    fn discard(&self, cache_id: &str) {
        if let Err(e) = self.driver.remove(cache_id) {
            tracing::warn!("failed to clean up layer {cache_id}: {e}");
        }
    }

    /// Record a freshly unpacked layer, taking a reference on its parent.
    ///
    /// If the chain is already stored, the existing record gains a reference
    /// instead. Either way the new driver directory is removed unless the new
    /// record was saved.
    fn commit_new(&self, record: LayerRecord) -> Result<Layer> {
        let cache_id = record.cache_id.clone();
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut layers = match self.load_layers() {
            Ok(layers) => layers,
            Err(e) => {
                self.discard(&cache_id);
                return Err(e);
            }
        };

        if let Some(existing) = layers.iter_mut().find(|l| l.id == record.id) {
            existing.references += 1;
            let layer = existing.to_layer();
            self.discard(&cache_id);
            self.save_layers(&layers)?;
            tracing::debug!("layer {} already stored, discarded new content", layer.chain_id);
            return Ok(layer);
        }

        if let Some(parent) = &record.parent {
            match layers.iter_mut().find(|l| &l.id == parent) {
                Some(parent_record) => parent_record.references += 1,
                None => {
                    self.discard(&cache_id);
                    return Err(StorageError::LayerNotFound(parent.to_string()));
                }
            }
        }

        let layer = record.to_layer();
        layers.push(record);
        if let Err(e) = self.save_layers(&layers) {
            self.discard(&cache_id);
            return Err(e);
        }
        Ok(layer)
    }

    /// Unpack `content` into a fresh driver directory and hash it.
    fn unpack_new(
        &self,
        cache_id: &str,
        parent_cache_id: Option<&str>,
        content: &mut dyn Read,
    ) -> Result<(DiffId, u64)> {
        self.driver.create(cache_id, parent_cache_id)?;
        let mut hashing = DiffIdReader::new(content);
        self.driver.apply_diff(cache_id, &mut hashing)?;
        Ok(hashing.finish()?)
    }
}

impl LayerStore for FileLayerStore {
    fn get(&self, chain_id: &ChainId) -> Result<Option<Layer>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut layers = self.load_layers()?;
        let Some(record) = layers.iter_mut().find(|l| &l.id == chain_id) else {
            return Ok(None);
        };
        record.references += 1;
        let layer = record.to_layer();
        self.save_layers(&layers)?;
        Ok(Some(layer))
    }

    fn register(
        &self,
        content: &mut dyn Read,
        parent: Option<&ChainId>,
        foreign: Option<&ForeignSource>,
    ) -> Result<Layer> {
        // Validate parent exists if specified
        let parent_cache_id = match parent {
            Some(parent) => Some(
                self.cache_id(parent)
                    .map_err(|_| StorageError::LayerNotFound(parent.to_string()))?,
            ),
            None => None,
        };

        let cache_id = generate_cache_id();
        let (diff_id, diff_size) =
            match self.unpack_new(&cache_id, parent_cache_id.as_deref(), content) {
                Ok(v) => v,
                Err(e) => {
                    self.discard(&cache_id);
                    return Err(e);
                }
            };
        let chain_id = match parent {
            Some(parent) => parent.extend(&diff_id),
            None => ChainId::from(diff_id.clone()),
        };
        tracing::debug!("unpacked layer {chain_id} ({diff_size} bytes) into {cache_id}");

        let record = LayerRecord {
            id: chain_id,
            diff_id,
            parent: parent.cloned(),
            cache_id,
            diff_size,
            references: 1,
            created: Some(chrono::Utc::now().to_rfc3339()),
            foreign_source: foreign.cloned(),
        };
        self.commit_new(record)
    }

    fn release(&self, layer: &Layer) -> Result<Vec<LayerMetadata>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut layers = self.load_layers()?;

        let mut removed: Vec<LayerRecord> = Vec::new();
        let mut next = Some(layer.chain_id.clone());
        while let Some(id) = next.take() {
            let idx = layers
                .iter()
                .position(|l| l.id == id)
                .ok_or_else(|| StorageError::LayerNotFound(id.to_string()))?;
            let record = &mut layers[idx];
            record.references = record.references.saturating_sub(1);
            if record.references == 0 {
                let record = layers.remove(idx);
                next = record.parent.clone();
                removed.push(record);
            }
        }
        self.save_layers(&layers)?;

        // Delete driver directories only once the records are gone
        for record in &removed {
            self.driver.remove(&record.cache_id)?;
        }
        Ok(removed.iter().map(LayerRecord::metadata).collect())
    }

    fn cache_id(&self, chain_id: &ChainId) -> Result<String> {
        self.record(chain_id)?
            .map(|r| r.cache_id)
            .ok_or_else(|| StorageError::LayerNotFound(chain_id.to_string()))
    }

    fn driver(&self) -> &dyn GraphDriver {
        &self.driver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std::ambient_authority;

    fn store() -> (tempfile::TempDir, FileLayerStore) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("layers")).unwrap();
        let dir = Dir::open_ambient_dir(tmp.path().join("layers"), ambient_authority()).unwrap();
        let driver = DirDriver::open(tmp.path().join("dir")).unwrap();
        (tmp, FileLayerStore::new(dir, driver))
    }

    fn layer_tar(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap()
    }

    fn refs(store: &FileLayerStore, id: &ChainId) -> Option<u64> {
        store.record(id).unwrap().map(|r| r.references)
    }

    #[test]
    fn test_generate_cache_id() {
        let id = generate_cache_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_cache_id());
    }

    #[test]
    fn test_register_computes_identities() {
        let (_tmp, store) = store();
        let tar = layer_tar("a.txt", b"a");
        let base = store.register(&mut &tar[..], None, None).unwrap();
        assert_eq!(base.diff_id, DiffId::from_content(&tar));
        assert_eq!(base.chain_id.as_str(), base.diff_id.as_str());
        assert_eq!(base.size, tar.len() as u64);

        let tar2 = layer_tar("b.txt", b"b");
        let top = store
            .register(&mut &tar2[..], Some(&base.chain_id), None)
            .unwrap();
        assert_eq!(top.chain_id, base.chain_id.extend(&top.diff_id));
        assert_eq!(top.parent.as_ref(), Some(&base.chain_id));

        let cache_id = store.cache_id(&top.chain_id).unwrap();
        assert!(
            store
                .dir_driver()
                .diff_path(&cache_id)
                .join("b.txt")
                .exists()
        );
    }

    #[test]
    fn test_register_dedups_existing_chain() {
        let (_tmp, store) = store();
        let tar = layer_tar("a.txt", b"a");
        let first = store.register(&mut &tar[..], None, None).unwrap();
        let second = store.register(&mut &tar[..], None, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(refs(&store, &first.chain_id), Some(2));
        assert_eq!(store.dir_driver().layer_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_register_unknown_parent() {
        let (_tmp, store) = store();
        let missing = ChainId::from(DiffId::from_content(b"missing"));
        let tar = layer_tar("a.txt", b"a");
        assert!(matches!(
            store.register(&mut &tar[..], Some(&missing), None),
            Err(StorageError::LayerNotFound(_))
        ));
        assert!(store.dir_driver().layer_ids().unwrap().is_empty());
    }

    #[test]
    fn test_commit_without_parent_record_cleans_up() {
        let (_tmp, store) = store();
        let tar = layer_tar("a.txt", b"a");
        let cache_id = generate_cache_id();
        let (diff_id, diff_size) = store.unpack_new(&cache_id, None, &mut &tar[..]).unwrap();
        assert_eq!(store.dir_driver().layer_ids().unwrap(), vec![cache_id.clone()]);

        // The parent went away between the lookup and the commit.
        let parent = ChainId::from(DiffId::from_content(b"gone"));
        let record = LayerRecord {
            id: parent.extend(&diff_id),
            diff_id,
            parent: Some(parent),
            cache_id,
            diff_size,
            references: 1,
            created: None,
            foreign_source: None,
        };
        assert!(matches!(
            store.commit_new(record),
            Err(StorageError::LayerNotFound(_))
        ));
        assert!(store.list().unwrap().is_empty());
        assert!(store.dir_driver().layer_ids().unwrap().is_empty());
    }

    #[test]
    fn test_register_invalid_tar_cleans_up() {
        let (_tmp, store) = store();
        let garbage = vec![0xffu8; 1024];
        assert!(store.register(&mut &garbage[..], None, None).is_err());
        assert!(store.list().unwrap().is_empty());
        assert!(store.dir_driver().layer_ids().unwrap().is_empty());
    }

    #[test]
    fn test_get_takes_reference() {
        let (_tmp, store) = store();
        let tar = layer_tar("a.txt", b"a");
        let layer = store.register(&mut &tar[..], None, None).unwrap();
        assert_eq!(store.get(&layer.chain_id).unwrap(), Some(layer.clone()));
        assert_eq!(refs(&store, &layer.chain_id), Some(2));

        let missing = ChainId::from(DiffId::from_content(b"missing"));
        assert_eq!(store.get(&missing).unwrap(), None);
    }

    #[test]
    fn test_release_cascades_to_parent() {
        let (_tmp, store) = store();
        let base = store
            .register(&mut &layer_tar("a", b"a")[..], None, None)
            .unwrap();
        let top = store
            .register(&mut &layer_tar("b", b"b")[..], Some(&base.chain_id), None)
            .unwrap();
        assert_eq!(refs(&store, &base.chain_id), Some(2));

        // Dropping the caller's reference on the base leaves the child's.
        assert!(store.release(&base).unwrap().is_empty());
        assert_eq!(refs(&store, &base.chain_id), Some(1));

        let removed = store.release(&top).unwrap();
        let removed: Vec<_> = removed.into_iter().map(|m| m.chain_id).collect();
        assert_eq!(removed, vec![top.chain_id.clone(), base.chain_id.clone()]);
        assert!(store.list().unwrap().is_empty());
        assert!(store.dir_driver().layer_ids().unwrap().is_empty());
    }

    #[test]
    fn test_foreign_source_is_recorded() {
        let (_tmp, store) = store();
        let foreign = ForeignSource {
            media_type: "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip".to_string(),
            size: 10,
            digest: "sha256:abc".to_string(),
            urls: vec!["https://example.com/layer".to_string()],
        };
        let layer = store
            .register(&mut &layer_tar("a", b"a")[..], None, Some(&foreign))
            .unwrap();
        let record = store.record(&layer.chain_id).unwrap().unwrap();
        assert_eq!(record.foreign_source, Some(foreign));
    }

    #[test]
    fn test_layer_record_kebab_case() {
        let diff_id = DiffId::from_content(b"a");
        let record = LayerRecord {
            id: ChainId::from(diff_id.clone()),
            diff_id,
            parent: None,
            cache_id: "abc".to_string(),
            diff_size: 100,
            references: 1,
            created: None,
            foreign_source: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("diff-id"));
        assert!(json.contains("cache-id"));
        assert!(json.contains("diff-size"));
        assert!(!json.contains("parent"));
        let parsed: LayerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
