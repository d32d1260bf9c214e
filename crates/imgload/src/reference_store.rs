//! File-backed tag store.
//!
//! Tags are kept in `images/repositories.json`, grouped by repository name:
//!
//! ```json
//! {
//!   "docker.io/library/busybox": {
//!     "docker.io/library/busybox:latest": "sha256:..."
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use cap_std::fs::Dir;

use crate::digest::ImageId;
use crate::error::{Result, StorageError};
use crate::reference::TaggedReference;
use crate::storage::{read_json, write_json_atomic};
use crate::store::ReferenceStore;

const REPOSITORIES_FILE: &str = "repositories.json";

type Repositories = BTreeMap<String, BTreeMap<String, ImageId>>;

/// Tag store backed by `repositories.json`.
#[derive(Debug)]
pub struct FileReferenceStore {
    dir: Dir,
    lock: Mutex<()>,
}

impl FileReferenceStore {
    /// Create a store over an opened `images/` directory.
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    /// All tags as `(reference, image)` pairs, sorted by reference.
    pub fn list(&self) -> Result<Vec<(String, ImageId)>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .load()?
            .into_values()
            .flat_map(|tags| tags.into_iter())
            .collect())
    }

    /// Tags pointing at `id`.
    pub fn tags_for(&self, id: &ImageId) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|(_, image)| image == id)
            .map(|(reference, _)| reference)
            .collect())
    }

    fn load(&self) -> Result<Repositories> {
        Ok(read_json(&self.dir, REPOSITORIES_FILE)?.unwrap_or_default())
    }
}

impl ReferenceStore for FileReferenceStore {
    fn get(&self, reference: &TaggedReference) -> Result<Option<ImageId>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .load()?
            .get(&reference.name())
            .and_then(|tags| tags.get(&reference.to_string()))
            .cloned())
    }

    fn add_tag(&self, reference: &TaggedReference, id: &ImageId, force: bool) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut repositories = self.load()?;
        let tags = repositories.entry(reference.name()).or_default();
        let key = reference.to_string();
        if let Some(existing) = tags.get(&key)
            && existing != id
            && !force
        {
            return Err(StorageError::TagConflict {
                reference: key,
                existing: existing.to_string(),
            });
        }
        tags.insert(key, id.clone());
        write_json_atomic(&self.dir, REPOSITORIES_FILE, &repositories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use cap_std::ambient_authority;

    fn store() -> (tempfile::TempDir, FileReferenceStore) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).unwrap();
        (tmp, FileReferenceStore::new(dir))
    }

    fn id(name: &str) -> ImageId {
        ImageId::new(Digest::from_bytes(name.as_bytes()))
    }

    #[test]
    fn test_add_and_get() {
        let (_tmp, store) = store();
        let r = TaggedReference::parse("busybox:latest").unwrap();
        assert_eq!(store.get(&r).unwrap(), None);

        store.add_tag(&r, &id("a"), false).unwrap();
        assert_eq!(store.get(&r).unwrap(), Some(id("a")));
        assert_eq!(
            store.list().unwrap(),
            vec![("docker.io/library/busybox:latest".to_string(), id("a"))]
        );
    }

    #[test]
    fn test_retag_requires_force() {
        let (_tmp, store) = store();
        let r = TaggedReference::parse("busybox:latest").unwrap();
        store.add_tag(&r, &id("a"), false).unwrap();

        // Same target is not a conflict.
        store.add_tag(&r, &id("a"), false).unwrap();

        assert!(matches!(
            store.add_tag(&r, &id("b"), false),
            Err(StorageError::TagConflict { .. })
        ));
        store.add_tag(&r, &id("b"), true).unwrap();
        assert_eq!(store.get(&r).unwrap(), Some(id("b")));
    }

    #[test]
    fn test_tags_for() {
        let (_tmp, store) = store();
        for tag in ["busybox:1", "busybox:2", "alpine:3"] {
            let r = TaggedReference::parse(tag).unwrap();
            let target = if tag.starts_with("busybox") { "a" } else { "b" };
            store.add_tag(&r, &id(target), false).unwrap();
        }
        assert_eq!(
            store.tags_for(&id("a")).unwrap(),
            vec![
                "docker.io/library/busybox:1".to_string(),
                "docker.io/library/busybox:2".to_string()
            ]
        );
    }
}
