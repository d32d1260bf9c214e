//! Configuration file parsing.
//!
//! The configuration is a TOML file, by default `/etc/imgload/storage.toml`.
//! Setting `$IMGLOAD_CONFIG` points at a different file. A missing file is
//! the same as an empty one.
//!
//! ```toml
//! [storage]
//! root = "/var/lib/imgload/storage"
//!
//! # Where archives are unpacked during a load
//! tmp_dir = "/var/tmp"
//! ```

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, StorageError};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/imgload/storage.toml";

/// Environment variable naming an alternative configuration file.
pub const CONFIG_ENV: &str = "IMGLOAD_CONFIG";

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    /// The `[storage]` table.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Storage settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Primary storage root path.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Parent directory for scratch directories.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
}

impl ConfigFile {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read the configuration file at `path`, `None` when it does not exist.
    pub fn from_path(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };
        Self::from_toml(&content).map(Some).map_err(|e| {
            StorageError::InvalidStorage(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Read the configuration from its default location.
    pub fn load() -> Result<Option<Self>> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::from_path(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let config = ConfigFile::from_toml(
            r#"
            [storage]
            root = "/srv/images"
            tmp_dir = "/var/tmp"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.root, Some(PathBuf::from("/srv/images")));
        assert_eq!(config.storage.tmp_dir, Some(PathBuf::from("/var/tmp")));
    }

    #[test]
    fn test_parse_empty() {
        let config = ConfigFile::from_toml("").unwrap();
        assert!(config.storage.root.is_none());
        assert!(config.storage.tmp_dir.is_none());
    }

    #[test]
    fn test_from_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("storage.toml");
        assert!(ConfigFile::from_path(&path).unwrap().is_none());

        std::fs::write(&path, "[storage]\nroot = \"/x\"\n").unwrap();
        let config = ConfigFile::from_path(&path).unwrap().unwrap();
        assert_eq!(config.storage.root, Some(PathBuf::from("/x")));

        std::fs::write(&path, "[storage\n").unwrap();
        assert!(matches!(
            ConfigFile::from_path(&path),
            Err(StorageError::InvalidStorage(_))
        ));
    }
}
