//! Image configuration model.
//!
//! An image config is a JSON document. The loader interprets two keys of it:
//!
//! - `rootfs`: the ordered list of layer diff IDs ([`RootFs`])
//! - `history`: one entry per layer, in the same order ([`History`])
//!
//! All other keys are carried through untouched, because the image ID is the
//! digest of the exact config bytes and must survive a load unchanged.
//!
//! This module also converts legacy (v1) per-layer config blobs, as found in
//! pre-manifest archives, into the current config shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::digest::{ChainId, DiffId, ImageId, chain_id};

pub use oci_spec::image::History;

/// Root filesystem type used for layered images.
pub const ROOTFS_TYPE_LAYERS: &str = "layers";

/// An image root filesystem: an ordered stack of layer diff IDs.
///
/// The diff list only ever grows at the end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Root filesystem type, normally `"layers"`.
    #[serde(rename = "type")]
    pub fs_type: String,

    /// Diff IDs from the base layer to the top layer.
    #[serde(default)]
    pub diff_ids: Vec<DiffId>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self::new()
    }
}

impl RootFs {
    /// An empty layered root filesystem.
    pub fn new() -> Self {
        Self {
            fs_type: ROOTFS_TYPE_LAYERS.to_string(),
            diff_ids: Vec::new(),
        }
    }

    /// Push a layer on top.
    pub fn append(&mut self, diff_id: DiffId) {
        self.diff_ids.push(diff_id);
    }

    /// Chain ID of the full stack, `None` when there are no layers.
    pub fn chain_id(&self) -> Option<ChainId> {
        chain_id(&self.diff_ids)
    }
}

/// An image configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// The layer stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,

    /// Per-layer history, parallel to `rootfs.diff_ids`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    /// Every other config key, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageConfig {
    /// Parse a config blob.
    pub fn from_json(config: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(config)
    }

    /// A config holding nothing but a root filesystem.
    pub fn with_rootfs(rootfs: RootFs) -> Self {
        Self {
            rootfs: Some(rootfs),
            ..Default::default()
        }
    }

    /// Diff IDs of the root filesystem, empty when there is none.
    pub fn diff_ids(&self) -> &[DiffId] {
        self.rootfs.as_ref().map(|r| r.diff_ids.as_slice()).unwrap_or(&[])
    }
}

/// An image as known to the image store.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Digest of the config blob.
    pub id: ImageId,

    /// The parsed config.
    pub config: ImageConfig,

    /// Parent image, when one has been recorded.
    pub parent: Option<ImageId>,
}

impl Image {
    /// The image root filesystem, empty when the config has none.
    pub fn rootfs(&self) -> RootFs {
        self.config.rootfs.clone().unwrap_or_default()
    }

    /// The image history.
    pub fn history(&self) -> &[History] {
        &self.config.history
    }
}

/// Docker versions older than this wrote v1 configs with fields that must
/// not leak into the converted config.
const NO_FALLBACK_MIN_VERSION: [u64; 3] = [1, 8, 3];

/// Keys removed from a v1 config when converting it.
const V1_ONLY_KEYS: &[&str] = &["id", "parent", "Size", "parent_id", "layer_id", "throwaway"];

/// The v1 config fields known to old engines.
#[derive(Debug, Default, Serialize, Deserialize)]
struct V1Image {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    os: Option<String>,
    #[serde(rename = "Size", default, skip_serializing_if = "Option::is_none")]
    size: Option<i64>,
}

impl V1Image {
    fn created_by(&self) -> Option<String> {
        let cmd = self.container_config.as_ref()?.get("Cmd")?.as_array()?;
        let parts: Vec<&str> = cmd.iter().filter_map(Value::as_str).collect();
        Some(parts.join(" "))
    }
}

/// The legacy parent ID declared by a v1 config, if any.
pub fn v1_parent(config: &[u8]) -> serde_json::Result<Option<String>> {
    let v1: V1Image = serde_json::from_slice(config)?;
    Ok(v1.parent.filter(|p| !p.is_empty()))
}

/// Derive a history entry from a v1 config.
pub fn history_from_v1_config(config: &[u8], empty_layer: bool) -> serde_json::Result<History> {
    let v1: V1Image = serde_json::from_slice(config)?;
    let mut history = History::default();
    history.set_created(v1.created.clone());
    history.set_author(v1.author.clone());
    history.set_created_by(v1.created_by());
    history.set_comment(v1.comment.clone());
    if empty_layer {
        history.set_empty_layer(Some(true));
    }
    Ok(history)
}

/// Build a current-format config from a v1 config plus the reconstructed
/// root filesystem and history.
pub fn config_from_v1_config(
    config: &[u8],
    rootfs: &RootFs,
    history: &[History],
) -> serde_json::Result<Vec<u8>> {
    let v1: V1Image = serde_json::from_slice(config)?;

    let mut fields: Map<String, Value> = if uses_v1_fallback(v1.docker_version.as_deref()) {
        match serde_json::to_value(&v1)? {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    } else {
        serde_json::from_slice(config)?
    };

    for key in V1_ONLY_KEYS {
        fields.remove(*key);
    }
    fields.insert("rootfs".to_string(), serde_json::to_value(rootfs)?);
    fields.insert("history".to_string(), serde_json::to_value(history)?);

    serde_json::to_vec(&fields)
}

fn uses_v1_fallback(docker_version: Option<&str>) -> bool {
    let Some(version) = docker_version else {
        return true;
    };
    let parsed: Vec<u64> = version
        .split(['.', '-', '+'])
        .take(3)
        .map(|part| part.parse().unwrap_or(0))
        .collect();
    let mut padded = [0u64; 3];
    for (slot, value) in padded.iter_mut().zip(parsed) {
        *slot = value;
    }
    padded < NO_FALLBACK_MIN_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(content: &str) -> DiffId {
        DiffId::from_content(content.as_bytes())
    }

    #[test]
    fn test_rootfs_append_and_chain() {
        let mut rootfs = RootFs::new();
        assert!(rootfs.chain_id().is_none());

        rootfs.append(diff("a"));
        assert_eq!(rootfs.chain_id().unwrap().as_str(), diff("a").as_str());

        rootfs.append(diff("b"));
        assert_eq!(rootfs.chain_id(), chain_id(&[diff("a"), diff("b")]));
    }

    #[test]
    fn test_image_config_preserves_unknown_keys() {
        let raw = format!(
            r#"{{"architecture":"amd64","config":{{"Env":["A=1"]}},"rootfs":{{"type":"layers","diff_ids":["{}"]}},"history":[{{"created_by":"/bin/sh"}}]}}"#,
            diff("a")
        );
        let config = ImageConfig::from_json(raw.as_bytes()).unwrap();
        assert_eq!(config.diff_ids(), &[diff("a")]);
        assert_eq!(config.history.len(), 1);
        assert_eq!(config.history[0].created_by().as_deref(), Some("/bin/sh"));
        assert_eq!(config.extra["architecture"], "amd64");

        let reparsed: Value = serde_json::to_value(&config).unwrap();
        assert_eq!(reparsed["config"]["Env"][0], "A=1");
    }

    #[test]
    fn test_image_config_without_rootfs() {
        let config = ImageConfig::from_json(br#"{"os":"linux"}"#).unwrap();
        assert!(config.rootfs.is_none());
        assert!(config.diff_ids().is_empty());
    }

    #[test]
    fn test_minimal_config_serialization() {
        let mut rootfs = RootFs::new();
        rootfs.append(diff("a"));
        let json = serde_json::to_string(&ImageConfig::with_rootfs(rootfs)).unwrap();
        assert_eq!(
            json,
            format!(r#"{{"rootfs":{{"type":"layers","diff_ids":["{}"]}}}}"#, diff("a"))
        );
    }

    const V1_CONFIG: &str = r#"{
        "id": "aaaa",
        "parent": "bbbb",
        "created": "2016-01-01T00:00:00Z",
        "author": "someone",
        "comment": "imported",
        "docker_version": "1.10.0",
        "container_config": {"Cmd": ["/bin/sh", "-c", "echo hi"]},
        "architecture": "amd64",
        "os": "linux",
        "Size": 1234,
        "layer_id": "x",
        "custom": true
    }"#;

    #[test]
    fn test_v1_parent() {
        assert_eq!(v1_parent(V1_CONFIG.as_bytes()).unwrap().as_deref(), Some("bbbb"));
        assert_eq!(v1_parent(br#"{"parent":""}"#).unwrap(), None);
        assert_eq!(v1_parent(br#"{}"#).unwrap(), None);
    }

    #[test]
    fn test_history_from_v1_config() {
        let history = history_from_v1_config(V1_CONFIG.as_bytes(), false).unwrap();
        assert_eq!(history.created().as_deref(), Some("2016-01-01T00:00:00Z"));
        assert_eq!(history.author().as_deref(), Some("someone"));
        assert_eq!(history.comment().as_deref(), Some("imported"));
        assert_eq!(history.created_by().as_deref(), Some("/bin/sh -c echo hi"));
        assert_eq!(history.empty_layer(), None);
    }

    #[test]
    fn test_config_from_v1_config() {
        let mut rootfs = RootFs::new();
        rootfs.append(diff("a"));
        let history = vec![history_from_v1_config(V1_CONFIG.as_bytes(), false).unwrap()];

        let converted = config_from_v1_config(V1_CONFIG.as_bytes(), &rootfs, &history).unwrap();
        let value: Value = serde_json::from_slice(&converted).unwrap();
        let object = value.as_object().unwrap();

        for removed in V1_ONLY_KEYS {
            assert!(!object.contains_key(*removed), "{removed} should be removed");
        }
        assert_eq!(object["custom"], true);
        assert_eq!(object["rootfs"]["diff_ids"][0], diff("a").as_str());
        assert_eq!(object["history"][0]["author"], "someone");

        let parsed = ImageConfig::from_json(&converted).unwrap();
        assert_eq!(parsed.rootfs.as_ref(), Some(&rootfs));
        assert_eq!(parsed.history, history);
    }

    #[test]
    fn test_config_from_old_v1_config_drops_unknown_keys() {
        let old = r#"{"id":"aaaa","docker_version":"1.6.2","custom":true,"os":"linux"}"#;
        let converted = config_from_v1_config(old.as_bytes(), &RootFs::new(), &[]).unwrap();
        let value: Value = serde_json::from_slice(&converted).unwrap();
        assert!(value.get("custom").is_none());
        assert_eq!(value["os"], "linux");
    }

    #[test]
    fn test_uses_v1_fallback() {
        assert!(uses_v1_fallback(None));
        assert!(uses_v1_fallback(Some("1.8.2")));
        assert!(uses_v1_fallback(Some("0.9")));
        assert!(!uses_v1_fallback(Some("1.8.3")));
        assert!(!uses_v1_fallback(Some("1.10.0")));
        assert!(!uses_v1_fallback(Some("17.03.1-ce")));
    }
}
