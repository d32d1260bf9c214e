//! Tagged image reference parsing.
//!
//! Archives name images with repository tags such as `busybox:latest` or
//! `registry.example.com:5000/team/app:v1`. These are normalized to a fully
//! qualified form (`docker.io/library/busybox:latest`) before they reach the
//! reference store, and shortened back to their familiar form for display.

use std::fmt;

use crate::error::LoadError;

/// Registry assumed when a reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Repository namespace for single-component names on the default registry.
const OFFICIAL_REPO_PREFIX: &str = "library/";

/// A normalized `registry/repository:tag` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaggedReference {
    /// Registry hostname, possibly with a port.
    registry: String,
    /// Repository path within the registry.
    repository: String,
    /// Tag.
    tag: String,
}

impl TaggedReference {
    /// Parse a reference that must carry a tag.
    ///
    /// References with a digest or without a tag are rejected.
    pub fn parse(reference: &str) -> Result<Self, LoadError> {
        let named = parse_name(reference)?;
        let (name, tag) = split_tag(named).ok_or_else(|| invalid(reference))?;
        Self::with_tag(name, tag).map_err(|_| invalid(reference))
    }

    /// Build a reference from a repository name and a separate tag.
    pub fn with_tag(name: &str, tag: &str) -> Result<Self, LoadError> {
        let full = format!("{name}:{tag}");
        let name = parse_name(name).map_err(|_| invalid(&full))?;
        if split_tag(name).is_some() || !valid_tag(tag) {
            return Err(invalid(&full));
        }
        let (registry, repository) = split_registry(name).ok_or_else(|| invalid(&full))?;
        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }

    /// The normalized repository name without the tag.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// The tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The short display form, as a user would type it.
    pub fn familiar(&self) -> String {
        let repository = if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix(OFFICIAL_REPO_PREFIX)
                .filter(|r| !r.contains('/'))
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        format!("{repository}:{}", self.tag)
    }
}

impl fmt::Display for TaggedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.tag)
    }
}

fn invalid(reference: &str) -> LoadError {
    LoadError::InvalidReference(reference.to_string())
}

/// Trim and reject empty references or references pinned by digest.
fn parse_name(reference: &str) -> Result<&str, LoadError> {
    let reference = reference.trim();
    if reference.is_empty() || reference.contains('@') {
        return Err(invalid(reference));
    }
    Ok(reference)
}

/// Split `name:tag` on the last colon after the last slash.
///
/// A colon in the first component with no slash after it is a registry port
/// only when followed by a path, so `host:5000/app` has no tag.
fn split_tag(reference: &str) -> Option<(&str, &str)> {
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let colon = reference[last_slash..].rfind(':')? + last_slash;
    Some((&reference[..colon], &reference[colon + 1..]))
}

fn split_registry(name: &str) -> Option<(String, String)> {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        _ => (
            DEFAULT_REGISTRY.to_string(),
            format!("{OFFICIAL_REPO_PREFIX}{name}"),
        ),
    };
    let valid = !repository.is_empty()
        && repository.split('/').all(valid_path_component)
        && registry.chars().all(|c| c.is_ascii_alphanumeric() || ".-:".contains(c));
    valid.then_some((registry, repository))
}

fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    !bytes.is_empty()
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(b))
}

fn valid_tag(tag: &str) -> bool {
    let bytes = tag.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 128
        && (bytes[0].is_ascii_alphanumeric() || bytes[0] == b'_')
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(b))
}
