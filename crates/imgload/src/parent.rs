//! Parent links between images of one load batch.
//!
//! A manifest may declare a parent for each image. The declaration is only
//! trusted when the parent is itself part of the same batch, and it is only
//! committed when the parent's history is a strict one-entry prefix of the
//! child's.

use crate::digest::ImageId;
use crate::image::Image;

/// A declared parent edge for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    /// The child image.
    pub id: ImageId,
    /// The declared parent, if any.
    pub parent: Option<ImageId>,
}

/// Drop parent declarations that do not point at another image of the batch.
///
/// Order is preserved. A link whose parent is missing from the batch, or
/// whose parent is the image itself, comes back with `parent` cleared.
pub fn validated_parent_links(links: &[ParentLink]) -> Vec<ParentLink> {
    links
        .iter()
        .map(|link| {
            let parent = link.parent.as_ref().filter(|parent| {
                links
                    .iter()
                    .any(|other| &other.id == *parent && other.id != link.id)
            });
            ParentLink {
                id: link.id.clone(),
                parent: parent.cloned(),
            }
        })
        .collect()
}

/// Whether `parent` may be recorded as the parent of `child`.
pub fn check_valid_parent(child: &Image, parent: &Image) -> bool {
    let (child, parent) = (child.history(), parent.history());
    if child.is_empty() && parent.is_empty() {
        return true;
    }
    child.len() == parent.len() + 1 && child.starts_with(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::image::{History, ImageConfig};

    fn id(name: &str) -> ImageId {
        ImageId::new(Digest::from_bytes(name.as_bytes()))
    }

    fn link(child: &str, parent: Option<&str>) -> ParentLink {
        ParentLink {
            id: id(child),
            parent: parent.map(id),
        }
    }

    fn entry(created_by: &str) -> History {
        let mut history = History::default();
        history.set_created_by(Some(created_by.to_string()));
        history
    }

    fn image(name: &str, history: &[&str]) -> Image {
        Image {
            id: id(name),
            config: ImageConfig {
                history: history.iter().map(|h| entry(h)).collect(),
                ..Default::default()
            },
            parent: None,
        }
    }

    #[test]
    fn test_validated_parent_links_prunes_unknown() {
        let links = vec![link("A", Some("B")), link("B", None), link("C", Some("Z"))];
        let validated = validated_parent_links(&links);
        assert_eq!(
            validated,
            vec![link("A", Some("B")), link("B", None), link("C", None)]
        );
    }

    #[test]
    fn test_validated_parent_links_rejects_self_parent() {
        let validated = validated_parent_links(&[link("A", Some("A"))]);
        assert_eq!(validated, vec![link("A", None)]);
    }

    #[test]
    fn test_validated_parent_links_keeps_order() {
        let links = vec![link("C", Some("B")), link("A", None), link("B", Some("A"))];
        let validated = validated_parent_links(&links);
        let order: Vec<_> = validated.iter().map(|l| l.id.clone()).collect();
        assert_eq!(order, vec![id("C"), id("A"), id("B")]);
        assert!(validated.iter().filter(|l| l.parent.is_some()).count() == 2);
    }

    #[test]
    fn test_validated_parent_links_empty() {
        assert!(validated_parent_links(&[]).is_empty());
    }

    #[test]
    fn test_check_valid_parent() {
        let empty_a = image("a", &[]);
        let empty_b = image("b", &[]);
        assert!(check_valid_parent(&empty_a, &empty_b));

        let parent = image("p", &["one"]);
        let child = image("c", &["one", "two"]);
        assert!(check_valid_parent(&child, &parent));
        assert!(!check_valid_parent(&parent, &child));

        // Same length is not a parent.
        assert!(!check_valid_parent(&parent, &image("q", &["one"])));

        // Two entries longer is not a direct parent.
        assert!(!check_valid_parent(&image("g", &["one", "two", "three"]), &parent));

        // Divergent prefix.
        assert!(!check_valid_parent(&image("d", &["other", "two"]), &parent));

        // Child with history, parent without.
        assert!(check_valid_parent(&image("e", &["one"]), &empty_a));
    }
}
