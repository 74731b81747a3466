//! Manifest, spine and guide of a package

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;

/// A resource declared in the manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestItem {
    pub id: String,

    /// Container name, root-relative and percent-decoded
    pub href: String,

    /// Canonical lowercase media type
    pub media_type: String,

    pub properties: BTreeSet<String>,

    pub fallback: Option<String>,
}

impl ManifestItem {
    pub fn new(id: impl Into<String>, href: impl Into<String>, media_type: &str) -> Self {
        Self {
            id: id.into(),
            href: href.into(),
            media_type: crate::types::media::canonical_media_type(media_type),
            properties: BTreeSet::new(),
            fallback: None,
        }
    }

    pub fn with_property(mut self, property: &str) -> Self {
        self.properties.insert(property.to_string());
        self
    }

    pub fn is_html(&self) -> bool {
        crate::types::media::is_html(&self.media_type)
    }

    pub fn is_css(&self) -> bool {
        self.media_type == "text/css"
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

/// Ordered set of manifest items with unique ids and hrefs
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    items: Vec<ManifestItem>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ManifestItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ManifestItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    pub fn by_href(&self, href: &str) -> Option<&ManifestItem> {
        self.items.iter().find(|i| i.href == href)
    }

    pub fn by_href_mut(&mut self, href: &str) -> Option<&mut ManifestItem> {
        self.items.iter_mut().find(|i| i.href == href)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Add an item. Ids and hrefs must both be unused.
    pub fn insert(&mut self, item: ManifestItem) -> Result<(), ConversionError> {
        if self.contains_id(&item.id) {
            return Err(ConversionError::Conflict(format!(
                "manifest id '{}' already exists",
                item.id
            )));
        }
        if self.by_href(&item.href).is_some() {
            return Err(ConversionError::Conflict(format!(
                "manifest href '{}' already exists",
                item.href
            )));
        }
        let wants_cover = item.properties.contains("cover-image");
        self.items.push(item);
        if wants_cover {
            let id = self.items[self.items.len() - 1].id.clone();
            self.set_cover_image(Some(&id));
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<ManifestItem> {
        let pos = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(pos))
    }

    /// Derive an unused id from a file name
    pub fn unique_id(&self, name: &str) -> String {
        let stem = name.rsplit('/').next().unwrap_or(name);
        let mut base: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if !base.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
            base.insert(0, 'x');
        }
        if !self.contains_id(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}{n}"))
            .find(|candidate| !self.contains_id(candidate))
            .unwrap_or(base)
    }

    /// The item carrying the `cover-image` property
    pub fn cover_image(&self) -> Option<&ManifestItem> {
        self.items
            .iter()
            .find(|i| i.properties.contains("cover-image"))
    }

    /// Move the `cover-image` property to `id` (or clear it), keeping it unique.
    pub fn set_cover_image(&mut self, id: Option<&str>) {
        for item in &mut self.items {
            if Some(item.id.as_str()) == id {
                item.properties.insert("cover-image".to_string());
            } else {
                item.properties.remove("cover-image");
            }
        }
    }

    /// The EPUB 3 navigation document
    pub fn nav(&self) -> Option<&ManifestItem> {
        self.items.iter().find(|i| i.properties.contains("nav"))
    }

    /// The first NCX document
    pub fn ncx(&self) -> Option<&ManifestItem> {
        self.items
            .iter()
            .find(|i| i.media_type == "application/x-dtbncx+xml")
    }
}

/// One entry of the reading order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpineItem {
    pub idref: String,
    pub linear: bool,
}

/// Reading order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Spine {
    pub items: Vec<SpineItem>,

    /// Manifest id of the NCX
    pub toc: Option<String>,

    pub page_progression_direction: Option<String>,
}

impl Spine {
    pub fn push(&mut self, idref: impl Into<String>, linear: bool) {
        self.items.push(SpineItem {
            idref: idref.into(),
            linear,
        });
    }

    pub fn insert(&mut self, index: usize, idref: impl Into<String>, linear: bool) {
        let index = index.min(self.items.len());
        self.items.insert(
            index,
            SpineItem {
                idref: idref.into(),
                linear,
            },
        );
    }

    pub fn contains(&self, idref: &str) -> bool {
        self.items.iter().any(|i| i.idref == idref)
    }

    pub fn remove(&mut self, idref: &str) {
        self.items.retain(|i| i.idref != idref);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|i| i.idref.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A guide reference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuideReference {
    /// Guide type (cover, toc, text, ...)
    pub kind: String,
    pub title: String,
    /// Container name
    pub href: String,
    pub fragment: Option<String>,
}

/// Legacy OPF guide
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Guide {
    pub references: Vec<GuideReference>,
}

impl Guide {
    pub fn get(&self, kind: &str) -> Option<&GuideReference> {
        self.references.iter().find(|r| r.kind == kind)
    }

    /// Set the reference for `kind`, replacing any existing one.
    pub fn set(
        &mut self,
        kind: &str,
        title: impl Into<String>,
        href: impl Into<String>,
        fragment: Option<String>,
    ) {
        self.remove(kind);
        self.references.push(GuideReference {
            kind: kind.to_string(),
            title: title.into(),
            href: href.into(),
            fragment,
        });
    }

    pub fn remove(&mut self, kind: &str) {
        self.references.retain(|r| r.kind != kind);
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuideReference> {
        self.references.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_rejects_duplicates() {
        let mut manifest = Manifest::new();
        manifest
            .insert(ManifestItem::new("a", "a.xhtml", "application/xhtml+xml"))
            .unwrap();
        assert!(manifest
            .insert(ManifestItem::new("a", "b.xhtml", "application/xhtml+xml"))
            .is_err());
        assert!(manifest
            .insert(ManifestItem::new("b", "a.xhtml", "application/xhtml+xml"))
            .is_err());
    }

    #[test]
    fn test_single_cover_image() {
        let mut manifest = Manifest::new();
        manifest
            .insert(ManifestItem::new("c1", "c1.jpg", "image/jpeg").with_property("cover-image"))
            .unwrap();
        manifest
            .insert(ManifestItem::new("c2", "c2.jpg", "image/jpg").with_property("cover-image"))
            .unwrap();
        let covers: Vec<_> = manifest
            .iter()
            .filter(|i| i.properties.contains("cover-image"))
            .collect();
        assert_eq!(covers.len(), 1);
        assert_eq!(covers[0].id, "c2");
        assert_eq!(covers[0].media_type, "image/jpeg");
    }

    #[test]
    fn test_unique_id() {
        let mut manifest = Manifest::new();
        manifest
            .insert(ManifestItem::new("ch1.xhtml", "text/ch1.xhtml", "application/xhtml+xml"))
            .unwrap();
        assert_eq!(manifest.unique_id("other/ch1.xhtml"), "ch1.xhtml1");
        assert_eq!(manifest.unique_id("01 intro.html"), "x01_intro.html");
    }

    #[test]
    fn test_guide_set_replaces() {
        let mut guide = Guide::default();
        guide.set("cover", "Cover", "a.jpg", None);
        guide.set("cover", "Cover", "b.jpg", None);
        assert_eq!(guide.references.len(), 1);
        assert_eq!(guide.get("cover").map(|r| r.href.as_str()), Some("b.jpg"));
    }
}
