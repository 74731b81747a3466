//! The main Book type - the root of the IR

use std::collections::HashSet;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use super::media::canonical_media_type;
use super::{CoverData, Guide, Manifest, Metadata, Spine, TocNode};
use crate::container::Container;
use crate::error::Result;
use crate::opf::metadata::{read_metadata, write_metadata};

/// The complete book representation
///
/// Manifest, spine, guide, TOC and metadata live in the container's package
/// so that every structural mutation goes through [`Container`] methods.
#[derive(Debug)]
pub struct Book {
    /// Unique identifier for this book
    pub id: Uuid,

    pub container: Container,
}

/// Result of [`Book::check_integrity`]
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct IntegrityReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Book {
    pub fn new(container: Container) -> Self {
        Self {
            id: Uuid::new_v4(),
            container,
        }
    }

    /// A book with no content in a temporary directory
    pub fn empty() -> Result<Self> {
        Ok(Self::new(Container::temporary()?))
    }

    pub fn manifest(&self) -> &Manifest {
        &self.container.opf().manifest
    }

    pub fn spine(&self) -> &Spine {
        &self.container.opf().spine
    }

    pub fn guide(&self) -> &Guide {
        &self.container.opf().guide
    }

    pub fn toc(&mut self) -> &TocNode {
        self.container.toc()
    }

    /// Metadata record read from the package
    pub fn metadata(&self) -> Metadata {
        let mut meta = read_metadata(self.container.opf());
        meta.cover_data = self.cover_data();
        meta
    }

    /// Rewrite the package metadata from `meta`. The cover is handled by
    /// the metadata embedding transform.
    pub fn set_metadata(&mut self, meta: &Metadata) {
        write_metadata(self.container.opf_mut(), meta);
    }

    /// Get the book title
    pub fn title(&self) -> String {
        read_metadata(self.container.opf()).title
    }

    pub fn spine_names(&self) -> Vec<String> {
        self.container.spine_names()
    }

    /// Name of the cover image: the `cover-image` item, else the EPUB 2
    /// `<meta name="cover">` item, else an image guide cover
    pub fn cover_name(&self) -> Option<String> {
        let opf = self.container.opf();
        if let Some(item) = opf.manifest.cover_image() {
            return Some(item.href.clone());
        }
        let doc = &opf.metadata;
        let meta_cover = doc
            .children_named(opf.metadata_element(), "meta")
            .into_iter()
            .find(|&m| doc.attr(m, "name") == Some("cover"))
            .and_then(|m| doc.attr(m, "content"))
            .and_then(|id| opf.manifest.get(id))
            .filter(|item| item.is_image());
        if let Some(item) = meta_cover {
            return Some(item.href.clone());
        }
        opf.guide
            .get("cover")
            .and_then(|r| opf.manifest.by_href(&r.href))
            .filter(|item| item.is_image())
            .map(|item| item.href.clone())
    }

    pub fn cover_data(&self) -> Option<CoverData> {
        let name = self.cover_name()?;
        let data = self.container.read(&name).ok()?;
        let format = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_else(|| "jpeg".to_string());
        Some(CoverData { format, data })
    }

    /// Drop spine entries whose ids are not in the manifest. Returns how
    /// many were dropped.
    pub fn enforce_spine(&mut self) -> usize {
        let manifest_ids: Vec<String> = self.manifest().iter().map(|i| i.id.clone()).collect();
        let spine = &mut self.container.opf_mut().spine;
        let before = spine.len();
        spine.items.retain(|s| {
            let known = manifest_ids.contains(&s.idref);
            if !known {
                warn!(idref = %s.idref, "dropping spine entry missing from the manifest");
            }
            known
        });
        before - spine.len()
    }

    /// Remove TOC entries whose target is not a manifested file of the
    /// book. Returns how many were removed; the TOC is left untouched (and
    /// clean) when nothing dangles.
    pub fn prune_dangling(&mut self) -> usize {
        let dangling: HashSet<String> = {
            let hrefs: Vec<String> = self
                .container
                .toc()
                .flatten()
                .into_iter()
                .filter_map(|(_, node)| node.href.clone())
                .collect();
            hrefs
                .into_iter()
                .filter(|href| !self.resolves(href))
                .collect()
        };
        if dangling.is_empty() {
            return 0;
        }
        let toc = self.container.toc_mut();
        let before = toc.count();
        toc.retain(&mut |node| node.href.as_ref().map_or(true, |h| !dangling.contains(h)));
        let removed = before - toc.count();
        warn!(removed, "pruned TOC entries pointing outside the book");
        removed
    }

    /// Whether `href` names a manifest item whose file exists
    fn resolves(&self, href: &str) -> bool {
        self.manifest().by_href(href).is_some() && self.container.exists(href)
    }

    /// Check the invariants that input codecs and transforms must keep
    pub fn check_integrity(&mut self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let opf = self.container.opf().clone();

        for idref in opf.spine.ids() {
            if !opf.manifest.contains_id(idref) {
                report
                    .errors
                    .push(format!("spine item '{idref}' is not in the manifest"));
            }
        }
        for item in opf.manifest.iter() {
            if !self.container.exists(&item.href) {
                report
                    .errors
                    .push(format!("manifest item '{}' has no file '{}'", item.id, item.href));
            }
            if canonical_media_type(&item.media_type) != item.media_type {
                report.warnings.push(format!(
                    "manifest item '{}' has non-canonical media type '{}'",
                    item.id, item.media_type
                ));
            }
        }
        let covers = opf
            .manifest
            .iter()
            .filter(|i| i.properties.contains("cover-image"))
            .count();
        if covers > 1 {
            report
                .errors
                .push(format!("{covers} manifest items carry the cover-image property"));
        }
        for reference in opf.guide.iter() {
            if !self.container.exists(&reference.href) {
                report.warnings.push(format!(
                    "guide reference '{}' points to missing '{}'",
                    reference.kind, reference.href
                ));
            }
        }

        let entries: Vec<(String, Option<String>)> = self
            .container
            .toc()
            .flatten()
            .into_iter()
            .filter_map(|(_, n)| n.href.clone().map(|h| (h, n.fragment.clone())))
            .collect();
        for (href, fragment) in entries {
            if !self.container.exists(&href) {
                report
                    .errors
                    .push(format!("TOC entry points to missing '{href}'"));
                continue;
            }
            let Some(fragment) = fragment else {
                continue;
            };
            let resolved = match self.container.html(&href) {
                Ok(doc) => doc.element_by_id(&fragment).is_some(),
                Err(_) => true,
            };
            if !resolved {
                report
                    .warnings
                    .push(format!("TOC fragment '{href}#{fragment}' does not resolve"));
            }
        }
        report
    }
}
