//! The on-disk ebook.
//!
//! A [`Container`] owns a working directory holding the raw entries of a book
//! plus its package document. Parsed trees are cached in memory and written
//! back on [`Container::flush`]; every structural change (add, rename,
//! remove) goes through the container so that manifest, spine, guide, TOC
//! and in-document references stay consistent.

pub mod links;
pub mod paths;
mod spider;
pub mod text;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::css::Stylesheet;
use crate::dom::Document;
use crate::error::{ConversionError, ParseError, QuireError, Result};
use crate::opf::nav::{read_nav, update_nav, write_nav};
use crate::opf::ncx::{read_ncx, write_ncx};
use crate::opf::Package;
use crate::types::media::{guess_media_type, is_css, is_html, is_xml};
use crate::types::{ManifestItem, TocNode};

pub use links::{Link, LinkLocation};
pub use spider::{spider, Spidered};

use links::{css_links, markup_links, rewrite_css, rewrite_markup, Retarget};
use text::decode_text;

pub const EPUB_MIMETYPE: &str = "application/epub+zip";
const CONTAINER_XML: &str = "META-INF/container.xml";

/// A parsed entry
#[derive(Debug, Clone)]
pub enum Parsed {
    Html(Document),
    Css(Stylesheet),
    Xml(Document),
}

impl Parsed {
    fn serialize(&self) -> String {
        match self {
            Parsed::Html(doc) | Parsed::Xml(doc) => doc.to_xml(),
            Parsed::Css(sheet) => sheet.to_css(),
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    parsed: Option<Parsed>,
    dirty: bool,
}

/// An ebook's working directory with parsed-tree cache and link index
#[derive(Debug)]
pub struct Container {
    root: PathBuf,
    _tmp: Option<TempDir>,
    opf_name: String,
    package: Package,
    package_dirty: bool,
    entries: BTreeMap<String, Entry>,
    toc: Option<TocNode>,
    toc_dirty: bool,
    /// Links made by each referrer, computed on demand
    links: HashMap<String, Vec<Link>>,
}

fn not_found(name: &str) -> QuireError {
    io::Error::new(io::ErrorKind::NotFound, format!("no entry named '{name}'")).into()
}

fn is_referrer(media_type: &str) -> bool {
    is_html(media_type) || is_css(media_type) || is_xml(media_type)
}

fn is_zip(path: &Path) -> io::Result<bool> {
    let mut head = [0u8; 4];
    let mut file = fs::File::open(path)?;
    let n = file.read(&mut head)?;
    Ok(n == 4 && head == *b"PK\x03\x04")
}

/// Relative names of every file below `dir`, with `/` separators
fn walk(dir: &Path) -> io::Result<Vec<String>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                visit(root, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                let name: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(name.join("/"));
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    visit(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for name in walk(from)? {
        let dest = to.join(&name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from.join(&name), dest)?;
    }
    Ok(())
}

pub(crate) fn extract_zip(path: &Path, root: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(fs::File::open(path)?)
        .map_err(|e| ParseError::CorruptInput(format!("{}: {e}", path.display())))?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(rel) = file.enclosed_name() else {
            warn!(entry = file.name(), "skipping archive entry outside the book root");
            continue;
        };
        let dest = root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

/// Rootfile named by `META-INF/container.xml`
fn rootfile(root: &Path) -> Option<String> {
    let bytes = fs::read(root.join(CONTAINER_XML)).ok()?;
    let doc = Document::parse_xml(&decode_text(&bytes)).ok()?;
    let rootfiles = doc.elements_by_name(doc.root(), "rootfile");
    let pick = rootfiles
        .iter()
        .copied()
        .find(|&r| doc.attr(r, "media-type") == Some("application/oebps-package+xml"))
        .or_else(|| rootfiles.first().copied())?;
    paths::normalize_name(doc.attr(pick, "full-path")?)
}

fn container_xml(opf_name: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  \
         <rootfiles>\n    \
         <rootfile full-path=\"{}\" media-type=\"application/oebps-package+xml\"/>\n  \
         </rootfiles>\n\
         </container>\n",
        crate::dom::escape_text(opf_name)
    )
}

impl Container {
    /// An empty book rooted at `root`, which is created if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            _tmp: None,
            opf_name: "content.opf".to_string(),
            package: Package::new(),
            package_dirty: true,
            entries: BTreeMap::new(),
            toc: Some(TocNode::root()),
            toc_dirty: false,
            links: HashMap::new(),
        })
    }

    /// An empty book in a fresh temporary directory, removed on drop
    pub fn temporary() -> Result<Self> {
        let tmp = tempfile::Builder::new().prefix("quire-").tempdir()?;
        let mut container = Self::new(tmp.path())?;
        container._tmp = Some(tmp);
        Ok(container)
    }

    /// Open an EPUB file, an OEBPS directory, an OPF file or a single HTML
    /// file into a fresh temporary directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let tmp = tempfile::Builder::new().prefix("quire-").tempdir()?;
        let mut container = Self::open_in(path, tmp.path())?;
        container._tmp = Some(tmp);
        Ok(container)
    }

    /// Open `path` using `root` as the working directory
    pub fn open_in(path: impl AsRef<Path>, root: impl Into<PathBuf>) -> Result<Self> {
        let path = path.as_ref();
        let root = root.into();
        fs::create_dir_all(&root)?;
        if path.is_dir() {
            copy_dir(path, &root)?;
            return Self::load(root, None);
        }
        if is_zip(path)? {
            extract_zip(path, &root)?;
            return Self::load(root, None);
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "opf" => {
                let dir = path.parent().unwrap_or(Path::new("."));
                copy_dir(dir, &root)?;
                let opf = path
                    .strip_prefix(dir)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .ok();
                Self::load(root, opf)
            }
            "html" | "htm" | "xhtml" | "shtml" => Self::from_html(path, root, 5),
            _ => Err(ParseError::InvalidEbook(format!(
                "{} is not an EPUB, OEBPS directory, OPF or HTML file",
                path.display()
            ))
            .into()),
        }
    }

    /// Build a book from an HTML file and the local files it reaches
    pub fn from_html(index: &Path, root: impl Into<PathBuf>, max_levels: usize) -> Result<Self> {
        let base = index.parent().unwrap_or(Path::new("."));
        let index_name = index
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| ParseError::InvalidEbook(format!("{}", index.display())))?;
        let found = spider(base, &index_name, max_levels);
        let mut container = Self::new(root)?;
        for name in &found.names {
            let data = fs::read(base.join(name))?;
            if let Err(e) = container.add_name(name, &data, None, &[]) {
                warn!(name = %name, "skipping spidered file: {e}");
            }
        }
        for name in &found.spine {
            if let Some(id) = container.manifest_id_for_name(name).map(str::to_string) {
                container.package.spine.push(id, true);
            }
        }
        Ok(container)
    }

    fn load(root: PathBuf, opf_hint: Option<String>) -> Result<Self> {
        let files = walk(&root)?;
        let opf_name = opf_hint
            .or_else(|| rootfile(&root).filter(|n| files.contains(n)))
            .or_else(|| files.iter().find(|n| n.to_ascii_lowercase().ends_with(".opf")).cloned())
            .ok_or_else(|| ParseError::InvalidEbook("no package document found".into()))?;
        let text = decode_text(&fs::read(root.join(&opf_name))?);
        let mut package = Package::parse_str(&text, &opf_name)?;

        let missing: Vec<ManifestItem> = package
            .manifest
            .iter()
            .filter(|item| !files.contains(&item.href))
            .cloned()
            .collect();
        for item in missing {
            warn!(href = %item.href, "manifest item has no file, dropping it");
            package.spine.remove(&item.id);
            package.manifest.remove(&item.id);
        }

        let entries = files
            .into_iter()
            .filter(|n| n != "mimetype" && n != CONTAINER_XML && *n != opf_name)
            .map(|n| (n, Entry::default()))
            .collect();
        debug!(opf = %opf_name, "opened book");
        Ok(Self {
            root,
            _tmp: None,
            opf_name,
            package,
            package_dirty: false,
            entries,
            toc: None,
            toc_dirty: false,
            links: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Container name of the package document
    pub fn opf_name(&self) -> &str {
        &self.opf_name
    }

    /// Filesystem path of an entry, refusing names that leave the root
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ParseError::InvalidEbook(format!("invalid entry name '{name}'")).into());
        }
        Ok(self.root.join(rel))
    }

    /// Names of all entries other than the package document and OCF files
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Media type from the manifest, else guessed from the extension
    pub fn media_type(&self, name: &str) -> String {
        self.package
            .manifest
            .by_href(name)
            .map(|i| i.media_type.clone())
            .unwrap_or_else(|| guess_media_type(name).to_string())
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| e.dirty)
    }

    /// Whether the TOC changed since the TOC documents were last written
    pub fn is_toc_dirty(&self) -> bool {
        self.toc_dirty
    }

    /// Size in bytes of an entry as it would be written now
    pub fn size(&self, name: &str) -> Result<u64> {
        match self.entries.get(name) {
            Some(Entry {
                parsed: Some(p),
                dirty: true,
            }) => Ok(p.serialize().len() as u64),
            Some(_) => Ok(fs::metadata(self.path_of(name)?)?.len()),
            None => Err(not_found(name)),
        }
    }

    /// Current bytes of an entry, including unflushed edits
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        if name == self.opf_name {
            return Ok(self.package.to_xml(&self.opf_name).into_bytes());
        }
        match self.entries.get(name) {
            Some(Entry {
                parsed: Some(p),
                dirty: true,
            }) => Ok(p.serialize().into_bytes()),
            Some(_) => Ok(fs::read(self.path_of(name)?)?),
            None => Err(not_found(name)),
        }
    }

    /// Entry text decoded per its BOM or declared encoding
    pub fn read_text(&self, name: &str) -> Result<String> {
        Ok(decode_text(&self.read(name)?))
    }

    /// Replace the bytes of an entry, creating it (unmanifested) if needed.
    /// Any cached tree is dropped.
    pub fn write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        if name == self.opf_name {
            self.package = Package::parse_str(&decode_text(data), name)?;
            self.package_dirty = false;
            return Ok(());
        }
        self.entries.insert(name.to_string(), Entry::default());
        self.links.remove(name);
        Ok(())
    }

    fn check_free(&self, name: &str, except: Option<&str>) -> Result<()> {
        let taken = self
            .entries
            .keys()
            .map(String::as_str)
            .chain([self.opf_name.as_str(), "mimetype", CONTAINER_XML])
            .filter(|n| Some(*n) != except)
            .find(|n| n.eq_ignore_ascii_case(name));
        match taken {
            Some(existing) => Err(ConversionError::Conflict(format!(
                "'{name}' collides with existing entry '{existing}'"
            ))
            .into()),
            None => Ok(()),
        }
    }

    /// Add a new manifested entry and return its manifest id. Fails with
    /// `Conflict` if the name is taken, ignoring case.
    pub fn add_name(
        &mut self,
        name: &str,
        data: &[u8],
        media_type: Option<&str>,
        properties: &[&str],
    ) -> Result<String> {
        let name = paths::normalize_name(name)
            .ok_or_else(|| ParseError::InvalidEbook(format!("invalid entry name '{name}'")))?;
        self.check_free(&name, None)?;
        let media_type = media_type.unwrap_or_else(|| guess_media_type(&name));
        let id = self.package.manifest.unique_id(&name);
        let mut item = ManifestItem::new(id.clone(), name.clone(), media_type);
        for property in properties {
            item = item.with_property(property);
        }
        self.package.manifest.insert(item)?;
        self.package_dirty = true;
        self.write(&name, data)?;
        Ok(id)
    }

    /// A free name derived from `name` by appending a counter to the stem
    pub fn unique_name(&self, name: &str) -> String {
        if self.check_free(name, None).is_ok() {
            return name.to_string();
        }
        let (stem, ext) = match name.rfind('.') {
            Some(dot) if dot > name.rfind('/').map_or(0, |s| s + 1) => name.split_at(dot),
            _ => (name, ""),
        };
        (1..)
            .map(|n| format!("{stem}-{n}{ext}"))
            .find(|candidate| self.check_free(candidate, None).is_ok())
            .unwrap_or_else(|| name.to_string())
    }

    fn ensure_parsed(&mut self, name: &str) -> Result<()> {
        let entry = self.entries.get(name).ok_or_else(|| not_found(name))?;
        if entry.parsed.is_some() {
            return Ok(());
        }
        let media_type = self.media_type(name);
        let parsed = if is_html(&media_type) {
            let text = decode_text(&fs::read(self.path_of(name)?)?);
            let (doc, errors) = Document::parse_html_with_errors(&text);
            for error in errors {
                debug!(file = name, "html recovery: {error}");
            }
            Parsed::Html(doc)
        } else if is_css(&media_type) {
            let sheet = Stylesheet::parse(&decode_text(&fs::read(self.path_of(name)?)?));
            for error in &sheet.errors {
                debug!(file = name, line = error.line, "css: {}", error.message);
            }
            Parsed::Css(sheet)
        } else if is_xml(&media_type) {
            let text = decode_text(&fs::read(self.path_of(name)?)?);
            Parsed::Xml(Document::parse_xml(&text).map_err(|e| e.in_file(name))?)
        } else {
            return Err(ParseError::NotParseable(format!("{name} ({media_type})")).into());
        };
        if let Some(entry) = self.entries.get_mut(name) {
            entry.parsed = Some(parsed);
        }
        Ok(())
    }

    /// Parsed tree of an entry
    pub fn parsed(&mut self, name: &str) -> Result<&Parsed> {
        self.ensure_parsed(name)?;
        self.entries
            .get(name)
            .and_then(|e| e.parsed.as_ref())
            .ok_or_else(|| not_found(name))
    }

    /// Parsed tree of an entry for editing; the entry becomes dirty
    pub fn parsed_mut(&mut self, name: &str) -> Result<&mut Parsed> {
        self.ensure_parsed(name)?;
        self.links.remove(name);
        let entry = self.entries.get_mut(name).ok_or_else(|| not_found(name))?;
        entry.dirty = true;
        entry.parsed.as_mut().ok_or_else(|| not_found(name))
    }

    /// Store a tree as the new content of an existing entry
    pub fn set_parsed(&mut self, name: &str, parsed: Parsed) -> Result<()> {
        let entry = self.entries.get_mut(name).ok_or_else(|| not_found(name))?;
        entry.parsed = Some(parsed);
        entry.dirty = true;
        self.links.remove(name);
        Ok(())
    }

    pub fn html(&mut self, name: &str) -> Result<&Document> {
        match self.parsed(name)? {
            Parsed::Html(doc) => Ok(doc),
            _ => Err(ParseError::NotParseable(format!("{name} is not HTML")).into()),
        }
    }

    pub fn html_mut(&mut self, name: &str) -> Result<&mut Document> {
        match self.parsed_mut(name)? {
            Parsed::Html(doc) => Ok(doc),
            _ => Err(ParseError::NotParseable(format!("{name} is not HTML")).into()),
        }
    }

    pub fn css(&mut self, name: &str) -> Result<&Stylesheet> {
        match self.parsed(name)? {
            Parsed::Css(sheet) => Ok(sheet),
            _ => Err(ParseError::NotParseable(format!("{name} is not CSS")).into()),
        }
    }

    pub fn css_mut(&mut self, name: &str) -> Result<&mut Stylesheet> {
        match self.parsed_mut(name)? {
            Parsed::Css(sheet) => Ok(sheet),
            _ => Err(ParseError::NotParseable(format!("{name} is not CSS")).into()),
        }
    }

    pub fn xml(&mut self, name: &str) -> Result<&Document> {
        match self.parsed(name)? {
            Parsed::Xml(doc) | Parsed::Html(doc) => Ok(doc),
            Parsed::Css(_) => Err(ParseError::NotParseable(format!("{name} is not XML")).into()),
        }
    }

    pub fn xml_mut(&mut self, name: &str) -> Result<&mut Document> {
        match self.parsed_mut(name)? {
            Parsed::Xml(doc) | Parsed::Html(doc) => Ok(doc),
            Parsed::Css(_) => Err(ParseError::NotParseable(format!("{name} is not XML")).into()),
        }
    }

    /// The package document
    pub fn opf(&self) -> &Package {
        &self.package
    }

    pub fn opf_mut(&mut self) -> &mut Package {
        self.package_dirty = true;
        &mut self.package
    }

    /// Name of the NCX: the spine's toc attribute, else the first NCX item
    pub fn ncx_name(&self) -> Option<String> {
        let manifest = &self.package.manifest;
        self.package
            .spine
            .toc
            .as_deref()
            .and_then(|id| manifest.get(id))
            .or_else(|| manifest.ncx())
            .map(|i| i.href.clone())
            .filter(|n| self.exists(n))
    }

    /// Name of the EPUB 3 navigation document
    pub fn nav_name(&self) -> Option<String> {
        self.package
            .manifest
            .nav()
            .map(|i| i.href.clone())
            .filter(|n| self.exists(n))
    }

    pub fn ncx(&mut self) -> Result<Option<&Document>> {
        match self.ncx_name() {
            Some(name) => self.xml(&name).map(Some),
            None => Ok(None),
        }
    }

    pub fn nav(&mut self) -> Result<Option<&Document>> {
        match self.nav_name() {
            Some(name) => self.html(&name).map(Some),
            None => Ok(None),
        }
    }

    fn load_toc(&mut self) -> TocNode {
        if let Some(name) = self.nav_name() {
            match self.html(&name) {
                Ok(doc) => {
                    let toc = read_nav(doc, &name);
                    if !toc.is_empty() {
                        return toc;
                    }
                }
                Err(e) => warn!(file = %name, "unreadable navigation document: {e}"),
            }
        }
        if let Some(name) = self.ncx_name() {
            match self.xml(&name) {
                Ok(doc) => return read_ncx(doc, &name),
                Err(e) => warn!(file = %name, "unreadable NCX: {e}"),
            }
        }
        TocNode::root()
    }

    /// Table of contents, read from the nav document or NCX on first use
    pub fn toc(&mut self) -> &TocNode {
        if self.toc.is_none() {
            self.toc = Some(self.load_toc());
        }
        self.toc.get_or_insert_with(TocNode::root)
    }

    pub fn toc_mut(&mut self) -> &mut TocNode {
        self.toc();
        self.toc_dirty = true;
        self.toc.get_or_insert_with(TocNode::root)
    }

    pub fn set_toc(&mut self, toc: TocNode) {
        self.toc = Some(toc);
        self.toc_dirty = true;
    }

    pub fn manifest_id_for_name(&self, name: &str) -> Option<&str> {
        self.package.manifest.by_href(name).map(|i| i.id.as_str())
    }

    pub fn name_for_href(&self, href: &str, base: &str) -> Option<String> {
        paths::name_for_href(href, base)
    }

    pub fn href_for_name(&self, name: &str, base: &str) -> String {
        paths::href_for_name(name, base)
    }

    /// Spine documents in reading order
    pub fn spine_names(&self) -> Vec<String> {
        self.package
            .spine
            .ids()
            .filter_map(|id| self.package.manifest.get(id))
            .map(|i| i.href.clone())
            .collect()
    }

    fn referrers(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|n| is_referrer(&self.media_type(n)))
            .cloned()
            .collect()
    }

    /// Text of a stylesheet entry, serialized from its tree if parsed
    fn css_text(&self, name: &str) -> Result<String> {
        match self.entries.get(name) {
            Some(Entry {
                parsed: Some(Parsed::Css(sheet)),
                ..
            }) => Ok(sheet.to_css()),
            Some(_) => self.read_text(name),
            None => Err(not_found(name)),
        }
    }

    /// References made by an entry. Entries that fail to parse have none.
    pub fn links(&mut self, name: &str) -> Result<Vec<Link>> {
        if let Some(cached) = self.links.get(name) {
            return Ok(cached.clone());
        }
        let media_type = self.media_type(name);
        let found = if is_css(&media_type) {
            css_links(&self.css_text(name)?, name)
        } else if is_referrer(&media_type) {
            match self.parsed(name) {
                Ok(Parsed::Html(doc) | Parsed::Xml(doc)) => markup_links(doc, name),
                Ok(Parsed::Css(_)) => Vec::new(),
                Err(e) => {
                    warn!(file = name, "cannot index links: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        self.links.insert(name.to_string(), found.clone());
        Ok(found)
    }

    /// Entries referring to `target`, with the referring links
    pub fn referrers_of(&mut self, target: &str) -> Result<Vec<(String, Vec<Link>)>> {
        let mut out = Vec::new();
        for referrer in self.referrers() {
            let hits: Vec<Link> = self
                .links(&referrer)?
                .into_iter()
                .filter(|l| l.target == target)
                .collect();
            if !hits.is_empty() {
                out.push((referrer, hits));
            }
        }
        Ok(out)
    }

    /// Rewrite the links of `name`, which is moving to `new_base` (or
    /// staying, when equal). Returns the number of changed values.
    fn retarget_entry(
        &mut self,
        name: &str,
        new_base: &str,
        decide: &dyn Fn(&str) -> Retarget,
    ) -> Result<usize> {
        let links = self.links(name)?;
        let moving = name != new_base;
        let locations: Vec<LinkLocation> = links
            .into_iter()
            .filter(|l| moving || decide(&l.target) != Retarget::Keep)
            .map(|l| l.location)
            .collect();
        if locations.is_empty() {
            return Ok(0);
        }
        let changed = if is_css(&self.media_type(name)) {
            let css = self.css_text(name)?;
            match rewrite_css(&css, name, new_base, decide) {
                Some(new_css) => {
                    self.set_parsed(name, Parsed::Css(Stylesheet::parse(&new_css)))?;
                    1
                }
                None => 0,
            }
        } else {
            let doc = self.xml_mut(name)?;
            rewrite_markup(doc, &locations, name, new_base, decide)
        };
        Ok(changed)
    }

    /// Rename an entry, updating every reference to it: in-document links,
    /// stylesheet urls, manifest, guide and TOC.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if !self.exists(old) {
            return Err(not_found(old));
        }
        let new = paths::normalize_name(new)
            .ok_or_else(|| ParseError::InvalidEbook(format!("invalid entry name '{new}'")))?;
        if old == new {
            return Ok(());
        }
        self.check_free(&new, Some(old))?;
        self.toc();

        let decide = |target: &str| {
            if target == old {
                Retarget::Move(new.clone())
            } else {
                Retarget::Keep
            }
        };
        for (referrer, _) in self.referrers_of(old)? {
            if referrer != old {
                self.retarget_entry(&referrer, &referrer, &decide)?;
            }
        }
        if is_referrer(&self.media_type(old)) {
            self.retarget_entry(old, &new, &decide)?;
        }

        let from = self.path_of(old)?;
        let to = self.path_of(&new)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &to)?;
        if let Some(entry) = self.entries.remove(old) {
            self.entries.insert(new.clone(), entry);
        }
        self.links.remove(old);

        if let Some(item) = self.package.manifest.by_href_mut(old) {
            item.href = new.clone();
        }
        for reference in &mut self.package.guide.references {
            if reference.href == old {
                reference.href = new.clone();
            }
        }
        self.package_dirty = true;
        let mut toc_changed = false;
        if let Some(toc) = self.toc.as_mut() {
            toc.for_each_mut(&mut |node| {
                if node.href.as_deref() == Some(old) {
                    node.href = Some(new.clone());
                    toc_changed = true;
                }
            });
        }
        self.toc_dirty |= toc_changed;
        info!(from = old, to = %new, "renamed entry");
        Ok(())
    }

    /// Remove an entry from disk, manifest, spine, guide and TOC. Links that
    /// pointed to it are emptied.
    pub fn remove_name(&mut self, name: &str) -> Result<()> {
        if !self.exists(name) {
            return Err(not_found(name));
        }
        self.toc();
        let decide = |target: &str| {
            if target == name {
                Retarget::Break
            } else {
                Retarget::Keep
            }
        };
        for (referrer, hits) in self.referrers_of(name)? {
            if referrer == name {
                continue;
            }
            warn!(
                referrer = %referrer,
                target = name,
                count = hits.len(),
                "breaking links to removed entry"
            );
            self.retarget_entry(&referrer, &referrer, &decide)?;
        }

        if let Some(id) = self.manifest_id_for_name(name).map(str::to_string) {
            self.package.spine.remove(&id);
            if self.package.spine.toc.as_deref() == Some(id.as_str()) {
                self.package.spine.toc = None;
            }
            self.package.manifest.remove(&id);
        }
        self.package.guide.references.retain(|r| r.href != name);
        self.package_dirty = true;
        if let Some(toc) = self.toc.as_mut() {
            let before = toc.count();
            toc.retain(&mut |node| node.href.as_deref() != Some(name));
            self.toc_dirty |= toc.count() != before;
        }

        let path = self.path_of(name)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        self.entries.remove(name);
        self.links.remove(name);
        Ok(())
    }

    /// Point every reference to a key of `map` at its value instead.
    /// Returns the number of rewritten values.
    pub fn replace_links(&mut self, map: &HashMap<String, String>) -> Result<usize> {
        let decide = |target: &str| match map.get(target) {
            Some(to) => Retarget::Move(to.clone()),
            None => Retarget::Keep,
        };
        let mut changed = 0;
        for referrer in self.referrers() {
            changed += self.retarget_entry(&referrer, &referrer, &decide)?;
        }
        Ok(changed)
    }

    fn package_title(&self) -> String {
        let doc = &self.package.metadata;
        doc.children(self.package.metadata_element())
            .iter()
            .copied()
            .find(|&c| doc.name(c) == Some("dc:title"))
            .map(|t| doc.normalized_text(t))
            .unwrap_or_default()
    }

    fn package_uid(&self) -> String {
        let doc = &self.package.metadata;
        doc.element_by_id(&self.package.unique_identifier)
            .map(|n| doc.normalized_text(n))
            .unwrap_or_default()
    }

    /// Create, drop and regenerate the NCX and navigation document from the
    /// current TOC. A nav document is only kept for EPUB 3 packages.
    pub fn write_toc_documents(&mut self, want_ncx: bool, want_nav: bool) -> Result<()> {
        let toc = self.toc().clone();
        let title = self.package_title();
        let want_nav = want_nav && self.package.is_epub3();
        let opf_dir = paths::dir_of(&self.opf_name).to_string();

        match (self.ncx_name(), want_ncx) {
            (Some(name), true) => {
                let doc = write_ncx(&toc, &name, &self.package_uid(), &title);
                self.set_parsed(&name, Parsed::Xml(doc))?;
            }
            (None, true) => {
                let name = self.unique_name(&format!("{opf_dir}toc.ncx"));
                let doc = write_ncx(&toc, &name, &self.package_uid(), &title);
                let id = self.add_name(&name, doc.to_xml().as_bytes(), Some("application/x-dtbncx+xml"), &[])?;
                self.package.spine.toc = Some(id);
            }
            (Some(name), false) => self.remove_name(&name)?,
            (None, false) => {}
        }

        let lang = self.package.lang.clone();
        match (self.nav_name(), want_nav) {
            (Some(name), true) => {
                let doc = self.html_mut(&name)?;
                if !update_nav(doc, &toc, &name) {
                    let guide = self.package.guide.clone();
                    let doc = write_nav(&toc, &guide, &name, &title, lang.as_deref());
                    self.set_parsed(&name, Parsed::Html(doc))?;
                }
            }
            (None, true) => {
                let name = self.unique_name(&format!("{opf_dir}nav.xhtml"));
                let doc = write_nav(&toc, &self.package.guide, &name, &title, lang.as_deref());
                self.add_name(&name, doc.to_xml().as_bytes(), Some("application/xhtml+xml"), &["nav"])?;
            }
            (Some(name), false) => {
                let spined = self
                    .manifest_id_for_name(&name)
                    .is_some_and(|id| self.package.spine.contains(id));
                if spined {
                    // still part of the reading order, only drop the role
                    if let Some(item) = self.package.manifest.by_href_mut(&name) {
                        item.properties.remove("nav");
                    }
                } else {
                    self.remove_name(&name)?;
                }
            }
            (None, false) => {}
        }
        self.toc_dirty = false;
        self.package_dirty = true;
        Ok(())
    }

    /// Write all dirty trees, the TOC documents and the package to disk
    pub fn flush(&mut self) -> Result<()> {
        if self.toc_dirty {
            let toc = self.toc().clone();
            if let Some(name) = self.ncx_name() {
                let doc = write_ncx(&toc, &name, &self.package_uid(), &self.package_title());
                self.set_parsed(&name, Parsed::Xml(doc))?;
            }
            if let Some(name) = self.nav_name() {
                if let Ok(doc) = self.html_mut(&name) {
                    update_nav(doc, &toc, &name);
                }
            }
            self.toc_dirty = false;
        }
        let dirty: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(n, _)| n.clone())
            .collect();
        for name in dirty {
            let path = self.path_of(&name)?;
            if let Some(entry) = self.entries.get_mut(&name) {
                if let Some(parsed) = &entry.parsed {
                    fs::write(&path, parsed.serialize())?;
                }
                entry.dirty = false;
            }
        }
        if self.package_dirty {
            fs::write(self.root.join(&self.opf_name), self.package.to_xml(&self.opf_name))?;
            self.package_dirty = false;
        }
        Ok(())
    }

    /// Write the book as an EPUB archive at `path`. The archive is built in
    /// a sibling temporary file and moved into place only when complete.
    pub fn commit(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.flush()?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut zip = ZipWriter::new(tmp.as_file_mut());
            let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            let deflated =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            zip.start_file("mimetype", stored)?;
            zip.write_all(EPUB_MIMETYPE.as_bytes())?;
            zip.start_file(CONTAINER_XML, deflated)?;
            zip.write_all(container_xml(&self.opf_name).as_bytes())?;
            zip.start_file(self.opf_name.as_str(), deflated)?;
            zip.write_all(self.package.to_xml(&self.opf_name).as_bytes())?;
            for name in self.entries.keys() {
                zip.start_file(name.as_str(), deflated)?;
                zip.write_all(&fs::read(self.path_of(name)?)?)?;
            }
            zip.finish()?;
        }
        tmp.persist(path).map_err(|e| QuireError::Io(e.error))?;
        info!(path = %path.display(), entries = self.entries.len(), "committed book");
        Ok(())
    }

    /// Write the book as an OEBPS directory tree at `dir`
    pub fn commit_to_dir(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        self.flush()?;
        fs::create_dir_all(dir)?;
        let opf_path = dir.join(&self.opf_name);
        if let Some(parent) = opf_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(opf_path, self.package.to_xml(&self.opf_name))?;
        for name in self.entries.keys() {
            let dest = dir.join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(self.path_of(name)?, dest)?;
        }
        Ok(())
    }
}
