//! HTMLZ output: a zip holding one `index.html`, its resources and a
//! `metadata.opf`.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::merge::merge_spine;
use super::Encoder;
use crate::error::Result;
use crate::opf::metadata::write_metadata;
use crate::opf::Package;
use crate::pipeline::StageContext;
use crate::types::media::is_html;
use crate::types::Book;

const INDEX: &str = "index.html";
const METADATA: &str = "metadata.opf";

pub struct HtmlzEncoder;

impl HtmlzEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HtmlzEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A standalone package carrying only metadata and the cover reference
fn metadata_opf(book: &Book) -> String {
    let mut pkg = Package::new();
    write_metadata(&mut pkg, &book.metadata());
    if let Some(cover) = book.cover_name() {
        pkg.guide.set("cover", "Cover", cover, None);
    }
    pkg.to_xml(METADATA)
}

impl Encoder for HtmlzEncoder {
    fn name(&self) -> &'static str {
        "htmlz"
    }

    fn file_extension(&self) -> &'static str {
        "htmlz"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["htmlz"]
    }

    fn mime_type(&self) -> &'static str {
        "application/zip"
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        let merged = merge_spine(book, INDEX)?;
        ctx.checkpoint()?;
        let skip = [book.container.ncx_name(), book.container.nav_name()];
        let resources: Vec<String> = book
            .manifest()
            .iter()
            .filter(|item| !is_html(&item.media_type) && !skip.contains(&Some(item.href.clone())))
            .map(|item| item.href.clone())
            .filter(|name| name != INDEX && name != METADATA)
            .collect();

        let mut zip = ZipWriter::new(File::create(output)?);
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(INDEX, deflated)?;
        zip.write_all(merged.doc.to_xml().as_bytes())?;
        for name in &resources {
            zip.start_file(name.as_str(), deflated)?;
            zip.write_all(&book.container.read(name)?)?;
        }
        zip.start_file(METADATA, deflated)?;
        zip.write_all(metadata_opf(book).as_bytes())?;
        zip.finish()?;
        ctx.log.info(format!(
            "merged {} documents into {INDEX} with {} resources",
            merged.chapters.len(),
            resources.len()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, HtmlzDecoder};
    use crate::transform::test_support::{book, context, xhtml};

    #[test]
    fn test_htmlz_round_trip() {
        let mut book = book(&[
            ("text/a.xhtml", &xhtml(r#"<h1>One</h1><img src="../img/p.png"/>"#)),
            ("text/b.xhtml", &xhtml("<h1>Two</h1>")),
        ]);
        book.container.add_name("img/p.png", b"\x89PNG\r\n\x1a\n", None, &[]).unwrap();
        let mut meta = book.metadata();
        meta.title = "Zipped".into();
        meta.authors = vec!["Z. Author".into()];
        book.set_metadata(&meta);

        let encoder = HtmlzEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[]);
        let out = tmp.path().join("book.htmlz");
        encoder.encode(&mut book, &out, &ctx).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"index.html"));
        assert!(names.contains(&"img/p.png"));
        assert!(names.contains(&"metadata.opf"));
        drop(archive);

        let decoder = HtmlzDecoder::new();
        let (ctx, _tmp2) = context(decoder.options(), &[]);
        let back = decoder.decode(&out, &ctx).unwrap();
        assert_eq!(back.title(), "Zipped");
        assert_eq!(back.metadata().authors, vec!["Z. Author"]);
        let html = back.container.read_text("index.html").unwrap();
        assert!(html.contains("Two"));
        assert!(html.contains(r#"src="img/p.png""#));
    }
}
