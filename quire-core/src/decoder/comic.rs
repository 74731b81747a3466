//! Comic book archive decoder (CBZ).
//!
//! Images are ordered by natural sort of their archive paths and each one
//! becomes a page of its own. `ComicInfo.xml`, when present, supplies the
//! metadata.

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;

use zip::ZipArchive;

use super::{corrupt, file_title, has_extension, is_zip, read_zip_entry, BookBuilder, Decoder};
use crate::container::text::decode_text;
use crate::dom::Document;
use crate::error::{ParseError, Result};
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::media::{guess_media_type, is_raster_image};
use crate::types::{parse_date, Book, Metadata, TocNode};

const PAGE_CSS: &str = "body { margin: 0; padding: 0; text-align: center; }\n\
div.comic-page { height: 100%; }\n\
img { max-width: 100%; max-height: 100%; }\n";

pub struct ComicDecoder;

impl ComicDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ComicDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Chunk {
    Number(u64),
    Text(String),
}

/// Sort key comparing digit runs by value
fn natural_key(name: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut chars = name.chars().peekable();
    while let Some(&c) = chars.peek() {
        let digits = c.is_ascii_digit();
        let mut run = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != digits {
                break;
            }
            run.push(c);
            chars.next();
        }
        chunks.push(if digits {
            Chunk::Number(run.parse().unwrap_or(u64::MAX))
        } else {
            Chunk::Text(run.to_lowercase())
        });
    }
    chunks
}

fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b)).then_with(|| a.cmp(b))
}

fn is_page(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name);
    !name.starts_with("__MACOSX/")
        && !file.starts_with('.')
        && !name.ends_with('/')
        && is_raster_image(guess_media_type(name))
}

/// Metadata from a `ComicInfo.xml` document
fn comic_info(xml: &str, fallback_title: &str) -> Result<Metadata> {
    let doc = Document::parse_xml(xml)?;
    let text = |name: &str| {
        doc.find_first(doc.root(), name)
            .map(|n| doc.normalized_text(n))
            .filter(|t| !t.is_empty())
    };
    let list = |name: &str| -> Vec<String> {
        text(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let mut meta = Metadata {
        title: text("Title")
            .or_else(|| text("Series"))
            .unwrap_or_else(|| fallback_title.to_string()),
        ..Metadata::default()
    };
    meta.authors = ["Writer", "Penciller", "Inker", "Colorist"]
        .iter()
        .flat_map(|role| list(role))
        .fold(Vec::new(), |mut acc, a| {
            if !acc.contains(&a) {
                acc.push(a);
            }
            acc
        });
    meta.publisher = text("Publisher");
    meta.comments = text("Summary");
    meta.tags = list("Genre");
    if let Some(series) = text("Series") {
        let index = text("Number").and_then(|n| n.parse::<f64>().ok());
        meta.set_series(Some(series), index);
    }
    if let Some(lang) = text("LanguageISO") {
        meta.set_languages([lang]);
    }
    if let Some(year) = text("Year") {
        let month = text("Month").unwrap_or_else(|| "1".into());
        let day = text("Day").unwrap_or_else(|| "1".into());
        meta.pubdate = parse_date(&format!("{year}-{month:0>2}-{day:0>2}"));
    }
    Ok(meta)
}

impl Decoder for ComicDecoder {
    fn name(&self) -> &'static str {
        "comic"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["cbz"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/vnd.comicbook+zip", "application/x-cbz"]
    }

    fn sniff(&self, path: &Path, head: &[u8]) -> bool {
        is_zip(head) && has_extension(path, &["cbz"])
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool(
            "no_sort",
            false,
            "Keep pages in archive order instead of sorting by file name",
        )]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let mut archive = ZipArchive::new(File::open(input)?).map_err(|e| corrupt(input, e))?;
        let mut pages: Vec<String> = archive.file_names().filter(|n| is_page(n)).map(str::to_string).collect();
        if pages.is_empty() {
            return Err(ParseError::InvalidEbook(format!("{} holds no images", input.display())).into());
        }
        if !ctx.options.bool("no_sort") {
            pages.sort_by(|a, b| natural_cmp(a, b));
        }
        let info_name = archive
            .file_names()
            .find(|n| n.rsplit('/').next().is_some_and(|f| f.eq_ignore_ascii_case("ComicInfo.xml")))
            .map(str::to_string);
        let meta = match info_name {
            Some(name) => {
                let xml = decode_text(&read_zip_entry(&mut archive, &name)?);
                comic_info(&xml, &file_title(input)).unwrap_or_else(|e| {
                    ctx.log.warn(format!("ignoring unreadable {name}: {e}"));
                    Metadata {
                        title: file_title(input),
                        ..Metadata::default()
                    }
                })
            }
            None => Metadata {
                title: file_title(input),
                ..Metadata::default()
            },
        };

        let mut builder = BookBuilder::new(ctx)?;
        let css = builder.add_resource("styles/comic.css", PAGE_CSS.as_bytes(), Some("text/css"))?;
        let lang = meta.language();
        let mut added = 0;
        for (i, entry) in pages.iter().enumerate() {
            ctx.checkpoint()?;
            let data = read_zip_entry(&mut archive, entry)?;
            let Some(image) = builder.add_image(&format!("images/page{:04}", i + 1), &data)? else {
                ctx.log.warn(format!("skipping {entry}: not a readable image"));
                continue;
            };
            added += 1;
            let title = format!("Page {added}");
            let (mut doc, body) = Document::xhtml_skeleton(&title, lang);
            if let Some(head) = doc.head() {
                let link = doc.create_element_with(
                    "link",
                    &[("rel", "stylesheet"), ("type", "text/css"), ("href", &format!("../{css}"))],
                );
                doc.append(head, link);
            }
            let div = doc.append_element(body, "div");
            doc.set_attr(div, "class", "comic-page");
            let img = doc.create_element_with("img", &[("src", &format!("../{image}")), ("alt", &title)]);
            doc.append(div, img);
            let name = builder.add_document(&format!("pages/page{added:04}.xhtml"), &doc)?;
            builder.toc_mut().add_child(TocNode::new(title, name));
            if added == 1 {
                builder.set_cover(&image);
            }
        }
        ctx.log.info(format!("{added} comic pages"));
        builder.finish(&meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

    #[test]
    fn test_natural_sort() {
        let mut names = vec!["p10.png", "p2.png", "P1.png", "cover.png"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["cover.png", "P1.png", "p2.png", "p10.png"]);
    }

    #[test]
    fn test_comic_decode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("issue.cbz");
        let mut zip = zip::ZipWriter::new(File::create(&input).unwrap());
        let opts = zip::write::SimpleFileOptions::default();
        for name in ["img/10.png", "img/2.png", "img/1.png", "__MACOSX/img/._1.png"] {
            zip.start_file(name, opts).unwrap();
            zip.write_all(PNG).unwrap();
        }
        zip.start_file("ComicInfo.xml", opts).unwrap();
        zip.write_all(
            b"<ComicInfo><Series>Space Cats</Series><Number>3</Number><Writer>A, B</Writer>\
<Penciller>B</Penciller><Year>2020</Year><Month>5</Month></ComicInfo>",
        )
        .unwrap();
        zip.finish().unwrap();

        let decoder = ComicDecoder::new();
        let (ctx, _tmp) = crate::transform::test_support::context(decoder.options(), &[]);
        let mut book = decoder.decode(&input, &ctx).unwrap();
        assert_eq!(
            book.spine_names(),
            vec!["pages/page0001.xhtml", "pages/page0002.xhtml", "pages/page0003.xhtml"]
        );
        assert_eq!(book.cover_name().as_deref(), Some("images/page0001.png"));
        let page = book.container.read_text("pages/page0001.xhtml").unwrap();
        assert!(page.contains(r#"src="../images/page0001.png""#));
        let meta = book.metadata();
        assert_eq!(meta.title, "Space Cats");
        assert_eq!(meta.series.as_deref(), Some("Space Cats"));
        assert_eq!(meta.series_index, Some(3.0));
        assert_eq!(meta.authors, vec!["A", "B"]);
        assert_eq!(book.toc().count(), 3);
        assert!(book.check_integrity().is_ok());
    }
}
