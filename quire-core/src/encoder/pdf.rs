//! PDF output.
//!
//! Books decoded from a PDF wrapper keep the original file, which is copied
//! through unchanged. Anything else is merged into one HTML page and handed
//! to a [`PdfRenderer`].

use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use super::merge::merge_spine;
use super::{output_failed, Encoder};
use crate::decoder::ORIGINAL_PDF;
use crate::error::{ConversionError, Result};
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::media::is_html;
use crate::types::Book;

const MERGED: &str = "index.html";
const DEFAULT_RENDERER: &str = "wkhtmltopdf";

/// Page geometry passed to a renderer
#[derive(Debug, Clone, PartialEq)]
pub struct PageSetup {
    pub paper_size: String,
    /// Margins in points
    pub margin: f64,
}

/// Turns a self-contained HTML page into a PDF
pub trait PdfRenderer: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, html: &Path, output: &Path, page: &PageSetup) -> Result<()>;
}

/// Renderer that runs an external HTML to PDF program with
/// wkhtmltopdf-style arguments
pub struct ExternalRenderer {
    program: String,
}

impl ExternalRenderer {
    /// The program named by `QUIRE_PDF_RENDERER`, else wkhtmltopdf
    pub fn from_env() -> Self {
        let program = std::env::var("QUIRE_PDF_RENDERER")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RENDERER.to_string());
        Self::new(program)
    }

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PdfRenderer for ExternalRenderer {
    fn name(&self) -> &str {
        &self.program
    }

    fn render(&self, html: &Path, output: &Path, page: &PageSetup) -> Result<()> {
        let margin = format!("{}pt", page.margin);
        let result = Command::new(&self.program)
            .arg("--quiet")
            .args(["--page-size", &page.paper_size])
            .args(["-T", &margin, "-B", &margin, "-L", &margin, "-R", &margin])
            .arg("--enable-local-file-access")
            .arg(html)
            .arg(output)
            .output();
        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConversionError::MissingCodec(format!(
                    "PDF renderer '{}' is not installed; set QUIRE_PDF_RENDERER",
                    self.program
                ))
                .into())
            }
            Err(e) => return Err(output_failed(format!("failed to run {}: {e}", self.program))),
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(output_failed(format!("{} failed: {}", self.program, stderr.trim())));
        }
        Ok(())
    }
}

pub struct PdfEncoder {
    renderer: Arc<dyn PdfRenderer>,
}

impl PdfEncoder {
    pub fn new() -> Self {
        Self::with_renderer(Arc::new(ExternalRenderer::from_env()))
    }

    pub fn with_renderer(renderer: Arc<dyn PdfRenderer>) -> Self {
        Self { renderer }
    }

    /// Write the merged page and every resource it may reference into `dir`
    fn stage_html(&self, book: &mut Book, dir: &Path) -> Result<std::path::PathBuf> {
        let merged = merge_spine(book, MERGED)?;
        let resources: Vec<String> = book
            .manifest()
            .iter()
            .filter(|item| !is_html(&item.media_type))
            .map(|item| item.href.clone())
            .collect();
        for name in resources {
            let path = dir.join(&name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, book.container.read(&name)?)?;
        }
        let html = dir.join(MERGED);
        std::fs::write(&html, merged.doc.to_xml())?;
        Ok(html)
    }
}

impl Default for PdfEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PdfEncoder {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn file_extension(&self) -> &'static str {
        "pdf"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn mime_type(&self) -> &'static str {
        "application/pdf"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::choice(
                "paper_size",
                &["a4", "a5", "letter", "legal"],
                "a4",
                "Paper size of the rendered PDF",
            ),
            OptionDef::float("pdf_page_margin", 72.0, "Page margin in points"),
        ]
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        if book.container.exists(ORIGINAL_PDF) {
            ctx.log.info("copying the embedded PDF through unchanged");
            std::fs::write(output, book.container.read(ORIGINAL_PDF)?)?;
            return Ok(());
        }
        let dir = ctx.temp_dir.join("pdf-render");
        std::fs::create_dir_all(&dir)?;
        let html = self.stage_html(book, &dir)?;
        ctx.checkpoint()?;
        let page = PageSetup {
            paper_size: ctx.options.str("paper_size").unwrap_or("a4").to_string(),
            margin: ctx.options.float("pdf_page_margin").unwrap_or(72.0),
        };
        ctx.log.info(format!("rendering with {}", self.renderer.name()));
        self.renderer.render(&html, output, &page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRenderer {
        seen: Mutex<Option<(String, PageSetup)>>,
    }

    impl PdfRenderer for FakeRenderer {
        fn name(&self) -> &str {
            "fake"
        }

        fn render(&self, html: &Path, output: &Path, page: &PageSetup) -> Result<()> {
            let text = std::fs::read_to_string(html)?;
            assert!(html.with_file_name("img/p.png").exists());
            *self.seen.lock().unwrap() = Some((text, page.clone()));
            std::fs::write(output, b"%PDF-1.4 fake")?;
            Ok(())
        }
    }

    #[test]
    fn test_renders_merged_html() {
        let mut book = book(&[
            ("a.xhtml", &xhtml(r#"<h1>One</h1><img src="img/p.png"/>"#)),
            ("b.xhtml", &xhtml("<h1>Two</h1>")),
        ]);
        book.container.add_name("img/p.png", b"\x89PNG\r\n\x1a\n", None, &[]).unwrap();
        let renderer = Arc::new(FakeRenderer::default());
        let encoder = PdfEncoder::with_renderer(renderer.clone());
        let (ctx, tmp) = context(encoder.options(), &[("paper_size", "letter")]);
        let out = tmp.path().join("out.pdf");
        encoder.encode(&mut book, &out, &ctx).unwrap();

        assert_eq!(std::fs::read(&out).unwrap(), b"%PDF-1.4 fake");
        let (html, page) = renderer.seen.lock().unwrap().take().unwrap();
        assert!(html.contains("One") && html.contains("Two"));
        assert_eq!(page.paper_size, "letter");
        assert_eq!(page.margin, 72.0);
    }

    #[test]
    fn test_original_pdf_passes_through() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>text</p>"))]);
        book.container
            .add_name(ORIGINAL_PDF, b"%PDF-1.7 original", Some("application/pdf"), &[])
            .unwrap();
        let encoder = PdfEncoder::with_renderer(Arc::new(ExternalRenderer::new("/nonexistent/renderer")));
        let (ctx, tmp) = context(encoder.options(), &[]);
        let out = tmp.path().join("out.pdf");
        encoder.encode(&mut book, &out, &ctx).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"%PDF-1.7 original");
    }

    #[test]
    fn test_missing_renderer() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>text</p>"))]);
        let encoder = PdfEncoder::with_renderer(Arc::new(ExternalRenderer::new("/nonexistent/renderer")));
        let (ctx, tmp) = context(encoder.options(), &[]);
        let err = encoder.encode(&mut book, &tmp.path().join("out.pdf"), &ctx).unwrap_err();
        assert_eq!(err.code(), "E_MISSING_CODEC");
    }
}
