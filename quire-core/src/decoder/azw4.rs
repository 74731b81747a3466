//! AZW4 (Kindle print replica) decoder.
//!
//! An AZW4 file is a MOBI database whose text records wrap a complete PDF.
//! The PDF is located by scanning for `%PDF` and the last `%%EOF`, read
//! through the PDF decoder and kept for PDF output.

use std::path::Path;
use std::sync::Arc;

use super::mobi::exth_metadata;
use super::pdf::{PdfBackend, PdfDecoder};
use super::{file_title, has_extension, Decoder};
use crate::error::{ParseError, Result};
use crate::pdb::mobi::MobiSection;
use crate::pdb::{self, PdbFile, PdbKind};
use crate::pipeline::StageContext;
use crate::types::Book;

pub struct Azw4Decoder {
    pdf: PdfDecoder,
}

impl Azw4Decoder {
    pub fn new() -> Self {
        Self { pdf: PdfDecoder::new() }
    }

    pub fn with_backend(backend: Arc<dyn PdfBackend>) -> Self {
        Self {
            pdf: PdfDecoder::with_backend(backend),
        }
    }
}

impl Default for Azw4Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// The embedded PDF, from `%PDF` through the last `%%EOF`
fn embedded_pdf(data: &[u8]) -> Option<&[u8]> {
    let start = data.windows(4).position(|w| w == b"%PDF")?;
    let end = data.windows(5).rposition(|w| w == b"%%EOF")? + 5;
    (end > start).then(|| &data[start..end])
}

impl Decoder for Azw4Decoder {
    fn name(&self) -> &'static str {
        "azw4"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["azw4"]
    }

    fn sniff(&self, path: &Path, head: &[u8]) -> bool {
        has_extension(path, &["azw4"]) && pdb::sniff(head) == Some(PdbKind::Mobi)
    }

    fn priority(&self) -> i32 {
        2
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let data = std::fs::read(input)?;
        let pdf = embedded_pdf(&data).ok_or_else(|| {
            ParseError::InvalidEbook(format!("{} holds no embedded PDF", input.display()))
        })?;
        ctx.log.debug(format!("embedded PDF is {} bytes", pdf.len()));

        let meta = PdbFile::parse(&data)
            .and_then(|db| MobiSection::parse(&db, 0))
            .map(|section| exth_metadata(&section, &file_title(input)));
        let title = meta.as_ref().ok().map(|m| m.title.clone());
        let mut book = self
            .pdf
            .decode_bytes(pdf, title.as_deref(), &file_title(input), true, ctx)?;
        match meta {
            Ok(meta) => book.set_metadata(&meta),
            Err(e) => ctx.log.warn(format!("no MOBI metadata: {e}")),
        }
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::pdf::ORIGINAL_PDF;
    use crate::pdb::mobi::{exth, Exth, Record0};
    use crate::transform::test_support::context;

    struct OneLine;

    impl PdfBackend for OneLine {
        fn name(&self) -> &'static str {
            "one-line"
        }

        fn extract_text(&self, _data: &[u8]) -> Result<String> {
            Ok("Page one text.".into())
        }
    }

    const PDF: &[u8] = b"%PDF-1.4\n1 0 obj<<>>endobj\n%%EOF\n";

    #[test]
    fn test_embedded_pdf() {
        let mut data = b"junk before ".to_vec();
        data.extend_from_slice(PDF);
        data.extend_from_slice(b"trailing");
        assert_eq!(embedded_pdf(&data).unwrap(), &PDF[..PDF.len() - 1]);
        assert!(embedded_pdf(b"no pdf here").is_none());
    }

    #[test]
    fn test_azw4_decode() {
        let mut ex = Exth::default();
        ex.push(exth::AUTHOR, "Print Author");
        let record0 = Record0 {
            title: "Replica".into(),
            text_length: PDF.len() as u32,
            text_record_count: 1,
            record_size: 4096,
            uid: 1,
            locale: 9,
            first_non_text: 2,
            first_resource: 2,
            flis_index: 2,
            fcis_index: 2,
            exth: ex,
        };
        let mut db = PdbFile::new("Replica", PdbKind::Mobi);
        db.records.push(record0.to_bytes());
        db.records.push(PDF.to_vec());

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("replica.azw4");
        std::fs::write(&input, db.to_bytes()).unwrap();
        let decoder = Azw4Decoder::with_backend(Arc::new(OneLine));
        let head = std::fs::read(&input).unwrap();
        assert!(decoder.sniff(&input, &head[..head.len().min(4096)]));

        let (ctx, _tmp) = context(Vec::new(), &[]);
        let book = decoder.decode(&input, &ctx).unwrap();
        let meta = book.metadata();
        assert_eq!(meta.title, "Replica");
        assert_eq!(meta.authors, vec!["Print Author"]);
        assert_eq!(book.container.read(ORIGINAL_PDF).unwrap(), &PDF[..PDF.len() - 1]);
    }
}
