//! Plain-text databases: PalmDoc (`TEXtREAd`) and zTXT (`zTXTGPlm`).

use std::io::Read;

use flate2::read::ZlibDecoder;
use flate2::{Compress, Compression, Crc, FlushCompress};

use super::{be_u16, be_u32, PdbFile, PdbKind};
use crate::compression::palmdoc;
use crate::error::{ConversionError, ParseError, Result};

pub const RECORD_SIZE: usize = 4096;
const ZTXT_RECORD_SIZE: usize = 8192;
const ZTXT_VERSION: u16 = 0x012C;
const ZTXT_RANDOM_ACCESS: u8 = 0x01;

/// Text bytes of a PalmDoc database, in the book's own encoding
pub fn read_palmdoc(pdb: &PdbFile) -> Result<Vec<u8>> {
    let header = pdb.record(0)?;
    let compression = be_u16(header, 0)
        .ok_or_else(|| ParseError::CorruptInput("PalmDoc header too short".into()))?;
    let count = be_u16(header, 8).unwrap_or(0) as usize;
    let count = count.min(pdb.records.len().saturating_sub(1));
    let mut text = Vec::new();
    for record in &pdb.records[1..=count] {
        match compression {
            1 => text.extend_from_slice(record),
            2 => text.extend(palmdoc::decompress(record)),
            other => {
                return Err(ParseError::UnsupportedFormat(format!(
                    "PalmDoc compression type {other}"
                ))
                .into())
            }
        }
    }
    Ok(text)
}

pub fn write_palmdoc(title: &str, text: &[u8], compress: bool) -> PdbFile {
    let mut pdb = PdbFile::new(title, PdbKind::PalmDoc);
    let chunks: Vec<&[u8]> = text.chunks(RECORD_SIZE).collect();
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(&(if compress { 2u16 } else { 1u16 }).to_be_bytes());
    header.extend_from_slice(&0u16.to_be_bytes());
    header.extend_from_slice(&(text.len() as u32).to_be_bytes());
    header.extend_from_slice(&(chunks.len() as u16).to_be_bytes());
    header.extend_from_slice(&(RECORD_SIZE as u16).to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes());
    pdb.records.push(header);
    for chunk in chunks {
        pdb.records.push(if compress {
            palmdoc::compress(chunk)
        } else {
            chunk.to_vec()
        });
    }
    pdb
}

pub fn read_ztxt(pdb: &PdbFile) -> Result<Vec<u8>> {
    let header = pdb.record(0)?;
    let version = be_u16(header, 0)
        .ok_or_else(|| ParseError::CorruptInput("zTXT header too short".into()))?;
    if version > ZTXT_VERSION {
        return Err(ParseError::UnsupportedFormat(format!("zTXT version {version:#x}")).into());
    }
    let count = be_u16(header, 2).unwrap_or(0) as usize;
    let size = be_u32(header, 4).unwrap_or(0) as usize;
    let count = count.min(pdb.records.len().saturating_sub(1));

    let compressed: Vec<u8> = pdb.records[1..=count].concat();
    let mut text = Vec::with_capacity(size);
    ZlibDecoder::new(compressed.as_slice())
        .read_to_end(&mut text)
        .map_err(|e| ParseError::CorruptInput(format!("zTXT stream: {e}")))?;
    if size != 0 && text.len() != size {
        return Err(ParseError::PartialInput(format!(
            "zTXT declares {size} bytes of text, found {}",
            text.len()
        ))
        .into());
    }
    Ok(text)
}

/// zTXT with every record full-flushed, so readers can seek
pub fn write_ztxt(title: &str, text: &[u8]) -> Result<PdbFile> {
    let mut z = Compress::new(Compression::default(), true);
    let mut records = Vec::new();
    for chunk in text.chunks(ZTXT_RECORD_SIZE) {
        let mut out = Vec::with_capacity(chunk.len() / 2 + 64);
        let mut input = chunk;
        loop {
            let before = z.total_in();
            z.compress_vec(input, &mut out, FlushCompress::Full)
                .map_err(|e| ConversionError::OutputFailed(format!("zlib: {e}")))?;
            input = &input[(z.total_in() - before) as usize..];
            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
            out.reserve(out.capacity().max(256));
        }
        records.push(out);
    }

    let mut crc = Crc::new();
    crc.update(text);
    let mut header = Vec::with_capacity(32);
    header.extend_from_slice(&ZTXT_VERSION.to_be_bytes());
    header.extend_from_slice(&(records.len() as u16).to_be_bytes());
    header.extend_from_slice(&(text.len() as u32).to_be_bytes());
    header.extend_from_slice(&(ZTXT_RECORD_SIZE as u16).to_be_bytes());
    header.extend_from_slice(&[0; 8]); // bookmarks and annotations
    header.push(ZTXT_RANDOM_ACCESS);
    header.push(0);
    header.extend_from_slice(&crc.sum().to_be_bytes());
    header.extend_from_slice(&[0; 4]);

    let mut pdb = PdbFile::new(title, PdbKind::Ztxt);
    pdb.records.push(header);
    pdb.records.extend(records);
    Ok(pdb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        "Call me Ishmael. Some years ago, never mind how long precisely.\n"
            .repeat(200)
            .into_bytes()
    }

    #[test]
    fn test_palmdoc_through_pdb_bytes() {
        let text = sample();
        let pdb = write_palmdoc("Moby Dick", &text, true);
        assert!(pdb.records.len() > 2);
        let parsed = PdbFile::parse(&pdb.to_bytes()).unwrap();
        assert_eq!(parsed.kind, PdbKind::PalmDoc);
        assert_eq!(read_palmdoc(&parsed).unwrap(), text);
    }

    #[test]
    fn test_ztxt() {
        let text = sample();
        let pdb = write_ztxt("Moby Dick", &text).unwrap();
        assert_eq!(pdb.records[0].len(), 28);
        assert_eq!(read_ztxt(&pdb).unwrap(), text);
    }
}
