//! MOBI record 0 (PalmDOC + MOBI + EXTH headers), text records and the
//! auxiliary records of Mobipocket files.

use std::io::Read;

use flate2::read::ZlibDecoder;
use tracing::warn;

use super::{be_u16, be_u32, PdbFile};
use crate::compression::{palmdoc, HuffCdicReader};
use crate::error::{ParseError, Result};

pub const NULL_INDEX: u32 = 0xFFFF_FFFF;
pub const MOBI6_HEADER_LEN: u32 = 0xE8;
pub const EOF_RECORD: &[u8] = b"\xe9\x8e\r\n";

pub mod exth {
    pub const AUTHOR: u32 = 100;
    pub const PUBLISHER: u32 = 101;
    pub const DESCRIPTION: u32 = 103;
    pub const ISBN: u32 = 104;
    pub const SUBJECT: u32 = 105;
    pub const PUBDATE: u32 = 106;
    pub const CONTRIBUTOR: u32 = 108;
    pub const RIGHTS: u32 = 109;
    pub const SOURCE: u32 = 112;
    pub const ASIN: u32 = 113;
    pub const KF8_BOUNDARY: u32 = 121;
    pub const COVER_OFFSET: u32 = 201;
    pub const THUMB_OFFSET: u32 = 202;
    pub const CREATOR_SOFTWARE: u32 = 204;
    pub const CDE_TYPE: u32 = 501;
    pub const UPDATED_TITLE: u32 = 503;
    pub const LANGUAGE: u32 = 524;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    PalmDoc,
    Huffman,
}

/// The fields of record 0 the reader and writer care about
#[derive(Debug, Clone)]
pub struct MobiHeader {
    pub compression: Compression,
    pub text_length: u32,
    pub text_record_count: u16,
    pub encryption: u16,
    pub header_length: u32,
    pub mobi_type: u32,
    /// Windows code page; 65001 is UTF-8
    pub codepage: u32,
    pub version: u32,
    pub full_name: String,
    pub locale: u32,
    pub first_resource: u32,
    pub huff_first: u32,
    pub huff_count: u32,
    pub exth_flags: u32,
    pub fdst_index: u32,
    pub extra_flags: u16,
    pub ncx_index: u32,
    pub frag_index: u32,
    pub skel_index: u32,
    pub guide_index: u32,
}

impl MobiHeader {
    pub fn parse(record0: &[u8]) -> Result<Self> {
        if record0.len() < 16 {
            return Err(ParseError::CorruptInput("MOBI record 0 too short".into()).into());
        }
        let u32_at = |pos: usize, default: u32| be_u32(record0, pos).unwrap_or(default);
        let compression = match be_u16(record0, 0).unwrap_or(1) {
            1 => Compression::None,
            2 => Compression::PalmDoc,
            0x4448 => Compression::Huffman,
            other => {
                return Err(
                    ParseError::UnsupportedFormat(format!("MOBI compression {other:#x}")).into(),
                )
            }
        };
        let has_mobi = record0.get(16..20) == Some(b"MOBI");
        let header_length = if has_mobi { u32_at(20, 0) } else { 0 };
        let full_name = {
            let offset = u32_at(0x54, 0) as usize;
            let len = u32_at(0x58, 0) as usize;
            record0
                .get(offset..offset.saturating_add(len))
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default()
        };
        let version = if has_mobi { u32_at(0x24, 1) } else { 1 };
        let kf8 = version >= 8;
        Ok(Self {
            compression,
            text_length: u32_at(4, 0),
            text_record_count: be_u16(record0, 8).unwrap_or(0),
            encryption: be_u16(record0, 12).unwrap_or(0),
            header_length,
            mobi_type: u32_at(0x18, 2),
            codepage: if has_mobi { u32_at(0x1C, 1252) } else { 1252 },
            version,
            full_name,
            locale: u32_at(0x5C, 0),
            first_resource: if has_mobi { u32_at(0x6C, NULL_INDEX) } else { NULL_INDEX },
            huff_first: u32_at(0x70, 0),
            huff_count: u32_at(0x74, 0),
            exth_flags: if has_mobi { u32_at(0x80, 0) } else { 0 },
            fdst_index: if kf8 { u32_at(0xC0, NULL_INDEX) } else { NULL_INDEX },
            extra_flags: if header_length >= 0xE4 {
                be_u16(record0, 0xF2).unwrap_or(0)
            } else {
                0
            },
            ncx_index: if header_length >= 0xE8 { u32_at(0xF4, NULL_INDEX) } else { NULL_INDEX },
            frag_index: if kf8 { u32_at(0xF8, NULL_INDEX) } else { NULL_INDEX },
            skel_index: if kf8 { u32_at(0xFC, NULL_INDEX) } else { NULL_INDEX },
            guide_index: if kf8 { u32_at(0x104, NULL_INDEX) } else { NULL_INDEX },
        })
    }

    pub fn has_exth(&self) -> bool {
        self.exth_flags & 0x40 != 0
    }

    pub fn is_kf8(&self) -> bool {
        self.version >= 8 && self.skel_index != NULL_INDEX
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        let encoding = if self.codepage == 65001 {
            encoding_rs::UTF_8
        } else {
            encoding_rs::WINDOWS_1252
        };
        encoding.decode(bytes).0.into_owned()
    }

    pub fn language(&self) -> Option<&'static str> {
        language_for_locale(self.locale)
    }
}

const LOCALES: &[(u32, &str)] = &[
    (4, "zh"),
    (7, "de"),
    (8, "el"),
    (9, "en"),
    (10, "es"),
    (11, "fi"),
    (12, "fr"),
    (16, "it"),
    (17, "ja"),
    (18, "ko"),
    (19, "nl"),
    (20, "no"),
    (21, "pl"),
    (22, "pt"),
    (25, "ru"),
    (29, "sv"),
];

pub fn language_for_locale(locale: u32) -> Option<&'static str> {
    let id = locale & 0xFF;
    LOCALES.iter().find(|(n, _)| *n == id).map(|(_, l)| *l)
}

pub fn locale_for_language(lang: &str) -> u32 {
    let primary = lang.split(['-', '_']).next().unwrap_or("");
    LOCALES
        .iter()
        .find(|(_, l)| l.eq_ignore_ascii_case(primary))
        .map(|(n, _)| *n)
        .unwrap_or(0)
}

/// EXTH records in file order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exth {
    pub records: Vec<(u32, Vec<u8>)>,
}

impl Exth {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 || &data[..4] != b"EXTH" {
            return Err(ParseError::CorruptInput("bad EXTH header".into()).into());
        }
        let count = be_u32(data, 8).unwrap_or(0);
        let mut records = Vec::new();
        let mut pos = 12;
        for _ in 0..count {
            let (Some(kind), Some(len)) = (be_u32(data, pos), be_u32(data, pos + 4)) else {
                break;
            };
            let len = len as usize;
            if len < 8 || pos + len > data.len() {
                warn!(kind, "truncated EXTH record");
                break;
            }
            records.push((kind, data[pos + 8..pos + len].to_vec()));
            pos += len;
        }
        Ok(Self { records })
    }

    pub fn push(&mut self, kind: u32, value: impl Into<Vec<u8>>) {
        self.records.push((kind, value.into()));
    }

    pub fn get(&self, kind: u32) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v.as_slice())
    }

    pub fn all(&self, kind: u32) -> impl Iterator<Item = &[u8]> {
        self.records
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_u32(&self, kind: u32) -> Option<u32> {
        self.get(kind)
            .and_then(|v| be_u32(v, 0))
            .filter(|&v| v != NULL_INDEX)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (kind, value) in &self.records {
            body.extend_from_slice(&kind.to_be_bytes());
            body.extend_from_slice(&(8 + value.len() as u32).to_be_bytes());
            body.extend_from_slice(value);
        }
        let padding = (4 - body.len() % 4) % 4;
        let mut out = b"EXTH".to_vec();
        out.extend_from_slice(&(12 + body.len() as u32).to_be_bytes());
        out.extend_from_slice(&(self.records.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out.extend(std::iter::repeat(0).take(padding));
        out
    }
}

/// Size of one backward-encoded trailing entry ending at `data.len()`
fn trailing_entry_size(data: &[u8]) -> usize {
    let start = data.len().saturating_sub(4);
    let mut size = 0usize;
    for &b in &data[start..] {
        if b & 0x80 != 0 {
            size = 0;
        }
        size = (size << 7) | (b & 0x7F) as usize;
    }
    size
}

/// Remove the trailing entries that `extra_flags` declares
pub fn strip_trailing_entries(record: &[u8], extra_flags: u16) -> &[u8] {
    let mut end = record.len();
    let mut flags = extra_flags >> 1;
    while flags != 0 {
        if flags & 1 != 0 {
            let size = trailing_entry_size(&record[..end]);
            if size == 0 || size > end {
                break;
            }
            end -= size;
        }
        flags >>= 1;
    }
    if extra_flags & 1 != 0 && end > 0 {
        let size = (record[end - 1] & 3) as usize + 1;
        end = end.saturating_sub(size);
    }
    &record[..end]
}

/// One MOBI header and its records. Joint files have two sections: the
/// MOBI 6 one at record 0 and the KF8 one at the EXTH boundary.
#[derive(Debug, Clone)]
pub struct MobiSection {
    /// Index of this section's record 0
    pub start: usize,
    pub header: MobiHeader,
    pub exth: Exth,
}

impl MobiSection {
    pub fn parse(pdb: &PdbFile, start: usize) -> Result<Self> {
        let record0 = pdb.record(start)?;
        let header = MobiHeader::parse(record0)?;
        let exth = if header.has_exth() {
            let offset = 16 + header.header_length as usize;
            match record0.get(offset..) {
                Some(data) => Exth::parse(data).unwrap_or_else(|e| {
                    warn!(error = %e, "ignoring unreadable EXTH block");
                    Exth::default()
                }),
                None => Exth::default(),
            }
        } else {
            Exth::default()
        };
        if header.encryption != 0 {
            return Err(ParseError::UnsupportedFormat("DRM-protected MOBI".into()).into());
        }
        Ok(Self {
            start,
            header,
            exth,
        })
    }

    /// Absolute record index of a section-relative one
    pub fn absolute(&self, relative: u32) -> Option<usize> {
        (relative != NULL_INDEX).then(|| self.start + relative as usize)
    }

    /// Decompressed text of this section
    pub fn text(&self, pdb: &PdbFile) -> Result<Vec<u8>> {
        let count = self.header.text_record_count as usize;
        let mut huff = match self.header.compression {
            Compression::Huffman => {
                let first = self.start + self.header.huff_first as usize;
                let huff = pdb.record(first)?;
                let cdics: Vec<&[u8]> = (1..self.header.huff_count as usize)
                    .filter_map(|i| pdb.records.get(first + i).map(Vec::as_slice))
                    .collect();
                Some(HuffCdicReader::new(huff, &cdics)?)
            }
            _ => None,
        };
        let mut text = Vec::with_capacity(self.header.text_length as usize);
        for i in 1..=count {
            let Some(record) = pdb.records.get(self.start + i) else {
                warn!(record = self.start + i, "text record missing");
                break;
            };
            let data = strip_trailing_entries(record, self.header.extra_flags);
            match (&mut huff, self.header.compression) {
                (Some(reader), _) => text.extend(reader.decompress(data)?),
                (None, Compression::PalmDoc) => text.extend(palmdoc::decompress(data)),
                (None, _) => text.extend_from_slice(data),
            }
        }
        Ok(text)
    }

    /// Resource records addressed by 1-based `recindex`/`kindle:embed`
    /// numbers
    pub fn resources<'a>(&self, pdb: &'a PdbFile) -> Vec<(usize, &'a [u8])> {
        let Some(first) = self.absolute(self.header.first_resource) else {
            return Vec::new();
        };
        pdb.records
            .iter()
            .enumerate()
            .skip(first)
            .map(|(i, data)| (i - first + 1, data.as_slice()))
            .take_while(|(_, data)| !data.starts_with(b"BOUNDARY"))
            .collect()
    }
}

/// Records that carry structure, not resources
pub fn is_auxiliary_record(data: &[u8]) -> bool {
    const TAGS: &[&[u8]] = &[
        b"FLIS", b"FCIS", b"FDST", b"DATP", b"SRCS", b"CMET", b"AUDI", b"VIDE", b"RESC",
        b"INDX", b"BOUNDARY",
    ];
    data.is_empty() || data == EOF_RECORD || TAGS.iter().any(|t| data.starts_with(t))
}

/// Payload of a `FONT` record, de-obfuscated and inflated
pub fn decode_font(record: &[u8]) -> Option<Vec<u8>> {
    if !record.starts_with(b"FONT") {
        return None;
    }
    let size = be_u32(record, 4)? as usize;
    let flags = be_u32(record, 8)?;
    let offset = be_u32(record, 12)? as usize;
    let key_len = be_u32(record, 16)? as usize;
    let key_offset = be_u32(record, 20)? as usize;
    let mut data = record.get(offset..)?.to_vec();
    if flags & 2 != 0 && key_len > 0 {
        let key = record.get(key_offset..key_offset + key_len)?;
        for (i, b) in data.iter_mut().take(1040).enumerate() {
            *b ^= key[i % key_len];
        }
    }
    if flags & 1 != 0 {
        let mut inflated = Vec::with_capacity(size);
        ZlibDecoder::new(data.as_slice())
            .read_to_end(&mut inflated)
            .ok()?;
        data = inflated;
    }
    Some(data)
}

/// Split UTF-8 text into PalmDoc records of `record_size` bytes. Each
/// record carries the bytes completing its last character as a
/// multibyte trailing entry.
pub fn text_records(text: &[u8], record_size: usize) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < text.len() {
        let end = (pos + record_size).min(text.len());
        let mut record = palmdoc::compress(&text[pos..end]);
        let overlap: Vec<u8> = text[end..]
            .iter()
            .take(3)
            .take_while(|&&b| b & 0xC0 == 0x80)
            .copied()
            .collect();
        record.extend_from_slice(&overlap);
        record.push(overlap.len() as u8);
        records.push(record);
        pos = end;
    }
    records
}

pub fn flis_record() -> Vec<u8> {
    let mut flis = b"FLIS".to_vec();
    flis.extend_from_slice(&8u32.to_be_bytes());
    flis.extend_from_slice(&65u16.to_be_bytes());
    flis.extend_from_slice(&0u16.to_be_bytes());
    flis.extend_from_slice(&0u32.to_be_bytes());
    flis.extend_from_slice(&NULL_INDEX.to_be_bytes());
    flis.extend_from_slice(&1u16.to_be_bytes());
    flis.extend_from_slice(&3u16.to_be_bytes());
    flis.extend_from_slice(&3u32.to_be_bytes());
    flis.extend_from_slice(&1u32.to_be_bytes());
    flis.extend_from_slice(&NULL_INDEX.to_be_bytes());
    flis
}

pub fn fcis_record(text_length: u32) -> Vec<u8> {
    let mut fcis = b"FCIS".to_vec();
    for v in [0x14u32, 0x10, 0x01, 0] {
        fcis.extend_from_slice(&v.to_be_bytes());
    }
    fcis.extend_from_slice(&text_length.to_be_bytes());
    for v in [0u32, 0x20, 0x08] {
        fcis.extend_from_slice(&v.to_be_bytes());
    }
    fcis.extend_from_slice(&1u16.to_be_bytes());
    fcis.extend_from_slice(&1u16.to_be_bytes());
    fcis.extend_from_slice(&0u32.to_be_bytes());
    fcis
}

/// Layout values needed to write a MOBI 6 record 0
#[derive(Debug, Clone)]
pub struct Record0 {
    pub title: String,
    pub text_length: u32,
    pub text_record_count: u16,
    pub record_size: u16,
    pub uid: u32,
    pub locale: u32,
    /// First record after the text, or NULL_INDEX
    pub first_non_text: u32,
    pub first_resource: u32,
    pub flis_index: u32,
    pub fcis_index: u32,
    pub exth: Exth,
}

impl Record0 {
    pub fn to_bytes(&self) -> Vec<u8> {
        let exth = self.exth.to_bytes();
        let title = self.title.as_bytes();
        let title_offset = 16 + MOBI6_HEADER_LEN as usize + exth.len();

        let mut r = Vec::with_capacity(title_offset + title.len() + 8192);
        r.extend_from_slice(&2u16.to_be_bytes());
        r.extend_from_slice(&0u16.to_be_bytes());
        r.extend_from_slice(&self.text_length.to_be_bytes());
        r.extend_from_slice(&self.text_record_count.to_be_bytes());
        r.extend_from_slice(&self.record_size.to_be_bytes());
        r.extend_from_slice(&0u16.to_be_bytes()); // no encryption
        r.extend_from_slice(&0u16.to_be_bytes());

        let u32s = |r: &mut Vec<u8>, values: &[u32]| {
            for v in values {
                r.extend_from_slice(&v.to_be_bytes());
            }
        };
        r.extend_from_slice(b"MOBI");
        u32s(&mut r, &[MOBI6_HEADER_LEN, 2, 65001, self.uid, 6]);
        u32s(&mut r, &[NULL_INDEX; 10]); // meta indices 0x28..0x50
        u32s(&mut r, &[self.first_non_text]);
        u32s(&mut r, &[title_offset as u32, title.len() as u32]);
        u32s(&mut r, &[self.locale, 0, 0]);
        u32s(&mut r, &[6, self.first_resource]);
        u32s(&mut r, &[0, 0, 0, 0]); // huffman
        u32s(&mut r, &[0x50]); // EXTH present
        r.extend_from_slice(&[0; 32]);
        u32s(&mut r, &[NULL_INDEX]);
        u32s(&mut r, &[NULL_INDEX, 0, 0, 0]); // DRM
        r.extend_from_slice(&[0; 8]);
        r.extend_from_slice(&1u16.to_be_bytes()); // first content record
        r.extend_from_slice(&self.text_record_count.to_be_bytes()); // last content record
        u32s(&mut r, &[1]);
        u32s(&mut r, &[self.fcis_index, 1, self.flis_index, 1]);
        r.extend_from_slice(&[0; 8]);
        u32s(&mut r, &[NULL_INDEX, 0]); // SRCS
        r.extend_from_slice(&[0xFF; 8]);
        u32s(&mut r, &[1]); // extra data flags: multibyte
        u32s(&mut r, &[NULL_INDEX]); // NCX index
        debug_assert_eq!(r.len(), 16 + MOBI6_HEADER_LEN as usize);

        r.extend_from_slice(&exth);
        r.extend_from_slice(title);
        r.extend_from_slice(&[0, 0]);
        while r.len() % 4 != 0 {
            r.push(0);
        }
        r.extend_from_slice(&[0; 8192]);
        r
    }
}
