//! KF8 index tables (INDX/TAGX/CNCX) and reassembly of the HTML parts
//! from skeletons and fragments.

use std::collections::HashMap;

use tracing::warn;

use super::mobi::MobiSection;
use super::{be_u32, PdbFile};
use crate::error::{ParseError, Result};

/// Forward variable-width integer; the last byte has the high bit set
pub fn decint(data: &[u8]) -> (u32, usize) {
    let mut value = 0u32;
    let mut consumed = 0;
    for &b in data {
        consumed += 1;
        value = (value << 7) | (b & 0x7F) as u32;
        if b & 0x80 != 0 {
            break;
        }
    }
    (value, consumed)
}

/// Kindle base-32 numbers (`0-9A-V`) used in `kindle:` URLs
pub fn from_base32(s: &str) -> Option<u32> {
    s.chars().try_fold(0u32, |acc, c| {
        let d = c.to_digit(32)?;
        acc.checked_mul(32)?.checked_add(d)
    })
}

#[derive(Debug, Clone, Copy)]
struct TagDef {
    tag: u8,
    values_per_entry: u8,
    mask: u8,
    end_flag: u8,
}

/// One index entry: its name and the values of each present tag
#[derive(Debug, Clone, Default)]
pub struct IndexEntry {
    pub name: String,
    pub tags: HashMap<u8, Vec<u32>>,
}

impl IndexEntry {
    pub fn first(&self, tag: u8) -> Option<u32> {
        self.tags.get(&tag).and_then(|v| v.first()).copied()
    }

    pub fn pair(&self, tag: u8) -> Option<(u32, u32)> {
        let values = self.tags.get(&tag)?;
        Some((*values.first()?, values.get(1).copied().unwrap_or(0)))
    }
}

fn parse_tagx(data: &[u8]) -> Option<(usize, Vec<TagDef>)> {
    if !data.starts_with(b"TAGX") {
        return None;
    }
    let len = be_u32(data, 4)? as usize;
    let control_bytes = be_u32(data, 8)? as usize;
    let defs = data
        .get(12..len.min(data.len()))?
        .chunks_exact(4)
        .map(|c| TagDef {
            tag: c[0],
            values_per_entry: c[1],
            mask: c[2],
            end_flag: c[3],
        })
        .collect();
    Some((control_bytes, defs))
}

fn tag_map(control_byte_count: usize, defs: &[TagDef], data: &[u8]) -> HashMap<u8, Vec<u32>> {
    let mut out = HashMap::new();
    let Some(control) = data.get(..control_byte_count) else {
        return out;
    };
    let mut rest = &data[control_byte_count..];
    let mut cb = 0;
    // (tag, value count, byte count, values per entry)
    let mut pending: Vec<(u8, Option<u32>, Option<u32>, u8)> = Vec::new();
    for def in defs {
        if def.end_flag == 0x01 {
            cb += 1;
            continue;
        }
        let Some(&byte) = control.get(cb) else {
            break;
        };
        let value = byte & def.mask;
        if value == 0 {
            continue;
        }
        if value == def.mask {
            if def.mask.count_ones() > 1 {
                let (bytes, used) = decint(rest);
                rest = &rest[used.min(rest.len())..];
                pending.push((def.tag, None, Some(bytes), def.values_per_entry));
            } else {
                pending.push((def.tag, Some(1), None, def.values_per_entry));
            }
        } else {
            let count = (value >> def.mask.trailing_zeros()) as u32;
            pending.push((def.tag, Some(count), None, def.values_per_entry));
        }
    }
    for (tag, count, bytes, per_entry) in pending {
        let mut values = Vec::new();
        match (count, bytes) {
            (Some(count), _) => {
                for _ in 0..count * per_entry as u32 {
                    if rest.is_empty() {
                        break;
                    }
                    let (v, used) = decint(rest);
                    rest = &rest[used..];
                    values.push(v);
                }
            }
            (None, Some(bytes)) => {
                let mut total = 0;
                while total < bytes as usize && !rest.is_empty() {
                    let (v, used) = decint(rest);
                    rest = &rest[used..];
                    total += used;
                    values.push(v);
                }
            }
            (None, None) => {}
        }
        out.insert(tag, values);
    }
    out
}

/// Read an index whose header record is at absolute `index`. Returns the
/// entries and the CNCX string table keyed by offset.
pub fn read_index(pdb: &PdbFile, index: usize) -> Result<(Vec<IndexEntry>, HashMap<u32, String>)> {
    let header = pdb.record(index)?;
    if !header.starts_with(b"INDX") {
        return Err(ParseError::CorruptInput(format!("record {index} is not an INDX header")).into());
    }
    let header_len = be_u32(header, 4).unwrap_or(0) as usize;
    let data_records = be_u32(header, 24).unwrap_or(0) as usize;
    let cncx_count = be_u32(header, 52).unwrap_or(0) as usize;
    let tagx_at = if header.get(header_len..header_len + 4) == Some(b"TAGX") {
        header_len
    } else {
        header
            .windows(4)
            .position(|w| w == b"TAGX")
            .ok_or_else(|| ParseError::CorruptInput("INDX without TAGX".into()))?
    };
    let (control_bytes, defs) = parse_tagx(&header[tagx_at..])
        .ok_or_else(|| ParseError::CorruptInput("unreadable TAGX".into()))?;

    let mut entries = Vec::new();
    for i in 1..=data_records {
        let record = pdb.record(index + i)?;
        let idxt = be_u32(record, 20).unwrap_or(0) as usize;
        let count = be_u32(record, 24).unwrap_or(0) as usize;
        if record.get(idxt..idxt + 4) != Some(b"IDXT") {
            warn!(record = index + i, "index record without IDXT");
            continue;
        }
        let mut positions: Vec<usize> = (0..count)
            .filter_map(|j| super::be_u16(record, idxt + 4 + j * 2))
            .map(|p| p as usize)
            .collect();
        positions.push(idxt);
        for pair in positions.windows(2) {
            let Some(entry) = record.get(pair[0]..pair[1]) else {
                continue;
            };
            let Some((&len, rest)) = entry.split_first() else {
                continue;
            };
            let len = (len as usize).min(rest.len());
            let name = String::from_utf8_lossy(&rest[..len]).into_owned();
            let tags = tag_map(control_bytes, &defs, &rest[len..]);
            entries.push(IndexEntry { name, tags });
        }
    }

    let mut cncx = HashMap::new();
    for k in 0..cncx_count {
        let Some(record) = pdb.records.get(index + data_records + 1 + k) else {
            break;
        };
        let mut pos = 0;
        while pos < record.len() {
            let (len, used) = decint(&record[pos..]);
            let start = pos + used;
            let end = (start + len as usize).min(record.len());
            if len > 0 {
                let text = String::from_utf8_lossy(&record[start..end]).into_owned();
                cncx.insert((k as u32) * 0x10000 + pos as u32, text);
            }
            pos = end.max(pos + 1);
        }
    }
    Ok((entries, cncx))
}

#[derive(Debug, Clone)]
pub struct Skeleton {
    pub name: String,
    pub fragment_count: usize,
    pub start: usize,
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub insert_pos: usize,
    pub selector: Option<String>,
    pub file_number: usize,
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct NcxEntry {
    pub title: String,
    pub level: u32,
    pub parent: Option<usize>,
    pub pos_fid: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct GuideEntry {
    pub kind: String,
    pub title: String,
    pub pos_fid: Option<(u32, u32)>,
}

/// One reassembled HTML file with its span in the raw text flow
#[derive(Debug, Clone)]
pub struct Part {
    pub file_number: usize,
    pub start: usize,
    pub end: usize,
    pub content: Vec<u8>,
}

/// The KF8 structure tables of a section
#[derive(Debug, Clone, Default)]
pub struct Kf8Layout {
    pub skeletons: Vec<Skeleton>,
    pub fragments: Vec<Fragment>,
    pub ncx: Vec<NcxEntry>,
    pub guide: Vec<GuideEntry>,
    /// Flow boundaries in the text; flow 0 is the HTML
    pub flows: Vec<(usize, usize)>,
}

impl Kf8Layout {
    pub fn read(pdb: &PdbFile, section: &MobiSection) -> Result<Self> {
        let h = &section.header;
        let mut layout = Kf8Layout::default();

        if let Some(skel) = section.absolute(h.skel_index) {
            let (entries, _) = read_index(pdb, skel)?;
            layout.skeletons = entries
                .iter()
                .map(|e| {
                    let (start, length) = e.pair(6).unwrap_or((0, 0));
                    Skeleton {
                        name: e.name.clone(),
                        fragment_count: e.first(1).unwrap_or(0) as usize,
                        start: start as usize,
                        length: length as usize,
                    }
                })
                .collect();
        }
        if let Some(frag) = section.absolute(h.frag_index) {
            let (entries, cncx) = read_index(pdb, frag)?;
            layout.fragments = entries
                .iter()
                .map(|e| Fragment {
                    insert_pos: e.name.trim().parse().unwrap_or(0),
                    selector: e.first(2).and_then(|o| cncx.get(&o).cloned()),
                    file_number: e.first(3).unwrap_or(0) as usize,
                    length: e.pair(6).map(|(_, l)| l as usize).unwrap_or(0),
                })
                .collect();
        }
        if let Some(ncx) = section.absolute(h.ncx_index) {
            match read_index(pdb, ncx) {
                Ok((entries, cncx)) => {
                    layout.ncx = entries
                        .iter()
                        .map(|e| NcxEntry {
                            title: e
                                .first(3)
                                .and_then(|o| cncx.get(&o).cloned())
                                .unwrap_or_else(|| e.name.clone()),
                            level: e.first(4).unwrap_or(0),
                            parent: e.first(21).map(|p| p as usize),
                            pos_fid: e.pair(6),
                        })
                        .collect()
                }
                Err(e) => warn!(error = %e, "ignoring unreadable NCX index"),
            }
        }
        if let Some(guide) = section.absolute(h.guide_index) {
            if let Ok((entries, cncx)) = read_index(pdb, guide) {
                layout.guide = entries
                    .iter()
                    .map(|e| GuideEntry {
                        kind: e.name.clone(),
                        title: e
                            .first(1)
                            .and_then(|o| cncx.get(&o).cloned())
                            .unwrap_or_default(),
                        pos_fid: e.pair(6),
                    })
                    .collect();
            }
        }
        if let Some(fdst) = section.absolute(h.fdst_index) {
            let record = pdb.record(fdst)?;
            if record.starts_with(b"FDST") {
                let start = be_u32(record, 4).unwrap_or(12) as usize;
                let count = be_u32(record, 8).unwrap_or(0) as usize;
                layout.flows = (0..count)
                    .filter_map(|i| {
                        let at = start + i * 8;
                        Some((be_u32(record, at)? as usize, be_u32(record, at + 4)? as usize))
                    })
                    .collect();
            }
        }
        Ok(layout)
    }

    pub fn flow<'a>(&self, text: &'a [u8], n: usize) -> Option<&'a [u8]> {
        if self.flows.is_empty() {
            return (n == 0).then_some(text);
        }
        let (start, end) = *self.flows.get(n)?;
        text.get(start..end.min(text.len()))
    }

    /// Insert every fragment into its skeleton
    pub fn assemble(&self, text: &[u8]) -> Vec<Part> {
        let mut parts = Vec::with_capacity(self.skeletons.len());
        let mut frag_index = 0;
        for (n, skel) in self.skeletons.iter().enumerate() {
            let mut base = skel.start + skel.length;
            let Some(skeleton) = text.get(skel.start..base) else {
                warn!(skeleton = %skel.name, "skeleton outside the text flow");
                continue;
            };
            let mut content = skeleton.to_vec();
            for _ in 0..skel.fragment_count {
                let Some(frag) = self.fragments.get(frag_index) else {
                    break;
                };
                frag_index += 1;
                let piece = text.get(base..base + frag.length).unwrap_or_default();
                let at = frag.insert_pos.saturating_sub(skel.start).min(content.len());
                content.splice(at..at, piece.iter().copied());
                base += frag.length;
            }
            parts.push(Part {
                file_number: n,
                start: skel.start,
                end: base,
                content,
            });
        }
        parts
    }

    /// Part index and offset inside it of a `kindle:pos:fid` target
    pub fn locate(&self, parts: &[Part], fid: u32, offset: u32) -> Option<(usize, usize)> {
        let frag = self.fragments.get(fid as usize)?;
        let pos = frag.insert_pos + offset as usize;
        parts
            .iter()
            .position(|p| p.start <= pos && pos < p.end)
            .map(|i| (i, pos - parts[i].start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decint_and_base32() {
        assert_eq!(decint(&[0x81]), (1, 1));
        assert_eq!(decint(&[0x01, 0x80]), (128, 2));
        assert_eq!(from_base32("0001"), Some(1));
        assert_eq!(from_base32("00V"), Some(31));
        assert_eq!(from_base32("010"), Some(32));
        assert_eq!(from_base32("XYZ"), None);
    }

    #[test]
    fn test_tag_map() {
        let defs = [
            TagDef { tag: 1, values_per_entry: 1, mask: 0x01, end_flag: 0 },
            TagDef { tag: 6, values_per_entry: 2, mask: 0x02, end_flag: 0 },
            TagDef { tag: 0, values_per_entry: 0, mask: 0, end_flag: 1 },
        ];
        let data = [0x03, 0x82, 0x8A, 0x94];
        let map = tag_map(1, &defs, &data);
        assert_eq!(map[&1], vec![2]);
        assert_eq!(map[&6], vec![10, 20]);
    }

    #[test]
    fn test_assemble_inserts_fragments() {
        let text = b"<html><body></body></html><p>one</p><p>two</p>";
        let layout = Kf8Layout {
            skeletons: vec![Skeleton {
                name: "SKEL0".into(),
                fragment_count: 2,
                start: 0,
                length: 26,
            }],
            fragments: vec![
                Fragment { insert_pos: 12, selector: None, file_number: 0, length: 10 },
                Fragment { insert_pos: 22, selector: None, file_number: 0, length: 10 },
            ],
            ..Kf8Layout::default()
        };
        let parts = layout.assemble(text);
        assert_eq!(
            parts[0].content,
            b"<html><body><p>one</p><p>two</p></body></html>".to_vec()
        );
        assert_eq!(layout.locate(&parts, 1, 0), Some((0, 22)));
    }
}
