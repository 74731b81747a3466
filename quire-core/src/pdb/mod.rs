//! Palm database files: the record container shared by MOBI, PalmDoc,
//! zTXT and the other Palm-era formats.

pub mod index;
pub mod mobi;
pub mod text;

use crate::error::{ParseError, Result};

const HEADER_LEN: usize = 78;

/// What a database holds, from its 8-byte type/creator identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdbKind {
    Mobi,
    PalmDoc,
    Ztxt,
    EReader,
    Plucker,
    Haodoo,
    Unknown(String),
}

impl PdbKind {
    pub fn from_ident(ident: &[u8]) -> Self {
        match ident {
            b"BOOKMOBI" => PdbKind::Mobi,
            b"TEXtREAd" => PdbKind::PalmDoc,
            b"zTXTGPlm" => PdbKind::Ztxt,
            b"PNRdPPrs" | b"PDctPPrs" => PdbKind::EReader,
            b"DataPlkr" => PdbKind::Plucker,
            b"BOOKMTIT" | b"BOOKMTIU" => PdbKind::Haodoo,
            other if other.eq_ignore_ascii_case(b"TEXtREAd") => PdbKind::PalmDoc,
            other => PdbKind::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn ident(&self) -> &[u8] {
        match self {
            PdbKind::Mobi => b"BOOKMOBI",
            PdbKind::PalmDoc => b"TEXtREAd",
            PdbKind::Ztxt => b"zTXTGPlm",
            PdbKind::EReader => b"PNRdPPrs",
            PdbKind::Plucker => b"DataPlkr",
            PdbKind::Haodoo => b"BOOKMTIU",
            PdbKind::Unknown(s) => s.as_bytes(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PdbKind::Mobi => "mobi",
            PdbKind::PalmDoc => "palmdoc",
            PdbKind::Ztxt => "ztxt",
            PdbKind::EReader => "ereader",
            PdbKind::Plucker => "plucker",
            PdbKind::Haodoo => "haodoo",
            PdbKind::Unknown(_) => "unknown",
        }
    }
}

/// Identifier of a PDB file without reading the rest of it
pub fn sniff(data: &[u8]) -> Option<PdbKind> {
    let ident = data.get(60..68)?;
    if ident.iter().all(|b| b.is_ascii_graphic()) {
        Some(PdbKind::from_ident(ident))
    } else {
        None
    }
}

/// A parsed database: its name, type and raw records
#[derive(Debug, Clone)]
pub struct PdbFile {
    pub name: String,
    pub kind: PdbKind,
    pub records: Vec<Vec<u8>>,
}

pub(crate) fn be_u16(data: &[u8], pos: usize) -> Option<u16> {
    data.get(pos..pos + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn be_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

impl PdbFile {
    pub fn new(name: impl Into<String>, kind: PdbKind) -> Self {
        Self {
            name: name.into(),
            kind,
            records: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::CorruptInput("PDB header too short".into()).into());
        }
        let name_end = data[..32].iter().position(|&b| b == 0).unwrap_or(32);
        let name = String::from_utf8_lossy(&data[..name_end]).into_owned();
        let kind = PdbKind::from_ident(&data[60..68]);
        let count = be_u16(data, 76).unwrap_or(0) as usize;
        if data.len() < HEADER_LEN + count * 8 {
            return Err(ParseError::CorruptInput("PDB record list truncated".into()).into());
        }

        let offsets: Vec<usize> = (0..count)
            .filter_map(|i| be_u32(data, HEADER_LEN + i * 8))
            .map(|o| o as usize)
            .collect();
        let mut records = Vec::with_capacity(count);
        for (i, &start) in offsets.iter().enumerate() {
            let end = offsets.get(i + 1).copied().unwrap_or(data.len());
            if start > end || end > data.len() {
                return Err(ParseError::CorruptInput(format!(
                    "PDB record {i} has invalid bounds {start}..{end}"
                ))
                .into());
            }
            records.push(data[start..end].to_vec());
        }
        Ok(Self {
            name,
            kind,
            records,
        })
    }

    pub fn record(&self, index: usize) -> Result<&[u8]> {
        self.records.get(index).map(Vec::as_slice).ok_or_else(|| {
            ParseError::CorruptInput(format!("record {index} is missing")).into()
        })
    }

    /// Serialize with record offsets and unique ids filled in
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut name = [0u8; 32];
        let safe: Vec<u8> = self
            .name
            .bytes()
            .map(|b| if b.is_ascii_alphanumeric() || b == b'-' { b } else { b'_' })
            .take(31)
            .collect();
        name[..safe.len()].copy_from_slice(&safe);
        out.extend_from_slice(&name);

        let now = chrono::Utc::now().timestamp() as u32;
        out.extend_from_slice(&0u16.to_be_bytes()); // attributes
        out.extend_from_slice(&0u16.to_be_bytes()); // version
        out.extend_from_slice(&now.to_be_bytes()); // created
        out.extend_from_slice(&now.to_be_bytes()); // modified
        out.extend_from_slice(&[0; 16]); // backup, modnum, appinfo, sortinfo
        let mut ident = [b' '; 8];
        let raw = self.kind.ident();
        ident[..raw.len().min(8)].copy_from_slice(&raw[..raw.len().min(8)]);
        out.extend_from_slice(&ident);
        let seed = (2 * self.records.len()).saturating_sub(1) as u32;
        out.extend_from_slice(&seed.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&(self.records.len() as u16).to_be_bytes());

        let mut offset = HEADER_LEN + self.records.len() * 8 + 2;
        for (i, record) in self.records.iter().enumerate() {
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            let uid = ((2 * i) as u32).to_be_bytes();
            out.extend_from_slice(&[0, uid[1], uid[2], uid[3]]);
            offset += record.len();
        }
        out.extend_from_slice(&[0, 0]);
        for record in &self.records {
            out.extend_from_slice(record);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_parse() {
        let mut pdb = PdbFile::new("My Book: Part 1", PdbKind::PalmDoc);
        pdb.records = vec![b"zero".to_vec(), b"one".to_vec(), Vec::new(), b"three".to_vec()];
        let bytes = pdb.to_bytes();
        assert_eq!(sniff(&bytes), Some(PdbKind::PalmDoc));

        let parsed = PdbFile::parse(&bytes).unwrap();
        assert_eq!(parsed.name, "My_Book__Part_1");
        assert_eq!(parsed.records, pdb.records);
        assert!(parsed.record(9).is_err());
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(PdbKind::from_ident(b"BOOKMOBI"), PdbKind::Mobi);
        assert_eq!(PdbKind::from_ident(b"PNRdPPrs"), PdbKind::EReader);
        assert_eq!(
            PdbKind::from_ident(b"XXXXYYYY"),
            PdbKind::Unknown("XXXXYYYY".into())
        );
        assert!(PdbFile::parse(b"short").is_err());
    }
}
