//! HUFF/CDIC decompression used by some MOBI text records.
//!
//! The HUFF record holds a 256 entry lookup table keyed by the top byte of
//! the code and a table of min/max codes per code length. CDIC records hold
//! the phrase dictionary; phrases may themselves be compressed.

use crate::error::{ParseError, Result};

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone)]
enum Phrase {
    Packed(Vec<u8>),
    Plain(Vec<u8>),
}

#[derive(Debug)]
pub struct HuffCdicReader {
    /// (code length, terminal, max code) by top byte
    lookup: Vec<(u32, bool, u32)>,
    mincode: [u32; 33],
    maxcode: [u32; 33],
    phrases: Vec<Phrase>,
}

fn corrupt(message: &str) -> crate::error::QuireError {
    ParseError::CorruptInput(format!("HUFF/CDIC: {message}")).into()
}

fn be_u32(data: &[u8], pos: usize) -> Option<u32> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

impl HuffCdicReader {
    pub fn new(huff: &[u8], cdics: &[&[u8]]) -> Result<Self> {
        let mut reader = Self {
            lookup: Vec::with_capacity(256),
            mincode: [0; 33],
            maxcode: [0; 33],
            phrases: Vec::new(),
        };
        reader.load_huff(huff)?;
        for cdic in cdics {
            reader.load_cdic(cdic)?;
        }
        Ok(reader)
    }

    fn load_huff(&mut self, huff: &[u8]) -> Result<()> {
        if huff.len() < 24 || &huff[..8] != b"HUFF\x00\x00\x00\x18" {
            return Err(corrupt("bad HUFF header"));
        }
        let off1 = be_u32(huff, 8).ok_or_else(|| corrupt("truncated header"))? as usize;
        let off2 = be_u32(huff, 12).ok_or_else(|| corrupt("truncated header"))? as usize;

        for i in 0..256 {
            let v = be_u32(huff, off1 + i * 4).ok_or_else(|| corrupt("lookup table truncated"))?;
            let codelen = v & 0x1F;
            let terminal = v & 0x80 != 0;
            let maxcode = if codelen > 0 {
                (((v >> 8) as u64 + 1) << (32 - codelen)).wrapping_sub(1) as u32
            } else {
                0
            };
            self.lookup.push((codelen, terminal, maxcode));
        }
        for len in 1..=32usize {
            let pos = off2 + (len - 1) * 8;
            let min = be_u32(huff, pos).ok_or_else(|| corrupt("code table truncated"))?;
            let max = be_u32(huff, pos + 4).ok_or_else(|| corrupt("code table truncated"))?;
            self.mincode[len] = ((min as u64) << (32 - len)) as u32;
            self.maxcode[len] = (((max as u64 + 1) << (32 - len)).wrapping_sub(1)) as u32;
        }
        Ok(())
    }

    fn load_cdic(&mut self, cdic: &[u8]) -> Result<()> {
        if cdic.len() < 16 || &cdic[..8] != b"CDIC\x00\x00\x00\x10" {
            return Err(corrupt("bad CDIC header"));
        }
        let total = be_u32(cdic, 8).unwrap_or(0) as usize;
        let bits = be_u32(cdic, 12).unwrap_or(0).min(31);
        let count = (1usize << bits).min(total.saturating_sub(self.phrases.len()));
        for i in 0..count {
            let at = 16 + i * 2;
            let off = cdic
                .get(at..at + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
                .ok_or_else(|| corrupt("offset table truncated"))?;
            let start = 16 + off;
            let header = cdic
                .get(start..start + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| corrupt("phrase truncated"))?;
            let len = (header & 0x7FFF) as usize;
            let end = (start + 2 + len).min(cdic.len());
            let bytes = cdic[start + 2..end].to_vec();
            self.phrases.push(if header & 0x8000 != 0 {
                Phrase::Plain(bytes)
            } else {
                Phrase::Packed(bytes)
            });
        }
        Ok(())
    }

    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 3);
        self.unpack(data, &mut out, 0)?;
        Ok(out)
    }

    fn unpack(&mut self, data: &[u8], out: &mut Vec<u8>, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(corrupt("phrase nesting too deep"));
        }
        let mut padded = data.to_vec();
        padded.extend_from_slice(&[0; 8]);
        let window = |pos: usize| {
            let b = &padded[pos..pos + 8];
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        };

        let mut remaining = data.len() as i64 * 8;
        let mut pos = 0;
        let mut x = window(pos);
        let mut n: i32 = 32;
        while remaining > 0 {
            if n <= 0 {
                pos += 4;
                x = window(pos);
                n += 32;
            }
            let code = (x >> n) as u32;
            let (mut codelen, terminal, mut maxcode) = self.lookup[(code >> 24) as usize];
            if !terminal {
                while codelen < 32 && code < self.mincode[codelen as usize] {
                    codelen += 1;
                }
                maxcode = self.maxcode[codelen as usize];
            }
            if codelen == 0 {
                return Err(corrupt("zero length code"));
            }
            n -= codelen as i32;
            remaining -= codelen as i64;
            if remaining < 0 {
                break;
            }
            let index = (maxcode.wrapping_sub(code) >> (32 - codelen)) as usize;
            let phrase = self
                .phrases
                .get(index)
                .cloned()
                .ok_or_else(|| corrupt("phrase index out of range"))?;
            match phrase {
                Phrase::Plain(bytes) => out.extend_from_slice(&bytes),
                Phrase::Packed(bytes) => {
                    let mut expanded = Vec::new();
                    self.unpack(&bytes, &mut expanded, depth + 1)?;
                    out.extend_from_slice(&expanded);
                    self.phrases[index] = Phrase::Plain(expanded);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A table where every 8-bit code is terminal and maps to its own phrase
    fn identity_tables() -> (Vec<u8>, Vec<u8>) {
        let mut huff = b"HUFF\x00\x00\x00\x18".to_vec();
        huff.extend_from_slice(&24u32.to_be_bytes());
        huff.extend_from_slice(&(24u32 + 1024).to_be_bytes());
        huff.extend_from_slice(&[0; 8]);
        for _ in 0..256u32 {
            // codelen 8, terminal, maxcode 255
            huff.extend_from_slice(&((255u32 << 8) | 0x80 | 8).to_be_bytes());
        }
        huff.extend_from_slice(&[0; 256]);

        let mut cdic = b"CDIC\x00\x00\x00\x10".to_vec();
        cdic.extend_from_slice(&256u32.to_be_bytes());
        cdic.extend_from_slice(&8u32.to_be_bytes());
        let table_len = 256 * 2;
        for i in 0..256u16 {
            cdic.extend_from_slice(&(table_len as u16 + i * 3).to_be_bytes());
        }
        for i in 0..256u16 {
            cdic.extend_from_slice(&0x8001u16.to_be_bytes());
            cdic.push((255 - i) as u8);
        }
        (huff, cdic)
    }

    #[test]
    fn test_terminal_codes_map_to_phrases() {
        let (huff, cdic) = identity_tables();
        let mut reader = HuffCdicReader::new(&huff, &[&cdic]).unwrap();
        // phrase index is 255 - byte, and phrase i holds 255 - i
        let out = reader.decompress(b"Hi").unwrap();
        assert_eq!(out, b"Hi");
    }

    #[test]
    fn test_bad_header() {
        assert!(HuffCdicReader::new(b"nope", &[]).is_err());
    }
}
