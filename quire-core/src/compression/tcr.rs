//! TCR: a 256 entry phrase dictionary followed by one code byte per phrase.

use std::collections::HashMap;

use crate::error::{ParseError, Result};

pub const TCR_HEADER: &[u8] = b"!!8-Bit!!";

const MAX_PHRASE: usize = 255;

pub fn decompress(input: &[u8]) -> Result<Vec<u8>> {
    let body = input
        .strip_prefix(TCR_HEADER)
        .ok_or_else(|| ParseError::UnsupportedFormat("missing TCR header".into()))?;
    let mut phrases: Vec<&[u8]> = Vec::with_capacity(256);
    let mut pos = 0;
    for _ in 0..256 {
        let len = *body
            .get(pos)
            .ok_or_else(|| ParseError::CorruptInput("TCR dictionary truncated".into()))?
            as usize;
        let phrase = body
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| ParseError::CorruptInput("TCR dictionary truncated".into()))?;
        phrases.push(phrase);
        pos += 1 + len;
    }
    let mut out = Vec::with_capacity(body.len() * 3);
    for &code in &body[pos..] {
        out.extend_from_slice(phrases[code as usize]);
    }
    Ok(out)
}

/// Greedy pair merging: codes are allocated to the most frequent adjacent
/// pair until the dictionary is full or no pair repeats.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut phrases: Vec<Vec<u8>> = vec![Vec::new(); 256];
    let mut used = [false; 256];
    for &b in input {
        if !used[b as usize] {
            used[b as usize] = true;
            phrases[b as usize] = vec![b];
        }
    }
    let mut codes: Vec<u8> = input.to_vec();
    let mut free: Vec<u8> = (0..=255u8).filter(|&c| !used[c as usize]).collect();
    free.reverse();

    while let Some(&code) = free.last() {
        let mut counts: HashMap<(u8, u8), usize> = HashMap::new();
        for pair in codes.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if phrases[a as usize].len() + phrases[b as usize].len() <= MAX_PHRASE {
                *counts.entry((a, b)).or_default() += 1;
            }
        }
        let best = counts
            .into_iter()
            .filter(|&(_, n)| n > 1)
            .max_by(|x, y| x.1.cmp(&y.1).then_with(|| y.0.cmp(&x.0)));
        let Some(((a, b), _)) = best else {
            break;
        };
        free.pop();
        let mut merged = phrases[a as usize].clone();
        merged.extend_from_slice(&phrases[b as usize]);
        phrases[code as usize] = merged;

        let mut next = Vec::with_capacity(codes.len());
        let mut i = 0;
        while i < codes.len() {
            if i + 1 < codes.len() && codes[i] == a && codes[i + 1] == b {
                next.push(code);
                i += 2;
            } else {
                next.push(codes[i]);
                i += 1;
            }
        }
        codes = next;
    }

    let mut out = TCR_HEADER.to_vec();
    for phrase in &phrases {
        out.push(phrase.len() as u8);
        out.extend_from_slice(phrase);
    }
    out.extend_from_slice(&codes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let text = "It was the best of times, it was the worst of times.\n".repeat(20);
        let packed = compress(text.as_bytes());
        assert!(packed.starts_with(TCR_HEADER));
        assert!(packed.len() < text.len());
        assert_eq!(decompress(&packed).unwrap(), text.as_bytes());
    }

    #[test]
    fn test_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).chain(0..=255u8).collect();
        assert_eq!(decompress(&compress(&data)).unwrap(), data);
    }

    #[test]
    fn test_rejects_missing_header() {
        let err = decompress(b"plain text").unwrap_err();
        assert_eq!(err.code(), "E_UNSUPPORTED_FORMAT");
    }
}
