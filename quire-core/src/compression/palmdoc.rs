//! PalmDOC LZ77
//!
//! - `0x01..=0x08`: copy the next n bytes literally
//! - `0x00`, `0x09..=0x7F`: literal byte
//! - `0x80..=0xBF`: back-reference, with the next byte: distance is
//!   `(pair & 0x3FFF) >> 3`, length `(pair & 7) + 3`
//! - `0xC0..=0xFF`: a space followed by `byte ^ 0x80`

const MAX_DISTANCE: usize = 2047;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 10;

pub fn decompress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() * 2);
    let mut i = 0;
    while i < input.len() {
        let c = input[i];
        i += 1;
        match c {
            0x01..=0x08 => {
                let end = (i + c as usize).min(input.len());
                output.extend_from_slice(&input[i..end]);
                i = end;
            }
            0x00 | 0x09..=0x7F => output.push(c),
            0xC0..=0xFF => {
                output.push(b' ');
                output.push(c ^ 0x80);
            }
            _ => {
                let Some(&next) = input.get(i) else {
                    break;
                };
                i += 1;
                let pair = u16::from_be_bytes([c, next]);
                let distance = ((pair & 0x3FFF) >> 3) as usize;
                let length = (pair & 7) as usize + MIN_MATCH;
                if distance == 0 || distance > output.len() {
                    continue;
                }
                for _ in 0..length {
                    output.push(output[output.len() - distance]);
                }
            }
        }
    }
    output
}

/// Longest match for `data[pos..]` within the preceding window
fn longest_match(data: &[u8], pos: usize) -> Option<(usize, usize)> {
    let max_len = MAX_MATCH.min(data.len() - pos);
    if max_len < MIN_MATCH {
        return None;
    }
    let window_start = pos.saturating_sub(MAX_DISTANCE);
    let mut best: Option<(usize, usize)> = None;
    for start in (window_start..pos).rev() {
        let len = data[start..]
            .iter()
            .zip(&data[pos..pos + max_len])
            .take_while(|(a, b)| a == b)
            .count();
        if len >= MIN_MATCH && best.map_or(true, |(_, l)| len > l) {
            best = Some((pos - start, len));
            if len == max_len {
                break;
            }
        }
    }
    best
}

pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if let Some((distance, len)) = longest_match(input, i) {
            let pair = ((distance << 3) | (len - MIN_MATCH)) as u16 | 0x8000;
            output.extend_from_slice(&pair.to_be_bytes());
            i += len;
            continue;
        }
        let c = input[i];
        if c == b' ' {
            if let Some(&next) = input.get(i + 1) {
                if (0x40..=0x7F).contains(&next) {
                    output.push(next ^ 0x80);
                    i += 2;
                    continue;
                }
            }
        }
        if c == 0 || (0x09..0x80).contains(&c) {
            output.push(c);
            i += 1;
            continue;
        }
        let start = i;
        while i < input.len() && i - start < 8 {
            let b = input[i];
            if b == 0 || (0x09..0x80).contains(&b) {
                break;
            }
            i += 1;
        }
        output.push((i - start) as u8);
        output.extend_from_slice(&input[start..i]);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_literals_and_space_pairs() {
        assert_eq!(decompress(b"Hello"), b"Hello");
        assert_eq!(decompress(&[0xC1]), b" A");
        assert_eq!(decompress(&[0x02, 0xE9, 0xFF]), &[0xE9, 0xFF]);
    }

    #[test]
    fn test_back_reference() {
        // "abcabc": literal abc, then distance 3 length 3
        let pair: u16 = 0x8000 | (3 << 3);
        let mut input = b"abc".to_vec();
        input.extend_from_slice(&pair.to_be_bytes());
        assert_eq!(decompress(&input), b"abcabc");
    }

    #[test]
    fn test_compress_shrinks_repetitive_text() {
        let text = "The quick brown fox. ".repeat(40);
        let packed = compress(text.as_bytes());
        assert!(packed.len() < text.len() / 2);
        assert_eq!(decompress(&packed), text.as_bytes());
        let binary: Vec<u8> = (0..=255u8).collect();
        assert_eq!(decompress(&compress(&binary)), binary);
    }
}
