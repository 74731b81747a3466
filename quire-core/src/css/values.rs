//! Length units, font sizes and selector specificity.

/// Scale factors of the absolute font-size keywords, relative to the base size
const FONT_SIZE_KEYWORDS: &[(&str, f64)] = &[
    ("xx-small", 0.6),
    ("x-small", 0.75),
    ("small", 0.89),
    ("medium", 1.0),
    ("large", 1.2),
    ("x-large", 1.5),
    ("xx-large", 2.0),
    ("xxx-large", 3.0),
];

/// Split `1.5em` into number and lowercase unit
pub fn parse_dimension(value: &str) -> Option<(f64, String)> {
    let value = value.trim();
    let split = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    let number: f64 = value[..split].parse().ok()?;
    Some((number, value[split..].trim().to_ascii_lowercase()))
}

/// Convert a length to points. `font_pt` is the element's font size (for
/// `em`, `ex` and `%`), `root_pt` the root font size (for `rem`).
pub fn length_to_pt(value: &str, font_pt: f64, root_pt: f64) -> Option<f64> {
    let (n, unit) = parse_dimension(value)?;
    Some(match unit.as_str() {
        "pt" => n,
        "px" => n * 0.75,
        "em" => n * font_pt,
        "rem" => n * root_pt,
        "ex" => n * font_pt * 0.5,
        "%" => n * font_pt / 100.0,
        "in" => n * 72.0,
        "cm" => n * 72.0 / 2.54,
        "mm" => n * 72.0 / 25.4,
        "pc" => n * 12.0,
        "" if n == 0.0 => 0.0,
        _ => return None,
    })
}

/// Resolve a `font-size` value to points against the parent size and the
/// profile base size
pub fn font_size_to_pt(value: &str, parent_pt: f64, base_pt: f64) -> Option<f64> {
    let value = value.trim().to_ascii_lowercase();
    if let Some(&(_, factor)) = FONT_SIZE_KEYWORDS.iter().find(|(k, _)| *k == value) {
        return Some(base_pt * factor);
    }
    match value.as_str() {
        "smaller" => Some(parent_pt / 1.2),
        "larger" => Some(parent_pt * 1.2),
        "inherit" => Some(parent_pt),
        "initial" => Some(base_pt),
        other => length_to_pt(other, parent_pt, base_pt),
    }
}

/// `12pt`, `10.5pt`: at most two decimals, trailing zeros trimmed
pub fn format_pt(pt: f64) -> String {
    let s = format!("{:.2}", pt);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    let s = if s == "-0" { "0" } else { s };
    format!("{s}pt")
}

/// Split a selector list on top-level commas
pub fn split_selector_list(selectors: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut current = String::new();
    for c in selectors.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '(' | '[') => {
                depth += 1;
                current.push(c);
            }
            (None, ')' | ']') => {
                depth -= 1;
                current.push(c);
            }
            (None, ',') if depth == 0 => {
                let s = current.trim();
                if !s.is_empty() {
                    out.push(s.to_string());
                }
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

/// Specificity `(ids, classes, types)` of a single complex selector
pub fn specificity(selector: &str) -> (u32, u32, u32) {
    let chars: Vec<char> = selector.chars().collect();
    let (mut a, mut b, mut c) = (0, 0, 0);
    let mut i = 0;
    let ident_end = |mut j: usize| {
        while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '-' || chars[j] == '_' || chars[j] == '\\') {
            j += 1;
        }
        j
    };
    while i < chars.len() {
        match chars[i] {
            '#' => {
                a += 1;
                i = ident_end(i + 1);
            }
            '.' => {
                b += 1;
                i = ident_end(i + 1);
            }
            '[' => {
                b += 1;
                while i < chars.len() && chars[i] != ']' {
                    i += 1;
                }
                i += 1;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                c += 1;
                i = ident_end(i + 2);
            }
            ':' => {
                let end = ident_end(i + 1);
                let name: String = chars[i + 1..end].iter().collect::<String>().to_ascii_lowercase();
                i = end;
                if matches!(name.as_str(), "before" | "after" | "first-line" | "first-letter") {
                    c += 1;
                    continue;
                }
                if chars.get(i) == Some(&'(') {
                    let start = i + 1;
                    let mut depth = 1;
                    i += 1;
                    while i < chars.len() && depth > 0 {
                        match chars[i] {
                            '(' => depth += 1,
                            ')' => depth -= 1,
                            _ => {}
                        }
                        i += 1;
                    }
                    if name == "not" || name == "is" {
                        let inner: String = chars[start..i.saturating_sub(1)].iter().collect();
                        let (ia, ib, ic) = specificity(&inner);
                        a += ia;
                        b += ib;
                        c += ic;
                        continue;
                    }
                }
                if name != "where" {
                    b += 1;
                }
            }
            ch if ch.is_alphabetic() || ch == '_' => {
                c += 1;
                i = ident_end(i);
            }
            _ => i += 1,
        }
    }
    (a, b, c)
}
