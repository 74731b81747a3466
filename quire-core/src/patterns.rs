//! Regex patterns compiled once on first use.

use regex::Regex;
use std::sync::LazyLock;

// === Markup ===

/// `<!ENTITY name "value">` declarations in a DOCTYPE internal subset
pub static ENTITY_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<!ENTITY\s+([A-Za-z_][\w.-]*)\s+(?:"([^"]*)"|'([^']*)')\s*>"#)
        .expect("valid entity pattern")
});

/// `<name attrs/>` tags, used to expand self-closed non-void HTML elements
pub static SELF_CLOSING_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([A-Za-z][A-Za-z0-9:-]*)(\s[^<>]*?)?\s*/>").expect("valid self-closing pattern")
});

/// Encoding named in an XML declaration
pub static XML_ENCODING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*<\?xml[^>]*?encoding\s*=\s*["']([A-Za-z0-9._:-]+)["']"#)
        .expect("valid xml encoding pattern")
});

/// Charset named by an HTML `<meta>` tag
pub static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9._:-]+)"#)
        .expect("valid meta charset pattern")
});

/// `data:` URL: media type, parameters, payload
pub static DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^data:([^;,]*)((?:;[^;,]*)*),(.*)$").expect("valid data url pattern")
});

// === MOBI ===

/// Mobi6 `filepos` link targets
pub static FILEPOS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filepos\s*=\s*['"]?0*(\d+)['"]?"#).expect("valid filepos pattern")
});

/// Mobi6 image references by record index
pub static RECINDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:hi|lo)?recindex\s*=\s*['"]?(\d+)['"]?"#).expect("valid recindex pattern")
});

/// KF8 `kindle:embed:XXXX` resource references
pub static KINDLE_EMBED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"kindle:embed:([0-9A-Va-v]{4})(?:\?mime=[^'\x22)\s]*)?")
        .expect("valid kindle embed pattern")
});

/// KF8 `kindle:pos:fid:XXXX:off:XXXXXXXXXX` link targets
pub static KINDLE_POS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"kindle:pos:fid:([0-9A-Va-v]{4}):off:([0-9A-Va-v]{10})")
        .expect("valid kindle pos pattern")
});

/// KF8 `kindle:flow:XXXX?mime=type` references to secondary text flows
pub static KINDLE_FLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"kindle:flow:([0-9A-Va-v]{4})\?mime=([\w+./-]+)").expect("valid kindle flow pattern")
});

/// `id` attribute inside a start tag
pub static ID_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\sid\s*=\s*['"]([^'"]+)['"]"#).expect("valid id attribute pattern")
});

// === Text ===

/// Runs of two or more line breaks separating paragraphs
pub static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n\s*").expect("valid paragraph pattern"));

/// Characters unsafe in generated file names
pub static UNSAFE_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^A-Za-z0-9._-]+"#).expect("valid filename pattern"));

/// A trailing series index such as `[3]` or `#3.5` in a title
pub static SERIES_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*(?:\[|#)\s*(\d+(?:\.\d+)?)\s*\]?\s*$").expect("valid series pattern")
});
