//! Book metadata record (Dublin Core compliant with calibre-style extensions)

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Book metadata as a flat record
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// Book title
    pub title: String,

    /// Sort form of the title ("Hobbit, The")
    pub title_sort: Option<String>,

    /// Authors in display form
    pub authors: Vec<String>,

    /// Sort form of the authors as a single string
    pub author_sort: Option<String>,

    pub publisher: Option<String>,

    /// Publication date
    pub pubdate: Option<DateTime<Utc>>,

    /// When the record was created or last modified
    pub timestamp: Option<DateTime<Utc>>,

    /// Canonical BCP-47 tags, see [`canonicalize_language`]
    pub languages: Vec<String>,

    /// Subject/genre tags
    pub tags: Vec<String>,

    pub series: Option<String>,

    /// Position in series, present iff `series` is
    pub series_index: Option<f64>,

    /// Rating on a 0-10 scale
    pub rating: Option<u8>,

    /// Description as an HTML fragment
    pub comments: Option<String>,

    /// Identifiers keyed by lowercase scheme (isbn, uuid, doi, ...)
    pub identifiers: BTreeMap<String, String>,

    /// Raw cover image
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_data: Option<CoverData>,

    /// Custom columns keyed by lookup name
    pub user_metadata: BTreeMap<String, UserField>,
}

/// Cover image bytes with their format extension
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverData {
    /// Format extension (jpeg, png, ...)
    pub format: String,

    #[serde(with = "base64_serde")]
    pub data: Vec<u8>,
}

/// A custom metadata column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserField {
    pub datatype: String,
    pub value: serde_json::Value,
    pub display_name: String,
}

/// Fields of [`Metadata`] that an output format can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataField {
    Title,
    TitleSort,
    Authors,
    AuthorSort,
    Publisher,
    Pubdate,
    Timestamp,
    Languages,
    Tags,
    Series,
    Rating,
    Comments,
    Identifiers,
    Cover,
    UserMetadata,
}

impl MetadataField {
    pub const ALL: &'static [MetadataField] = &[
        MetadataField::Title,
        MetadataField::TitleSort,
        MetadataField::Authors,
        MetadataField::AuthorSort,
        MetadataField::Publisher,
        MetadataField::Pubdate,
        MetadataField::Timestamp,
        MetadataField::Languages,
        MetadataField::Tags,
        MetadataField::Series,
        MetadataField::Rating,
        MetadataField::Comments,
        MetadataField::Identifiers,
        MetadataField::Cover,
        MetadataField::UserMetadata,
    ];

    pub const TITLE_AUTHOR: &'static [MetadataField] =
        &[MetadataField::Title, MetadataField::Authors];
}

impl Metadata {
    /// Create new metadata with required fields
    pub fn new(title: impl Into<String>, language: impl Into<String>) -> Self {
        let mut meta = Self {
            title: title.into(),
            ..Self::default()
        };
        meta.set_languages([language.into()]);
        meta
    }

    /// Add an author
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.authors.push(author.into());
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn with_series(mut self, series: impl Into<String>, index: f64) -> Self {
        self.set_series(Some(series.into()), Some(index));
        self
    }

    pub fn with_identifier(mut self, scheme: &str, value: impl Into<String>) -> Self {
        self.set_identifier(scheme, value);
        self
    }

    /// Set the series, keeping `series_index` null exactly when `series` is.
    pub fn set_series(&mut self, series: Option<String>, index: Option<f64>) {
        match series.filter(|s| !s.trim().is_empty()) {
            Some(name) => {
                self.series = Some(name);
                self.series_index = Some(index.unwrap_or(1.0));
            }
            None => {
                self.series = None;
                self.series_index = None;
            }
        }
    }

    /// Replace the language list with canonicalized, de-duplicated tags.
    pub fn set_languages<I, S>(&mut self, langs: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.languages.clear();
        for lang in langs {
            if let Some(tag) = canonicalize_language(lang.as_ref()) {
                if !self.languages.contains(&tag) {
                    self.languages.push(tag);
                }
            }
        }
    }

    /// Insert an identifier under a lowercase scheme. Empty values are ignored.
    pub fn set_identifier(&mut self, scheme: &str, value: impl Into<String>) {
        let value = value.into();
        let value = value.trim();
        let scheme = scheme.trim().to_ascii_lowercase();
        if scheme.is_empty() || value.is_empty() {
            return;
        }
        self.identifiers.insert(scheme, value.to_string());
    }

    pub fn isbn(&self) -> Option<&str> {
        self.identifiers.get("isbn").map(String::as_str)
    }

    /// Primary language, if any
    pub fn language(&self) -> Option<&str> {
        self.languages.first().map(String::as_str)
    }

    /// Clamp the rating into 0..=10
    pub fn set_rating(&mut self, rating: Option<f64>) {
        self.rating = rating
            .filter(|r| r.is_finite())
            .map(|r| r.round().clamp(0.0, 10.0) as u8);
    }

    /// Authors joined the way they are displayed on a title page.
    pub fn authors_display(&self) -> String {
        self.authors.join(" & ")
    }

    /// Sort form of the first author: "First Middle Last" -> "Last, First Middle".
    pub fn computed_author_sort(&self) -> String {
        if let Some(sort) = &self.author_sort {
            return sort.clone();
        }
        self.authors
            .iter()
            .map(|a| author_to_sort(a))
            .collect::<Vec<_>>()
            .join(" & ")
    }

    /// Keep only the listed fields, clearing everything else.
    pub fn restrict_to(&mut self, fields: &[MetadataField]) {
        let keep = |f: MetadataField| fields.contains(&f);
        if !keep(MetadataField::Title) {
            self.title.clear();
        }
        if !keep(MetadataField::TitleSort) {
            self.title_sort = None;
        }
        if !keep(MetadataField::Authors) {
            self.authors.clear();
        }
        if !keep(MetadataField::AuthorSort) {
            self.author_sort = None;
        }
        if !keep(MetadataField::Publisher) {
            self.publisher = None;
        }
        if !keep(MetadataField::Pubdate) {
            self.pubdate = None;
        }
        if !keep(MetadataField::Timestamp) {
            self.timestamp = None;
        }
        if !keep(MetadataField::Languages) {
            self.languages.clear();
        }
        if !keep(MetadataField::Tags) {
            self.tags.clear();
        }
        if !keep(MetadataField::Series) {
            self.set_series(None, None);
        }
        if !keep(MetadataField::Rating) {
            self.rating = None;
        }
        if !keep(MetadataField::Comments) {
            self.comments = None;
        }
        if !keep(MetadataField::Identifiers) {
            // the package identifier always survives
            self.identifiers.retain(|scheme, _| scheme == "uuid");
        }
        if !keep(MetadataField::Cover) {
            self.cover_data = None;
        }
        if !keep(MetadataField::UserMetadata) {
            self.user_metadata.clear();
        }
    }
}

fn author_to_sort(author: &str) -> String {
    let parts: Vec<&str> = author.split_whitespace().collect();
    match parts.as_slice() {
        [] => String::new(),
        [single] => single.to_string(),
        [rest @ .., last] => format!("{}, {}", last, rest.join(" ")),
    }
}

/// Canonicalize a language tag to `lang[-REGION]`.
///
/// Accepts `_` as separator, three-letter codes for common languages and
/// arbitrary case. Returns `None` for empty or `und` tags.
pub fn canonicalize_language(raw: &str) -> Option<String> {
    let raw = raw.trim().replace('_', "-");
    let mut parts = raw.split('-').filter(|p| !p.is_empty());
    let lang = parts.next()?.to_ascii_lowercase();
    if lang == "und" || !lang.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let lang = match lang.as_str() {
        "eng" => "en",
        "fre" | "fra" => "fr",
        "ger" | "deu" => "de",
        "spa" => "es",
        "ita" => "it",
        "dut" | "nld" => "nl",
        "por" => "pt",
        "rus" => "ru",
        "jpn" => "ja",
        "chi" | "zho" => "zh",
        "pol" => "pl",
        "swe" => "sv",
        other => other,
    }
    .to_string();
    match parts.next() {
        Some(region) if region.len() == 2 && region.chars().all(|c| c.is_ascii_alphabetic()) => {
            Some(format!("{}-{}", lang, region.to_ascii_uppercase()))
        }
        Some(script) if script.len() == 4 => {
            let mut s = script.to_ascii_lowercase();
            s[..1].make_ascii_uppercase();
            Some(format!("{lang}-{s}"))
        }
        _ => Some(lang),
    }
}

/// Parse the date forms found in OPF and FB2 metadata.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01-01"), "%Y-%m-%d"))
        .ok()
        .or_else(|| {
            // "2011-03-04T00:00:00" without an offset
            raw.get(..10)
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        })?;
    let naive = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Base64 serialization for binary data
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
