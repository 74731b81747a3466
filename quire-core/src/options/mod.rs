//! Typed conversion options.
//!
//! Codecs, transforms and the pipeline declare the options they read as
//! [`OptionDef`]s. Values are resolved once per conversion into an
//! [`OptionsMap`]: an explicit user value wins, then recommendations by
//! level (HIGH over MED over LOW), then the declared default.

pub mod profiles;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dom::XPath;
use crate::error::ConversionError;

pub use profiles::{InputProfile, OutputProfile};

/// Value type of an option
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionKind {
    Bool,
    Int,
    Float,
    Str,
    Choice(&'static [&'static str]),
    /// Comma separated list of strings
    List,
    /// An XPath expression, validated at resolution time
    XPath,
}

/// A resolved option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::None => Ok(()),
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Float(x) => write!(f, "{x}"),
            OptionValue::Str(s) => f.write_str(s),
            OptionValue::List(l) => f.write_str(&l.join(",")),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Str(v)
    }
}

/// Strength of a recommendation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Med,
    High,
}

/// Declaration of an option
#[derive(Debug, Clone)]
pub struct OptionDef {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: OptionValue,
    /// Level at which the default competes with recommendations
    pub level: Level,
    pub help: &'static str,
}

impl OptionDef {
    fn new(name: &'static str, kind: OptionKind, default: OptionValue, help: &'static str) -> Self {
        Self {
            name,
            kind,
            default,
            level: Level::Low,
            help,
        }
    }

    pub fn bool(name: &'static str, default: bool, help: &'static str) -> Self {
        Self::new(name, OptionKind::Bool, OptionValue::Bool(default), help)
    }

    pub fn int(name: &'static str, default: i64, help: &'static str) -> Self {
        Self::new(name, OptionKind::Int, OptionValue::Int(default), help)
    }

    pub fn float(name: &'static str, default: f64, help: &'static str) -> Self {
        Self::new(name, OptionKind::Float, OptionValue::Float(default), help)
    }

    pub fn string(name: &'static str, default: Option<&str>, help: &'static str) -> Self {
        let default = default.map_or(OptionValue::None, OptionValue::from);
        Self::new(name, OptionKind::Str, default, help)
    }

    pub fn choice(
        name: &'static str,
        choices: &'static [&'static str],
        default: &str,
        help: &'static str,
    ) -> Self {
        Self::new(name, OptionKind::Choice(choices), default.into(), help)
    }

    pub fn list(name: &'static str, help: &'static str) -> Self {
        Self::new(name, OptionKind::List, OptionValue::List(Vec::new()), help)
    }

    pub fn xpath(name: &'static str, default: Option<&str>, help: &'static str) -> Self {
        let default = default.map_or(OptionValue::None, OptionValue::from);
        Self::new(name, OptionKind::XPath, default, help)
    }

    pub fn at_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Parse a user-supplied string for this option
    pub fn parse_value(&self, raw: &str) -> Result<OptionValue, ConversionError> {
        let invalid = |message: String| ConversionError::InvalidOption {
            name: self.name.to_string(),
            message,
        };
        let raw = raw.trim();
        match self.kind {
            OptionKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "" | "true" | "yes" | "on" | "1" => Ok(OptionValue::Bool(true)),
                "false" | "no" | "off" | "0" => Ok(OptionValue::Bool(false)),
                other => Err(invalid(format!("'{other}' is not a boolean"))),
            },
            OptionKind::Int => raw
                .parse()
                .map(OptionValue::Int)
                .map_err(|_| invalid(format!("'{raw}' is not an integer"))),
            OptionKind::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(OptionValue::Float)
                .ok_or_else(|| invalid(format!("'{raw}' is not a number"))),
            OptionKind::Str => Ok(OptionValue::Str(raw.to_string())),
            OptionKind::Choice(choices) => {
                if choices.contains(&raw) {
                    Ok(OptionValue::Str(raw.to_string()))
                } else {
                    Err(invalid(format!(
                        "'{raw}' is not one of {}",
                        choices.join(", ")
                    )))
                }
            }
            OptionKind::List => Ok(OptionValue::List(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )),
            OptionKind::XPath => {
                if raw.is_empty() {
                    return Ok(OptionValue::None);
                }
                XPath::parse(raw).map_err(|e| invalid(e.to_string()))?;
                Ok(OptionValue::Str(raw.to_string()))
            }
        }
    }
}

/// A suggested value from a codec or profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub name: String,
    pub value: OptionValue,
    pub level: Level,
}

impl Recommendation {
    pub fn new(name: &str, value: impl Into<OptionValue>, level: Level) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            level,
        }
    }
}

/// `-` and `_` are interchangeable in option names
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches("--").replace('-', "_")
}

/// Resolved options of one conversion
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptionsMap {
    values: BTreeMap<String, OptionValue>,
}

impl OptionsMap {
    /// Resolve `user` values (raw strings) against the declarations and
    /// recommendations. Unknown names and unparsable values are usage errors.
    pub fn resolve(
        defs: &[OptionDef],
        recommendations: &[Recommendation],
        user: &[(String, String)],
    ) -> Result<Self, ConversionError> {
        let mut chosen: BTreeMap<String, (Level, OptionValue)> = defs
            .iter()
            .map(|d| (d.name.to_string(), (d.level, d.default.clone())))
            .collect();
        for rec in recommendations {
            let name = normalize_name(&rec.name);
            match chosen.get_mut(&name) {
                Some(slot) if rec.level >= slot.0 => *slot = (rec.level, rec.value.clone()),
                Some(_) => {}
                None => tracing::debug!(option = %name, "recommendation for undeclared option ignored"),
            }
        }
        let mut values: BTreeMap<String, OptionValue> =
            chosen.into_iter().map(|(k, (_, v))| (k, v)).collect();
        for (raw_name, raw_value) in user {
            let name = normalize_name(raw_name);
            let def = defs.iter().find(|d| d.name == name).ok_or_else(|| {
                ConversionError::InvalidOption {
                    name: name.clone(),
                    message: "unknown option".into(),
                }
            })?;
            values.insert(name, def.parse_value(raw_value)?);
        }
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<OptionValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn bool(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OptionValue::Bool(true)))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name)? {
            OptionValue::Int(i) => Some(*i),
            OptionValue::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        match self.values.get(name)? {
            OptionValue::Float(f) => Some(*f),
            OptionValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String value; empty strings count as unset
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name)? {
            OptionValue::Str(s) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> &[String] {
        match self.values.get(name) {
            Some(OptionValue::List(l)) => l,
            _ => &[],
        }
    }

    /// Compiled XPath value
    pub fn xpath(&self, name: &str) -> Result<Option<XPath>, ConversionError> {
        match self.str(name) {
            Some(expr) => XPath::parse(expr)
                .map(Some)
                .map_err(|e| ConversionError::InvalidOption {
                    name: name.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<OptionDef> {
        vec![
            OptionDef::float("base_font_size", 0.0, "Base font size in pt"),
            OptionDef::bool("linearize_tables", false, "Turn tables into blocks"),
            OptionDef::choice("epub_toc", &["both", "ncx", "nav"], "both", "TOC documents"),
            OptionDef::xpath("level1_toc", None, "Level 1 TOC entries"),
            OptionDef::list("disable_transforms", "Transforms to skip"),
        ]
    }

    #[test]
    fn test_precedence() {
        let recs = vec![
            Recommendation::new("base_font_size", 10.0, Level::Med),
            Recommendation::new("base_font_size", 16.0, Level::High),
            Recommendation::new("base_font_size", 8.0, Level::Low),
        ];
        let opts = OptionsMap::resolve(&defs(), &recs, &[]).unwrap();
        assert_eq!(opts.float("base_font_size"), Some(16.0));

        let user = vec![("base-font-size".to_string(), "14".to_string())];
        let opts = OptionsMap::resolve(&defs(), &recs, &user).unwrap();
        assert_eq!(opts.float("base_font_size"), Some(14.0));
    }

    #[test]
    fn test_user_values_are_validated() {
        let bad = |name: &str, value: &str| {
            OptionsMap::resolve(&defs(), &[], &[(name.to_string(), value.to_string())])
                .unwrap_err()
        };
        assert!(matches!(bad("nonsense", "1"), ConversionError::InvalidOption { .. }));
        assert!(matches!(bad("epub_toc", "all"), ConversionError::InvalidOption { .. }));
        assert!(matches!(bad("level1_toc", "//h:h1["), ConversionError::InvalidOption { .. }));

        let opts = OptionsMap::resolve(
            &defs(),
            &[],
            &[
                ("linearize-tables".into(), "".into()),
                ("disable_transforms".into(), "jacket, flatten_css".into()),
                ("level1_toc".into(), "//h:h1".into()),
            ],
        )
        .unwrap();
        assert!(opts.bool("linearize_tables"));
        assert_eq!(opts.list("disable_transforms"), ["jacket", "flatten_css"]);
        assert!(opts.xpath("level1_toc").unwrap().is_some());
        assert_eq!(opts.str("epub_toc"), Some("both"));
    }
}
