//! Device profiles.
//!
//! Profiles are plain values. Output profiles turn into HIGH level
//! recommendations before user options are applied.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Level, Recommendation};
use crate::error::{ConversionError, Result};

/// Characteristics of the device a book was made for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub dpi: f64,
    /// Base font size in pt
    pub fbase: f64,
}

/// Characteristics of the target reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Usable screen area in pixels (width, height)
    pub screen_size: (u32, u32),
    pub dpi: f64,
    /// Base font size in pt
    pub fbase: f64,
    /// Image formats the reader can display, as extensions
    #[serde(default = "default_image_formats")]
    pub supported_image_formats: Vec<String>,
    /// Preferred size of split HTML files in KiB
    #[serde(default = "default_flow_size")]
    pub flow_size: u32,
    /// Characters to strip from text, as a regex character class
    #[serde(default)]
    pub remove_special_chars: Option<String>,
    #[serde(default = "default_true")]
    pub supports_tables: bool,
}

fn default_image_formats() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif"].iter().map(|s| s.to_string()).collect()
}

fn default_flow_size() -> u32 {
    260
}

fn default_true() -> bool {
    true
}

impl InputProfile {
    pub fn builtin() -> Vec<InputProfile> {
        let p = |name: &str, description: &str, dpi: f64, fbase: f64| InputProfile {
            name: name.to_string(),
            description: description.to_string(),
            dpi,
            fbase,
        };
        vec![
            p("default", "Generic input", 100.0, 12.0),
            p("kindle", "Amazon Kindle", 168.451, 16.0),
            p("kobo", "Kobo Reader", 168.451, 12.0),
            p("sony", "Sony Reader", 168.451, 12.0),
        ]
    }

    pub fn by_name(name: &str) -> Option<InputProfile> {
        Self::builtin().into_iter().find(|p| p.name == name)
    }
}

impl OutputProfile {
    pub fn builtin() -> Vec<OutputProfile> {
        let p = |name: &str, description: &str, screen: (u32, u32), dpi: f64, fbase: f64| {
            OutputProfile {
                name: name.to_string(),
                description: description.to_string(),
                screen_size: screen,
                dpi,
                fbase,
                supported_image_formats: default_image_formats(),
                flow_size: default_flow_size(),
                remove_special_chars: None,
                supports_tables: true,
            }
        };
        let mut kindle = p("kindle", "Amazon Kindle", (525, 640), 168.451, 16.0);
        kindle.remove_special_chars = Some("[\u{00AD}\u{200B}]".to_string());
        kindle.supports_tables = false;
        let mut kindle_pw = p("kindle_pw", "Kindle Paperwhite", (658, 940), 212.0, 12.0);
        kindle_pw.remove_special_chars = Some("[\u{00AD}\u{200B}]".to_string());
        let mut tablet = p("tablet", "Tablets and phones", (10000, 10000), 270.0, 12.0);
        tablet.flow_size = 0;
        tablet.supported_image_formats.push("svg".to_string());
        let mut sony = p("sony", "Sony Reader", (590, 775), 168.451, 12.0);
        sony.flow_size = 260;
        vec![
            p("default", "Generic output", (1600, 1200), 100.0, 12.0),
            kindle,
            kindle_pw,
            p("kobo", "Kobo Reader", (536, 710), 168.451, 12.0),
            tablet,
            p("generic_eink", "Generic e-ink reader", (590, 775), 168.0, 12.0),
            sony,
        ]
    }

    pub fn by_name(name: &str) -> Option<OutputProfile> {
        Self::builtin().into_iter().find(|p| p.name == name)
    }

    /// Load a profile from a JSON file
    pub fn from_file(path: &Path) -> Result<OutputProfile> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            ConversionError::InvalidOption {
                name: "output_profile_file".into(),
                message: format!("{}: {e}", path.display()),
            }
            .into()
        })
    }

    /// Option values this profile asks for
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let (w, h) = self.screen_size;
        let mut recs = vec![
            Recommendation::new("max_image_size", format!("{w}x{h}"), Level::High),
            Recommendation::new("base_font_size", self.fbase, Level::High),
            Recommendation::new("flow_size", self.flow_size as i64, Level::High),
        ];
        if !self.supports_tables {
            recs.push(Recommendation::new("linearize_tables", true, Level::High));
        }
        recs
    }

    pub fn supports_image(&self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        self.supported_image_formats.iter().any(|f| *f == ext)
            || (ext == "jpeg" && self.supported_image_formats.iter().any(|f| f == "jpg"))
    }
}

/// Parse a `WIDTHxHEIGHT` size
pub fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;

    #[test]
    fn test_builtin_names() {
        for name in ["default", "kindle", "kindle_pw", "kobo", "tablet", "generic_eink", "sony"] {
            assert!(OutputProfile::by_name(name).is_some(), "{name}");
        }
        assert!(OutputProfile::by_name("nope").is_none());
    }

    #[test]
    fn test_kindle_recommendations() {
        let recs = OutputProfile::by_name("kindle").unwrap().recommendations();
        let size = recs.iter().find(|r| r.name == "max_image_size").unwrap();
        assert_eq!(size.value, OptionValue::Str("525x640".into()));
        assert!(recs.iter().any(|r| r.name == "linearize_tables" && r.level == Level::High));
        assert_eq!(parse_size("525x640"), Some((525, 640)));
    }

    #[test]
    fn test_profile_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(
            &path,
            r#"{"name": "mine", "screen_size": [600, 800], "dpi": 150.0, "fbase": 11.0}"#,
        )
        .unwrap();
        let profile = OutputProfile::from_file(&path).unwrap();
        assert_eq!(profile.screen_size, (600, 800));
        assert!(profile.supports_tables);
        assert!(profile.supports_image("jpeg"));
    }
}
