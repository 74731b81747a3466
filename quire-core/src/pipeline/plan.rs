//! Choosing which transforms run and in what order.

use std::collections::BTreeSet;

use crate::error::{ConversionError, Result};
use crate::options::OptionsMap;

/// Transforms that run unless disabled
pub const DEFAULT_CHAIN: &[&str] = &[
    "normalize_guide",
    "clean_html",
    "data_urls",
    "detect_cover",
    "detect_structure",
    "generate_toc",
    "flatten_css",
    "normalize_images",
    "embed_metadata",
];

/// Boolean options that switch a transform on
const OPTION_TRIGGERS: &[(&str, &str)] = &[
    ("insert_jacket", "jacket"),
    ("remove_fake_margins", "remove_fake_margins"),
    ("linearize_tables", "linearize_tables"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub name: &'static str,
    /// Requested by the user rather than by the defaults or a codec; a name
    /// conflict in such a stage is logged and the stage skipped
    pub optional: bool,
}

/// Build the chain: defaults, codec requirements, option triggers and
/// `enable_transforms`, minus `disable_transforms`, in registry order.
pub fn plan(
    registered: &[&'static str],
    required: &[&str],
    options: &OptionsMap,
) -> Result<Vec<PlannedStage>> {
    let check = |name: &str, option: &str| -> Result<()> {
        if registered.contains(&name) {
            Ok(())
        } else {
            Err(ConversionError::InvalidOption {
                name: option.to_string(),
                message: format!("unknown transform '{name}'"),
            }
            .into())
        }
    };

    let mut wanted: BTreeSet<&str> = DEFAULT_CHAIN.iter().copied().collect();
    let mut mandatory: BTreeSet<&str> = BTreeSet::new();
    for name in required {
        check(name, "required_transforms")?;
        wanted.insert(name);
        mandatory.insert(name);
    }
    let mut optional: BTreeSet<&str> = BTreeSet::new();
    for (option, name) in OPTION_TRIGGERS {
        if options.bool(option) {
            wanted.insert(name);
            optional.insert(name);
        }
    }
    for name in options.list("enable_transforms") {
        check(name, "enable_transforms")?;
        wanted.insert(name);
        optional.insert(name);
    }
    for name in options.list("disable_transforms") {
        check(name, "disable_transforms")?;
        wanted.remove(name.as_str());
    }

    Ok(registered
        .iter()
        .filter(|name| wanted.contains(**name))
        .map(|&name| PlannedStage {
            name,
            optional: optional.contains(name)
                && !mandatory.contains(name)
                && !DEFAULT_CHAIN.contains(&name),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionValue;
    use crate::transform::CANONICAL_ORDER;

    fn names(stages: &[PlannedStage]) -> Vec<&str> {
        stages.iter().map(|s| s.name).collect()
    }

    #[test]
    fn test_default_chain_in_canonical_order() {
        let stages = plan(CANONICAL_ORDER, &[], &OptionsMap::default()).unwrap();
        assert_eq!(names(&stages), DEFAULT_CHAIN);
        assert!(stages.iter().all(|s| !s.optional));
    }

    #[test]
    fn test_required_enabled_and_disabled() {
        let mut options = OptionsMap::default();
        options.set("insert_jacket", true);
        options.set(
            "disable_transforms",
            OptionValue::List(vec!["flatten_css".into()]),
        );
        let stages = plan(CANONICAL_ORDER, &["upgrade_opf"], &options).unwrap();
        let got = names(&stages);
        assert_eq!(got[1], "upgrade_opf");
        assert!(got.contains(&"jacket"));
        assert!(!got.contains(&"flatten_css"));
        let jacket = stages.iter().find(|s| s.name == "jacket").unwrap();
        assert!(jacket.optional);
    }

    #[test]
    fn test_unknown_transform_is_usage_error() {
        let mut options = OptionsMap::default();
        options.set("enable_transforms", OptionValue::List(vec!["nope".into()]));
        let err = plan(CANONICAL_ORDER, &[], &options).unwrap_err();
        assert!(err.is_usage());
    }
}
