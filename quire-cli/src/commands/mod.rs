//! CLI command implementations

mod batch;
mod convert;
mod formats;
mod info;
mod polish;
mod validate;

pub use batch::batch;
pub use convert::convert;
pub use formats::formats;
pub use info::info;
pub use polish::polish;
pub use validate::validate;

use std::fmt;

use quire_core::QuireError;

pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

/// The command line itself is wrong
#[derive(Debug)]
pub struct UsageError(pub String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

/// Process exit status for a failed command
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<UsageError>().is_some() {
        return EXIT_USAGE;
    }
    match err.downcast_ref::<QuireError>() {
        Some(e) if e.is_cancelled() => EXIT_CANCELLED,
        Some(e) if e.is_usage() => EXIT_USAGE,
        _ => EXIT_FAILURE,
    }
}

/// Turn `--name=value`, `--name value` and bare `--flag` arguments into
/// option pairs. A bare flag means `true`.
pub fn parse_options(args: &[String]) -> Result<Vec<(String, String)>, UsageError> {
    let mut out = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let Some(body) = arg.strip_prefix("--").filter(|b| !b.is_empty()) else {
            return Err(UsageError(format!("unexpected argument '{arg}', options are written --name=value")));
        };
        match body.split_once('=') {
            Some((name, value)) => out.push((name.to_string(), value.to_string())),
            None => {
                let value = match iter.peek() {
                    Some(next) if !next.starts_with("--") => iter.next().cloned(),
                    _ => None,
                };
                out.push((body.to_string(), value.unwrap_or_else(|| "true".to_string())));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::ConversionError;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_options() {
        let parsed = parse_options(&args(&[
            "--epub-version=2",
            "--max-line-length",
            "60",
            "--keep-links",
            "--margin=-1",
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("epub-version".to_string(), "2".to_string()),
                ("max-line-length".to_string(), "60".to_string()),
                ("keep-links".to_string(), "true".to_string()),
                ("margin".to_string(), "-1".to_string()),
            ]
        );
        assert!(parse_options(&args(&["stray"])).is_err());
        assert!(parse_options(&args(&["--"])).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::new(UsageError("bad".into()));
        assert_eq!(exit_code(&usage), EXIT_USAGE);

        let invalid: QuireError = ConversionError::InvalidOption {
            name: "x".into(),
            message: "unknown".into(),
        }
        .into();
        assert_eq!(exit_code(&anyhow::Error::new(invalid).context("converting")), EXIT_USAGE);

        let cancelled: QuireError = ConversionError::Cancelled.into();
        assert_eq!(exit_code(&anyhow::Error::new(cancelled)), EXIT_CANCELLED);

        let failed: QuireError = ConversionError::OutputFailed("disk full".into()).into();
        assert_eq!(exit_code(&anyhow::Error::new(failed)), EXIT_FAILURE);
    }
}
