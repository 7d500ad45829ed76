use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced to callers of the engine.
///
/// Anything that depends on the token being compiled (unknown utilities,
/// malformed brackets, theme misses) resolves to a non-match instead. The
/// variants here cover I/O, configuration input, and the opt-in strict modes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid preset: {0}")]
    InvalidPreset(String),

    #[error("theme key `{key}` referenced by `{token}` is not defined")]
    MissingThemeKey { token: String, key: String },

    #[error("extractor `{name}` failed: {message}")]
    Extractor { name: String, message: String },

    #[error("extractor `{name}` timed out after {millis}ms")]
    ExtractorTimeout { name: String, millis: u64 },

    #[error("{0}")]
    Scan(String),

    #[error("{0}")]
    Watch(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn pattern(pattern: &str, source: regex::Error) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn renders_missing_theme_key() {
        let err = Error::MissingThemeKey {
            token: "p-99".to_string(),
            key: "spacing.99".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "theme key `spacing.99` referenced by `p-99` is not defined"
        );
    }

    #[test]
    fn wraps_regex_errors() {
        let source = regex::Regex::new("(").unwrap_err();
        let err = Error::pattern("(", source);
        assert!(err.to_string().starts_with("invalid pattern `(`"));
    }
}
