use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration for {field}: '{raw}'")]
    InvalidDuration {
        field: &'static str,
        raw: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid URL for {field}: '{raw}'")]
    InvalidUrl {
        field: &'static str,
        raw: String,
        #[source]
        source: url::ParseError,
    },
    #[error("{field} must use one of the schemes {expected:?}, got '{scheme}'")]
    UnsupportedScheme {
        field: &'static str,
        scheme: String,
        expected: &'static [&'static str],
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Dotenv(#[from] dotenvy::Error),
}
