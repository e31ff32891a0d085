use std::{str::FromStr, time::Duration};

use crate::error::ConfigLoadError;

/// Parse a boolean value from a raw string, accepting common env-style forms.
///
/// Accepted truthy values (case-insensitive): `"1"`, `"true"`, `"yes"`, `"on"`.
/// Accepted falsy values: `"0"`, `"false"`, `"no"`, `"off"`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Non-empty, trimmed value of an environment variable.
pub fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

/// Raw and parsed value of a typed environment variable. Unparseable values
/// keep their raw text so the loader can report them.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvValue<T> {
    Parsed(T),
    Invalid(String),
}

impl<T> EnvValue<T> {
    pub fn parsed(&self) -> Option<&T> {
        match self {
            EnvValue::Parsed(value) => Some(value),
            EnvValue::Invalid(_) => None,
        }
    }
}

pub fn parse_var<T: FromStr>(name: &str) -> Option<EnvValue<T>> {
    non_empty_var(name).map(|raw| match raw.parse() {
        Ok(value) => EnvValue::Parsed(value),
        Err(_) => EnvValue::Invalid(raw),
    })
}

pub fn parse_bool_var(name: &str) -> Option<EnvValue<bool>> {
    non_empty_var(name).map(|raw| match parse_bool(&raw) {
        Some(value) => EnvValue::Parsed(value),
        None => EnvValue::Invalid(raw),
    })
}

/// Human-friendly duration such as `"90s"`, `"2m"` or `"1h 30m"`.
pub fn parse_duration(field: &'static str, raw: &str) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(raw.trim()).map_err(|source| ConfigLoadError::InvalidDuration {
        field,
        raw: raw.to_string(),
        source,
    })
}
