use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Upstream returned {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Lease {key} is held by another worker")]
    LockContention { key: String },

    #[error("Feed transport error: {0}")]
    Transport(String),

    #[error("Access token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Failure taxonomy consumed by the task scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry with the standard backoff.
    TransientNetwork,
    /// Retry with a stretched backoff so upstream throttling is respected.
    RateLimited,
    /// Requeue promptly; tracked against a separate budget.
    LockContention,
    /// Never retried.
    MalformedPayload,
    /// Retried up to `max_attempts`, then reported as terminal.
    PermanentUpstreamError,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::LockContention => "lock_contention",
            ErrorClass::MalformedPayload => "malformed_payload",
            ErrorClass::PermanentUpstreamError => "permanent_upstream",
        };
        f.write_str(label)
    }
}

/// Classify an HTTP status code that was not a success.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 | 500..=599 => ErrorClass::TransientNetwork,
        _ => ErrorClass::PermanentUpstreamError,
    }
}

impl ArchiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ArchiveError::HttpStatus { status, .. } => classify_status(*status),
            ArchiveError::Http(err) => match err.status() {
                Some(status) => classify_status(status.as_u16()),
                None if err.is_decode() => ErrorClass::MalformedPayload,
                None => ErrorClass::TransientNetwork,
            },
            ArchiveError::LockContention { .. } => ErrorClass::LockContention,
            ArchiveError::Serialization(_)
            | ArchiveError::Image(_)
            | ArchiveError::Malformed(_) => ErrorClass::MalformedPayload,
            ArchiveError::Io(_)
            | ArchiveError::Database(_)
            | ArchiveError::Redis(_)
            | ArchiveError::Transport(_)
            | ArchiveError::TokenUnavailable(_)
            | ArchiveError::Blob(_)
            | ArchiveError::Cancelled(_) => ErrorClass::TransientNetwork,
            ArchiveError::InvalidConfig(_) | ArchiveError::Internal(_) => {
                ErrorClass::PermanentUpstreamError
            }
        }
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        ArchiveError::Malformed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_statuses_are_rate_limited() {
        let err = ArchiveError::HttpStatus {
            status: 429,
            url: "https://example.test/a.png".into(),
        };
        assert_eq!(err.class(), ErrorClass::RateLimited);
    }

    #[test]
    fn server_errors_are_transient_and_client_errors_permanent() {
        assert_eq!(classify_status(503), ErrorClass::TransientNetwork);
        assert_eq!(classify_status(408), ErrorClass::TransientNetwork);
        assert_eq!(classify_status(404), ErrorClass::PermanentUpstreamError);
        assert_eq!(classify_status(403), ErrorClass::PermanentUpstreamError);
    }

    #[test]
    fn decode_failures_are_never_retried() {
        let err = ArchiveError::malformed("missing userInfo");
        assert_eq!(err.class(), ErrorClass::MalformedPayload);

        let json_err = serde_json::from_str::<serde_json::Value>("{")
            .expect_err("truncated json should fail");
        assert_eq!(
            ArchiveError::from(json_err).class(),
            ErrorClass::MalformedPayload
        );
    }

    #[test]
    fn missing_access_token_is_transient() {
        let err = ArchiveError::TokenUnavailable("no access token found on page".into());
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
    }

    #[test]
    fn lock_contention_is_its_own_class() {
        let err = ArchiveError::LockContention {
            key: "download:x".into(),
        };
        assert_eq!(err.class(), ErrorClass::LockContention);
    }
}
