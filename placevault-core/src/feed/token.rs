use std::{fmt, time::Duration};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ArchiveError, Result};

/// Default page the access token is scraped from.
pub const DEFAULT_TOKEN_PAGE: &str = "https://www.reddit.com/r/place/";

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

const TOKEN_PATTERN: &str = r#""accessToken":"([^"]+)""#;

/// Source of the bearer token used by the feed handshake and the resolver.
#[async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    async fn token(&self) -> Result<String>;

    /// Forget any cached token so the next call fetches a fresh one.
    async fn invalidate(&self) {}
}

/// A token supplied by configuration.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

pub fn extract_token(pattern: &Regex, body: &str) -> Option<String> {
    pattern
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Scrapes the token out of a public page and caches it for `ttl`.
pub struct PageTokenProvider {
    client: reqwest::Client,
    page_url: String,
    pattern: Regex,
    ttl: Duration,
    cached: Mutex<Option<(String, Instant)>>,
}

impl fmt::Debug for PageTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTokenProvider")
            .field("page_url", &self.page_url)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PageTokenProvider {
    pub fn new(page_url: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("placevault/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        let pattern = Regex::new(TOKEN_PATTERN)
            .map_err(|e| ArchiveError::InvalidConfig(format!("token pattern: {e}")))?;
        Ok(Self {
            client,
            page_url: page_url.into(),
            pattern,
            ttl,
            cached: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.page_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::HttpStatus {
                status: status.as_u16(),
                url: self.page_url.clone(),
            });
        }
        let body = response.text().await?;
        extract_token(&self.pattern, &body).ok_or_else(|| {
            ArchiveError::TokenUnavailable(format!("no access token found on {}", self.page_url))
        })
    }
}

#[async_trait]
impl TokenProvider for PageTokenProvider {
    async fn token(&self) -> Result<String> {
        // Held across the fetch so concurrent callers share one refresh.
        let mut cached = self.cached.lock().await;
        if let Some((token, fetched)) = cached.as_ref() {
            if fetched.elapsed() < self.ttl {
                return Ok(token.clone());
            }
            debug!(page = %self.page_url, "access token expired");
        }

        let token = self.fetch().await?;
        info!(page = %self.page_url, "refreshed access token");
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_pulled_out_of_embedded_json() {
        let pattern = Regex::new(TOKEN_PATTERN).expect("pattern");
        let body = r#"<script>window.___r = {"user":{"session":{"accessToken":"abc-123.def","expires":"x"}}}</script>"#;
        assert_eq!(extract_token(&pattern, body).as_deref(), Some("abc-123.def"));
        assert_eq!(extract_token(&pattern, "<html></html>"), None);
    }

    #[tokio::test]
    async fn static_provider_returns_configured_token() {
        let provider = StaticTokenProvider::new("secret");
        assert_eq!(provider.token().await.expect("token"), "secret");
        provider.invalidate().await;
        assert_eq!(provider.token().await.expect("token"), "secret");
        assert!(!format!("{provider:?}").contains("secret"));
    }

    /// Serves one canned HTTP response per connection.
    async fn serve_page(body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn page_without_token_is_retried_not_dropped() {
        use crate::error::ErrorClass;
        use crate::jobs::{JobPayload, JobPolicyTable, JobRecord, ResolveSingleJob, RetryDecision};
        use crate::types::{ChangedCoordinate, PartitionId};

        let url = serve_page("<html>challenge page</html>").await;
        let provider = PageTokenProvider::new(url, DEFAULT_TOKEN_TTL).expect("provider");

        let err = provider.token().await.expect_err("no token on the page");
        assert!(matches!(err, ArchiveError::TokenUnavailable(_)));
        assert_eq!(err.class(), ErrorClass::TransientNetwork);

        let job = JobRecord::new(JobPayload::ResolveSingle(ResolveSingleJob {
            coordinate: ChangedCoordinate::new(PartitionId(0), 1, 2),
        }), 0);
        let policies = JobPolicyTable::default();
        let decision = policies.resolve_single.decide(&job, err.class());
        assert!(matches!(decision, RetryDecision::Retry { attempt: 1, .. }), "{decision:?}");
    }

    #[tokio::test]
    async fn page_token_is_cached() {
        let url = serve_page(r#"<script>{"accessToken":"tok-1"}</script>"#).await;
        let provider = PageTokenProvider::new(url, DEFAULT_TOKEN_TTL).expect("provider");
        assert_eq!(provider.token().await.expect("token"), "tok-1");
        assert_eq!(provider.token().await.expect("cached token"), "tok-1");
    }
}
