//! Live feed ingestion: access tokens, the partition ceiling, the websocket
//! transport and per-channel subscription tasks.

pub mod config_tracker;
pub mod subscription;
pub mod token;
pub mod transport;

pub use config_tracker::{
    CeilingStore, ConfigTracker, DEFAULT_META_KEY, InMemoryCeilingStore, RedisCeilingStore,
};
pub use subscription::{SubscriptionManager, SubscriptionSettings, SubscriptionState};
pub use token::{
    DEFAULT_TOKEN_PAGE, DEFAULT_TOKEN_TTL, PageTokenProvider, StaticTokenProvider, TokenProvider,
};
pub use transport::{
    DEFAULT_FEED_ORIGIN, DEFAULT_FEED_URL, DEFAULT_TEAM_OWNER, FeedConnection, FeedTransport,
    WsFeedTransport,
};
