//! Layered configuration for the placevault archiver.
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional TOML file (`--config`, `PLACEVAULT_CONFIG`, `placevault.toml` or
//! `config/placevault.toml`) and the process environment, which may itself
//! be seeded from a `.env` file.

pub mod error;
pub mod loader;
pub mod models;
pub mod sources;
pub mod util;
pub mod validation;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    BlobConfig, Config, ConfigMetadata, DEFAULT_RESOLVER_URL, DatabaseConfig, FeedConfig,
    PipelineConfig, RedisConfig, ResolverConfig, TokenSource,
};
pub use validation::{ConfigWarning, ConfigWarnings};
