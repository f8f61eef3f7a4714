//! statuswatch: resilient status polling for third-party AI providers.
//!
//! The engine fetches, interprets and caches health checks against many
//! unreliable status endpoints. Each provider sits behind a circuit
//! breaker and an outbound rate limit. A priority batch scheduler drives
//! the polling cycles.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod interpret;
pub mod limiter;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod types;

pub use error::FetchError;
pub use fetcher::{FetcherConfig, StatusFetcher};
pub use types::{ProviderDescriptor, ResponseFormat, ServiceStatus, StatusResult};
