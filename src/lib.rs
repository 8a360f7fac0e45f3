//! # Render Gateway
//!
//! Turns URLs of the form
//! `https://host[/prefix]/screenshot[s][/WxH]/path[@Nx].ext[?query]` into
//! rendered PNG screenshots or PDF documents of `https://host/path?query`,
//! served through a cache-aside front door.
//!
//! A headless Chrome instance is expensive to start, so rendering goes through
//! a [`SessionManager`] that keeps one engine per session key, launches it on
//! first use, gives every request its own isolated browser context and shuts
//! the engine down once it has sat idle for the configured budget.
//!
//! ## Pipeline
//!
//! | Stage | Type | Notes |
//! |-------|------|-------|
//! | Cache lookup | [`ResponseCache`] | Keyed by the exact request URL |
//! | Parse | [`RequestParser`] | Malformed input never reaches the engine |
//! | Render | [`SessionManager`] | Lazy launch, idle eviction, bounded by a timeout |
//! | Store | [`CachedResponse`] | Written back in the background, successes only |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_gateway::{
//!     CacheAsideGateway, ChromiumEngine, Config, MemoryCache, Metrics, RequestParser,
//!     SessionManager,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let metrics = Arc::new(Metrics::new());
//!     let sessions = Arc::new(SessionManager::new(
//!         Arc::new(ChromiumEngine::new(config.clone())),
//!         &config,
//!         metrics.clone(),
//!     ));
//!     let gateway = CacheAsideGateway::new(
//!         RequestParser::from_config(&config),
//!         sessions.clone(),
//!         Arc::new(MemoryCache::new()),
//!         config.session.key.clone(),
//!         metrics,
//!     );
//!
//!     let response = gateway
//!         .handle("https://example.com/screenshot/600x400/pricing@2x.png")
//!         .await;
//!     println!("{} ({} bytes)", response.status, response.body.len());
//!
//!     sessions.shutdown().await;
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-gateway parse https://example.com/screenshot/foo/bar.pdf
//! render-gateway render https://example.com/screenshots/pricing.png --output pricing.png
//! render-gateway batch --input urls.txt --output renders/ --concurrency 4
//! ```

/// Configuration and settings
pub mod config;

/// Error types for parsing, rendering and configuration
pub mod error;

/// Request URL grammar and target URL construction
pub mod request;

/// Traits the session manager uses to drive a rendering engine
pub mod engine;

/// Headless Chrome implementation of the engine traits
pub mod chromium;

/// Per-key engine lifecycle with idle eviction
pub mod session;

/// Response cache collaborator
pub mod cache;

/// Cache-aside front door
pub mod gateway;

/// Counters, gauges and the Prometheus exporter
pub mod metrics;

/// Command-line interface implementation
pub mod cli;

#[cfg(test)]
mod tests;

pub use self::metrics::{Metrics, PrometheusExporter};
pub use cache::*;
pub use chromium::*;
pub use cli::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use gateway::*;
pub use request::*;
pub use session::*;
