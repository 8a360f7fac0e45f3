//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the render gateway:
//! Chrome launch settings, session lifecycle timings, per-request defaults,
//! and operator-supplied headers and query parameters.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest freshness horizon a rendered result may be given (one year).
pub const MAX_CACHE_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Main configuration structure for the render gateway
///
/// # Examples
///
/// ```rust
/// use render_gateway::Config;
///
/// let config = Config {
///     global_query_params: vec!["theme=dark".to_string()],
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for rendered pages (default: Chrome default)
    pub user_agent: Option<String>,

    /// Engine session lifecycle settings
    pub session: SessionSettings,

    /// Values used when the request URL omits a field
    pub defaults: RenderDefaults,

    /// Static header forwarded on every page navigation, typically an
    /// authorization header for the rendered origin
    pub forwarded_auth: Option<ForwardedAuth>,

    /// `key=value` pairs appended to every target URL after the ones the
    /// client sent. Order is preserved.
    pub global_query_params: Vec<String>,

    /// Page geometry used for document (PDF) output
    pub document: DocumentSettings,

    /// How often expired entries are swept from the in-memory response cache
    /// (default: 5 minutes)
    pub cache_purge_interval: Duration,

    /// Port for the Prometheus scrape endpoint (default: disabled)
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chrome_path: None,
            user_agent: None,
            session: SessionSettings::default(),
            defaults: RenderDefaults::default(),
            forwarded_auth: None,
            global_query_params: Vec::new(),
            document: DocumentSettings::default(),
            cache_purge_interval: Duration::from_secs(300),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.width == 0 || self.defaults.height == 0 {
            return Err(ConfigError::Invalid(
                "Default dimensions must be greater than 0".to_string(),
            ));
        }

        if !(1..=4).contains(&self.defaults.scale) {
            return Err(ConfigError::Invalid(format!(
                "Default scale must be between 1 and 4, got {}",
                self.defaults.scale
            )));
        }

        if self.defaults.cache_ttl_seconds == 0 {
            return Err(ConfigError::Invalid(
                "Cache TTL must be greater than 0".to_string(),
            ));
        }

        if self.defaults.cache_ttl_seconds > MAX_CACHE_TTL_SECONDS {
            return Err(ConfigError::Invalid(format!(
                "Cache TTL must be at most {MAX_CACHE_TTL_SECONDS} seconds, got {}",
                self.defaults.cache_ttl_seconds
            )));
        }

        if self.cache_purge_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Cache purge interval must be greater than 0".to_string(),
            ));
        }

        if self.session.tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Tick interval must be greater than 0".to_string(),
            ));
        }

        if self.session.idle_budget < self.session.tick_interval {
            return Err(ConfigError::Invalid(
                "Idle budget must be at least one tick interval".to_string(),
            ));
        }

        if self.session.render_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Render timeout must be greater than 0".to_string(),
            ));
        }

        if let Some(param) = self.global_query_params.iter().find(|p| p.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "Global query parameters must not be empty: {param:?}"
            )));
        }

        Ok(())
    }
}

/// Engine session lifecycle settings
///
/// A session's engine is torn down once it has sat idle for `idle_budget`,
/// measured in whole `tick_interval` steps.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Logical key of the managed session (default: "default")
    pub key: String,

    /// Cumulative idle time before the engine is released (default: 60 seconds)
    pub idle_budget: Duration,

    /// Interval between idle ticks (default: 10 seconds)
    pub tick_interval: Duration,

    /// Upper bound on navigation plus capture for one request (default: 30 seconds)
    pub render_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            key: "default".to_string(),
            idle_budget: Duration::from_secs(60),
            tick_interval: Duration::from_secs(10),
            render_timeout: Duration::from_secs(30),
        }
    }
}

/// Fallback values for fields the request URL leaves out
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderDefaults {
    /// Viewport width in pixels (default: 1200)
    pub width: u32,

    /// Viewport height in pixels (default: 630)
    pub height: u32,

    /// Device pixel ratio (default: 1)
    pub scale: u8,

    /// Output format (default: PNG)
    pub format: OutputFormat,

    /// Freshness horizon of a rendered result (default: 7 days)
    pub cache_ttl_seconds: u64,
}

impl Default for RenderDefaults {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 630,
            scale: 1,
            format: OutputFormat::Png,
            cache_ttl_seconds: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardedAuth {
    pub header: String,
    pub value: String,
}

/// Page geometry for document output, in inches
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DocumentSettings {
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin: f64,
    pub print_background: bool,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        // A4
        Self {
            paper_width: 8.27,
            paper_height: 11.7,
            margin: 0.4,
            print_background: true,
        }
    }
}

/// Supported output formats
///
/// The first variant is the default when the request URL names none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Raster capture clipped to the requested viewport
    Png,
    /// Paginated document render
    Pdf,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 2] = [OutputFormat::Png, OutputFormat::Pdf];

    pub fn from_extension(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.extension() == token)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Pdf => "application/pdf",
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, OutputFormat::Pdf)
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use render_gateway::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default());
/// assert!(args.contains(&"--headless".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--font-render-hinting=none".to_string(),
        format!(
            "--window-size={},{}",
            config.defaults.width, config.defaults.height
        ),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &Config,
) -> Result<chromiumoxide::browser::BrowserConfig, String> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.defaults.width, config.defaults.height)
        .args(get_chrome_args(config));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build()
}
