//! Request URL parsing
//!
//! Turns an inbound URL of the shape
//! `https://<host>/<anything>/screenshot[s][/<W>x<H>]/<path>[@<2-4>x][.<format>][?<query>]`
//! into a [`RenderRequest`] describing what to render.

use crate::{Config, OutputFormat, ParseError, RenderDefaults};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static REQUEST_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    let formats = OutputFormat::ALL
        .iter()
        .map(|format| format.extension())
        .collect::<Vec<_>>()
        .join("|");

    let pattern = format!(
        concat!(
            r"^(?P<base>https?://[^/?#]+)(?:/[^?#]*?)??/screenshots?",
            r"(?:/(?P<width>\d+)x(?P<height>\d+))?",
            r"(?P<path>/[^?#]*?)?",
            r"(?:@(?P<scale>[2-4])x)?",
            r"(?:\.(?P<format>{}))?",
            r"(?:\?(?P<query>[^#]*))?$",
        ),
        formats
    );

    Regex::new(&pattern).expect("request pattern is a valid regex")
});

/// What to render, resolved from a request URL plus configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderRequest {
    pub target_url: String,
    pub output_format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub scale: u8,
    /// Raw `key=value` strings in the order they are appended to the target.
    pub extra_query_params: Vec<String>,
    pub cache_ttl_seconds: u64,
}

impl RenderRequest {
    pub fn content_type(&self) -> &'static str {
        self.output_format.content_type()
    }
}

/// Parses request URLs against the fixed request pattern.
///
/// Performs no I/O. The only failure is a [`ParseError`].
#[derive(Debug, Clone)]
pub struct RequestParser {
    defaults: RenderDefaults,
    global_query_params: Vec<String>,
}

impl RequestParser {
    pub fn new(defaults: RenderDefaults, global_query_params: Vec<String>) -> Self {
        Self {
            defaults,
            global_query_params,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.defaults.clone(), config.global_query_params.clone())
    }

    pub fn parse(&self, request_url: &str) -> Result<RenderRequest, ParseError> {
        let captures = REQUEST_PATTERN
            .captures(request_url)
            .ok_or_else(|| ParseError::Malformed(request_url.to_string()))?;

        let base = &captures["base"];
        let path = captures.name("path").map_or("", |m| m.as_str());

        let (width, height) = match (captures.name("width"), captures.name("height")) {
            (Some(width), Some(height)) => (
                parse_dimension(width.as_str())?,
                parse_dimension(height.as_str())?,
            ),
            _ => (self.defaults.width, self.defaults.height),
        };

        // The pattern only admits a single digit in 2..=4.
        let scale = captures
            .name("scale")
            .and_then(|m| m.as_str().parse::<u8>().ok())
            .unwrap_or(self.defaults.scale);

        let output_format = captures
            .name("format")
            .and_then(|m| OutputFormat::from_extension(m.as_str()))
            .unwrap_or(self.defaults.format);

        let mut extra_query_params: Vec<String> = captures
            .name("query")
            .map(|m| {
                m.as_str()
                    .split('&')
                    .filter(|param| !param.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        extra_query_params.extend(self.global_query_params.iter().cloned());

        let target_url = build_target_url(base, path, &extra_query_params);
        url::Url::parse(&target_url)
            .map_err(|e| ParseError::InvalidTarget(format!("{target_url}: {e}")))?;

        Ok(RenderRequest {
            target_url,
            output_format,
            width,
            height,
            scale,
            extra_query_params,
            cache_ttl_seconds: self.defaults.cache_ttl_seconds,
        })
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new(RenderDefaults::default(), Vec::new())
    }
}

pub fn build_target_url(base: &str, path: &str, params: &[String]) -> String {
    if params.is_empty() {
        format!("{base}{path}")
    } else {
        format!("{base}{path}?{}", params.join("&"))
    }
}

fn parse_dimension(value: &str) -> Result<u32, ParseError> {
    match value.parse::<u32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ParseError::InvalidDimension(value.to_string())),
    }
}
