use std::time::Duration;
use thiserror::Error;

/// Raised by the request parser when an inbound URL does not describe a render.
///
/// Always client-caused. Maps to a 4xx response and is never logged as an
/// engine fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Malformed render request: {0}")]
    Malformed(String),

    #[error("Invalid dimension '{0}'")]
    InvalidDimension(String),

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),
}

impl ParseError {
    pub fn status_code(&self) -> u16 {
        400
    }
}

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Rendering engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Engine disconnected")]
    Disconnected,

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Render timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine shutdown failed: {0}")]
    EvictionFailure(String),

    #[error("Render task aborted: {0}")]
    Aborted(String),
}

impl RenderError {
    /// HTTP status the gateway answers with when this error reaches it.
    pub fn status_code(&self) -> u16 {
        match self {
            RenderError::EngineUnavailable(_) | RenderError::Disconnected => 503,
            RenderError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Short label used as a log and metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::EngineUnavailable(_) => "engine_unavailable",
            RenderError::Disconnected => "disconnected",
            RenderError::Navigation(_) => "navigation",
            RenderError::Capture(_) => "capture",
            RenderError::Timeout(_) => "timeout",
            RenderError::EvictionFailure(_) => "eviction",
            RenderError::Aborted(_) => "aborted",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
}
