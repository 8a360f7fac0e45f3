//! Rendering engine abstraction
//!
//! The session manager drives a rendering engine only through these traits:
//! launch an engine, open an isolated context per request, open a page in
//! it, and capture. [`crate::ChromiumEngine`] is the production
//! implementation.

use crate::{OutputFormat, RenderError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Starts engine instances.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError>;
}

/// Ownership of one live engine process or connection.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// False once the engine has gone away and the handle cannot be reused.
    fn is_connected(&self) -> bool;

    /// Opens a context that shares no cookies or storage with any other.
    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError>;

    async fn close(&self) -> Result<(), RenderError>;
}

#[async_trait]
pub trait RenderContext: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError>;

    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_extra_headers(&self, headers: &HashMap<String, String>)
        -> Result<(), RenderError>;

    async fn set_viewport(&self, width: u32, height: u32, scale: u8) -> Result<(), RenderError>;

    /// Navigates and returns once the network is judged idle.
    async fn goto(&self, url: &str) -> Result<(), RenderError>;

    async fn capture(&self, capture: &Capture) -> Result<Vec<u8>, RenderError>;

    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}

/// What to capture from a loaded page.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    /// Raster capture of the region `(0, 0, width, height)`.
    Clip { width: u32, height: u32 },
    /// Paginated document with fixed page size and margins, in inches.
    Document {
        paper_width: f64,
        paper_height: f64,
        margin: f64,
        print_background: bool,
    },
}

impl Capture {
    pub fn format(&self) -> OutputFormat {
        match self {
            Capture::Clip { .. } => OutputFormat::Png,
            Capture::Document { .. } => OutputFormat::Pdf,
        }
    }
}

/// Captured bytes together with their content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub data: Vec<u8>,
    pub content_type: String,
}
