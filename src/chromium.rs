//! Headless Chrome implementation of the rendering engine traits
//!
//! Each [`ChromiumHandle`] owns one Chrome process and the background task
//! that pumps its DevTools Protocol events. Every request gets its own
//! browser context so cookies and storage never cross requests.

use crate::{
    create_browser_config, Capture, Config, EngineHandle, RenderContext, RenderEngine,
    RenderError, RenderPage,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, PrintToPdfParams, Viewport,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct ChromiumEngine {
    config: Config,
}

impl ChromiumEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    async fn launch(&self) -> Result<Arc<dyn EngineHandle>, RenderError> {
        let browser_config =
            create_browser_config(&self.config).map_err(RenderError::EngineUnavailable)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::EngineUnavailable(e.to_string()))?;

        // The handler is a Stream and must be polled for the browser to make progress
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Chrome handler error: {}", e);
                        return Err(e);
                    }
                    None => {
                        debug!("Chrome handler stream ended");
                        break;
                    }
                }
            }
            Ok(())
        });

        info!("Chrome instance launched");

        Ok(Arc::new(ChromiumHandle {
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
        }))
    }
}

pub struct ChromiumHandle {
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
}

#[async_trait]
impl EngineHandle for ChromiumHandle {
    fn is_connected(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        if !self.is_connected() {
            return Err(RenderError::Disconnected);
        }

        let context_id = self
            .browser
            .lock()
            .await
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        Ok(Box::new(ChromiumContext {
            browser: self.browser.clone(),
            context_id,
        }))
    }

    async fn close(&self) -> Result<(), RenderError> {
        let result = self.browser.lock().await.close().await;
        self.handler.abort();

        result
            .map(|_| ())
            .map_err(|e| RenderError::EvictionFailure(e.to_string()))
    }
}

struct ChromiumContext {
    browser: Arc<Mutex<Browser>>,
    context_id: BrowserContextId,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(self.context_id.clone())
            .build()
            .map_err(RenderError::Navigation)?;

        let page = self
            .browser
            .lock()
            .await
            .new_page(params)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        Ok(Box::new(ChromiumPage { page }))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.browser
            .lock()
            .await
            .dispose_browser_context(self.context_id.clone())
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_extra_headers(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<(), RenderError> {
        let headers = serde_json::to_value(headers)
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        Ok(())
    }

    async fn set_viewport(&self, width: u32, height: u32, scale: u8) -> Result<(), RenderError> {
        let emulation_params = SetDeviceMetricsOverrideParams::builder()
            .width(width)
            .height(height)
            .device_scale_factor(f64::from(scale))
            .mobile(false)
            .build()
            .map_err(RenderError::Navigation)?;

        self.page
            .execute(emulation_params)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        Ok(())
    }

    async fn goto(&self, url: &str) -> Result<(), RenderError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| RenderError::Navigation(e.to_string()))?;

        Ok(())
    }

    async fn capture(&self, capture: &Capture) -> Result<Vec<u8>, RenderError> {
        match capture {
            Capture::Clip { width, height } => {
                let screenshot_params = ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .clip(Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: f64::from(*width),
                        height: f64::from(*height),
                        scale: 1.0,
                    })
                    .build();

                self.page
                    .screenshot(screenshot_params)
                    .await
                    .map_err(|e| RenderError::Capture(e.to_string()))
            }
            Capture::Document {
                paper_width,
                paper_height,
                margin,
                print_background,
            } => {
                let pdf_params = PrintToPdfParams {
                    paper_width: Some(*paper_width),
                    paper_height: Some(*paper_height),
                    margin_top: Some(*margin),
                    margin_bottom: Some(*margin),
                    margin_left: Some(*margin),
                    margin_right: Some(*margin),
                    print_background: Some(*print_background),
                    ..Default::default()
                };

                self.page
                    .pdf(pdf_params)
                    .await
                    .map_err(|e| RenderError::Capture(e.to_string()))
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        self.page
            .close()
            .await
            .map_err(|e| RenderError::Capture(e.to_string()))
    }
}
