//! Chromium-backed tab driver
//!
//! Implements the pool's `BrowserDriver`/`TabContext`/`TabPage` traits over
//! a headless Chrome instance driven through the DevTools protocol. One
//! browser process serves the whole pipeline; each pooled context maps to a
//! dedicated page target.

use crate::tab_pool::{BrowserDriver, CaptureParams, TabContext, TabPage};
use crate::VizzlyError;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Path to the Chrome/Chromium executable; auto-detected when None
    pub chrome_path: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            width: 1920,
            height: 1080,
        }
    }
}

fn chrome_args(options: &BrowserOptions) -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        format!("--window-size={},{}", options.width, options.height),
    ]
}

pub struct CdpBrowser {
    browser: Mutex<Browser>,
    handler_task: tokio::task::JoinHandle<()>,
}

impl CdpBrowser {
    pub async fn launch(options: &BrowserOptions) -> Result<Self, VizzlyError> {
        let mut builder = BrowserConfig::builder()
            .window_size(options.width, options.height)
            .args(chrome_args(options));
        if let Some(path) = &options.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(VizzlyError::BrowserLaunchFailed)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| VizzlyError::BrowserLaunchFailed(e.to_string()))?;

        // The handler is a stream of DevTools protocol events and must be
        // polled for the connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser handler error: {}", e);
                    break;
                }
            }
            info!("Browser handler stream ended");
        });

        Ok(Self {
            browser: Mutex::new(browser),
            handler_task,
        })
    }

    pub async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        let _ = browser.close().await;
        self.handler_task.abort();
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn new_context(&self) -> Result<Box<dyn TabContext>, VizzlyError> {
        let browser = self.browser.lock().await;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| VizzlyError::Page(e.to_string()))?;
        Ok(Box::new(CdpTabContext {
            page: Arc::new(CdpTabPage { page }),
        }))
    }
}

struct CdpTabContext {
    page: Arc<CdpTabPage>,
}

#[async_trait]
impl TabContext for CdpTabContext {
    fn page(&self) -> Arc<dyn TabPage> {
        self.page.clone()
    }

    async fn close(&mut self) -> Result<(), VizzlyError> {
        self.page
            .page
            .clone()
            .close()
            .await
            .map_err(|e| VizzlyError::Page(e.to_string()))
    }
}

struct CdpTabPage {
    page: Page,
}

#[async_trait]
impl TabPage for CdpTabPage {
    async fn set_viewport(&self, width: u32, height: u32) -> Result<(), VizzlyError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width as i64)
            .height(height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(VizzlyError::Page)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| VizzlyError::Page(e.to_string()))?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), VizzlyError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| VizzlyError::Page(format!("navigation to {} failed: {}", url, e)))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| VizzlyError::Page(e.to_string()))?;
        Ok(())
    }

    async fn run_script(&self, script: &str) -> Result<(), VizzlyError> {
        self.page
            .evaluate(script)
            .await
            .map_err(|e| VizzlyError::Page(format!("script hook failed: {}", e)))?;
        Ok(())
    }

    async fn capture(&self, params: &CaptureParams) -> Result<Vec<u8>, VizzlyError> {
        let screenshot_params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(params.full_page)
            .omit_background(params.omit_background)
            .build();
        self.page
            .screenshot(screenshot_params)
            .await
            .map_err(|e| VizzlyError::CaptureFailed(e.to_string()))
    }
}
