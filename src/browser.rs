//! Disposable stealth browser instances.
//!
//! Each instance launches a fresh Chromium with a throwaway profile
//! directory, anti-automation launch flags, and a stealth init script bound
//! to a randomly drawn fingerprint profile. Instances are never reused
//! across retrieval attempts; tearing one down drops the profile directory
//! and aborts the CDP event loop.

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::evasion::{self, EvasionProfile};
use crate::session::Session;

/// Platform cookies are scoped to the apex domain so every subdomain
/// (blog, wenku, passport) sees them.
const COOKIE_DOMAIN: &str = ".csdn.net";

const LAUNCH_ATTEMPTS: u32 = 3;
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("browser protocol error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),

    #[error("navigation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single-use Chromium instance with a coherent fingerprint.
pub struct StealthBrowser {
    browser: Browser,
    profile: EvasionProfile,
    handler_task: JoinHandle<()>,
    // Held for its Drop; the directory outlives the browser process.
    _profile_dir: tempfile::TempDir,
}

impl StealthBrowser {
    /// Launch a fresh instance. Launch is retried a few times because
    /// Chromium occasionally fails to bind its devtools port on busy hosts.
    pub async fn launch(headless: bool, extra_args: &[String]) -> Result<Self, BrowserError> {
        let mut attempt = 0u32;
        loop {
            match Self::launch_once(headless, extra_args).await {
                Ok(instance) => return Ok(instance),
                Err(err) if attempt + 1 < LAUNCH_ATTEMPTS => {
                    log::warn!("browser launch failed ({err}), retrying");
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn launch_once(headless: bool, extra_args: &[String]) -> Result<Self, BrowserError> {
        let profile = evasion::random_profile();
        let profile_dir = tempfile::TempDir::new()?;
        let (width, height) = profile.viewport;

        let mut builder = BrowserConfig::builder()
            .user_data_dir(profile_dir.path())
            .window_size(width, height)
            .arg(format!("--user-agent={}", profile.user_agent));
        for flag in evasion::launch_flags() {
            builder = builder.arg(flag);
        }
        for arg in extra_args {
            builder = builder.arg(arg.clone());
        }
        if !headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        log::debug!(
            "launched browser instance ({}x{}, {})",
            width,
            height,
            profile.platform
        );
        Ok(Self {
            browser,
            profile,
            handler_task,
            _profile_dir: profile_dir,
        })
    }

    pub fn profile(&self) -> &EvasionProfile {
        &self.profile
    }

    /// Open a page with the stealth script installed and the session's
    /// cookies planted before any navigation.
    pub async fn open_page(&self, session: &Session) -> Result<Page, BrowserError> {
        let page = self.browser.new_page("about:blank").await?;
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
            evasion::stealth_init_script(&self.profile),
        ))
        .await?;

        if !session.is_empty() {
            let cookies: Vec<CookieParam> = session
                .cookies()
                .map(|(name, value)| {
                    let mut param = CookieParam::new(name, value);
                    param.domain = Some(COOKIE_DOMAIN.to_string());
                    param.path = Some("/".to_string());
                    param
                })
                .collect();
            page.set_cookies(cookies).await?;
        }
        Ok(page)
    }

    /// Navigate and wait for the load to settle, bounded by the navigation
    /// timeout.
    pub async fn goto(&self, page: &Page, url: &str) -> Result<(), BrowserError> {
        let navigation = async {
            page.goto(url).await?.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        tokio::time::timeout(NAVIGATION_TIMEOUT, navigation)
            .await
            .map_err(|_| BrowserError::Timeout(NAVIGATION_TIMEOUT))??;
        Ok(())
    }

    /// All cookies currently held by the instance, for merging back into
    /// the session.
    pub async fn export_cookies(&self, page: &Page) -> Result<Vec<(String, String)>, BrowserError> {
        let cookies = page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect())
    }

    /// Shut the instance down. Also runs implicitly on drop, but calling it
    /// lets errors surface.
    pub async fn close(mut self) -> Result<(), BrowserError> {
        self.browser.close().await?;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }
}

impl Drop for StealthBrowser {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}
