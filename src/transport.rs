//! Content transports.
//!
//! Two ways to fetch a page as an authenticated user: a plain HTTP client
//! wearing a fingerprint profile's headers, and a real browser instance for
//! pages the edge refuses to hand to a bare client. Both hide behind the
//! [`Navigator`] trait so the orchestrator can swap one for the other
//! mid-retrieval, and both report back any cookies the server set so the
//! session stays current.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::browser::{BrowserError, StealthBrowser};
use crate::evasion;
use crate::session::Session;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A page as fetched: final URL after redirects, origin status, body, and
/// any cookies the response set.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub url: Url,
    pub status: u16,
    pub html: String,
    pub cookies: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum NavigateError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl From<BrowserError> for NavigateError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Timeout(_) => NavigateError::Timeout,
            other => NavigateError::Browser(other.to_string()),
        }
    }
}

/// A way to fetch a page while carrying the session's cookies.
#[async_trait]
pub trait Navigator: Send + Sync {
    /// Short transport name for logging.
    fn name(&self) -> &'static str;

    async fn navigate(
        &self,
        url: &Url,
        session: &Session,
    ) -> Result<FetchedDocument, NavigateError>;
}

/// Plain HTTP transport wearing a fingerprint profile's headers.
pub struct HttpNavigator {
    client: reqwest::Client,
}

impl HttpNavigator {
    pub fn new() -> Result<Self, NavigateError> {
        let profile = evasion::random_profile();
        let mut headers = http::HeaderMap::new();
        for (name, value) in evasion::browser_headers(&profile) {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(name.as_bytes()),
                http::header::HeaderValue::from_str(&value),
            ) {
                headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .cookie_store(false)
            .gzip(true)
            .brotli(true)
            .timeout(HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| NavigateError::Protocol(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Navigator for HttpNavigator {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn navigate(
        &self,
        url: &Url,
        session: &Session,
    ) -> Result<FetchedDocument, NavigateError> {
        let mut request = self.client.get(url.clone());
        if !session.is_empty() {
            request = request.header(http::header::COOKIE, session.cookie_header());
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let cookies = response
            .headers()
            .get_all(http::header::SET_COOKIE)
            .iter()
            .filter_map(|raw| raw.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let html = response.text().await.map_err(classify_reqwest_error)?;

        log::debug!("http fetch of {final_url} returned {status}");
        Ok(FetchedDocument {
            url: final_url,
            status,
            html,
            cookies,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> NavigateError {
    if err.is_timeout() {
        NavigateError::Timeout
    } else if err.is_connect() {
        NavigateError::Connect(err.to_string())
    } else {
        NavigateError::Protocol(err.to_string())
    }
}

/// First name=value pair of a Set-Cookie header; attributes are dropped.
fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Browser-backed transport. Launches a disposable instance per fetch, so
/// each use carries a fresh fingerprint and leaves no reusable state.
pub struct BrowserNavigator {
    headless: bool,
    extra_args: Vec<String>,
}

impl BrowserNavigator {
    pub fn new(headless: bool, extra_args: Vec<String>) -> Self {
        Self {
            headless,
            extra_args,
        }
    }
}

#[async_trait]
impl Navigator for BrowserNavigator {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn navigate(
        &self,
        url: &Url,
        session: &Session,
    ) -> Result<FetchedDocument, NavigateError> {
        let browser = StealthBrowser::launch(self.headless, &self.extra_args).await?;
        let page = browser.open_page(session).await?;
        browser.goto(&page, url.as_str()).await?;

        let final_url = page
            .url()
            .await
            .map_err(|e| NavigateError::Browser(e.to_string()))?
            .and_then(|raw| Url::parse(&raw).ok())
            .unwrap_or_else(|| url.clone());
        let html = page
            .content()
            .await
            .map_err(|e| NavigateError::Browser(e.to_string()))?;
        let cookies = browser.export_cookies(&page).await?;

        if let Err(err) = browser.close().await {
            log::warn!("browser teardown failed: {err}");
        }

        // The CDP path has no status line; a rendered document counts as 200.
        Ok(FetchedDocument {
            url: final_url,
            status: 200,
            html,
            cookies,
        })
    }
}
