//! Password login state machine.
//!
//! Drives a disposable browser through the platform's login page: switch to
//! the password tab, enter credentials, submit, then poll for one of three
//! outcomes: a redirect off the passport host (success), a click-captcha
//! panel (solve and keep polling), or an inline rejection message. The whole
//! flow runs under a single wall-clock budget; the browser is torn down on
//! every exit path.

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::layout::Point;
use chromiumoxide::page::Page;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::browser::StealthBrowser;
use crate::captcha::CaptchaSolver;
use crate::session::Session;

use async_trait::async_trait;

const LOGIN_URL: &str = "https://passport.csdn.net/login?code=applets";

const PASSWORD_TAB_SELECTOR: &str = "span.login-third-passwd";
const USERNAME_SELECTOR: &str = "input.base-input-text[autocomplete='username']";
const PASSWORD_SELECTOR: &str = "input.base-input-text[autocomplete='current-password']";
const SUBMIT_SELECTOR: &str = "button.base-button";
const ERROR_SELECTOR: &str = ".base-error-text";

const CHALLENGE_PANEL_SELECTORS: [&str; 3] = ["#click_v2", ".verify-img-panel", "canvas"];
const CHALLENGE_CAPTION_SELECTOR: &str = ".caption__title";
const DEFAULT_CAPTION: &str = "按顺序点击图中文字";

const LOGIN_BUDGET: Duration = Duration::from_secs(90);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHALLENGE_ATTEMPTS: u32 = 3;

/// Where the flow was when it last made progress. Carried in errors so
/// failures say what stage broke, not just that login failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Start,
    PageLoaded,
    CredentialsEntered,
    SubmitClicked,
    ChallengePresented,
    ChallengeResolving,
    ChallengeCleared,
    Redirected,
    Authenticated,
    Failed,
}

#[derive(Debug, Error)]
pub enum LoginFailure {
    #[error("login page element not found: {0}")]
    ElementNotFound(String),

    #[error("verification challenge could not be resolved: {0}")]
    ChallengeUnresolved(String),

    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    #[error("login did not complete within {0:?}")]
    Timeout(Duration),

    #[error("browser failure: {0}")]
    Browser(String),
}

#[derive(Debug, Error)]
#[error("login failed at {state:?}: {failure}")]
pub struct LoginError {
    pub state: LoginState,
    pub failure: LoginFailure,
}

impl LoginError {
    fn new(state: LoginState, failure: LoginFailure) -> Self {
        Self { state, failure }
    }
}

/// Anything that can produce a verified session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self) -> Result<Session, LoginError>;
}

/// Browser-driven password login.
pub struct LoginFlow {
    username: String,
    password: String,
    solver: Arc<dyn CaptchaSolver>,
    headless: bool,
    extra_args: Vec<String>,
}

impl LoginFlow {
    pub fn new(username: &str, password: &str, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            solver,
            headless: true,
            extra_args: Vec::new(),
        }
    }

    /// Run with a visible browser window. Besides debugging, this enables
    /// the operator to clear a challenge by hand when the solver gives up.
    pub fn with_headful(mut self, headful: bool) -> Self {
        self.headless = !headful;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    async fn run(&self, browser: &StealthBrowser, page: &Page) -> Result<Session, LoginError> {
        let mut state = LoginState::Start;

        browser
            .goto(page, LOGIN_URL)
            .await
            .map_err(|e| LoginError::new(state, LoginFailure::Browser(e.to_string())))?;
        state = LoginState::PageLoaded;
        log::debug!("login page loaded");

        // The page defaults to the QR tab; switch to password login.
        click_element(page, PASSWORD_TAB_SELECTOR)
            .await
            .map_err(|f| LoginError::new(state, f))?;
        tokio::time::sleep(jitter()).await;

        type_into(page, USERNAME_SELECTOR, &self.username)
            .await
            .map_err(|f| LoginError::new(state, f))?;
        tokio::time::sleep(jitter()).await;
        type_into(page, PASSWORD_SELECTOR, &self.password)
            .await
            .map_err(|f| LoginError::new(state, f))?;
        state = LoginState::CredentialsEntered;

        tokio::time::sleep(jitter()).await;
        click_element(page, SUBMIT_SELECTOR)
            .await
            .map_err(|f| LoginError::new(state, f))?;
        state = LoginState::SubmitClicked;
        log::info!("login form submitted, waiting for outcome");

        let deadline = tokio::time::Instant::now() + LOGIN_BUDGET;
        let mut challenge_attempts = 0u32;

        loop {
            if tokio::time::Instant::now() > deadline {
                return Err(LoginError::new(
                    state,
                    LoginFailure::Timeout(LOGIN_BUDGET),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let current = page
                .url()
                .await
                .map_err(|e| LoginError::new(state, LoginFailure::Browser(e.to_string())))?
                .unwrap_or_default();
            if !current.is_empty() && !current.contains("passport.csdn.net") {
                state = LoginState::Redirected;
                log::info!("login redirected to {current}");
                break;
            }

            if let Some(panel) = find_challenge_panel(page).await {
                if state != LoginState::ChallengePresented
                    && state != LoginState::ChallengeResolving
                {
                    state = LoginState::ChallengePresented;
                    log::info!("verification challenge presented");
                }
                if challenge_attempts >= CHALLENGE_ATTEMPTS {
                    if self.headless {
                        return Err(LoginError::new(
                            state,
                            LoginFailure::ChallengeUnresolved(format!(
                                "gave up after {CHALLENGE_ATTEMPTS} attempts"
                            )),
                        ));
                    }
                    // Headful: let the operator clear it by hand, keep polling.
                    continue;
                }
                state = LoginState::ChallengeResolving;
                challenge_attempts += 1;
                match self.resolve_challenge(page, &panel).await {
                    Ok(()) => {
                        state = LoginState::ChallengeCleared;
                        log::info!("challenge answer submitted ({challenge_attempts})");
                    }
                    Err(failure) => {
                        log::warn!("challenge attempt {challenge_attempts} failed: {failure}");
                        if challenge_attempts >= CHALLENGE_ATTEMPTS && self.headless {
                            return Err(LoginError::new(state, failure));
                        }
                    }
                }
                continue;
            }

            if let Some(message) = read_error_text(page).await {
                return Err(LoginError::new(
                    LoginState::Failed,
                    LoginFailure::CredentialsRejected(message),
                ));
            }
        }

        let cookies = browser
            .export_cookies(page)
            .await
            .map_err(|e| LoginError::new(state, LoginFailure::Browser(e.to_string())))?;
        let mut session = Session::from_cookies(cookies);
        if !session.has_required_keys() {
            return Err(LoginError::new(
                state,
                LoginFailure::CredentialsRejected(format!(
                    "redirect without identity cookies (missing {:?})",
                    session.missing_required_keys()
                )),
            ));
        }
        session.mark_verified();
        log::info!("authenticated; session holds {} cookie(s)", session.len());
        Ok(session)
    }

    /// Solve the click captcha: screenshot the panel, hand it to the solver,
    /// translate image coordinates to page coordinates, click with jitter.
    async fn resolve_challenge(
        &self,
        page: &Page,
        panel_selector: &str,
    ) -> Result<(), LoginFailure> {
        let panel = page
            .find_element(panel_selector)
            .await
            .map_err(|_| LoginFailure::ElementNotFound(panel_selector.to_string()))?;
        let image = panel
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| LoginFailure::Browser(e.to_string()))?;

        let caption = match page.find_element(CHALLENGE_CAPTION_SELECTOR).await {
            Ok(el) => el
                .inner_text()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| DEFAULT_CAPTION.to_string()),
            Err(_) => DEFAULT_CAPTION.to_string(),
        };

        log::debug!("solving challenge via {} ({caption})", self.solver.name());
        let answer = self
            .solver
            .solve(&image, &caption)
            .await
            .map_err(|e| LoginFailure::ChallengeUnresolved(e.to_string()))?;

        let rect: PanelRect = page
            .evaluate(format!(
                "JSON.stringify(document.querySelector({panel_selector:?})\
                 .getBoundingClientRect())"
            ))
            .await
            .map_err(|e| LoginFailure::Browser(e.to_string()))?
            .into_value::<String>()
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .ok_or_else(|| LoginFailure::Browser("challenge panel has no geometry".into()))?;

        for point in &answer.points {
            let target = Point {
                x: rect.x + point.x as f64,
                y: rect.y + point.y as f64,
            };
            page.click(target)
                .await
                .map_err(|e| LoginFailure::Browser(e.to_string()))?;
            tokio::time::sleep(jitter()).await;
        }

        // Give the widget a moment to verify; a surviving panel means the
        // answer was wrong and is worth a refund report.
        tokio::time::sleep(Duration::from_secs(2)).await;
        if find_challenge_panel(page).await.is_some() {
            if let Some(solve_id) = &answer.solve_id {
                if let Err(err) = self.solver.report_failure(solve_id).await {
                    log::warn!("failed to report wrong answer: {err}");
                }
            }
            return Err(LoginFailure::ChallengeUnresolved(
                "panel still visible after clicks".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PanelRect {
    x: f64,
    y: f64,
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(300..700))
}

async fn click_element(page: &Page, selector: &str) -> Result<(), LoginFailure> {
    let element = page
        .find_element(selector)
        .await
        .map_err(|_| LoginFailure::ElementNotFound(selector.to_string()))?;
    element
        .click()
        .await
        .map_err(|e| LoginFailure::Browser(e.to_string()))?;
    Ok(())
}

async fn type_into(page: &Page, selector: &str, text: &str) -> Result<(), LoginFailure> {
    let element = page
        .find_element(selector)
        .await
        .map_err(|_| LoginFailure::ElementNotFound(selector.to_string()))?;
    element
        .click()
        .await
        .map_err(|e| LoginFailure::Browser(e.to_string()))?;
    element
        .type_str(text)
        .await
        .map_err(|e| LoginFailure::Browser(e.to_string()))?;
    Ok(())
}

async fn find_challenge_panel(page: &Page) -> Option<&'static str> {
    for selector in CHALLENGE_PANEL_SELECTORS {
        if page.find_element(selector).await.is_ok() {
            return Some(selector);
        }
    }
    None
}

async fn read_error_text(page: &Page) -> Option<String> {
    let element = page.find_element(ERROR_SELECTOR).await.ok()?;
    let text = element.inner_text().await.ok()??;
    let text = text.trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[async_trait]
impl Authenticator for LoginFlow {
    async fn login(&self) -> Result<Session, LoginError> {
        log::info!("starting password login for {}", self.username);
        let browser = StealthBrowser::launch(self.headless, &self.extra_args)
            .await
            .map_err(|e| {
                LoginError::new(LoginState::Start, LoginFailure::Browser(e.to_string()))
            })?;
        let page = match browser.open_page(&Session::new()).await {
            Ok(page) => page,
            Err(e) => {
                let failure = LoginFailure::Browser(e.to_string());
                let _ = browser.close().await;
                return Err(LoginError::new(LoginState::Start, failure));
            }
        };

        let outcome = self.run(&browser, &page).await;
        if let Err(err) = browser.close().await {
            log::warn!("browser teardown after login failed: {err}");
        }
        outcome
    }
}
