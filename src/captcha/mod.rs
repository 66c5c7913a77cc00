//! Pluggable captcha solving backends.
//!
//! The login flow hands a solver the raw challenge image and an instruction
//! caption, and gets back the points to click in image coordinates. Backends
//! are third-party solving services plus a manual fallback that parks the
//! image on disk and reads coordinates from stdin.

use async_trait::async_trait;
use thiserror::Error;

mod chaojiying;
mod manual;
mod twocaptcha;

pub use chaojiying::ChaoJiYingSolver;
pub use manual::ManualSolver;
pub use twocaptcha::TwoCaptchaSolver;

/// A click target in challenge-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickPoint {
    pub x: u32,
    pub y: u32,
}

/// A solved challenge: the click points plus the service-side solve id,
/// needed to report a wrong answer back for a refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaAnswer {
    pub points: Vec<ClickPoint>,
    pub solve_id: Option<String>,
}

impl CaptchaAnswer {
    pub fn unattributed(points: Vec<ClickPoint>) -> Self {
        Self {
            points,
            solve_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptchaError {
    #[error("solver configuration error: {0}")]
    Configuration(String),

    #[error("solver service error: {0}")]
    Provider(String),

    #[error("solver timed out waiting for an answer")]
    Timeout,

    #[error("solver could not resolve the challenge: {0}")]
    Unresolved(String),
}

/// A click-captcha solving backend.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Short backend name for logging.
    fn name(&self) -> &'static str;

    /// Solve a click captcha: given the challenge image (PNG bytes) and the
    /// instruction caption, return the points to click in order.
    async fn solve(&self, image_png: &[u8], caption: &str)
        -> Result<CaptchaAnswer, CaptchaError>;

    /// Report a wrong answer back to the service, where supported.
    async fn report_failure(&self, _solve_id: &str) -> Result<(), CaptchaError> {
        Ok(())
    }
}
