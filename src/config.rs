//! Environment-driven configuration.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::captcha::{CaptchaSolver, ChaoJiYingSolver, ManualSolver, TwoCaptchaSolver};

const DEFAULT_COOKIES_FILE: &str = "cookies.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("solver configuration rejected: {0}")]
    Solver(String),
}

/// Which challenge-solving backend to use.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SolverChoice {
    ChaoJiYing,
    TwoCaptcha,
    #[default]
    Manual,
}

/// Runtime settings, read once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub username: String,
    pub password: String,
    pub cookies_file: PathBuf,
    pub solver: SolverChoice,
    pub headful: bool,
    pub extra_browser_args: Vec<String>,
}

impl Settings {
    /// Read settings from the environment. `CSDN_USERNAME` and
    /// `CSDN_PASSWORD` are mandatory; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let username =
            env::var("CSDN_USERNAME").map_err(|_| ConfigError::Missing("CSDN_USERNAME"))?;
        let password =
            env::var("CSDN_PASSWORD").map_err(|_| ConfigError::Missing("CSDN_PASSWORD"))?;

        let cookies_file = env::var("COOKIES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_COOKIES_FILE));

        let solver = match env::var("CAPTCHA_SERVICE").as_deref() {
            Ok("chaojiying") => SolverChoice::ChaoJiYing,
            Ok("2captcha") => SolverChoice::TwoCaptcha,
            Ok("manual") | Err(_) => SolverChoice::Manual,
            Ok(other) => {
                log::warn!("unknown CAPTCHA_SERVICE {other:?}, falling back to manual");
                SolverChoice::Manual
            }
        };

        let headful = env::var("CSDNGATE_HEADFUL")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let extra_browser_args = env::var("CSDNGATE_EXTRA_ARGS")
            .map(|raw| {
                raw.split_whitespace()
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            username,
            password,
            cookies_file,
            solver,
            headful,
            extra_browser_args,
        })
    }

    /// Build the challenge solver the settings name, reading backend
    /// credentials from the environment on demand.
    pub fn solver(&self) -> Result<Arc<dyn CaptchaSolver>, ConfigError> {
        match self.solver {
            SolverChoice::ChaoJiYing => {
                let user = env::var("CHAOJIYING_USERNAME")
                    .map_err(|_| ConfigError::Missing("CHAOJIYING_USERNAME"))?;
                let pass = env::var("CHAOJIYING_PASSWORD")
                    .map_err(|_| ConfigError::Missing("CHAOJIYING_PASSWORD"))?;
                let soft_id = env::var("CHAOJIYING_SOFT_ID").unwrap_or_else(|_| "1".to_string());
                let solver = ChaoJiYingSolver::new(&user, &pass, &soft_id)
                    .map_err(|e| ConfigError::Solver(e.to_string()))?;
                Ok(Arc::new(solver))
            }
            SolverChoice::TwoCaptcha => {
                let key = env::var("TWOCAPTCHA_API_KEY")
                    .map_err(|_| ConfigError::Missing("TWOCAPTCHA_API_KEY"))?;
                let solver = TwoCaptchaSolver::new(&key)
                    .map_err(|e| ConfigError::Solver(e.to_string()))?;
                Ok(Arc::new(solver))
            }
            SolverChoice::Manual => Ok(Arc::new(ManualSolver::new())),
        }
    }
}
