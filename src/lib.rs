//! # csdngate
//!
//! Authenticated retrieval of gated CSDN content: blog articles and wenku
//! documents that the platform serves behind a membership lock.
//!
//! The crate drives the whole pipeline: password login through a disposable
//! stealth browser (click-captcha included), cookie session persistence,
//! fingerprint-profiled fetching with a browser fallback for edge
//! interstitials, lock-marker detection, and the read-grant escalation that
//! releases locked items for a member account.
//!
//! Lock handling fails open: once a document is in hand it is always
//! returned, at worst still marked locked.
//!
//! ## Example
//!
//! ```no_run
//! use csdngate::{Retriever, Settings};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     let retriever = Retriever::from_settings(&settings)?;
//!     let url = Url::parse("https://blog.csdn.net/someone/article/details/151638092")?;
//!     let document = retriever.retrieve(&url).await?;
//!     println!("{} ({} bytes)", document.title.as_deref().unwrap_or("untitled"), document.html.len());
//!     Ok(())
//! }
//! ```

mod retriever;

pub mod browser;
pub mod captcha;
pub mod config;
pub mod evasion;
pub mod lock;
pub mod login;
pub mod session;
pub mod transport;
pub mod unlock;

pub use crate::retriever::{
    BuildError,
    LockState,
    Retriever,
    RetrieverBuilder,
    RetrieveError,
    RetrieveStrategy,
    RetrievedDocument,
    UnlockAttempt,
};

pub use crate::config::{ConfigError, Settings, SolverChoice};

pub use crate::lock::{ContentCategory, InvalidTarget, TargetId};

pub use crate::login::{Authenticator, LoginError, LoginFailure, LoginFlow, LoginState};

pub use crate::session::store::CredentialStore;
pub use crate::session::{Session, REQUIRED_COOKIES};

pub use crate::captcha::{
    CaptchaAnswer,
    CaptchaError,
    CaptchaSolver,
    ChaoJiYingSolver,
    ClickPoint,
    ManualSolver,
    TwoCaptchaSolver,
};

pub use crate::transport::{
    BrowserNavigator,
    FetchedDocument,
    HttpNavigator,
    NavigateError,
    Navigator,
};

pub use crate::unlock::{UnlockClient, UnlockError, UnlockOutcome, Unlocker};

pub use crate::evasion::{EdgeVerdict, EvasionProfile};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
