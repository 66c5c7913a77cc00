//! Content-unlock API client.
//!
//! Locked items are released through an authenticated read-grant endpoint
//! keyed by the target identifier. The endpoint answers 200 when the grant
//! is issued and 400 when it was already held, so both count as success.
//! Wenku items are served from more than one API host depending on
//! document age; candidates are tried in order until one accepts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::lock::{ContentCategory, TargetId};
use crate::session::Session;

const BLOG_UNLOCK_URL: &str = "https://blog.csdn.net/phoenix/web/v1/vip-article-read";
const WENKU_UNLOCK_URLS: [&str; 3] = [
    "https://wenku.csdn.net/api/phoenix/web/v1/vip-article-read",
    "https://wenku.csdn.net/phoenix/web/v1/vip-article-read",
    "https://blog.csdn.net/phoenix/web/v1/vip-article-read",
];

const UNLOCK_TIMEOUT: Duration = Duration::from_secs(20);

/// What the grant endpoint said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Grant issued (API code 200).
    Unlocked,
    /// Grant already held (API code 400).
    AlreadyUnlocked,
    /// The endpoint declined, with its own words.
    Rejected(String),
}

impl UnlockOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Unlocked | Self::AlreadyUnlocked)
    }
}

#[derive(Debug, Error)]
pub enum UnlockError {
    #[error("unlock request timed out")]
    Timeout,

    #[error("unlock transport failed: {0}")]
    Transport(String),

    #[error("unreadable unlock response: {0}")]
    Malformed(String),
}

/// Anything that can release a locked item for the session's account.
#[async_trait]
pub trait Unlocker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn unlock(
        &self,
        target: &TargetId,
        session: &Session,
    ) -> Result<UnlockOutcome, UnlockError>;
}

pub struct UnlockClient {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

impl UnlockClient {
    pub fn new() -> Result<Self, UnlockError> {
        let client = reqwest::Client::builder()
            .timeout(UNLOCK_TIMEOUT)
            .build()
            .map_err(|e| UnlockError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post_grant(
        &self,
        url: &str,
        target: &TargetId,
        session: &Session,
    ) -> Result<UnlockOutcome, UnlockError> {
        let payload = match target.category {
            ContentCategory::Blog => json!({ "articleId": target.id }),
            ContentCategory::Wenku => json!({ "articleId": target.id, "wenkuId": target.id }),
        };

        let response = self
            .client
            .post(url)
            .header(http::header::COOKIE, session.cookie_header())
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UnlockError::Timeout
                } else {
                    UnlockError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body: GrantResponse = response
            .json()
            .await
            .map_err(|e| UnlockError::Malformed(format!("{status}: {e}")))?;

        Ok(match body.code {
            200 => UnlockOutcome::Unlocked,
            400 => UnlockOutcome::AlreadyUnlocked,
            code => UnlockOutcome::Rejected(format!(
                "code {code}: {}",
                body.message.unwrap_or_default()
            )),
        })
    }
}

#[async_trait]
impl Unlocker for UnlockClient {
    fn name(&self) -> &'static str {
        "read-grant"
    }

    async fn unlock(
        &self,
        target: &TargetId,
        session: &Session,
    ) -> Result<UnlockOutcome, UnlockError> {
        let candidates: &[&str] = match target.category {
            ContentCategory::Blog => &[BLOG_UNLOCK_URL],
            ContentCategory::Wenku => &WENKU_UNLOCK_URLS,
        };

        let mut last: Option<UnlockOutcome> = None;
        let mut last_err: Option<UnlockError> = None;
        for url in candidates {
            match self.post_grant(url, target, session).await {
                Ok(outcome) if outcome.is_success() => {
                    log::info!("unlock granted for {} via {url}", target.id);
                    return Ok(outcome);
                }
                Ok(outcome) => {
                    log::debug!("unlock declined at {url}: {outcome:?}");
                    last = Some(outcome);
                }
                Err(err) => {
                    log::debug!("unlock transport failed at {url}: {err}");
                    last_err = Some(err);
                }
            }
        }

        match (last, last_err) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(err)) => Err(err),
            (None, None) => Err(UnlockError::Transport("no unlock endpoint".into())),
        }
    }
}
