//! Edge response classification and retry backoff.
//!
//! The platform sits behind an edge that answers with 52x statuses when the
//! origin is unreachable, and occasionally serves an HTML interstitial with
//! a 200 status instead. The 52x responses are transient and worth backing
//! off on; the interstitial is the signal to escalate from plain HTTP to a
//! real browser.

use std::future::Future;
use std::time::Duration;

/// What the edge gave us, independent of what the origin wanted to say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeVerdict {
    /// A genuine origin response.
    Ok,
    /// The edge reported the origin down (HTTP 520-527).
    ServerDown(u16),
    /// An anti-automation interstitial served in place of content.
    Interstitial,
}

/// Markers that identify an interstitial page regardless of status code.
const INTERSTITIAL_MARKERS: [&str; 7] = [
    "Checking your browser",
    "Just a moment",
    "cdn-cgi/challenge-platform",
    "cf-browser-verification",
    "cf_chl_opt",
    "安全验证",
    "访问异常",
];

/// Classify an edge response by status code and body content.
pub fn classify_edge(status: u16, body: &str) -> EdgeVerdict {
    if (520..=527).contains(&status) {
        return EdgeVerdict::ServerDown(status);
    }
    for marker in INTERSTITIAL_MARKERS {
        if body.contains(marker) {
            return EdgeVerdict::Interstitial;
        }
    }
    EdgeVerdict::Ok
}

/// Run `operation` up to `attempts` times, sleeping `2^attempt` seconds
/// between tries. The final error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(attempts: u32, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < attempts => {
                let delay = Duration::from_secs(1u64 << attempt);
                log::warn!(
                    "attempt {}/{attempts} failed ({err}), retrying in {delay:?}",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
