//! Session model and credential document handling.
//!
//! A [`Session`] is the cookie set that identifies an authenticated caller to
//! CSDN. It is usable only when the three identity cookies the platform
//! checks on every request are present; anything less is treated as "no
//! session" rather than an error so the orchestrator can fall back to a
//! fresh login.

pub mod store;

pub use store::{CredentialStore, StoreError};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Identity cookies CSDN requires on authenticated requests.
pub const REQUIRED_COOKIES: [&str; 3] = ["UserToken", "UserInfo", "UserName"];

/// Authenticated cookie set plus verification metadata. Only the cookie map
/// is ever persisted; the verification timestamp lives and dies in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    cookies: BTreeMap<String, String>,
    last_verified_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a session from an iterator of cookie pairs.
    pub fn from_cookies<I, K, V>(cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cookies: cookies
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            last_verified_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// All three identity cookies are present.
    pub fn has_required_keys(&self) -> bool {
        REQUIRED_COOKIES
            .iter()
            .all(|name| self.cookies.contains_key(*name))
    }

    /// Identity cookies missing from this session, for diagnostics.
    pub fn missing_required_keys(&self) -> Vec<&'static str> {
        REQUIRED_COOKIES
            .iter()
            .copied()
            .filter(|name| !self.cookies.contains_key(*name))
            .collect()
    }

    pub fn last_verified_at(&self) -> Option<DateTime<Utc>> {
        self.last_verified_at
    }

    /// Record a successful live probe against the platform.
    pub fn mark_verified(&mut self) {
        self.last_verified_at = Some(Utc::now());
    }

    /// Union `cookies` into this session, new values winning on conflict.
    ///
    /// Returns the number of cookies that actually changed. Verification is
    /// invalidated only when an identity cookie was replaced, since WAF or
    /// tracking cookies churn constantly without affecting auth state.
    pub fn merge<I, K, V>(&mut self, cookies: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut changed = 0;
        for (name, value) in cookies {
            let name = name.into();
            let value = value.into();
            if self.cookies.get(&name) == Some(&value) {
                continue;
            }
            if REQUIRED_COOKIES.contains(&name.as_str()) {
                self.last_verified_at = None;
            }
            self.cookies.insert(name, value);
            changed += 1;
        }
        changed
    }

    /// Render the `Cookie` request header value for this session.
    pub fn cookie_header(&self) -> String {
        let mut header = String::new();
        for (name, value) in &self.cookies {
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(name);
            header.push('=');
            header.push_str(value);
        }
        header
    }
}

/// Parse a credential document in any of the three supported on-disk forms:
/// a JSON object (`{"name": "value"}`), a browser-export JSON list
/// (`[{"name": ..., "value": ...}]`), or a raw `Cookie` header string.
pub fn parse_credential_document(content: &str) -> Result<BTreeMap<String, String>, ParseError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => {
            let mut cookies = BTreeMap::new();
            for (name, value) in map {
                match value {
                    serde_json::Value::String(value) => {
                        cookies.insert(name, value);
                    }
                    other => {
                        cookies.insert(name, other.to_string());
                    }
                }
            }
            Ok(cookies)
        }
        Ok(serde_json::Value::Array(entries)) => {
            let mut cookies = BTreeMap::new();
            for entry in entries {
                let (Some(name), Some(value)) = (
                    entry.get("name").and_then(|v| v.as_str()),
                    entry.get("value").and_then(|v| v.as_str()),
                ) else {
                    return Err(ParseError::MalformedEntry);
                };
                cookies.insert(name.to_string(), value.to_string());
            }
            Ok(cookies)
        }
        Ok(_) => Err(ParseError::UnsupportedShape),
        Err(_) => {
            // Not JSON; fall back to the raw cookie-header form.
            let cookies = parse_cookie_string(trimmed);
            if cookies.is_empty() {
                Err(ParseError::UnsupportedShape)
            } else {
                Ok(cookies)
            }
        }
    }
}

/// Parse a browser-copied cookie header (`name1=value1; name2=value2`).
pub fn parse_cookie_string(raw: &str) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        cookies.insert(name.to_string(), value.trim().to_string());
    }
    cookies
}

/// Why a credential document could not be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("credential document is empty")]
    Empty,
    #[error("credential list entry is missing name/value fields")]
    MalformedEntry,
    #[error("credential document shape is not a cookie map, list, or header string")]
    UnsupportedShape,
}
