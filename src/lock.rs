//! Lock detection and target classification.
//!
//! The platform serves two gated content categories with distinct URL
//! shapes, lock markers, and unlock identifiers. Marker matching is
//! inherently heuristic: the tables below mirror what the platform currently
//! renders into locked pages, and are kept as enumerated lists so HTML
//! changes require touching one table instead of scattered conditionals.
//! Detection is fail-open by design, callers must treat a positive match as
//! "worth escalating", never as grounds to withhold content.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// Content categories with distinct lock markers and identifier rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentCategory {
    /// `blog.csdn.net/<author>/article/details/<numeric id>`
    Blog,
    /// `wenku.csdn.net/{answer|doc|column}/<slug>`
    Wenku,
}

/// Parsed retrieval target: category plus the unlock identifier extracted
/// from the URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetId {
    pub category: ContentCategory,
    pub id: String,
}

static BLOG_ARTICLE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/article/details/(\d+)").expect("blog id regex"));
static WENKU_DOC_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/(?:answer|doc|column)/([A-Za-z0-9_-]+)").expect("wenku id regex")
});
static WENKU_FALLBACK_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/(?:[^/]+/)?([A-Za-z0-9_-]+)/?$").expect("wenku fallback regex"));

impl TargetId {
    /// Extract the category and identifier from a target URL.
    ///
    /// This must run before any network call: an unextractable identifier is
    /// a caller error and must fail fast without consuming quota.
    pub fn parse(url: &Url) -> Result<Self, InvalidTarget> {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        if host == "wenku.csdn.net" {
            let path = url.path();
            let id = WENKU_DOC_ID
                .captures(path)
                .or_else(|| WENKU_FALLBACK_ID.captures(path))
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| InvalidTarget::new(url))?;
            return Ok(Self {
                category: ContentCategory::Wenku,
                id,
            });
        }

        if let Some(caps) = BLOG_ARTICLE_ID.captures(url.path()) {
            return Ok(Self {
                category: ContentCategory::Blog,
                id: caps[1].to_string(),
            });
        }

        Err(InvalidTarget::new(url))
    }
}

/// No unlock identifier could be extracted from the URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no article or wenku identifier in target url: {url}")]
pub struct InvalidTarget {
    pub url: String,
}

impl InvalidTarget {
    fn new(url: &Url) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

/// Markers rendered into VIP-locked blog articles.
const BLOG_LOCK_MARKERS: [&str; 6] = [
    r#"class="vip-mask""#,
    r#"class="read-all-content-btn""#,
    "vip-article-read",
    r#"data-vip="true""#,
    "vip-lock",
    "vip-mask",
];

/// Markers rendered into VIP-locked wenku documents.
const WENKU_LOCK_MARKERS: [&str; 8] = [
    "开通会员查看完整答案",
    "最低0.3元/天",
    "阅读全文",
    r#"class="open-btn-wrap""#,
    r#"data-vip="true""#,
    "继续阅读",
    "付费阅读",
    "会员专享",
];

/// Does `html` carry the lock markers of the given category?
///
/// Case-insensitive substring match over the enumerated marker table.
/// False positives are expected and tolerated; the escalation ladder
/// treats a surviving match as advisory only.
pub fn is_locked(html: &str, category: ContentCategory) -> bool {
    let markers: &[&str] = match category {
        ContentCategory::Blog => &BLOG_LOCK_MARKERS,
        ContentCategory::Wenku => &WENKU_LOCK_MARKERS,
    };

    let content = html.to_lowercase();
    for marker in markers {
        if content.contains(&marker.to_lowercase()) {
            log::debug!("lock marker matched ({category:?}): {marker}");
            return true;
        }
    }
    false
}

static BLOG_TITLE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["h1.title-article", ".article-title", "article h1", "title"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});
static WENKU_TITLE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["h1.title", ".title", "h1", "title"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});
static TITLE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-_].*?CSDN.*?$").expect("title suffix regex"));

/// Best-effort page title, with the platform suffix stripped when the
/// `<title>` tag was the only match.
pub fn extract_title(html: &str, category: ContentCategory) -> Option<String> {
    let selectors: &[Selector] = match category {
        ContentCategory::Blog => &BLOG_TITLE_SELECTORS,
        ContentCategory::Wenku => &WENKU_TITLE_SELECTORS,
    };

    let document = Html::parse_document(html);
    for selector in selectors {
        if let Some(element) = document.select(selector).next() {
            let text: String = element.text().collect::<String>().trim().to_string();
            if text.is_empty() {
                continue;
            }
            let cleaned = TITLE_SUFFIX.replace(&text, "").trim().to_string();
            if !cleaned.is_empty() {
                return Some(cleaned);
            }
            return Some(text);
        }
    }
    None
}
