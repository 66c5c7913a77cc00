//! Browser fingerprint profiles and stealth launch parameters.
//!
//! Every disposable browser instance and every plain HTTP request carries a
//! coherent fingerprint picked from a small pool: user agent, viewport,
//! language and platform all come from the same profile so the pieces never
//! contradict each other. Profiles rotate per instance, never per request.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;

pub mod retry;

pub use retry::{classify_edge, with_retry, EdgeVerdict};

/// A coherent browser fingerprint: user agent, viewport, language and
/// platform drawn together so they never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvasionProfile {
    pub user_agent: &'static str,
    pub viewport: (u32, u32),
    pub accept_language: &'static str,
    pub platform: &'static str,
}

static PROFILES: Lazy<Vec<EvasionProfile>> = Lazy::new(|| {
    vec![
        EvasionProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
            viewport: (1920, 1080),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
            platform: "Win32",
        },
        EvasionProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
            viewport: (1536, 864),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
            platform: "Win32",
        },
        EvasionProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
            viewport: (1440, 900),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
            platform: "MacIntel",
        },
        EvasionProfile {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
            viewport: (1680, 1050),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
            platform: "MacIntel",
        },
        EvasionProfile {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
            viewport: (1920, 1080),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
            platform: "Linux x86_64",
        },
        EvasionProfile {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
            viewport: (1366, 768),
            accept_language: "zh-CN,zh;q=0.9,en;q=0.8",
            platform: "Win32",
        },
    ]
});

/// Pick a random profile for a new browser instance or HTTP client.
pub fn random_profile() -> EvasionProfile {
    let mut rng = rand::thread_rng();
    PROFILES
        .choose(&mut rng)
        .cloned()
        .unwrap_or_else(|| PROFILES[0].clone())
}

/// Chromium switches that suppress the obvious automation signals.
pub fn launch_flags() -> Vec<String> {
    [
        "--disable-blink-features=AutomationControlled",
        "--disable-infobars",
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-dev-shm-usage",
        "--disable-background-timer-throttling",
        "--disable-backgrounding-occluded-windows",
        "--disable-renderer-backgrounding",
        "--lang=zh-CN",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Script injected into every new document before page scripts run.
///
/// Masks `navigator.webdriver`, fills in the plugin list and language
/// preferences, and routes the permissions query for notifications through
/// the default-prompt path that real profiles report.
pub fn stealth_init_script(profile: &EvasionProfile) -> String {
    format!(
        r#"
Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
Object.defineProperty(navigator, 'languages', {{ get: () => ['zh-CN', 'zh', 'en'] }});
Object.defineProperty(navigator, 'platform', {{ get: () => '{platform}' }});
Object.defineProperty(navigator, 'plugins', {{
    get: () => [1, 2, 3, 4, 5].map(() => ({{ name: 'Chromium PDF Plugin' }}))
}});
window.chrome = window.chrome || {{ runtime: {{}} }};
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications'
        ? Promise.resolve({{ state: Notification.permission }})
        : originalQuery(parameters)
);
"#,
        platform = profile.platform
    )
}

/// Header set for the plain HTTP path, matching what the profile's browser
/// would send on a top-level navigation.
pub fn browser_headers(profile: &EvasionProfile) -> Vec<(&'static str, String)> {
    vec![
        ("User-Agent", profile.user_agent.to_string()),
        ("Accept-Language", profile.accept_language.to_string()),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8"
                .to_string(),
        ),
        ("Upgrade-Insecure-Requests", "1".to_string()),
        ("Sec-Fetch-Dest", "document".to_string()),
        ("Sec-Fetch-Mode", "navigate".to_string()),
        ("Sec-Fetch-Site", "none".to_string()),
        ("Sec-Fetch-User", "?1".to_string()),
    ]
}
