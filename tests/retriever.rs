//! Escalation-ladder tests driven by scripted transports.
//!
//! The retriever's three seams (navigator, authenticator, unlocker) are
//! replaced with scripted fakes so each rung of the ladder can be walked
//! deterministically, including the failure paths no live server would
//! produce on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use csdngate::{
    Authenticator, CredentialStore, FetchedDocument, LockState, LoginError, LoginFailure,
    LoginState, NavigateError, Navigator, Retriever, RetrieveError, RetrieveStrategy, Session,
    TargetId, UnlockError, UnlockOutcome, Unlocker,
};

const BLOG_URL: &str = "https://blog.csdn.net/alice/article/details/151638092";

const OPEN_PAGE: &str = "<html><head><title>Rust异步编程-CSDN博客</title></head>\
                         <body><article>full text</article></body></html>";
const LOCKED_PAGE: &str = r#"<html><head><title>Rust异步编程-CSDN博客</title></head>
    <body><div class="vip-mask">VIP文章</div></body></html>"#;

fn page(html: &str) -> FetchedDocument {
    FetchedDocument {
        url: Url::parse(BLOG_URL).unwrap(),
        status: 200,
        html: html.to_string(),
        cookies: Vec::new(),
    }
}

/// Navigator that replays a scripted sequence of outcomes. The last script
/// entry repeats once the script runs dry. Every call records the cookie
/// header it was given so tests can check what a rung actually sent.
struct ScriptedNavigator {
    script: Mutex<VecDeque<Result<FetchedDocument, &'static str>>>,
    calls: AtomicU32,
    cookie_headers: Mutex<Vec<String>>,
}

impl ScriptedNavigator {
    fn new(script: Vec<Result<FetchedDocument, &'static str>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            cookie_headers: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn cookie_headers(&self) -> Vec<String> {
        self.cookie_headers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Navigator for ScriptedNavigator {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn navigate(
        &self,
        _url: &Url,
        session: &Session,
    ) -> Result<FetchedDocument, NavigateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cookie_headers.lock().unwrap().push(session.cookie_header());
        let mut script = self.script.lock().unwrap();
        let step = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().expect("navigator script is empty")
        };
        match step {
            Ok(doc) => Ok(doc),
            Err("timeout") => Err(NavigateError::Timeout),
            Err(other) => Err(NavigateError::Connect(other.to_string())),
        }
    }
}

struct ScriptedUnlocker {
    grant: bool,
    calls: AtomicU32,
}

impl ScriptedUnlocker {
    fn granting() -> Arc<Self> {
        Arc::new(Self {
            grant: true,
            calls: AtomicU32::new(0),
        })
    }

    fn refusing() -> Arc<Self> {
        Arc::new(Self {
            grant: false,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Unlocker for ScriptedUnlocker {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn unlock(
        &self,
        _target: &TargetId,
        _session: &Session,
    ) -> Result<UnlockOutcome, UnlockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.grant {
            Ok(UnlockOutcome::Unlocked)
        } else {
            Ok(UnlockOutcome::Rejected("code 403: not a member".into()))
        }
    }
}

struct ScriptedAuthenticator {
    succeed: bool,
    calls: AtomicU32,
}

impl ScriptedAuthenticator {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            calls: AtomicU32::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: false,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn identity_session() -> Session {
    Session::from_cookies([
        ("UserToken", "tok"),
        ("UserInfo", "info"),
        ("UserName", "alice"),
    ])
}

#[async_trait]
impl Authenticator for ScriptedAuthenticator {
    async fn login(&self) -> Result<Session, LoginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            let mut session = identity_session();
            session.mark_verified();
            Ok(session)
        } else {
            Err(LoginError {
                state: LoginState::SubmitClicked,
                failure: LoginFailure::CredentialsRejected("bad password".into()),
            })
        }
    }
}

struct Harness {
    retriever: Retriever,
    navigator: Arc<ScriptedNavigator>,
    fallback: Arc<ScriptedNavigator>,
    unlocker: Arc<ScriptedUnlocker>,
    authenticator: Arc<ScriptedAuthenticator>,
    store: Arc<CredentialStore>,
    _dir: tempfile::TempDir,
}

fn harness(
    navigator: Arc<ScriptedNavigator>,
    fallback: Arc<ScriptedNavigator>,
    unlocker: Arc<ScriptedUnlocker>,
    authenticator: Arc<ScriptedAuthenticator>,
    seed_session: bool,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CredentialStore::new(dir.path().join("cookies.json")));
    if seed_session {
        store.save(&identity_session()).unwrap();
    }

    // Scripts address content fetches only; the liveness probe gets its own
    // dedicated tests below.
    let retriever = Retriever::builder()
        .with_navigator(navigator.clone())
        .with_browser_fallback(fallback.clone())
        .with_unlocker(unlocker.clone())
        .with_authenticator(authenticator.clone())
        .with_store(store.clone())
        .with_verify_on_load(false)
        .build()
        .unwrap();

    Harness {
        retriever,
        navigator,
        fallback,
        unlocker,
        authenticator,
        store,
        _dir: dir,
    }
}

fn blog_url() -> Url {
    Url::parse(BLOG_URL).unwrap()
}

#[tokio::test]
async fn open_page_needs_one_fetch_and_no_unlock() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    assert_eq!(doc.title.as_deref(), Some("Rust异步编程"));
    assert_eq!(doc.attempts.len(), 1);
    assert_eq!(doc.attempts[0].strategy, RetrieveStrategy::Direct);
    assert_eq!(doc.attempts[0].outcome, LockState::Unlocked);
    assert_eq!(h.navigator.calls(), 1);
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(h.unlocker.calls(), 0);
    assert_eq!(h.authenticator.calls(), 0);
}

#[tokio::test]
async fn locked_page_is_released_by_unlock_and_refetch() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE)), Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    assert_eq!(
        doc.attempts.last().unwrap().strategy,
        RetrieveStrategy::UnlockThenRefetch
    );
    assert_eq!(h.navigator.calls(), 2);
    assert_eq!(h.unlocker.calls(), 1);
    assert_eq!(h.fallback.calls(), 0);
}

#[tokio::test]
async fn refused_unlock_escalates_to_browser() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::refusing(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    assert_eq!(
        doc.attempts.last().unwrap().strategy,
        RetrieveStrategy::BrowserFallback
    );
    assert_eq!(h.fallback.calls(), 1);
    assert_eq!(h.authenticator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_transport_timeouts_fail_hard() {
    let h = harness(
        ScriptedNavigator::new(vec![Err("timeout")]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let err = h.retriever.retrieve(&blog_url()).await.unwrap_err();
    assert!(matches!(err, RetrieveError::TransportFailure(_)), "{err}");
    // Exactly the retry budget, and no browser substitution for transport
    // errors.
    assert_eq!(h.navigator.calls(), 3);
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(h.unlocker.calls(), 0);
}

fn edge_down_page() -> FetchedDocument {
    FetchedDocument {
        url: Url::parse(BLOG_URL).unwrap(),
        status: 521,
        html: "<html><body>origin unreachable</body></html>".to_string(),
        cookies: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn transient_52x_is_retried_before_any_substitution() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(edge_down_page()), Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    // The second attempt recovered; the browser never came into it.
    assert_eq!(h.navigator.calls(), 2);
    assert_eq!(h.fallback.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_52x_exhausts_backoff_then_substitutes_browser() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(edge_down_page())]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    // The full retry budget is spent against the edge before substituting.
    assert_eq!(h.navigator.calls(), 3);
    assert_eq!(h.fallback.calls(), 1);
}

#[tokio::test]
async fn response_cookies_are_persisted_and_reused_by_later_rungs() {
    let mut refreshed = page(LOCKED_PAGE);
    refreshed.cookies = vec![("dc_session_id".to_string(), "fresh".to_string())];
    let h = harness(
        ScriptedNavigator::new(vec![Ok(refreshed), Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);

    // The refetch after the unlock grant already carried the cookie the
    // first response set.
    let headers = h.navigator.cookie_headers();
    assert_eq!(headers.len(), 2);
    assert!(!headers[0].contains("dc_session_id"));
    assert!(headers[1].contains("dc_session_id=fresh"));

    // And the merged set went to disk alongside the identity cookies.
    let reloaded = h.store.load().unwrap().expect("persisted session");
    assert_eq!(reloaded.get("dc_session_id"), Some("fresh"));
    assert_eq!(reloaded.get("UserToken"), Some("tok"));
}

#[tokio::test]
async fn interstitial_is_refetched_through_the_browser() {
    let interstitial = "<html><body>Checking your browser before accessing</body></html>";
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(interstitial))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    assert_eq!(h.navigator.calls(), 1);
    assert_eq!(h.fallback.calls(), 1);
}

#[tokio::test]
async fn invalid_target_touches_nothing() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let url = Url::parse("https://blog.csdn.net/alice").unwrap();
    let err = h.retriever.retrieve(&url).await.unwrap_err();
    assert!(matches!(err, RetrieveError::InvalidTarget(_)), "{err}");
    assert_eq!(h.navigator.calls(), 0);
    assert_eq!(h.fallback.calls(), 0);
    assert_eq!(h.unlocker.calls(), 0);
    assert_eq!(h.authenticator.calls(), 0);
}

#[tokio::test]
async fn missing_session_triggers_login_before_fetching() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        false,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    assert_eq!(h.authenticator.calls(), 1);
}

#[tokio::test]
async fn unavailable_login_with_no_stored_session_is_fatal() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::failing(),
        false,
    );

    let err = h.retriever.retrieve(&blog_url()).await.unwrap_err();
    assert!(
        matches!(err, RetrieveError::AuthenticationUnavailable(_)),
        "{err}"
    );
    assert_eq!(h.navigator.calls(), 0);
}

#[tokio::test]
async fn exhausted_ladder_fails_open_with_locked_content() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE))]),
        ScriptedUnlocker::refusing(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(doc.locked);
    assert!(!doc.html.is_empty());
    assert_eq!(doc.attempts.len(), 4);
    assert!(doc.attempts.iter().all(|a| !a.succeeded()));
    // Every rung saw a document on this walk, so nothing is Unavailable.
    assert!(doc
        .attempts
        .iter()
        .all(|a| a.outcome == LockState::Locked));
    // The relogin rung was actually walked.
    assert_eq!(h.authenticator.calls(), 1);
}

#[tokio::test]
async fn relogin_rescues_a_stale_session() {
    // Locked through direct, unlock-refetch, and browser; open only after
    // the fresh login.
    let h = harness(
        ScriptedNavigator::new(vec![
            Ok(page(LOCKED_PAGE)),
            Ok(page(LOCKED_PAGE)),
            Ok(page(OPEN_PAGE)),
        ]),
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE))]),
        ScriptedUnlocker::granting(),
        ScriptedAuthenticator::succeeding(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    assert_eq!(
        doc.attempts.last().unwrap().strategy,
        RetrieveStrategy::ReloginThenRetry
    );
    assert_eq!(h.authenticator.calls(), 1);
    assert_eq!(h.unlocker.calls(), 2);
}

#[tokio::test]
async fn login_failure_during_escalation_still_returns_content() {
    let h = harness(
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE))]),
        ScriptedNavigator::new(vec![Ok(page(LOCKED_PAGE))]),
        ScriptedUnlocker::refusing(),
        ScriptedAuthenticator::failing(),
        true,
    );

    let doc = h.retriever.retrieve(&blog_url()).await.unwrap();
    assert!(doc.locked);
    assert!(doc.html.contains("vip-mask"));
    assert_eq!(h.authenticator.calls(), 1);
    // The relogin rung produced nothing to classify.
    assert_eq!(
        doc.attempts.last().unwrap().outcome,
        LockState::Unavailable
    );
}

#[tokio::test]
async fn probe_rejected_session_is_replaced_before_fetching() {
    let passport_bounce = FetchedDocument {
        url: Url::parse("https://passport.csdn.net/login?from=www").unwrap(),
        status: 200,
        html: "<html><body>login</body></html>".to_string(),
        cookies: Vec::new(),
    };
    let navigator = ScriptedNavigator::new(vec![Ok(passport_bounce), Ok(page(OPEN_PAGE))]);
    let authenticator = ScriptedAuthenticator::succeeding();

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CredentialStore::new(dir.path().join("cookies.json")));
    store.save(&identity_session()).unwrap();

    // No explicit opt-in: a disk-loaded session is probed by default.
    let retriever = Retriever::builder()
        .with_navigator(navigator.clone())
        .with_browser_fallback(ScriptedNavigator::new(vec![Ok(page(OPEN_PAGE))]))
        .with_unlocker(ScriptedUnlocker::granting())
        .with_authenticator(authenticator.clone())
        .with_store(store.clone())
        .build()
        .unwrap();

    let doc = retriever.retrieve(&blog_url()).await.unwrap();
    assert!(!doc.locked);
    // Probe fetch, then the content fetch under the fresh session.
    assert_eq!(navigator.calls(), 2);
    assert_eq!(authenticator.calls(), 1);
}

/// End-to-end retrieval against the live platform.
#[tokio::test]
#[ignore = "Requires network access and real CSDN credentials in the environment"]
async fn live_retrieve() {
    let settings = csdngate::Settings::from_env().expect("credentials in environment");
    let retriever = Retriever::from_settings(&settings).expect("retriever setup");
    let url = Url::parse(BLOG_URL).unwrap();
    let doc = retriever.retrieve(&url).await.expect("retrieval");
    assert!(!doc.html.is_empty());
}
