//! Fetch, detect, unlock.
//!
//! The retriever turns a target URL into the best document it can get for
//! the configured account, escalating through a fixed ladder when the page
//! comes back lock-marked: refetch after an unlock grant, then a real
//! browser, then a fresh login. Lock handling fails open: once a document
//! is in hand it is always returned, at worst still marked locked. Hard
//! errors are reserved for the cases where there is nothing to return at
//! all.

use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::Settings;
use crate::evasion::{self, EdgeVerdict};
use crate::lock::{self, InvalidTarget, TargetId};
use crate::login::{Authenticator, LoginFlow};
use crate::session::store::CredentialStore;
use crate::session::Session;
use crate::transport::{BrowserNavigator, FetchedDocument, HttpNavigator, NavigateError, Navigator};
use crate::unlock::{UnlockClient, Unlocker};

const TRANSPORT_ATTEMPTS: u32 = 3;
const DEFAULT_BUDGET: Duration = Duration::from_secs(300);

/// Probe target for session liveness: the homepage bounces logged-out
/// callers to the passport host.
static PROBE_URL: Lazy<Url> =
    Lazy::new(|| Url::parse("https://www.csdn.net/").expect("probe url"));

/// Escalation rung that produced (or tried to produce) a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveStrategy {
    /// Plain authenticated fetch.
    Direct,
    /// Unlock grant followed by a refetch.
    UnlockThenRefetch,
    /// Refetch through a disposable browser.
    BrowserFallback,
    /// Fresh login, then unlock and refetch again.
    ReloginThenRetry,
}

/// What a rung left the page in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// The rung produced the full content.
    Unlocked,
    /// The rung produced a document that is still lock-marked.
    Locked,
    /// The rung failed outright and produced nothing to classify.
    Unavailable,
}

impl LockState {
    fn of(html: &str, category: lock::ContentCategory) -> Self {
        if lock::is_locked(html, category) {
            LockState::Locked
        } else {
            LockState::Unlocked
        }
    }
}

/// One rung of the ladder as it was actually walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockAttempt {
    pub strategy: RetrieveStrategy,
    pub outcome: LockState,
}

impl UnlockAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == LockState::Unlocked
    }
}

/// The retrieved page plus what it took to get it.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub url: Url,
    pub html: String,
    pub title: Option<String>,
    /// Still lock-marked after the full ladder. Advisory, the content is
    /// whatever the server rendered.
    pub locked: bool,
    pub attempts: Vec<UnlockAttempt>,
}

#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    InvalidTarget(#[from] InvalidTarget),

    #[error("no usable session and login failed: {0}")]
    AuthenticationUnavailable(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("retrieval exceeded {0:?}")]
    Timeout(Duration),
}

/// Failure shape inside the transport retry loop. A 52x edge status counts
/// as retryable even though it arrives as a well-formed response.
#[derive(Debug, Error)]
enum FetchFailure {
    #[error(transparent)]
    Transport(NavigateError),
    #[error("edge reported the origin down (HTTP {0})")]
    EdgeDown(u16),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("retriever is missing a {0}")]
    MissingComponent(&'static str),

    #[error("transport setup failed: {0}")]
    Transport(String),
}

/// Orchestrates fetch, lock detection, and the escalation ladder.
pub struct Retriever {
    navigator: Arc<dyn Navigator>,
    fallback: Arc<dyn Navigator>,
    authenticator: Arc<dyn Authenticator>,
    unlocker: Arc<dyn Unlocker>,
    store: Arc<CredentialStore>,
    transport_attempts: u32,
    budget: Duration,
    verify_on_load: bool,
}

#[derive(Default)]
pub struct RetrieverBuilder {
    navigator: Option<Arc<dyn Navigator>>,
    fallback: Option<Arc<dyn Navigator>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    unlocker: Option<Arc<dyn Unlocker>>,
    store: Option<Arc<CredentialStore>>,
    transport_attempts: Option<u32>,
    budget: Option<Duration>,
    verify_on_load: Option<bool>,
}

impl RetrieverBuilder {
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn with_browser_fallback(mut self, fallback: Arc<dyn Navigator>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_unlocker(mut self, unlocker: Arc<dyn Unlocker>) -> Self {
        self.unlocker = Some(unlocker);
        self
    }

    pub fn with_store(mut self, store: Arc<CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transport_attempts(mut self, attempts: u32) -> Self {
        self.transport_attempts = Some(attempts.max(1));
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Probe a freshly loaded session against the homepage before trusting
    /// it. On by default; costs one extra fetch when cold.
    pub fn with_verify_on_load(mut self, verify: bool) -> Self {
        self.verify_on_load = Some(verify);
        self
    }

    pub fn build(self) -> Result<Retriever, BuildError> {
        let navigator = match self.navigator {
            Some(n) => n,
            None => Arc::new(
                HttpNavigator::new().map_err(|e| BuildError::Transport(e.to_string()))?,
            ),
        };
        let fallback = self
            .fallback
            .unwrap_or_else(|| Arc::new(BrowserNavigator::new(true, Vec::new())));
        let authenticator = self
            .authenticator
            .ok_or(BuildError::MissingComponent("authenticator"))?;
        let unlocker = self
            .unlocker
            .ok_or(BuildError::MissingComponent("unlocker"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(CredentialStore::new("cookies.json")));

        Ok(Retriever {
            navigator,
            fallback,
            authenticator,
            unlocker,
            store,
            transport_attempts: self.transport_attempts.unwrap_or(TRANSPORT_ATTEMPTS),
            budget: self.budget.unwrap_or(DEFAULT_BUDGET),
            verify_on_load: self.verify_on_load.unwrap_or(true),
        })
    }
}

impl Retriever {
    pub fn builder() -> RetrieverBuilder {
        RetrieverBuilder::default()
    }

    /// Wire a retriever from environment settings: password login with the
    /// configured solver, the read-grant client, and a browser fallback.
    pub fn from_settings(settings: &Settings) -> Result<Self, BuildError> {
        let solver = settings
            .solver()
            .map_err(|e| BuildError::Transport(e.to_string()))?;
        let login = LoginFlow::new(&settings.username, &settings.password, solver)
            .with_headful(settings.headful)
            .with_extra_args(settings.extra_browser_args.clone());
        let unlocker =
            UnlockClient::new().map_err(|e| BuildError::Transport(e.to_string()))?;

        Self::builder()
            .with_authenticator(Arc::new(login))
            .with_unlocker(Arc::new(unlocker))
            .with_browser_fallback(Arc::new(BrowserNavigator::new(
                !settings.headful,
                settings.extra_browser_args.clone(),
            )))
            .with_store(Arc::new(CredentialStore::new(&settings.cookies_file)))
            .build()
    }

    /// Retrieve under the configured wall-clock budget.
    pub async fn retrieve(&self, url: &Url) -> Result<RetrievedDocument, RetrieveError> {
        self.retrieve_with_deadline(url, self.budget).await
    }

    pub async fn retrieve_with_deadline(
        &self,
        url: &Url,
        budget: Duration,
    ) -> Result<RetrievedDocument, RetrieveError> {
        // Target validation happens before the clock starts and before any
        // network traffic.
        let target = TargetId::parse(url)?;
        tokio::time::timeout(budget, self.run(url, &target))
            .await
            .map_err(|_| RetrieveError::Timeout(budget))?
    }

    async fn run(
        &self,
        url: &Url,
        target: &TargetId,
    ) -> Result<RetrievedDocument, RetrieveError> {
        let mut session = self.ensure_session().await?;
        let mut attempts = Vec::new();

        // Rung 1: plain authenticated fetch.
        let mut document = self.fetch(url, &mut session).await?;
        if !lock::is_locked(&document.html, target.category) {
            attempts.push(UnlockAttempt {
                strategy: RetrieveStrategy::Direct,
                outcome: LockState::Unlocked,
            });
            return Ok(self.finish(document, target, false, attempts));
        }
        attempts.push(UnlockAttempt {
            strategy: RetrieveStrategy::Direct,
            outcome: LockState::Locked,
        });
        log::info!("{} is lock-marked, escalating", target.id);

        // Rung 2: unlock grant, then refetch. A failed refetch is not fatal
        // here, the locked document is already in hand.
        if self.try_unlock(target, &session).await {
            match self.fetch(url, &mut session).await {
                Ok(doc) => {
                    let outcome = LockState::of(&doc.html, target.category);
                    attempts.push(UnlockAttempt {
                        strategy: RetrieveStrategy::UnlockThenRefetch,
                        outcome,
                    });
                    document = doc;
                    if outcome == LockState::Unlocked {
                        return Ok(self.finish(document, target, false, attempts));
                    }
                }
                Err(err) => {
                    log::warn!("refetch after unlock failed: {err}");
                    attempts.push(UnlockAttempt {
                        strategy: RetrieveStrategy::UnlockThenRefetch,
                        outcome: LockState::Unavailable,
                    });
                }
            }
        } else {
            attempts.push(UnlockAttempt {
                strategy: RetrieveStrategy::UnlockThenRefetch,
                outcome: LockState::Locked,
            });
        }

        // Rung 3: a real browser sees the page as a member would.
        match self.fetch_via(&*self.fallback, url, &mut session, false).await {
            Ok(doc) => {
                let outcome = LockState::of(&doc.html, target.category);
                attempts.push(UnlockAttempt {
                    strategy: RetrieveStrategy::BrowserFallback,
                    outcome,
                });
                document = doc;
                if outcome == LockState::Unlocked {
                    return Ok(self.finish(document, target, false, attempts));
                }
            }
            Err(err) => {
                log::warn!("browser fallback failed: {err}");
                attempts.push(UnlockAttempt {
                    strategy: RetrieveStrategy::BrowserFallback,
                    outcome: LockState::Unavailable,
                });
            }
        }

        // Rung 4: the stored session may be stale in a way the server does
        // not admit to. Drop it, log in fresh, then unlock and refetch once
        // more. A login failure here is not fatal: content is already in
        // hand.
        if let Err(err) = self.store.clear() {
            log::warn!("failed to clear stale session: {err}");
        }
        match self.relogin().await {
            Ok(fresh) => {
                session = fresh;
                self.try_unlock(target, &session).await;
                match self.fetch(url, &mut session).await {
                    Ok(doc) => {
                        let outcome = LockState::of(&doc.html, target.category);
                        attempts.push(UnlockAttempt {
                            strategy: RetrieveStrategy::ReloginThenRetry,
                            outcome,
                        });
                        document = doc;
                        if outcome == LockState::Unlocked {
                            return Ok(self.finish(document, target, false, attempts));
                        }
                    }
                    Err(err) => {
                        log::warn!("refetch after relogin failed: {err}");
                        attempts.push(UnlockAttempt {
                            strategy: RetrieveStrategy::ReloginThenRetry,
                            outcome: LockState::Unavailable,
                        });
                    }
                }
            }
            Err(err) => {
                log::warn!("relogin during escalation failed: {err}");
                attempts.push(UnlockAttempt {
                    strategy: RetrieveStrategy::ReloginThenRetry,
                    outcome: LockState::Unavailable,
                });
            }
        }

        // Ladder exhausted: return what we have, still marked locked.
        log::warn!("{} stayed lock-marked after full escalation", target.id);
        Ok(self.finish(document, target, true, attempts))
    }

    fn finish(
        &self,
        document: FetchedDocument,
        target: &TargetId,
        locked: bool,
        attempts: Vec<UnlockAttempt>,
    ) -> RetrievedDocument {
        let title = lock::extract_title(&document.html, target.category);
        RetrievedDocument {
            url: document.url,
            html: document.html,
            title,
            locked,
            attempts,
        }
    }

    /// Load the persisted session or log in for a fresh one. Only this
    /// initial path treats a login failure as fatal; at that point there is
    /// no content to fall back to.
    async fn ensure_session(&self) -> Result<Session, RetrieveError> {
        match self.store.load() {
            Ok(Some(mut session)) => {
                log::debug!("using stored session ({} cookie(s))", session.len());
                if !self.verify_on_load
                    || session.last_verified_at().is_some()
                    || self.verify(&mut session).await
                {
                    return Ok(session);
                }
                log::info!("stored session rejected by probe, logging in fresh");
                if let Err(err) = self.store.clear() {
                    log::warn!("failed to clear rejected session: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("credential store unreadable ({err}), logging in fresh"),
        }
        self.relogin()
            .await
            .map_err(RetrieveError::AuthenticationUnavailable)
    }

    /// Probe the homepage with the stored cookies. Logged-out sessions get
    /// bounced to the passport host; a probe that cannot complete at all is
    /// treated as inconclusive rather than stale.
    async fn verify(&self, session: &mut Session) -> bool {
        match self.navigator.navigate(&PROBE_URL, &*session).await {
            Ok(doc) => {
                let live = doc.status == 200
                    && doc.url.host_str() != Some("passport.csdn.net");
                if live {
                    session.mark_verified();
                }
                live
            }
            Err(err) => {
                log::warn!("session probe inconclusive ({err}), keeping stored session");
                true
            }
        }
    }

    async fn relogin(&self) -> Result<Session, String> {
        let session = self
            .authenticator
            .login()
            .await
            .map_err(|e| e.to_string())?;
        if let Err(err) = self.store.save(&session) {
            log::warn!("failed to persist fresh session: {err}");
        }
        Ok(session)
    }

    async fn fetch(
        &self,
        url: &Url,
        session: &mut Session,
    ) -> Result<FetchedDocument, RetrieveError> {
        self.fetch_via(&*self.navigator, url, session, true).await
    }

    /// One transport-level fetch: bounded retries with backoff on transport
    /// errors and on 52x edge statuses, then (when `substitute` is set) a
    /// single browser substitution when the edge still refuses to serve the
    /// origin or answers with an interstitial.
    async fn fetch_via(
        &self,
        navigator: &dyn Navigator,
        url: &Url,
        session: &mut Session,
        substitute: bool,
    ) -> Result<FetchedDocument, RetrieveError> {
        let snapshot: &Session = &*session;
        let outcome = evasion::with_retry(self.transport_attempts, move || async move {
            let document = navigator
                .navigate(url, snapshot)
                .await
                .map_err(FetchFailure::Transport)?;
            match evasion::classify_edge(document.status, &document.html) {
                // A 52x is transient and worth the backoff; an interstitial
                // will not go away on its own, so it passes straight through
                // for substitution.
                EdgeVerdict::ServerDown(status) => Err(FetchFailure::EdgeDown(status)),
                verdict => Ok((document, verdict)),
            }
        })
        .await;

        let verdict = match outcome {
            Ok((document, EdgeVerdict::Ok)) => {
                self.absorb_cookies(session, &document);
                return Ok(document);
            }
            Ok((_, verdict)) => verdict,
            Err(FetchFailure::EdgeDown(status)) => EdgeVerdict::ServerDown(status),
            Err(FetchFailure::Transport(err)) => {
                return Err(RetrieveError::TransportFailure(err.to_string()));
            }
        };

        if !substitute {
            return Err(RetrieveError::TransportFailure(format!(
                "edge refused browser fetch: {verdict:?}"
            )));
        }
        log::info!(
            "{} fetch blocked by edge ({verdict:?}), substituting browser",
            navigator.name()
        );
        let document = self
            .fallback
            .navigate(url, &*session)
            .await
            .map_err(|e| RetrieveError::TransportFailure(e.to_string()))?;
        self.absorb_cookies(session, &document);
        Ok(document)
    }

    /// Merge response cookies into the session and persist when anything
    /// actually changed.
    fn absorb_cookies(&self, session: &mut Session, document: &FetchedDocument) {
        if document.cookies.is_empty() {
            return;
        }
        let changed = session.merge(document.cookies.iter().cloned());
        if changed > 0 {
            log::debug!("absorbed {changed} cookie(s) from response");
            if let Err(err) = self.store.save(session) {
                log::warn!("failed to persist session update: {err}");
            }
        }
    }

    /// Ask for the read grant. Rejections and transport errors both come
    /// back as `false`: unlock failure never aborts the ladder.
    async fn try_unlock(&self, target: &TargetId, session: &Session) -> bool {
        match self.unlocker.unlock(target, session).await {
            Ok(outcome) if outcome.is_success() => true,
            Ok(outcome) => {
                log::info!("unlock declined: {outcome:?}");
                false
            }
            Err(err) => {
                log::warn!("unlock attempt failed: {err}");
                false
            }
        }
    }
}
