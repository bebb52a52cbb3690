//! Per-source session tokens and their refresh lifecycle.
//!
//! Each registered source moves through:
//!
//! ```text
//! unauthenticated ──login ok──▶ authenticated ──lead window──▶ expiring-soon
//!        ▲                            ▲                            │
//!        └──────── refresh failed ────┴──────── refresh ok ◀───────┘
//! ```
//!
//! [`TokenManager::token_for`] returns the current token without taking the
//! refresh lock while the token is outside its warning window. Inside the
//! window (or with no token at all) callers serialize on a per-source async
//! mutex; the first one logs in and the rest pick up its result, so a burst
//! of concurrent callers triggers exactly one upstream login.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::ScrapeError;
use crate::models::{Credential, Session};
use crate::store::Store;

/// The upstream login call of one API family.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, credential: &Credential) -> Result<Session, ScrapeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// Lifetime assumed when the login response carries no expiry.
    /// `None` treats such tokens as long-lived.
    pub default_lifetime: Option<Duration>,
    /// How long before expiry a token counts as expiring soon.
    pub refresh_lead: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    ExpiringSoon,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::ExpiringSoon => "expiring_soon",
        }
    }
}

struct SourceAuth {
    credential: Credential,
    policy: TokenPolicy,
    authenticator: Arc<dyn Authenticator>,
    session: RwLock<Option<Session>>,
    /// Bumped after every completed login attempt, successful or not.
    generation: AtomicU64,
    refresh: tokio::sync::Mutex<()>,
    /// Error of the attempt that produced `generation`, if it failed.
    last_error: Mutex<Option<(u64, ScrapeError)>>,
    logins: AtomicU64,
}

impl SourceAuth {
    fn current(&self) -> Option<Session> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    /// Warning window of `session`: the configured lead, but never more than
    /// half the token's own lifetime, so a short-lived token is usable for a
    /// while after it is issued.
    fn lead_for(&self, session: &Session) -> Duration {
        match session.lifetime() {
            Some(lifetime) => self.policy.refresh_lead.min(lifetime / 2),
            None => self.policy.refresh_lead,
        }
    }

    fn state(&self) -> AuthState {
        let now = Utc::now();
        match self.current() {
            None => AuthState::Unauthenticated,
            Some(s) if s.is_expired(now) => AuthState::Unauthenticated,
            Some(s) if s.expires_within(now, self.lead_for(&s)) => AuthState::ExpiringSoon,
            Some(_) => AuthState::Authenticated,
        }
    }

    /// Token usable without refreshing: present and outside the lead window.
    fn fresh_token(&self) -> Option<String> {
        let now = Utc::now();
        self.current()
            .filter(|s| !s.expires_within(now, self.lead_for(s)))
            .map(|s| s.token)
    }

    /// Token usable at all: present and not yet expired.
    fn valid_token(&self) -> Option<String> {
        let now = Utc::now();
        self.current().filter(|s| !s.is_expired(now)).map(|s| s.token)
    }

    fn failure_of(&self, generation: u64) -> Option<ScrapeError> {
        let guard = self.last_error.lock().ok()?;
        match guard.as_ref() {
            Some((g, err)) if *g == generation => Some(err.clone()),
            _ => None,
        }
    }
}

pub struct TokenManager {
    sources: DashMap<String, Arc<SourceAuth>>,
    store: Arc<dyn Store>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            sources: DashMap::new(),
            store,
        }
    }

    /// Register a source. A persisted, unexpired session is restored.
    pub async fn register(
        &self,
        credential: Credential,
        policy: TokenPolicy,
        authenticator: Arc<dyn Authenticator>,
    ) {
        let source = credential.source.clone();
        let restored = match self.store.load_session(&source).await {
            Ok(Some(session)) if !session.is_expired(Utc::now()) => {
                tracing::debug!(source = %source, "restored persisted session");
                Some(session)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "failed to load persisted session");
                None
            }
        };
        self.sources.insert(
            source,
            Arc::new(SourceAuth {
                credential,
                policy,
                authenticator,
                session: RwLock::new(restored),
                generation: AtomicU64::new(0),
                refresh: tokio::sync::Mutex::new(()),
                last_error: Mutex::new(None),
                logins: AtomicU64::new(0),
            }),
        );
    }

    fn entry(&self, source: &str) -> Result<Arc<SourceAuth>, ScrapeError> {
        self.sources
            .get(source)
            .map(|e| e.value().clone())
            .ok_or_else(|| ScrapeError::UnknownSource(source.to_string()))
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn state(&self, source: &str) -> Result<AuthState, ScrapeError> {
        Ok(self.entry(source)?.state())
    }

    /// Number of upstream login attempts made for `source`.
    pub fn login_count(&self, source: &str) -> u64 {
        self.sources
            .get(source)
            .map(|e| e.logins.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Perform the upstream login now, regardless of current token state.
    pub async fn authenticate(&self, source: &str) -> Result<String, ScrapeError> {
        let auth = self.entry(source)?;
        let _guard = auth.refresh.lock().await;
        self.login(source, &auth).await
    }

    /// Current valid token, refreshing first if it is missing or inside the
    /// warning window.
    pub async fn token_for(&self, source: &str) -> Result<String, ScrapeError> {
        let auth = self.entry(source)?;
        let observed = auth.generation.load(Ordering::Acquire);
        if let Some(token) = auth.fresh_token() {
            return Ok(token);
        }

        let _guard = auth.refresh.lock().await;
        let current = auth.generation.load(Ordering::Acquire);
        if current != observed {
            // Someone else finished a login attempt while we waited.
            if let Some(err) = auth.failure_of(current) {
                return Err(err);
            }
            if let Some(token) = auth.valid_token() {
                return Ok(token);
            }
        }
        self.login(source, &auth).await
    }

    /// Drop the session for `source`, e.g. after the upstream rejected it.
    pub async fn invalidate(&self, source: &str) {
        let Ok(auth) = self.entry(source) else {
            return;
        };
        if let Ok(mut session) = auth.session.write() {
            *session = None;
        }
        if let Err(e) = self.store.delete_session(source).await {
            tracing::warn!(source, error = %e, "failed to delete persisted session");
        }
        tracing::info!(source, "session invalidated");
    }

    /// Refresh every source that is unauthenticated or expiring soon.
    /// Returns the sources that were refreshed successfully.
    pub async fn refresh_sweep(&self) -> Vec<String> {
        let mut refreshed = Vec::new();
        for source in self.sources() {
            let Ok(auth) = self.entry(&source) else {
                continue;
            };
            if auth.state() == AuthState::Authenticated {
                continue;
            }
            match self.token_for(&source).await {
                Ok(_) => refreshed.push(source),
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "token sweep refresh failed")
                }
            }
        }
        refreshed
    }

    /// Must be called with `auth.refresh` held.
    async fn login(&self, source: &str, auth: &SourceAuth) -> Result<String, ScrapeError> {
        auth.logins.fetch_add(1, Ordering::SeqCst);
        let result = auth.authenticator.login(&auth.credential).await;

        match result {
            Ok(mut session) => {
                if session.expires_at.is_none() {
                    if let Some(lifetime) = auth.policy.default_lifetime {
                        session = session.expiring_in(lifetime);
                    }
                }
                if let Ok(mut slot) = auth.session.write() {
                    *slot = Some(session.clone());
                }
                if let Ok(mut last) = auth.last_error.lock() {
                    *last = None;
                }
                auth.generation.fetch_add(1, Ordering::AcqRel);
                if let Err(e) = self.store.save_session(source, &session).await {
                    tracing::warn!(source, error = %e, "failed to persist session");
                }
                tracing::info!(
                    source,
                    expires_at = ?session.expires_at,
                    "authenticated"
                );
                Ok(session.token)
            }
            Err(err) => {
                if let Ok(mut slot) = auth.session.write() {
                    *slot = None;
                }
                let generation = auth.generation.load(Ordering::Acquire) + 1;
                if let Ok(mut last) = auth.last_error.lock() {
                    *last = Some((generation, err.clone()));
                }
                auth.generation.store(generation, Ordering::Release);
                tracing::warn!(source, error = %err, "login failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    struct FixedLogin {
        lifetime: Option<Duration>,
        fail_with: Option<ScrapeError>,
    }

    #[async_trait]
    impl Authenticator for FixedLogin {
        async fn login(&self, _credential: &Credential) -> Result<Session, ScrapeError> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let session = Session::new(format!("tok-{}", uuid::Uuid::new_v4()), Utc::now());
            Ok(match self.lifetime {
                Some(l) => session.expiring_in(l),
                None => session,
            })
        }
    }

    fn credential(source: &str) -> Credential {
        Credential {
            source: source.into(),
            identifier: "user".into(),
            secret: "pass".into(),
        }
    }

    fn policy() -> TokenPolicy {
        TokenPolicy {
            default_lifetime: None,
            refresh_lead: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn test_first_call_logs_in_then_reuses() {
        let tokens = TokenManager::new(Arc::new(InMemoryStore::new()));
        tokens
            .register(
                credential("alpha"),
                policy(),
                Arc::new(FixedLogin { lifetime: Some(Duration::from_secs(3600)), fail_with: None }),
            )
            .await;
        assert_eq!(tokens.state("alpha").unwrap(), AuthState::Unauthenticated);
        let first = tokens.token_for("alpha").await.unwrap();
        let second = tokens.token_for("alpha").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(tokens.login_count("alpha"), 1);
        assert_eq!(tokens.state("alpha").unwrap(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_short_lived_token_is_reused_until_half_its_lifetime() {
        let tokens = TokenManager::new(Arc::new(InMemoryStore::new()));
        tokens
            .register(
                credential("alpha"),
                policy(),
                Arc::new(FixedLogin { lifetime: Some(Duration::from_secs(120)), fail_with: None }),
            )
            .await;
        let first = tokens.token_for("alpha").await.unwrap();
        for _ in 0..9 {
            assert_eq!(tokens.token_for("alpha").await.unwrap(), first);
        }
        assert_eq!(tokens.login_count("alpha"), 1);
        assert_eq!(tokens.state("alpha").unwrap(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_short_lived_token_past_half_life_is_refreshed() {
        let store = Arc::new(InMemoryStore::new());
        let issued = Utc::now() - chrono::Duration::seconds(90);
        store
            .save_session("alpha", &Session::new("old", issued).expiring_in(Duration::from_secs(120)))
            .await
            .unwrap();
        let tokens = TokenManager::new(store);
        tokens
            .register(
                credential("alpha"),
                policy(),
                Arc::new(FixedLogin { lifetime: Some(Duration::from_secs(120)), fail_with: None }),
            )
            .await;
        assert_eq!(tokens.state("alpha").unwrap(), AuthState::ExpiringSoon);
        let token = tokens.token_for("alpha").await.unwrap();
        assert_ne!(token, "old");
        assert_eq!(tokens.login_count("alpha"), 1);
    }

    #[tokio::test]
    async fn test_default_lifetime_applies_when_upstream_omits_expiry() {
        let store = Arc::new(InMemoryStore::new());
        let tokens = TokenManager::new(store.clone());
        tokens
            .register(
                credential("alpha"),
                TokenPolicy {
                    default_lifetime: Some(Duration::from_secs(120)),
                    refresh_lead: Duration::from_secs(300),
                },
                Arc::new(FixedLogin { lifetime: None, fail_with: None }),
            )
            .await;
        tokens.authenticate("alpha").await.unwrap();
        let session = store.load_session("alpha").await.unwrap().unwrap();
        assert_eq!(session.lifetime(), Some(Duration::from_secs(120)));
        assert_eq!(tokens.state("alpha").unwrap(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported_and_leaves_unauthenticated() {
        let tokens = TokenManager::new(Arc::new(InMemoryStore::new()));
        tokens
            .register(
                credential("alpha"),
                policy(),
                Arc::new(FixedLogin {
                    lifetime: None,
                    fail_with: Some(ScrapeError::AuthFailed("bad password".into())),
                }),
            )
            .await;
        let err = tokens.token_for("alpha").await.unwrap_err();
        assert!(matches!(err, ScrapeError::AuthFailed(_)));
        assert_eq!(tokens.state("alpha").unwrap(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_session_restored_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_session("alpha", &Session::new("persisted", Utc::now()))
            .await
            .unwrap();
        let tokens = TokenManager::new(store);
        tokens
            .register(
                credential("alpha"),
                policy(),
                Arc::new(FixedLogin { lifetime: None, fail_with: None }),
            )
            .await;
        assert_eq!(tokens.token_for("alpha").await.unwrap(), "persisted");
        assert_eq!(tokens.login_count("alpha"), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_login() {
        let tokens = TokenManager::new(Arc::new(InMemoryStore::new()));
        tokens
            .register(
                credential("alpha"),
                policy(),
                Arc::new(FixedLogin { lifetime: None, fail_with: None }),
            )
            .await;
        let first = tokens.token_for("alpha").await.unwrap();
        tokens.invalidate("alpha").await;
        let second = tokens.token_for("alpha").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(tokens.login_count("alpha"), 2);
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let tokens = TokenManager::new(Arc::new(InMemoryStore::new()));
        assert!(matches!(
            tokens.token_for("ghost").await,
            Err(ScrapeError::UnknownSource(_))
        ));
    }
}
