//! Per-run login sessions, one per wiki.
//!
//! A [`SessionRegistry`] is created once per run and handed to every operation. It opens a
//! session lazily on first use, logs in at most once per wiki, and hands out fresh CSRF tokens.
//! Each session sits behind its own mutex which is held across the whole login exchange, so
//! callers racing for the same wiki still produce a single login.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::api::{ANONYMOUS_CSRF_TOKEN, WikiApi, WikiConnector};
use crate::config::BotCredentials;
use crate::error::SessionError;
use crate::rate_limit::RateLimiter;
use crate::wiki::WikiId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoginState {
    Pending,
    LoggedIn,
    Rejected(String),
}

pub struct Session<A> {
    wiki: WikiId,
    api: A,
    state: LoginState,
    logins: usize,
}

impl<A: WikiApi> Session<A> {
    fn new(wiki: WikiId, api: A) -> Self {
        Self {
            wiki,
            api,
            state: LoginState::Pending,
            logins: 0,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == LoginState::LoggedIn
    }

    fn ensure_rejected_is_fatal(&self) -> Result<(), SessionError> {
        if let LoginState::Rejected(reason) = &self.state {
            return Err(SessionError::Auth {
                wiki: self.wiki.clone(),
                reason: reason.clone(),
            });
        }
        Ok(())
    }

    fn login(
        &mut self,
        credentials: &BotCredentials,
        limiter: &dyn RateLimiter,
    ) -> Result<(), SessionError> {
        info!(wiki = %self.wiki, "logging in");
        self.logins += 1;
        let outcome = self.login_exchange(credentials);
        limiter.pause(&self.wiki);
        match outcome {
            Ok(()) => {
                self.state = LoginState::LoggedIn;
                if let Err(error) = self.api.persist_credentials() {
                    warn!(wiki = %self.wiki, error = %error, "failed to persist session cookies");
                }
                Ok(())
            }
            Err(reason) => {
                warn!(wiki = %self.wiki, reason = %reason, "login rejected");
                self.state = LoginState::Rejected(reason.clone());
                Err(SessionError::Auth {
                    wiki: self.wiki.clone(),
                    reason,
                })
            }
        }
    }

    fn login_exchange(&mut self, credentials: &BotCredentials) -> Result<(), String> {
        let login_token = self
            .api
            .fetch_login_token()
            .map_err(|error| format!("login token request failed: {error}"))?;
        let result = self
            .api
            .login(&credentials.username, &credentials.password, &login_token)
            .map_err(|error| format!("login request failed: {error}"))?;
        if result.is_success() {
            Ok(())
        } else {
            Err(result.reason.unwrap_or(result.result))
        }
    }

    fn csrf_token(&mut self) -> Result<String, SessionError> {
        let token = self.api.fetch_csrf_token()?;
        if token == ANONYMOUS_CSRF_TOKEN {
            let reason = "session is not authenticated (anonymous token)".to_string();
            self.state = LoginState::Rejected(reason.clone());
            return Err(SessionError::Auth {
                wiki: self.wiki.clone(),
                reason,
            });
        }
        Ok(token)
    }
}

type SharedSession<A> = Arc<Mutex<Session<A>>>;

pub struct SessionRegistry<C: WikiConnector> {
    connector: C,
    credentials: BotCredentials,
    limiter: Arc<dyn RateLimiter>,
    sessions: Mutex<BTreeMap<WikiId, SharedSession<C::Api>>>,
}

impl<C: WikiConnector> SessionRegistry<C> {
    pub fn new(connector: C, credentials: BotCredentials, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            connector,
            credentials,
            limiter,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Return a CSRF token for `wiki`, logging in first if this run has not done so yet.
    pub fn acquire_token(&self, wiki: &WikiId) -> Result<String, SessionError> {
        let shared = self.session(wiki)?;
        let mut session = lock(&shared, wiki)?;
        session.ensure_rejected_is_fatal()?;
        if !session.is_logged_in() {
            session.login(&self.credentials, self.limiter.as_ref())?;
        }
        session.csrf_token()
    }

    /// Run `operation` against the wiki's API client. No login is performed.
    pub fn with_api<T>(
        &self,
        wiki: &WikiId,
        operation: impl FnOnce(&mut C::Api) -> T,
    ) -> Result<T, SessionError> {
        let shared = self.session(wiki)?;
        let mut session = lock(&shared, wiki)?;
        session.ensure_rejected_is_fatal()?;
        Ok(operation(&mut session.api))
    }

    /// Wait out the rate limit after a state-changing call against `wiki`.
    pub fn pause(&self, wiki: &WikiId) {
        self.limiter.pause(wiki);
    }

    /// Number of login exchanges performed against `wiki` this run.
    pub fn login_count(&self, wiki: &WikiId) -> usize {
        let Ok(sessions) = self.sessions.lock() else {
            return 0;
        };
        sessions
            .get(wiki)
            .and_then(|shared| shared.lock().ok().map(|session| session.logins))
            .unwrap_or(0)
    }

    pub fn request_count(&self) -> usize {
        let Ok(sessions) = self.sessions.lock() else {
            return 0;
        };
        sessions
            .values()
            .filter_map(|shared| shared.lock().ok().map(|session| session.api.request_count()))
            .sum()
    }

    fn session(&self, wiki: &WikiId) -> Result<SharedSession<C::Api>, SessionError> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| SessionError::Poisoned { wiki: wiki.clone() })?;
        if let Some(existing) = sessions.get(wiki) {
            return Ok(Arc::clone(existing));
        }
        let api = self
            .connector
            .connect(wiki)
            .map_err(|source| SessionError::Connect {
                wiki: wiki.clone(),
                source,
            })?;
        debug_assert_eq!(api.wiki(), wiki);
        let shared = Arc::new(Mutex::new(Session::new(wiki.clone(), api)));
        sessions.insert(wiki.clone(), Arc::clone(&shared));
        Ok(shared)
    }
}

fn lock<'a, A>(
    shared: &'a SharedSession<A>,
    wiki: &WikiId,
) -> Result<std::sync::MutexGuard<'a, Session<A>>, SessionError> {
    shared
        .lock()
        .map_err(|_| SessionError::Poisoned { wiki: wiki.clone() })
}

#[cfg(test)]
mod tests {
    use crate::testing::{MockConnector, registry_with, wiki};

    #[test]
    fn repeated_token_requests_log_in_once() {
        let connector = MockConnector::default();
        let registry = registry_with(connector.clone());
        let dota = wiki("dota2");

        let first = registry.acquire_token(&dota).expect("token");
        let second = registry.acquire_token(&dota).expect("token");
        let third = registry.acquire_token(&dota).expect("token");

        assert_eq!(registry.login_count(&dota), 1);
        assert_eq!(connector.calls(&dota, "login"), 1);
        assert_eq!(connector.calls(&dota, "login_token"), 1);
        assert_eq!(connector.calls(&dota, "csrf_token"), 3);
        assert_ne!(first, second);
        assert_ne!(second, third);
    }

    #[test]
    fn each_wiki_gets_its_own_login() {
        let connector = MockConnector::default();
        let registry = registry_with(connector.clone());

        registry.acquire_token(&wiki("dota2")).expect("token");
        registry.acquire_token(&wiki("commons")).expect("token");
        registry.acquire_token(&wiki("dota2")).expect("token");

        assert_eq!(connector.calls(&wiki("dota2"), "login"), 1);
        assert_eq!(connector.calls(&wiki("commons"), "login"), 1);
        assert_eq!(connector.connections(), 2);
    }

    #[test]
    fn login_persists_credentials_and_pauses() {
        let connector = MockConnector::default();
        let registry = registry_with(connector.clone());
        let dota = wiki("dota2");

        registry.acquire_token(&dota).expect("token");

        assert_eq!(connector.calls(&dota, "persist"), 1);
        assert_eq!(connector.pauses(&dota), 1);
    }

    #[test]
    fn rejected_login_is_fatal_for_the_rest_of_the_run() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        connector.reject_login(&dota, "Incorrect username or password entered.");
        let registry = registry_with(connector.clone());

        let error = registry.acquire_token(&dota).expect_err("login must fail");
        assert!(error.is_auth());
        assert!(error.to_string().contains("Incorrect username"));

        let again = registry.acquire_token(&dota).expect_err("still failing");
        assert!(again.is_auth());
        let api_error = registry
            .with_api(&dota, |_| ())
            .expect_err("api access refused");
        assert!(api_error.is_auth());

        assert_eq!(connector.calls(&dota, "login"), 1);
        assert_eq!(connector.calls(&dota, "csrf_token"), 0);
        assert_eq!(connector.calls(&dota, "persist"), 0);
    }

    #[test]
    fn anonymous_csrf_token_counts_as_auth_failure() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        connector.anonymous_csrf(&dota);
        let registry = registry_with(connector.clone());

        let error = registry.acquire_token(&dota).expect_err("must fail");
        assert!(error.is_auth());
    }

    #[test]
    fn concurrent_acquisition_still_logs_in_once() {
        let connector = MockConnector::default();
        let registry = registry_with(connector.clone());
        let dota = wiki("dota2");

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| registry.acquire_token(&dota).expect("token"));
            }
        });

        assert_eq!(connector.calls(&dota, "login"), 1);
        assert_eq!(connector.calls(&dota, "csrf_token"), 4);
    }
}
