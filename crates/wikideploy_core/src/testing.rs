//! Scripted in-memory wiki farm for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::api::{
    ANONYMOUS_CSRF_TOKEN, EditRequest, EditResponse, LoginResult, ProtectRequest,
    ProtectionEntry, SearchQuery, WikiApi, WikiConnector, check_error, parse_edit,
    parse_protections,
};
use crate::config::BotCredentials;
use crate::error::ApiError;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;
use crate::wiki::WikiId;

pub(crate) fn wiki(slug: &str) -> WikiId {
    WikiId::parse(slug).expect("wiki slug")
}

pub(crate) fn registry_with(connector: MockConnector) -> SessionRegistry<MockConnector> {
    let limiter = connector.limiter();
    SessionRegistry::new(
        connector,
        BotCredentials {
            username: "DeployBot".to_string(),
            password: "secret".to_string(),
        },
        limiter,
    )
}

type PageKey = (WikiId, String);

#[derive(Default)]
pub(crate) struct MockState {
    connections: usize,
    calls: BTreeMap<(WikiId, &'static str), usize>,
    pauses: BTreeMap<WikiId, usize>,
    rejected_logins: BTreeMap<WikiId, String>,
    anonymous: BTreeSet<WikiId>,
    token_counter: usize,
    revision_counter: i64,
    pages: BTreeMap<PageKey, String>,
    protections: BTreeMap<PageKey, Vec<ProtectionEntry>>,
    edit_payloads: BTreeMap<PageKey, Value>,
    protect_payloads: BTreeMap<PageKey, Value>,
    search_results: BTreeMap<WikiId, Vec<String>>,
    failing_searches: BTreeSet<WikiId>,
    unconfirmed_deletes: BTreeSet<PageKey>,
    message_status: Option<String>,
    pub(crate) edits: Vec<PageKey>,
    pub(crate) summaries: Vec<String>,
    pub(crate) protects: Vec<(WikiId, String, String)>,
    pub(crate) deletes: Vec<PageKey>,
    pub(crate) messages: Vec<(WikiId, String, String)>,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state")
    }

    pub(crate) fn limiter(&self) -> Arc<dyn RateLimiter> {
        Arc::new(RecordingLimiter {
            state: Arc::clone(&self.state),
        })
    }

    pub(crate) fn calls(&self, wiki: &WikiId, operation: &'static str) -> usize {
        self.state()
            .calls
            .get(&(wiki.clone(), operation))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn pauses(&self, wiki: &WikiId) -> usize {
        self.state().pauses.get(wiki).copied().unwrap_or(0)
    }

    pub(crate) fn connections(&self) -> usize {
        self.state().connections
    }

    pub(crate) fn reject_login(&self, wiki: &WikiId, reason: &str) {
        self.state()
            .rejected_logins
            .insert(wiki.clone(), reason.to_string());
    }

    pub(crate) fn anonymous_csrf(&self, wiki: &WikiId) {
        self.state().anonymous.insert(wiki.clone());
    }

    pub(crate) fn seed_page(&self, wiki: &WikiId, title: &str, content: &str) {
        self.state()
            .pages
            .insert((wiki.clone(), title.to_string()), content.to_string());
    }

    pub(crate) fn page(&self, wiki: &WikiId, title: &str) -> Option<String> {
        self.state()
            .pages
            .get(&(wiki.clone(), title.to_string()))
            .cloned()
    }

    pub(crate) fn script_edit(&self, wiki: &WikiId, title: &str, payload: Value) {
        self.state()
            .edit_payloads
            .insert((wiki.clone(), title.to_string()), payload);
    }

    pub(crate) fn script_protect(&self, wiki: &WikiId, title: &str, payload: Value) {
        self.state()
            .protect_payloads
            .insert((wiki.clone(), title.to_string()), payload);
    }

    pub(crate) fn seed_search(&self, wiki: &WikiId, titles: &[&str]) {
        self.state().search_results.insert(
            wiki.clone(),
            titles.iter().map(ToString::to_string).collect(),
        );
    }

    pub(crate) fn fail_search(&self, wiki: &WikiId) {
        self.state().failing_searches.insert(wiki.clone());
    }

    pub(crate) fn refuse_delete(&self, wiki: &WikiId, title: &str) {
        self.state()
            .unconfirmed_deletes
            .insert((wiki.clone(), title.to_string()));
    }

    pub(crate) fn message_status(&self, status: &str) {
        self.state().message_status = Some(status.to_string());
    }

    pub(crate) fn protection_levels(&self, wiki: &WikiId, title: &str) -> Vec<ProtectionEntry> {
        self.state()
            .protections
            .get(&(wiki.clone(), title.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

impl WikiConnector for MockConnector {
    type Api = MockApi;

    fn connect(&self, wiki: &WikiId) -> Result<MockApi, ApiError> {
        self.state().connections += 1;
        Ok(MockApi {
            wiki: wiki.clone(),
            state: Arc::clone(&self.state),
            requests: 0,
        })
    }
}

struct RecordingLimiter {
    state: Arc<Mutex<MockState>>,
}

impl RateLimiter for RecordingLimiter {
    fn pause(&self, wiki: &WikiId) {
        let mut state = self.state.lock().expect("mock state");
        *state.pauses.entry(wiki.clone()).or_default() += 1;
    }
}

pub(crate) struct MockApi {
    wiki: WikiId,
    state: Arc<Mutex<MockState>>,
    requests: usize,
}

impl MockApi {
    fn record(&mut self, operation: &'static str) -> MutexGuard<'_, MockState> {
        self.requests += 1;
        let mut state = self.state.lock().expect("mock state");
        *state.calls.entry((self.wiki.clone(), operation)).or_default() += 1;
        state
    }

    fn key(&self, title: &str) -> PageKey {
        (self.wiki.clone(), title.to_string())
    }
}

impl WikiApi for MockApi {
    fn wiki(&self) -> &WikiId {
        &self.wiki
    }

    fn fetch_login_token(&mut self) -> Result<String, ApiError> {
        drop(self.record("login_token"));
        Ok("login-token+\\".to_string())
    }

    fn login(
        &mut self,
        username: &str,
        _password: &str,
        login_token: &str,
    ) -> Result<LoginResult, ApiError> {
        let wiki = self.wiki.clone();
        let state = self.record("login");
        assert_eq!(username, "DeployBot");
        assert_eq!(login_token, "login-token+\\");
        Ok(match state.rejected_logins.get(&wiki) {
            Some(reason) => LoginResult {
                result: "Failed".to_string(),
                reason: Some(reason.clone()),
            },
            None => LoginResult {
                result: "Success".to_string(),
                reason: None,
            },
        })
    }

    fn fetch_csrf_token(&mut self) -> Result<String, ApiError> {
        let wiki = self.wiki.clone();
        let mut state = self.record("csrf_token");
        if state.anonymous.contains(&wiki) {
            return Ok(ANONYMOUS_CSRF_TOKEN.to_string());
        }
        state.token_counter += 1;
        Ok(format!("csrf-{}+\\", state.token_counter))
    }

    fn edit(&mut self, request: &EditRequest<'_>) -> Result<EditResponse, ApiError> {
        let key = self.key(request.title);
        let mut state = self.record("edit");
        state.edits.push(key.clone());
        state.summaries.push(request.summary.to_string());
        if let Some(payload) = state.edit_payloads.get(&key) {
            return check_error(payload.clone()).and_then(|payload| parse_edit(&payload));
        }
        if state.pages.get(&key).map(String::as_str) == Some(request.text) {
            return Ok(EditResponse {
                result: "Success".to_string(),
                new_revision: None,
            });
        }
        state.revision_counter += 1;
        let revision = state.revision_counter;
        state.pages.insert(key, request.text.to_string());
        Ok(EditResponse {
            result: "Success".to_string(),
            new_revision: Some(revision),
        })
    }

    fn protect(&mut self, request: &ProtectRequest<'_>) -> Result<Vec<ProtectionEntry>, ApiError> {
        let key = self.key(request.title);
        let mut state = self.record("protect");
        state.protects.push((
            key.0.clone(),
            key.1.clone(),
            request.protections.to_string(),
        ));
        if let Some(payload) = state.protect_payloads.get(&key) {
            return check_error(payload.clone()).and_then(|payload| parse_protections(&payload));
        }
        let entries = request
            .protections
            .split('|')
            .filter_map(|pair| pair.split_once('='))
            .map(|(action, level)| ProtectionEntry {
                action: action.to_string(),
                level: level.to_string(),
            })
            .collect::<Vec<_>>();
        state.protections.insert(key, entries.clone());
        Ok(entries)
    }

    fn page_exists(&mut self, title: &str) -> Result<bool, ApiError> {
        let key = self.key(title);
        let state = self.record("page_exists");
        Ok(state.pages.contains_key(&key))
    }

    fn search_titles(&mut self, query: &SearchQuery<'_>) -> Result<Vec<String>, ApiError> {
        let wiki = self.wiki.clone();
        let state = self.record("search");
        assert_eq!(query.namespace, crate::api::NS_MODULE);
        if state.failing_searches.contains(&wiki) {
            return Err(ApiError::Remote {
                code: "internal_api_error".to_string(),
                info: "search backend unavailable".to_string(),
            });
        }
        Ok(state.search_results.get(&wiki).cloned().unwrap_or_default())
    }

    fn delete(&mut self, title: &str, _reason: &str, _token: &str) -> Result<bool, ApiError> {
        let key = self.key(title);
        let mut state = self.record("delete");
        state.deletes.push(key.clone());
        if state.unconfirmed_deletes.contains(&key) {
            return Ok(false);
        }
        state.pages.remove(&key);
        Ok(true)
    }

    fn set_message(&mut self, name: &str, value: &str) -> Result<String, ApiError> {
        let wiki = self.wiki.clone();
        let mut state = self.record("set_message");
        state
            .messages
            .push((wiki, name.to_string(), value.to_string()));
        Ok(state
            .message_status
            .clone()
            .unwrap_or_else(|| "Successfully changed the message value".to_string()))
    }

    fn persist_credentials(&mut self) -> Result<(), ApiError> {
        drop(self.record("persist"));
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.requests
    }
}
