//! MediaWiki action API client.
//!
//! [`WikiApi`] is the seam between the deployment logic and the network: the real
//! [`MediaWikiClient`] talks to `api.php`, tests drive a scripted fake. Every payload is validated
//! into a typed response here so callers never index raw JSON.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::DeployConfig;
use crate::credentials::CredentialStore;
use crate::error::ApiError;
use crate::wiki::WikiId;

pub const NS_MODULE: i32 = 828;

/// Token value MediaWiki hands out to sessions that are not logged in.
pub const ANONYMOUS_CSRF_TOKEN: &str = "+\\";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResult {
    pub result: String,
    pub reason: Option<String>,
}

impl LoginResult {
    pub fn is_success(&self) -> bool {
        self.result == "Success"
    }
}

#[derive(Debug, Clone)]
pub struct EditRequest<'a> {
    pub title: &'a str,
    pub text: &'a str,
    pub summary: &'a str,
    pub token: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditResponse {
    pub result: String,
    pub new_revision: Option<i64>,
}

impl EditResponse {
    pub fn is_success(&self) -> bool {
        self.result == "Success"
    }
}

#[derive(Debug, Clone)]
pub struct ProtectRequest<'a> {
    pub title: &'a str,
    /// Pipe-separated `action=level` pairs, e.g. `edit=sysop|move=sysop`.
    pub protections: &'a str,
    pub reason: &'a str,
    pub token: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionEntry {
    pub action: String,
    pub level: String,
}

#[derive(Debug, Clone)]
pub struct SearchQuery<'a> {
    pub search: &'a str,
    pub namespace: i32,
    pub limit: usize,
}

pub trait WikiApi {
    fn wiki(&self) -> &WikiId;
    fn fetch_login_token(&mut self) -> Result<String, ApiError>;
    fn login(
        &mut self,
        username: &str,
        password: &str,
        login_token: &str,
    ) -> Result<LoginResult, ApiError>;
    fn fetch_csrf_token(&mut self) -> Result<String, ApiError>;
    fn edit(&mut self, request: &EditRequest<'_>) -> Result<EditResponse, ApiError>;
    fn protect(&mut self, request: &ProtectRequest<'_>) -> Result<Vec<ProtectionEntry>, ApiError>;
    fn page_exists(&mut self, title: &str) -> Result<bool, ApiError>;
    fn search_titles(&mut self, query: &SearchQuery<'_>) -> Result<Vec<String>, ApiError>;
    /// Returns whether the response carried a deletion confirmation.
    fn delete(&mut self, title: &str, reason: &str, token: &str) -> Result<bool, ApiError>;
    /// Set an interface message through the farm's message extension; returns the status text.
    fn set_message(&mut self, name: &str, value: &str) -> Result<String, ApiError>;
    fn persist_credentials(&mut self) -> Result<(), ApiError>;
    fn request_count(&self) -> usize;
}

/// Opens one API client per wiki.
pub trait WikiConnector {
    type Api: WikiApi;

    fn connect(&self, wiki: &WikiId) -> Result<Self::Api, ApiError>;
}

#[derive(Debug, Clone)]
pub struct MediaWikiConnector {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub credential_dir: PathBuf,
}

impl MediaWikiConnector {
    pub fn from_config(config: &DeployConfig) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: config.base_url()?,
            user_agent: config.user_agent(),
            timeout: config.timeout(),
            credential_dir: config.credential_dir(),
        })
    }
}

impl WikiConnector for MediaWikiConnector {
    type Api = MediaWikiClient;

    fn connect(&self, wiki: &WikiId) -> Result<MediaWikiClient, ApiError> {
        let credentials = Arc::new(CredentialStore::load(&self.credential_dir, wiki)?);
        MediaWikiClient::new(
            wiki.clone(),
            format!("{}/{}/api.php", self.base_url, wiki),
            self.user_agent.clone(),
            self.timeout,
            credentials,
        )
    }
}

pub struct MediaWikiClient {
    wiki: WikiId,
    client: Client,
    api_url: Url,
    user_agent: String,
    credentials: Arc<CredentialStore>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(
        wiki: WikiId,
        api_url: String,
        user_agent: String,
        timeout: Duration,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, ApiError> {
        let api_url = Url::parse(&api_url).map_err(|_| ApiError::InvalidUrl(api_url.clone()))?;
        let client = Client::builder()
            .timeout(timeout)
            .cookie_provider(Arc::clone(&credentials))
            .build()?;
        Ok(Self {
            wiki,
            client,
            api_url,
            user_agent,
            credentials,
            request_count: 0,
        })
    }

    fn request_json_post(&mut self, params: &[(&str, String)]) -> Result<Value, ApiError> {
        let pairs = with_format(params);
        self.request_count += 1;
        debug!(wiki = %self.wiki, action = action_of(params), "POST api.php");
        let response = self
            .client
            .post(self.api_url.clone())
            .header("User-Agent", self.user_agent.clone())
            .form(&pairs)
            .send()?;
        decode_payload(response)
    }
}

impl WikiApi for MediaWikiClient {
    fn wiki(&self) -> &WikiId {
        &self.wiki
    }

    fn fetch_login_token(&mut self) -> Result<String, ApiError> {
        let payload = self.request_json_post(&login_token_params())?;
        parse_token(&payload, "logintoken")
    }

    fn login(
        &mut self,
        username: &str,
        password: &str,
        login_token: &str,
    ) -> Result<LoginResult, ApiError> {
        let payload = self.request_json_post(&login_params(username, password, login_token))?;
        parse_login(&payload)
    }

    fn fetch_csrf_token(&mut self) -> Result<String, ApiError> {
        let payload = self.request_json_post(&csrf_token_params())?;
        parse_token(&payload, "csrftoken")
    }

    fn edit(&mut self, request: &EditRequest<'_>) -> Result<EditResponse, ApiError> {
        let payload = self.request_json_post(&edit_params(request))?;
        parse_edit(&payload)
    }

    fn protect(&mut self, request: &ProtectRequest<'_>) -> Result<Vec<ProtectionEntry>, ApiError> {
        let payload = self.request_json_post(&protect_params(request))?;
        parse_protections(&payload)
    }

    fn page_exists(&mut self, title: &str) -> Result<bool, ApiError> {
        let payload = self.request_json_post(&page_info_params(title))?;
        parse_page_exists(&payload)
    }

    fn search_titles(&mut self, query: &SearchQuery<'_>) -> Result<Vec<String>, ApiError> {
        let payload = self.request_json_post(&search_params(query))?;
        parse_search_titles(&payload)
    }

    fn delete(&mut self, title: &str, reason: &str, token: &str) -> Result<bool, ApiError> {
        let payload = self.request_json_post(&delete_params(title, reason, token))?;
        parse_delete(&payload)
    }

    fn set_message(&mut self, name: &str, value: &str) -> Result<String, ApiError> {
        let payload = self.request_json_post(&message_params(name, value))?;
        parse_message_update(&payload)
    }

    fn persist_credentials(&mut self) -> Result<(), ApiError> {
        self.credentials.save()?;
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

type Params = Vec<(&'static str, String)>;

fn login_token_params() -> Params {
    vec![
        ("action", "query".to_string()),
        ("meta", "tokens".to_string()),
        ("type", "login".to_string()),
    ]
}

fn login_params(username: &str, password: &str, login_token: &str) -> Params {
    vec![
        ("action", "login".to_string()),
        ("lgname", username.to_string()),
        ("lgpassword", password.to_string()),
        ("lgtoken", login_token.to_string()),
    ]
}

fn csrf_token_params() -> Params {
    vec![
        ("action", "query".to_string()),
        ("meta", "tokens".to_string()),
    ]
}

fn edit_params(request: &EditRequest<'_>) -> Params {
    vec![
        ("action", "edit".to_string()),
        ("title", request.title.to_string()),
        ("text", request.text.to_string()),
        ("summary", request.summary.to_string()),
        ("bot", "true".to_string()),
        ("recreate", "true".to_string()),
        ("token", request.token.to_string()),
    ]
}

fn protect_params(request: &ProtectRequest<'_>) -> Params {
    vec![
        ("action", "protect".to_string()),
        ("title", request.title.to_string()),
        ("protections", request.protections.to_string()),
        ("reason", request.reason.to_string()),
        ("expiry", "infinite".to_string()),
        ("bot", "true".to_string()),
        ("token", request.token.to_string()),
    ]
}

fn page_info_params(title: &str) -> Params {
    vec![
        ("action", "query".to_string()),
        ("titles", title.to_string()),
        ("prop", "info".to_string()),
    ]
}

// An empty `srprop` asks for titles only.
fn search_params(query: &SearchQuery<'_>) -> Params {
    vec![
        ("action", "query".to_string()),
        ("list", "search".to_string()),
        ("srsearch", query.search.to_string()),
        ("srnamespace", query.namespace.to_string()),
        ("srlimit", query.limit.to_string()),
        ("srprop", String::new()),
    ]
}

fn delete_params(title: &str, reason: &str, token: &str) -> Params {
    vec![
        ("action", "delete".to_string()),
        ("title", title.to_string()),
        ("reason", reason.to_string()),
        ("token", token.to_string()),
    ]
}

fn message_params(name: &str, value: &str) -> Params {
    vec![
        ("action", "updatelpmwmessageapi".to_string()),
        ("messagename", name.to_string()),
        ("value", value.to_string()),
    ]
}

/// List every wiki of the farm from the index endpoint's `allwikis` object.
pub fn fetch_wiki_index(config: &DeployConfig) -> anyhow::Result<Vec<WikiId>> {
    let index_url = config.index_url()?;
    let client = Client::builder()
        .timeout(config.timeout())
        .build()
        .context("failed to build wiki index HTTP client")?;
    let response = client
        .get(&index_url)
        .header("User-Agent", config.user_agent())
        .header("Accept", "application/json")
        .send()
        .with_context(|| format!("failed to fetch wiki index from {index_url}"))?;
    let payload = decode_payload(response)
        .with_context(|| format!("failed to decode wiki index from {index_url}"))?;
    Ok(parse_wiki_index(&payload)?)
}

pub(crate) fn parse_wiki_index(payload: &Value) -> Result<Vec<WikiId>, ApiError> {
    let index: WikiIndexResponse = decode("wiki index", payload)?;
    let wikis = index
        .allwikis
        .ok_or_else(|| ApiError::malformed("wiki index", "missing allwikis object"))?;
    let mut output = Vec::with_capacity(wikis.len());
    for slug in wikis.keys() {
        match WikiId::parse(slug) {
            Ok(wiki) => output.push(wiki),
            Err(error) => warn!(slug = %slug, error = %error, "ignoring unusable wiki slug"),
        }
    }
    output.sort();
    Ok(output)
}

fn with_format(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        pairs.push(((*key).to_string(), value.clone()));
    }
    pairs
}

fn action_of<'a>(params: &'a [(&str, String)]) -> &'a str {
    params
        .iter()
        .find(|(key, _)| *key == "action")
        .map(|(_, value)| value.as_str())
        .unwrap_or("unknown")
}

// The API reports most failures in the JSON body while the HTTP status stays 200, so the body
// takes precedence over the status whenever it decodes.
fn decode_payload(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    let body = response.text()?;
    let payload: Value = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(_) if !status.is_success() => {
            return Err(ApiError::HttpStatus {
                status: status.as_u16(),
            });
        }
        Err(error) => return Err(ApiError::malformed("api", format!("invalid JSON: {error}"))),
    };
    check_error(payload)
}

fn decode<T: DeserializeOwned>(action: &'static str, payload: &Value) -> Result<T, ApiError> {
    serde_json::from_value(payload.clone())
        .map_err(|error| ApiError::malformed(action, format!("unexpected shape: {error}")))
}

pub(crate) fn check_error(payload: Value) -> Result<Value, ApiError> {
    let envelope: ErrorResponse = decode("api", &payload)?;
    if let Some(error) = envelope.error {
        return Err(ApiError::Remote {
            code: error.code.unwrap_or_else(|| "unknown_error".to_string()),
            info: error.info.unwrap_or_else(|| "unknown info".to_string()),
        });
    }
    Ok(payload)
}

pub(crate) fn parse_token(payload: &Value, kind: &'static str) -> Result<String, ApiError> {
    let response: TokenQueryResponse = decode("token", payload)?;
    let tokens = response.query.tokens.unwrap_or_default();
    let token = match kind {
        "logintoken" => tokens.logintoken,
        _ => tokens.csrftoken,
    };
    token.ok_or_else(|| ApiError::malformed("token", format!("missing query.tokens.{kind}")))
}

pub(crate) fn parse_login(payload: &Value) -> Result<LoginResult, ApiError> {
    let response: LoginResponse = decode("login", payload)?;
    let login = response
        .login
        .ok_or_else(|| ApiError::malformed("login", "missing login object"))?;
    let result = login
        .result
        .ok_or_else(|| ApiError::malformed("login", "missing login.result"))?;
    Ok(LoginResult {
        result,
        reason: login.reason,
    })
}

pub(crate) fn parse_edit(payload: &Value) -> Result<EditResponse, ApiError> {
    let response: EditReply = decode("edit", payload)?;
    let edit = response
        .edit
        .ok_or_else(|| ApiError::malformed("edit", "missing edit object"))?;
    let result = edit
        .result
        .ok_or_else(|| ApiError::malformed("edit", "missing edit.result"))?;
    Ok(EditResponse {
        result,
        new_revision: edit.newrevid,
    })
}

pub(crate) fn parse_protections(payload: &Value) -> Result<Vec<ProtectionEntry>, ApiError> {
    let response: ProtectResponse = decode("protect", payload)?;
    let protections = response
        .protect
        .and_then(|protect| protect.protections)
        .ok_or_else(|| ApiError::malformed("protect", "missing protect.protections"))?;
    let mut entries = Vec::new();
    for protection in protections {
        for (action, level) in protection {
            if action == "expiry" {
                continue;
            }
            if let Some(level) = level.as_str() {
                entries.push(ProtectionEntry {
                    action,
                    level: level.to_string(),
                });
            }
        }
    }
    Ok(entries)
}

pub(crate) fn parse_page_exists(payload: &Value) -> Result<bool, ApiError> {
    let response: PageQueryResponse = decode("page info", payload)?;
    let page = response
        .query
        .and_then(|query| query.pages.into_iter().next())
        .ok_or_else(|| ApiError::malformed("page info", "missing query.pages"))?;
    if page.invalid.unwrap_or(false) {
        let reason = page
            .invalidreason
            .unwrap_or_else(|| "invalid title".to_string());
        return Err(ApiError::malformed("page info", reason));
    }
    Ok(!page.missing.unwrap_or(false))
}

pub(crate) fn parse_search_titles(payload: &Value) -> Result<Vec<String>, ApiError> {
    let response: SearchResponse = decode("search", payload)?;
    let hits = response
        .query
        .and_then(|query| query.search)
        .ok_or_else(|| ApiError::malformed("search", "missing query.search"))?;
    Ok(hits.into_iter().map(|hit| hit.title).collect())
}

pub(crate) fn parse_delete(payload: &Value) -> Result<bool, ApiError> {
    let response: DeleteResponse = decode("delete", payload)?;
    Ok(response.delete.is_some())
}

pub(crate) fn parse_message_update(payload: &Value) -> Result<String, ApiError> {
    let response: MessageUpdateResponse = decode("message update", payload)?;
    response
        .updatelpmwmessageapi
        .and_then(|update| update.message)
        .ok_or_else(|| {
            ApiError::malformed("message update", "missing updatelpmwmessageapi.message")
        })
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorPayload>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    code: Option<String>,
    info: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WikiIndexResponse {
    allwikis: Option<BTreeMap<String, IgnoredAny>>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    login: Option<LoginPayload>,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditReply {
    edit: Option<EditPayload>,
}

#[derive(Debug, Deserialize)]
struct EditPayload {
    result: Option<String>,
    newrevid: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProtectResponse {
    protect: Option<ProtectPayload>,
}

// Each entry pairs one action with its level plus an `expiry` key.
#[derive(Debug, Deserialize)]
struct ProtectPayload {
    protections: Option<Vec<BTreeMap<String, Value>>>,
}

#[derive(Debug, Deserialize)]
struct PageQueryResponse {
    query: Option<PageQueryPayload>,
}

#[derive(Debug, Deserialize)]
struct PageQueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    missing: Option<bool>,
    invalid: Option<bool>,
    invalidreason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    query: Option<SearchPayload>,
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    search: Option<Vec<SearchQueryItem>>,
}

#[derive(Debug, Deserialize)]
struct SearchQueryItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    delete: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct MessageUpdateResponse {
    updatelpmwmessageapi: Option<MessageUpdatePayload>,
}

#[derive(Debug, Deserialize)]
struct MessageUpdatePayload {
    message: Option<String>,
}
