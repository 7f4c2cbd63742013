//! Per-wiki persisted session cookies.
//!
//! Each wiki gets its own jar at `<dir>/cookie_<wiki>.json`. The jar is loaded once when the
//! session is opened and written back after a successful login; it is the only state carried
//! between runs. Cookie semantics (expiry, domain and path scoping) come from `cookie_store`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cookie_store::RawCookie;
use reqwest::Url;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use tracing::{debug, warn};

use crate::error::CredentialError;
use crate::wiki::WikiId;

pub struct CredentialStore {
    path: PathBuf,
    jar: Mutex<cookie_store::CookieStore>,
}

impl CredentialStore {
    pub fn path_for(dir: &Path, wiki: &WikiId) -> PathBuf {
        dir.join(format!("cookie_{wiki}.json"))
    }

    /// Open the jar for `wiki`. A missing file starts an empty jar; an unreadable one is an error.
    pub fn load(dir: &Path, wiki: &WikiId) -> Result<Self, CredentialError> {
        let path = Self::path_for(dir, wiki);
        let jar = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| CredentialError::Read {
                path: path.clone(),
                source,
            })?;
            // Session cookies carry no expiry, so load those too.
            match cookie_store::serde::json::load_all(content.as_bytes()) {
                Ok(jar) => jar,
                Err(source) => {
                    warn!(path = %path.display(), "discarding corrupt credential file");
                    debug!(error = %source, "credential decode failure");
                    cookie_store::CookieStore::default()
                }
            }
        } else {
            cookie_store::CookieStore::default()
        };
        let store = Self {
            path,
            jar: Mutex::new(jar),
        };
        debug!(wiki = %wiki, count = store.len(), "loaded persisted cookies");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of unexpired cookies.
    pub fn len(&self) -> usize {
        self.jar
            .lock()
            .map(|jar| jar.iter_unexpired().count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of the unexpired cookie called `name`, whatever its domain.
    pub fn get(&self, name: &str) -> Option<String> {
        let jar = self.jar.lock().ok()?;
        jar.iter_unexpired()
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
    }

    /// Apply one `Set-Cookie` header value received from `url`.
    pub fn store_response_cookie(&self, header: &str, url: &Url) {
        let Ok(cookie) = RawCookie::parse(header.to_string()) else {
            debug!(url = %url, "ignoring unparsable Set-Cookie header");
            return;
        };
        if let Ok(mut jar) = self.jar.lock() {
            jar.store_response_cookies(std::iter::once(cookie), url);
        }
    }

    pub fn save(&self) -> Result<(), CredentialError> {
        let mut rendered = Vec::new();
        {
            let jar = self.jar.lock().map_err(|_| CredentialError::Encode {
                path: self.path.clone(),
                source: "cookie jar lock poisoned".into(),
            })?;
            cookie_store::serde::json::save_incl_expired_and_nonpersistent(&jar, &mut rendered)
                .map_err(|source| CredentialError::Encode {
                    path: self.path.clone(),
                    source,
                })?;
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| CredentialError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.path, rendered).map_err(|source| CredentialError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), count = self.len(), "persisted cookies");
        Ok(())
    }
}

impl CookieStore for CredentialStore {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let cookies = cookie_headers
            .filter_map(|header| header.to_str().ok())
            .filter_map(|text| RawCookie::parse(text.to_string()).ok())
            .collect::<Vec<_>>();
        if let Ok(mut jar) = self.jar.lock() {
            jar.store_response_cookies(cookies.into_iter(), url);
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let jar = self.jar.lock().ok()?;
        let value = jar
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if value.is_empty() {
            return None;
        }
        HeaderValue::from_str(&value).ok()
    }
}
