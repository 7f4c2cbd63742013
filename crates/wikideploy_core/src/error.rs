//! Error types shared by the API client and the session layer.

use std::path::PathBuf;

use crate::wiki::WikiId;

/// Failure of a single remote API interaction.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Network failure, timeout, or undecodable body.
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("HTTP error: {status}")]
    HttpStatus { status: u16 },

    /// `api.php` answered with an `error` object.
    #[error("MediaWiki API error [{code}]: {info}")]
    Remote { code: String, info: String },

    /// The payload lacks a field the caller depends on.
    #[error("malformed {action} response: {detail}")]
    MalformedResponse {
        action: &'static str,
        detail: String,
    },

    #[error("invalid API URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ApiError {
    pub fn malformed(action: &'static str, detail: impl Into<String>) -> Self {
        Self::MalformedResponse {
            action,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write credential file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode credential file {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Failure while obtaining an authorized session for one wiki.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Login was rejected. Every later request for this wiki fails the same way this run.
    #[error("login to {wiki} rejected: {reason}")]
    Auth { wiki: WikiId, reason: String },

    #[error("failed to open a session for {wiki}")]
    Connect {
        wiki: WikiId,
        #[source]
        source: ApiError,
    },

    #[error("session for {wiki} was poisoned by a panicking holder")]
    Poisoned { wiki: WikiId },

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SessionError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Render an error with its whole `source()` chain on one line, for report details.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
