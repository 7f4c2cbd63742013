use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = ".wikideploy.toml";
pub const DEFAULT_USER_AGENT: &str = concat!("wikideploy/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_RATE_LIMIT_MS: u64 = 4_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PROTECTION_LEVEL: &str = "allow-only-sysop";
pub const DEFAULT_PROTECTION_REASON: &str = "Git maintained";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DeployConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub deploy: DeploySection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    /// Farm root; each wiki lives at `{base_url}/{slug}/api.php`.
    pub base_url: Option<String>,
    /// Endpoint listing every wiki of the farm under `allwikis`.
    pub index_url: Option<String>,
    pub user_agent: Option<String>,
    /// Contact address appended to the user agent.
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DeploySection {
    pub credential_dir: Option<PathBuf>,
    pub rate_limit_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub protection_level: Option<String>,
    pub protection_reason: Option<String>,
    pub dev_env_name: Option<String>,
}

impl DeployConfig {
    /// Resolve the farm base URL: env WIKI_BASE_URL > config. Required for any remote call.
    pub fn base_url(&self) -> Result<String> {
        let value = env_override("WIKI_BASE_URL")
            .or_else(|| self.wiki.base_url.clone())
            .ok_or_else(|| anyhow::anyhow!("WIKI_BASE_URL or [wiki].base_url is required"))?;
        let trimmed = value.trim().trim_end_matches('/').to_string();
        if trimmed.is_empty() {
            bail!("wiki base URL cannot be empty");
        }
        Ok(trimmed)
    }

    /// Resolve the farm index URL: env WIKI_INDEX_URL > config > `{base_url}/api.php`.
    pub fn index_url(&self) -> Result<String> {
        if let Some(value) = env_override("WIKI_INDEX_URL").or_else(|| self.wiki.index_url.clone())
        {
            return Ok(value);
        }
        Ok(format!("{}/api.php", self.base_url()?))
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > default, with the contact appended.
    pub fn user_agent(&self) -> String {
        let base = env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        match env_override("WIKI_UA_EMAIL").or_else(|| self.wiki.contact.clone()) {
            Some(contact) => format!("{base} ({contact})"),
            None => base,
        }
    }

    pub fn credential_dir(&self) -> PathBuf {
        env_override("WIKI_CREDENTIAL_DIR")
            .map(PathBuf::from)
            .or_else(|| self.deploy.credential_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(
            env_override_u64("WIKI_RATE_LIMIT_MS")
                .or(self.deploy.rate_limit_ms)
                .unwrap_or(DEFAULT_RATE_LIMIT_MS),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(
            env_override_u64("WIKI_HTTP_TIMEOUT_MS")
                .or(self.deploy.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        )
    }

    pub fn protection_level(&self) -> String {
        self.deploy
            .protection_level
            .clone()
            .unwrap_or_else(|| DEFAULT_PROTECTION_LEVEL.to_string())
    }

    pub fn protection_reason(&self) -> String {
        self.deploy
            .protection_reason
            .clone()
            .unwrap_or_else(|| DEFAULT_PROTECTION_REASON.to_string())
    }

    /// Suffix for preview deployments: env LUA_DEV_ENV_NAME > config > none.
    pub fn dev_env_name(&self) -> Option<String> {
        env_override("LUA_DEV_ENV_NAME").or_else(|| {
            self.deploy
                .dev_env_name
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        })
    }
}

/// Bot account used for every wiki of the farm.
#[derive(Clone)]
pub struct BotCredentials {
    pub username: String,
    pub password: String,
}

impl BotCredentials {
    pub fn from_env() -> Result<Self> {
        let username = env_override("WIKI_USER")
            .ok_or_else(|| anyhow::anyhow!("WIKI_USER is required for authenticated calls"))?;
        let password = env::var("WIKI_PASSWORD")
            .ok()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("WIKI_PASSWORD is required for authenticated calls"))?;
        Ok(Self { username, password })
    }
}

impl std::fmt::Debug for BotCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What started the run; scheduled and manual runs are expected to be no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployTrigger {
    Push,
    Other,
}

impl DeployTrigger {
    pub fn from_env() -> Self {
        match env_override("DEPLOY_TRIGGER").as_deref() {
            Some("push") => Self::Push,
            _ => Self::Other,
        }
    }
}

/// Load and parse a DeployConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DeployConfig> {
    if !config_path.exists() {
        return Ok(DeployConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DeployConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_override_u64(key: &str) -> Option<u64> {
    env_override(key).and_then(|value| value.parse::<u64>().ok())
}
