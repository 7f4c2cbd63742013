use std::fmt;

use anyhow::{Result, bail};
use serde::Serialize;

/// Slug of the shared wiki that hosts cross-wiki modules and site resources.
pub const COMMONS: &str = "commons";

/// Identifies one wiki of the farm, e.g. `commons` or `dota2`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WikiId(String);

impl WikiId {
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            bail!("wiki slug cannot be empty");
        }
        if let Some(ch) = trimmed
            .chars()
            .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '_' | '-')))
        {
            bail!("invalid character {ch:?} in wiki slug {trimmed:?}");
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn commons() -> Self {
        Self(COMMONS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_commons(&self) -> bool {
        self.0 == COMMONS
    }
}

impl fmt::Display for WikiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
