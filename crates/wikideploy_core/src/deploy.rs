//! Pushing source files to wiki pages.
//!
//! The edit response decides whether anything changed: a successful edit that returns a new
//! revision id changed the page, one without a new revision was a no-op. Edits are never retried,
//! because a replayed edit is indistinguishable from a second legitimate edit on the remote side.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::api::{EditRequest, EditResponse, WikiApi, WikiConnector};
use crate::error::error_chain;
use crate::report::{EntryKind, EntryStatus, ReportEntry, RunReport};
use crate::session::SessionRegistry;
use crate::wiki::WikiId;

pub const SUMMARY_PREFIX: &str = "Git: ";
pub const CACHE_VERSION_MESSAGE: &str = "Resourceloaderarticles-cacheversion";
pub const CACHE_UPDATED_STATUS: &str = "Successfully changed the message value";

const MARKER_OPEN: &str = "---";
const MARKER_TAG: &str = "-- @Liquipedia";
const MARKER_PAGE_PREFIX: &str = "-- page=";

/// Read the target page from the three-line marker block a deployable module starts with:
///
/// ```text
/// ---
/// -- @Liquipedia
/// -- page=Module:Example
/// ```
pub fn extract_target_page(content: &str) -> Option<String> {
    let mut lines = content.split_inclusive('\n');
    let mut next_line = || {
        let line = lines.next()?;
        line.strip_suffix('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
    };
    if next_line()? != MARKER_OPEN || next_line()? != MARKER_TAG {
        return None;
    }
    let page = next_line()?.strip_prefix(MARKER_PAGE_PREFIX)?.trim();
    if page.is_empty() {
        return None;
    }
    Some(page.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployableItem {
    pub source_path: PathBuf,
    pub content: String,
    pub target_page: Option<String>,
}

impl DeployableItem {
    /// A Lua module. `page_suffix` is appended to the target page for preview environments.
    pub fn module(
        source_path: impl Into<PathBuf>,
        content: String,
        page_suffix: Option<&str>,
    ) -> Self {
        let target_page = extract_target_page(&content)
            .map(|page| format!("{page}{}", page_suffix.unwrap_or_default()));
        Self {
            source_path: source_path.into(),
            content,
            target_page,
        }
    }

    /// A site-wide script or stylesheet, deployed below `MediaWiki:Common.js/` or
    /// `MediaWiki:Common.css/` on commons.
    pub fn resource(source_path: impl Into<PathBuf>, content: String) -> Self {
        let source_path = source_path.into();
        let target_page = resource_page(&source_path);
        Self {
            source_path,
            content,
            target_page,
        }
    }

    pub fn display_path(&self) -> String {
        self.source_path.to_string_lossy().replace('\\', "/")
    }
}

fn resource_page(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let extension = path.extension()?.to_str()?;
    let family = match extension {
        "js" => "js",
        "css" | "scss" => "css",
        _ => return None,
    };
    Some(format!("MediaWiki:Common.{family}/{name}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum DeployResult {
    Changed,
    NoChange,
    Failed(String),
}

impl DeployResult {
    pub fn from_edit(edit: &EditResponse) -> Self {
        match (edit.is_success(), edit.new_revision) {
            (true, Some(_)) => Self::Changed,
            (true, None) => Self::NoChange,
            (false, _) => Self::Failed(format!("edit result: {}", edit.result)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Signal for the CI layer; unchanged and skipped items produce none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployNotice {
    Changed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum ItemStatus {
    Skipped,
    Deployed(DeployResult),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemOutcome {
    pub source_path: PathBuf,
    pub page: Option<String>,
    pub status: ItemStatus,
    pub notice: Option<DeployNotice>,
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(&self.status, ItemStatus::Deployed(result) if result.is_failure())
    }

    pub fn is_change(&self) -> bool {
        self.status == ItemStatus::Deployed(DeployResult::Changed)
    }
}

/// Push `content` to `page` on `wiki` and classify the remote answer.
pub fn deploy_page<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    wiki: &WikiId,
    page: &str,
    content: &str,
    reason: &str,
) -> DeployResult {
    let token = match registry.acquire_token(wiki) {
        Ok(token) => token,
        Err(error) => return DeployResult::Failed(error_chain(&error)),
    };
    let summary = format!("{SUMMARY_PREFIX}{}", reason.trim());
    let response = registry.with_api(wiki, |api| {
        api.edit(&EditRequest {
            title: page,
            text: content,
            summary: &summary,
            token: &token,
        })
    });
    match response {
        Ok(Ok(edit)) => {
            registry.pause(wiki);
            DeployResult::from_edit(&edit)
        }
        Ok(Err(error)) => {
            registry.pause(wiki);
            DeployResult::Failed(error_chain(&error))
        }
        Err(error) => DeployResult::Failed(error_chain(&error)),
    }
}

/// Deploy `items` to `wiki` one by one. Failures are recorded and never stop later items.
pub fn deploy_items<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    wiki: &WikiId,
    items: &[DeployableItem],
    reason: &str,
    report: &mut RunReport,
) -> Vec<ItemOutcome> {
    let mut outcomes = Vec::with_capacity(items.len());
    for item in items {
        let path = item.display_path();
        let Some(page) = item.target_page.as_deref() else {
            info!(path = %path, "skipping, no page marker found");
            report.record(ReportEntry::new(
                EntryKind::Deploy,
                &path,
                EntryStatus::Skipped,
            ));
            outcomes.push(ItemOutcome {
                source_path: item.source_path.clone(),
                page: None,
                status: ItemStatus::Skipped,
                notice: None,
            });
            continue;
        };

        info!(wiki = %wiki, path = %path, page = %page, "deploying");
        let result = deploy_page(registry, wiki, page, &item.content, reason);
        let (status, notice) = match &result {
            DeployResult::Changed => (EntryStatus::Changed, Some(DeployNotice::Changed)),
            DeployResult::NoChange => (EntryStatus::Unchanged, None),
            DeployResult::Failed(_) => (EntryStatus::Failed, Some(DeployNotice::Failed)),
        };
        let mut entry = ReportEntry::new(EntryKind::Deploy, &path, status);
        if let DeployResult::Failed(detail) = &result {
            warn!(wiki = %wiki, path = %path, page = %page, detail = %detail, "deploy failed");
            entry = entry.with_detail(detail.clone());
        } else {
            let changed = result == DeployResult::Changed;
            info!(wiki = %wiki, page = %page, changed, "deployed");
        }
        report.record(entry);
        outcomes.push(ItemOutcome {
            source_path: item.source_path.clone(),
            page: Some(page.to_string()),
            status: ItemStatus::Deployed(result),
            notice,
        });
    }
    outcomes
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceDeployOutcome {
    pub items: Vec<ItemOutcome>,
    /// `None` when no bump was attempted.
    pub cache_updated: Option<bool>,
}

/// Deploy site resources to commons and bump the resource-loader cache version when every item
/// deployed and at least one of them changed.
pub fn deploy_resources<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    items: &[DeployableItem],
    reason: &str,
    cache_version: Option<&str>,
    report: &mut RunReport,
) -> ResourceDeployOutcome {
    let commons = WikiId::commons();
    let outcomes = deploy_items(registry, &commons, items, reason, report);
    let all_deployed = !outcomes.iter().any(ItemOutcome::is_failure);
    let changed = outcomes.iter().any(ItemOutcome::is_change);

    let cache_updated = match cache_version {
        Some(_) if !all_deployed => {
            warn!("some resources failed to deploy; cache version not updated");
            None
        }
        Some(version) if changed => Some(update_cache_version(registry, &commons, version, report)),
        _ => None,
    };
    ResourceDeployOutcome {
        items: outcomes,
        cache_updated,
    }
}

pub fn update_cache_version<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    wiki: &WikiId,
    version: &str,
    report: &mut RunReport,
) -> bool {
    let subject = format!("{wiki}:{CACHE_VERSION_MESSAGE}");
    let outcome = registry
        .acquire_token(wiki)
        .map_err(|error| error_chain(&error))
        .and_then(|_| {
            let response = registry
                .with_api(wiki, |api| {
                    api.set_message(CACHE_VERSION_MESSAGE, version.trim())
                })
                .map_err(|error| error_chain(&error))?;
            registry.pause(wiki);
            response.map_err(|error| error_chain(&error))
        });
    match outcome {
        Ok(status) if status == CACHE_UPDATED_STATUS => {
            info!(wiki = %wiki, version = %version.trim(), "resource cache version updated");
            report.record(ReportEntry::new(
                EntryKind::Cache,
                subject,
                EntryStatus::Changed,
            ));
            true
        }
        Ok(status) => {
            warn!(wiki = %wiki, status = %status, "resource cache version not updated");
            report.record(
                ReportEntry::new(EntryKind::Cache, subject, EntryStatus::Failed)
                    .with_detail(status),
            );
            false
        }
        Err(detail) => {
            warn!(wiki = %wiki, detail = %detail, "resource cache version not updated");
            report.record(
                ReportEntry::new(EntryKind::Cache, subject, EntryStatus::Failed)
                    .with_detail(detail),
            );
            false
        }
    }
}
