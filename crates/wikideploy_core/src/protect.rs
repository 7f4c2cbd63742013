//! Protection reconciliation.
//!
//! Pages maintained from git are locked on the wiki that owns them. Shared commons modules are
//! additionally create-protected on every other wiki that has no local override, so nobody can
//! shadow them by accident.

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::api::{ProtectRequest, ProtectionEntry, WikiApi, WikiConnector};
use crate::config::DeployConfig;
use crate::error::error_chain;
use crate::report::{EntryKind, EntryStatus, ReportEntry, RunReport};
use crate::session::SessionRegistry;
use crate::wiki::WikiId;

pub const MODULE_PREFIX: &str = "Module:";
pub const TEMPLATE_PREFIX: &str = "Template:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionMode {
    /// Lock edit and move on a page that is expected to exist.
    MustExistLocked,
    /// Create-protect a title that must stay empty.
    MustNotExistLocked,
}

impl ProtectionMode {
    fn actions(self) -> &'static [&'static str] {
        match self {
            Self::MustExistLocked => &["edit", "move"],
            Self::MustNotExistLocked => &["create"],
        }
    }

    pub fn protections(self, level: &str) -> String {
        self.actions()
            .iter()
            .map(|action| format!("{action}={level}"))
            .collect::<Vec<_>>()
            .join("|")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectionTarget {
    pub wiki: WikiId,
    pub title: String,
    pub mode: ProtectionMode,
}

impl ProtectionTarget {
    pub fn new(wiki: WikiId, title: impl Into<String>, mode: ProtectionMode) -> Self {
        Self {
            wiki,
            title: title.into(),
            mode,
        }
    }
}

impl fmt::Display for ProtectionTarget {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.wiki, self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ProtectionOutcome {
    Applied,
    Conflict(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionPolicy {
    pub level: String,
    pub reason: String,
}

impl ProtectionPolicy {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            level: config.protection_level(),
            reason: config.protection_reason(),
        }
    }
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self::from_config(&DeployConfig::default())
    }
}

/// Bring one target into its required protection state.
pub fn reconcile<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    target: &ProtectionTarget,
    policy: &ProtectionPolicy,
) -> ProtectionOutcome {
    if target.mode == ProtectionMode::MustNotExistLocked {
        let exists = registry.with_api(&target.wiki, |api| api.page_exists(&target.title));
        registry.pause(&target.wiki);
        match exists {
            Ok(Ok(false)) => {}
            Ok(Ok(true)) => {
                return ProtectionOutcome::Conflict(format!(
                    "{} already exists on {}",
                    target.title, target.wiki
                ));
            }
            Ok(Err(error)) => return ProtectionOutcome::Failed(error_chain(&error)),
            Err(error) => return ProtectionOutcome::Failed(error_chain(&error)),
        }
    }
    protect(registry, target, policy)
}

fn protect<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    target: &ProtectionTarget,
    policy: &ProtectionPolicy,
) -> ProtectionOutcome {
    let token = match registry.acquire_token(&target.wiki) {
        Ok(token) => token,
        Err(error) => return ProtectionOutcome::Failed(error_chain(&error)),
    };
    let protections = target.mode.protections(&policy.level);
    let applied = registry.with_api(&target.wiki, |api| {
        api.protect(&ProtectRequest {
            title: &target.title,
            protections: &protections,
            reason: &policy.reason,
            token: &token,
        })
    });
    let entries = match applied {
        Ok(Ok(entries)) => {
            registry.pause(&target.wiki);
            entries
        }
        Ok(Err(error)) => {
            registry.pause(&target.wiki);
            return ProtectionOutcome::Failed(error_chain(&error));
        }
        Err(error) => return ProtectionOutcome::Failed(error_chain(&error)),
    };

    let missing = target
        .mode
        .actions()
        .iter()
        .filter(|action| !grants(&entries, action, &policy.level))
        .copied()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        ProtectionOutcome::Applied
    } else {
        ProtectionOutcome::Failed(format!(
            "could not ({}) protect {}",
            missing.join("|"),
            target.title
        ))
    }
}

fn grants(entries: &[ProtectionEntry], action: &str, level: &str) -> bool {
    entries
        .iter()
        .any(|entry| entry.action == action && entry.level == level)
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtectionRecord {
    pub target: ProtectionTarget,
    pub outcome: ProtectionOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtectionBatch {
    pub records: Vec<ProtectionRecord>,
}

impl ProtectionBatch {
    pub fn all_applied(&self) -> bool {
        self.records
            .iter()
            .all(|record| record.outcome == ProtectionOutcome::Applied)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProtectionRecord> {
        self.records
            .iter()
            .filter(|record| record.outcome != ProtectionOutcome::Applied)
    }
}

/// Reconcile every target in order. Outcomes are recorded, never raised.
pub fn reconcile_all<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    targets: &[ProtectionTarget],
    policy: &ProtectionPolicy,
    report: &mut RunReport,
) -> ProtectionBatch {
    let mut batch = ProtectionBatch::default();
    for target in targets {
        info!(
            wiki = %target.wiki,
            title = %target.title,
            mode = ?target.mode,
            "checking protection"
        );
        let outcome = reconcile(registry, target, policy);
        let subject = target.to_string();
        let entry = match &outcome {
            ProtectionOutcome::Applied => {
                info!(wiki = %target.wiki, title = %target.title, "protected");
                ReportEntry::new(EntryKind::Protect, subject, EntryStatus::Protected)
            }
            ProtectionOutcome::Conflict(detail) => {
                warn!(wiki = %target.wiki, title = %target.title, "page already exists");
                ReportEntry::new(EntryKind::Protect, subject, EntryStatus::Conflict)
                    .with_detail(detail.clone())
            }
            ProtectionOutcome::Failed(detail) => {
                warn!(
                    wiki = %target.wiki,
                    title = %target.title,
                    detail = %detail,
                    "protection failed"
                );
                ReportEntry::new(EntryKind::Protect, subject, EntryStatus::Failed)
                    .with_detail(detail.clone())
            }
        };
        report.record(entry);
        batch.records.push(ProtectionRecord {
            target: target.clone(),
            outcome,
        });
    }
    batch
}

/// A module source file, identified by the wiki directory it lives in and its module path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub wiki: WikiId,
    pub module: String,
}

impl ModuleSource {
    pub fn page(&self) -> String {
        format!("{MODULE_PREFIX}{}", self.module)
    }
}

/// Expand module sources into protection targets.
///
/// With `wiki_to_protect` set, only that wiki is touched: its own modules get locked and commons
/// modules get create-protected there unless the wiki overrides them locally. Without it, every
/// module is locked on its own wiki and commons modules are create-protected on every wiki in
/// `all_wikis` that has no local version.
pub fn plan_module_targets(
    sources: &[ModuleSource],
    wiki_to_protect: Option<&WikiId>,
    all_wikis: &[WikiId],
    has_local_version: impl Fn(&WikiId, &str) -> bool,
) -> Vec<ProtectionTarget> {
    let shadow_target = |wiki: &WikiId, source: &ModuleSource| {
        (!wiki.is_commons() && !has_local_version(wiki, &source.module)).then(|| {
            ProtectionTarget::new(
                wiki.clone(),
                source.page(),
                ProtectionMode::MustNotExistLocked,
            )
        })
    };

    let mut targets = Vec::new();
    for source in sources {
        match wiki_to_protect {
            Some(wiki) if *wiki == source.wiki => targets.push(ProtectionTarget::new(
                wiki.clone(),
                source.page(),
                ProtectionMode::MustExistLocked,
            )),
            Some(wiki) if source.wiki.is_commons() => {
                targets.extend(shadow_target(wiki, source));
            }
            Some(_) => {}
            None => {
                targets.push(ProtectionTarget::new(
                    source.wiki.clone(),
                    source.page(),
                    ProtectionMode::MustExistLocked,
                ));
                if source.wiki.is_commons() {
                    targets.extend(all_wikis.iter().filter_map(|wiki| shadow_target(wiki, source)));
                }
            }
        }
    }
    targets
}

/// Templates live on commons; every other wiki keeps the title create-protected.
pub fn plan_template_targets<'a>(
    wiki: &WikiId,
    names: impl IntoIterator<Item = &'a str>,
) -> Vec<ProtectionTarget> {
    let mode = if wiki.is_commons() {
        ProtectionMode::MustExistLocked
    } else {
        ProtectionMode::MustNotExistLocked
    };
    names
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| ProtectionTarget::new(wiki.clone(), format!("{TEMPLATE_PREFIX}{name}"), mode))
        .collect()
}
