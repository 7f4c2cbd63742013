//! Removal of preview copies left behind by dev-environment deploys.

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{NS_MODULE, SearchQuery, WikiApi, WikiConnector};
use crate::error::error_chain;
use crate::report::{EntryKind, EntryStatus, ReportEntry, RunReport};
use crate::session::SessionRegistry;
use crate::wiki::WikiId;

pub const SEARCH_LIMIT: usize = 5000;

/// Which search hits count as copies of the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalFilter {
    /// Title ends with the marker, e.g. `Module:Table/dev`.
    ExactSuffix,
    /// Marker appears anywhere in the title, which also catches sub-pages such as
    /// `Module:Table/dev/Data`.
    MarkerAnywhere,
    /// Every search hit, trusting the title search.
    AllMatches,
}

impl RemovalFilter {
    pub fn from_flags(include_sub_environments: bool) -> Self {
        if include_sub_environments {
            Self::AllMatches
        } else {
            Self::ExactSuffix
        }
    }

    pub fn is_candidate(self, title: &str, marker: &str) -> bool {
        match self {
            Self::ExactSuffix => title.ends_with(marker),
            Self::MarkerAnywhere => title.contains(marker),
            Self::AllMatches => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RemovalOutcome {
    Deleted,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalRecord {
    pub wiki: WikiId,
    pub title: String,
    pub outcome: RemovalOutcome,
}

/// Search `wiki` for module pages carrying `marker` and delete the ones `filter` accepts.
///
/// The search runs without logging in; a login only happens once there is something to delete.
pub fn remove_dev_copies<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    wiki: &WikiId,
    marker: &str,
    filter: RemovalFilter,
    report: &mut RunReport,
) -> Result<Vec<RemovalRecord>> {
    let marker = marker.trim();
    if marker.is_empty() {
        bail!("refusing to remove dev copies without an environment marker");
    }

    let search = format!("intitle:{marker}");
    let found = registry.with_api(wiki, |api| {
        api.search_titles(&SearchQuery {
            search: &search,
            namespace: NS_MODULE,
            limit: SEARCH_LIMIT,
        })
    });
    registry.pause(wiki);
    let detail = match found {
        Ok(Ok(titles)) => Ok(titles),
        Ok(Err(error)) => Err(error_chain(&error)),
        Err(error) => Err(error_chain(&error)),
    };
    let titles = match detail {
        Ok(titles) => titles,
        Err(detail) => return Ok(vec![search_failure(wiki, marker, detail, report)]),
    };
    debug!(wiki = %wiki, hits = titles.len(), "search finished");

    let reason = format!("Remove {marker}");
    let mut records = Vec::with_capacity(titles.len());
    for title in titles {
        let outcome = if filter.is_candidate(&title, marker) {
            delete_page(registry, wiki, &title, &reason)
        } else {
            RemovalOutcome::Skipped
        };
        let subject = format!("{wiki}:{title}");
        match &outcome {
            RemovalOutcome::Deleted => {
                info!(wiki = %wiki, title = %title, "deleted");
                report.record(ReportEntry::new(
                    EntryKind::Remove,
                    subject,
                    EntryStatus::Deleted,
                ));
            }
            RemovalOutcome::Skipped => {
                debug!(wiki = %wiki, title = %title, "not a copy of this environment");
                report.record(ReportEntry::new(
                    EntryKind::Remove,
                    subject,
                    EntryStatus::Skipped,
                ));
            }
            RemovalOutcome::Failed(detail) => {
                warn!(wiki = %wiki, title = %title, detail = %detail, "could not delete");
                report.record(
                    ReportEntry::new(EntryKind::Remove, subject, EntryStatus::Failed)
                        .with_detail(detail.clone()),
                );
            }
        }
        records.push(RemovalRecord {
            wiki: wiki.clone(),
            title,
            outcome,
        });
    }
    Ok(records)
}

fn search_failure(
    wiki: &WikiId,
    marker: &str,
    detail: String,
    report: &mut RunReport,
) -> RemovalRecord {
    let title = format!("intitle:{marker}");
    warn!(wiki = %wiki, detail = %detail, "dev copy search failed");
    report.record(
        ReportEntry::new(EntryKind::Remove, format!("{wiki}:{title}"), EntryStatus::Failed)
            .with_detail(detail.clone()),
    );
    RemovalRecord {
        wiki: wiki.clone(),
        title,
        outcome: RemovalOutcome::Failed(detail),
    }
}

fn delete_page<C: WikiConnector>(
    registry: &SessionRegistry<C>,
    wiki: &WikiId,
    title: &str,
    reason: &str,
) -> RemovalOutcome {
    let token = match registry.acquire_token(wiki) {
        Ok(token) => token,
        Err(error) => return RemovalOutcome::Failed(error_chain(&error)),
    };
    let deleted = registry.with_api(wiki, |api| api.delete(title, reason, &token));
    if deleted.is_ok() {
        registry.pause(wiki);
    }
    match deleted {
        Ok(Ok(true)) => RemovalOutcome::Deleted,
        Ok(Ok(false)) => RemovalOutcome::Failed("no deletion confirmation in response".to_string()),
        Ok(Err(error)) => RemovalOutcome::Failed(error_chain(&error)),
        Err(error) => RemovalOutcome::Failed(error_chain(&error)),
    }
}

/// Wikis to sweep: the explicit list when given, otherwise the whole farm. Commons is only
/// swept from the farm list when `include_commons` is set.
pub fn sweep_targets(explicit: &[WikiId], farm: &[WikiId], include_commons: bool) -> Vec<WikiId> {
    if !explicit.is_empty() {
        return explicit.to_vec();
    }
    let mut wikis = farm
        .iter()
        .filter(|wiki| include_commons || !wiki.is_commons())
        .cloned()
        .collect::<Vec<_>>();
    wikis.sort();
    wikis.dedup();
    wikis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, registry_with, wiki};

    #[test]
    fn filters_classify_titles() {
        let marker = "/dev";
        assert!(RemovalFilter::ExactSuffix.is_candidate("Module:Table/dev", marker));
        assert!(!RemovalFilter::ExactSuffix.is_candidate("Module:Table/dev/Data", marker));
        assert!(RemovalFilter::MarkerAnywhere.is_candidate("Module:Table/dev/Data", marker));
        assert!(!RemovalFilter::MarkerAnywhere.is_candidate("Module:Developer", "/dev"));
        assert!(RemovalFilter::AllMatches.is_candidate("Module:Developer", marker));
        assert_eq!(RemovalFilter::from_flags(true), RemovalFilter::AllMatches);
        assert_eq!(RemovalFilter::from_flags(false), RemovalFilter::ExactSuffix);
    }

    #[test]
    fn titles_without_the_suffix_are_skipped() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        connector.seed_search(&dota, &["Module:Table/dev", "Module:Table/dev/Data"]);
        let registry = registry_with(connector.clone());
        let mut report = RunReport::new();

        let records =
            remove_dev_copies(&registry, &dota, "/dev", RemovalFilter::ExactSuffix, &mut report)
                .expect("sweep");

        assert_eq!(records[0].outcome, RemovalOutcome::Deleted);
        assert_eq!(records[1].outcome, RemovalOutcome::Skipped);
        assert_eq!(
            connector.state().deletes,
            vec![(dota.clone(), "Module:Table/dev".to_string())]
        );
        assert_eq!(
            report.lines(),
            vec![
                "dota2:Module:Table/dev deleted",
                "dota2:Module:Table/dev/Data skipped",
            ]
        );
        assert!(report.all_succeeded());
    }

    #[test]
    fn sub_environments_are_removed_when_included() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        connector.seed_search(&dota, &["Module:Table/dev", "Module:Table/dev/Data"]);
        let registry = registry_with(connector.clone());
        let mut report = RunReport::new();

        let records = remove_dev_copies(
            &registry,
            &dota,
            "/dev",
            RemovalFilter::from_flags(true),
            &mut report,
        )
        .expect("sweep");

        assert!(records.iter().all(|r| r.outcome == RemovalOutcome::Deleted));
        assert_eq!(connector.calls(&dota, "delete"), 2);
        assert_eq!(connector.calls(&dota, "login"), 1);
        assert_eq!(connector.calls(&dota, "csrf_token"), 2);
    }

    #[test]
    fn empty_search_needs_no_login() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        let registry = registry_with(connector.clone());
        let mut report = RunReport::new();

        let records =
            remove_dev_copies(&registry, &dota, "/dev", RemovalFilter::ExactSuffix, &mut report)
                .expect("sweep");

        assert!(records.is_empty());
        assert_eq!(connector.calls(&dota, "login"), 0);
        assert_eq!(connector.pauses(&dota), 1);
        assert!(report.entries().is_empty());
    }

    #[test]
    fn unconfirmed_delete_fails_but_the_sweep_continues() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        connector.seed_search(&dota, &["Module:A/dev", "Module:B/dev"]);
        connector.refuse_delete(&dota, "Module:A/dev");
        let registry = registry_with(connector.clone());
        let mut report = RunReport::new();

        let records =
            remove_dev_copies(&registry, &dota, "/dev", RemovalFilter::ExactSuffix, &mut report)
                .expect("sweep");

        assert!(matches!(records[0].outcome, RemovalOutcome::Failed(_)));
        assert_eq!(records[1].outcome, RemovalOutcome::Deleted);
        assert!(!report.all_succeeded());
        assert_eq!(
            report.lines()[0],
            ":warning: could not delete dota2:Module:A/dev: no deletion confirmation in response"
        );
    }

    #[test]
    fn search_failure_is_recorded_not_raised() {
        let connector = MockConnector::default();
        let dota = wiki("dota2");
        connector.fail_search(&dota);
        let registry = registry_with(connector.clone());
        let mut report = RunReport::new();

        let records =
            remove_dev_copies(&registry, &dota, "/dev", RemovalFilter::ExactSuffix, &mut report)
                .expect("sweep");

        assert_eq!(records.len(), 1);
        assert!(matches!(records[0].outcome, RemovalOutcome::Failed(_)));
        assert!(!report.all_succeeded());
    }

    #[test]
    fn empty_marker_is_refused() {
        let connector = MockConnector::default();
        let registry = registry_with(connector.clone());
        let mut report = RunReport::new();

        let result = remove_dev_copies(
            &registry,
            &wiki("dota2"),
            "  ",
            RemovalFilter::AllMatches,
            &mut report,
        );

        assert!(result.is_err());
        assert_eq!(connector.connections(), 0);
    }

    #[test]
    fn commons_is_swept_only_when_included() {
        let farm = vec![wiki("valorant"), wiki("commons"), wiki("dota2")];

        assert_eq!(
            sweep_targets(&[], &farm, false),
            vec![wiki("dota2"), wiki("valorant")]
        );
        assert_eq!(sweep_targets(&[], &farm, true).len(), 3);
        assert_eq!(
            sweep_targets(&[wiki("commons")], &farm, false),
            vec![wiki("commons")]
        );
    }
}
