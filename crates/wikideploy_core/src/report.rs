//! Run-wide result aggregation.
//!
//! Every processed item becomes one [`ReportEntry`]. Entries are appended to the optional summary
//! file as they are recorded, so a run that dies halfway still leaves a readable partial report.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deploy,
    Protect,
    Remove,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Changed,
    Unchanged,
    Skipped,
    Protected,
    Conflict,
    Deleted,
    Failed,
}

impl EntryStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Conflict | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub kind: EntryKind,
    pub subject: String,
    pub status: EntryStatus,
    pub detail: Option<String>,
}

impl ReportEntry {
    pub fn new(kind: EntryKind, subject: impl Into<String>, status: EntryStatus) -> Self {
        Self {
            kind,
            subject: subject.into(),
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn render(&self) -> String {
        let subject = &self.subject;
        let line = match (self.kind, self.status) {
            (_, EntryStatus::Skipped) => format!("{subject} skipped"),
            (EntryKind::Deploy, EntryStatus::Changed) => {
                format!(":information_source: {subject} successfully deployed (changed)")
            }
            (EntryKind::Deploy, EntryStatus::Unchanged) => {
                format!(":information_source: {subject} successfully deployed")
            }
            (EntryKind::Deploy, _) => format!(":warning: {subject} failed to deploy"),
            (EntryKind::Protect, EntryStatus::Protected) => format!("{subject} protected"),
            (EntryKind::Protect, EntryStatus::Conflict) => {
                format!(":warning: {subject} already exists")
            }
            (EntryKind::Protect, _) => format!(":warning: could not protect {subject}"),
            (EntryKind::Remove, EntryStatus::Deleted) => format!("{subject} deleted"),
            (EntryKind::Remove, _) => format!(":warning: could not delete {subject}"),
            (EntryKind::Cache, EntryStatus::Failed) => {
                format!(":warning: {subject} could not be updated")
            }
            (EntryKind::Cache, _) => format!("{subject} updated"),
        };
        match &self.detail {
            Some(detail) if self.status.is_failure() => format!("{line}: {detail}"),
            _ => line,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    entries: Vec<ReportEntry>,
    summary: Option<SummaryFile>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror each recorded line into `path` (appending, one line per entry).
    pub fn with_summary_file(path: &Path) -> Result<Self> {
        Ok(Self {
            entries: Vec::new(),
            summary: Some(SummaryFile::open(path)?),
        })
    }

    pub fn record(&mut self, entry: ReportEntry) {
        if let Some(summary) = &mut self.summary
            && let Err(error) = summary.append(&entry.render())
        {
            warn!(path = %summary.path.display(), error = %error, "failed to append summary line");
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(ReportEntry::render).collect()
    }

    /// True when nothing failed or conflicted. Skipped entries do not count against the run.
    pub fn all_succeeded(&self) -> bool {
        !self.entries.iter().any(|entry| entry.status.is_failure())
    }

    pub fn changes_made(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.status == EntryStatus::Changed)
    }

    pub fn count(&self, status: EntryStatus) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.status == status)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.status.is_failure())
    }

    pub fn summary(&self) -> ReportSummary {
        ReportSummary {
            success: self.all_succeeded(),
            changes_made: self.changes_made(),
            changed: self.count(EntryStatus::Changed),
            unchanged: self.count(EntryStatus::Unchanged),
            skipped: self.count(EntryStatus::Skipped),
            protected: self.count(EntryStatus::Protected),
            deleted: self.count(EntryStatus::Deleted),
            conflicts: self.count(EntryStatus::Conflict),
            failed: self.count(EntryStatus::Failed),
            entries: self.entries.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub success: bool,
    pub changes_made: bool,
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub protected: usize,
    pub deleted: usize,
    pub conflicts: usize,
    pub failed: usize,
    pub entries: Vec<ReportEntry>,
}

#[derive(Debug)]
struct SummaryFile {
    path: PathBuf,
    file: File,
}

impl SummaryFile {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open summary file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.file, "{line}")?;
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{EntryKind, EntryStatus, ReportEntry, RunReport};

    #[test]
    fn skipped_and_unchanged_entries_keep_the_run_successful() {
        let mut report = RunReport::new();
        report.record(ReportEntry::new(
            EntryKind::Deploy,
            "lua/wikis/commons/A.lua",
            EntryStatus::Unchanged,
        ));
        report.record(ReportEntry::new(
            EntryKind::Deploy,
            "lua/wikis/commons/README.lua",
            EntryStatus::Skipped,
        ));
        assert!(report.all_succeeded());
        assert!(!report.changes_made());
    }

    #[test]
    fn any_failure_or_conflict_fails_the_run() {
        let mut report = RunReport::new();
        report.record(ReportEntry::new(
            EntryKind::Deploy,
            "a.lua",
            EntryStatus::Changed,
        ));
        assert!(report.all_succeeded());
        report.record(
            ReportEntry::new(EntryKind::Protect, "dota2:Module:A", EntryStatus::Conflict)
                .with_detail("page already exists"),
        );
        assert!(!report.all_succeeded());
        assert!(report.changes_made());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.summary().conflicts, 1);
    }

    #[test]
    fn lines_render_one_per_entry() {
        let mut report = RunReport::new();
        report.record(ReportEntry::new(
            EntryKind::Deploy,
            "a.lua",
            EntryStatus::Unchanged,
        ));
        report.record(
            ReportEntry::new(EntryKind::Deploy, "b.lua", EntryStatus::Failed)
                .with_detail("protectedpage"),
        );
        report.record(ReportEntry::new(
            EntryKind::Remove,
            "dota2:Module:A/dev",
            EntryStatus::Deleted,
        ));
        assert_eq!(
            report.lines(),
            vec![
                ":information_source: a.lua successfully deployed",
                ":warning: b.lua failed to deploy: protectedpage",
                "dota2:Module:A/dev deleted",
            ]
        );
    }

    #[test]
    fn summary_file_is_appended_incrementally() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("summary.md");
        fs::write(&path, "previous step\n").expect("seed");

        let mut report = RunReport::with_summary_file(&path).expect("open");
        report.record(ReportEntry::new(
            EntryKind::Deploy,
            "a.lua",
            EntryStatus::Skipped,
        ));
        let partial = fs::read_to_string(&path).expect("read");
        assert_eq!(partial, "previous step\na.lua skipped\n");

        report.record(ReportEntry::new(
            EntryKind::Deploy,
            "b.lua",
            EntryStatus::Changed,
        ));
        let full = fs::read_to_string(&path).expect("read");
        assert_eq!(full.lines().count(), 3);
    }
}
