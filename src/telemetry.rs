use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::pass::PassReport;

const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassSummary {
    pub updated_at: String,
    pub source: String,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub rejected: usize,
}

impl From<&PassReport> for PassSummary {
    fn from(report: &PassReport) -> Self {
        Self {
            updated_at: Utc::now().to_rfc3339(),
            source: report.source.as_str().to_string(),
            executed: report.executed(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            skipped: report.skipped(),
            rejected: report.rejected(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunReportSnapshot {
    pub schema_version: u32,
    pub updated_at: String,
    pub phases: BTreeMap<String, PassSummary>,
}

impl Default for RunReportSnapshot {
    fn default() -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            updated_at: Utc::now().to_rfc3339(),
            phases: BTreeMap::new(),
        }
    }
}

/// Last-pass counters per phase, persisted as one JSON document.
pub struct RunReportStore {
    path: PathBuf,
    snapshot: RunReportSnapshot,
}

impl RunReportStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load_snapshot(&path)?;
        Ok(Self { path, snapshot })
    }

    pub fn record_pass(&mut self, report: &PassReport) -> Result<()> {
        self.snapshot.schema_version = REPORT_SCHEMA_VERSION;
        self.snapshot.updated_at = Utc::now().to_rfc3339();
        self.snapshot
            .phases
            .insert(report.phase.name().to_string(), PassSummary::from(report));
        self.persist()
    }

    pub fn snapshot(&self) -> RunReportSnapshot {
        self.snapshot.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating report dir {}", parent.display()))?;
        }

        let payload = serde_json::to_string_pretty(&self.snapshot)
            .context("failed encoding run report")?;
        let tmp_path = self.path.with_extension("tmp");

        fs::write(&tmp_path, payload).with_context(|| {
            format!("failed writing temporary report file {}", tmp_path.display())
        })?;
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed moving run report {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<RunReportSnapshot> {
    if !path.exists() {
        return Ok(RunReportSnapshot::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading run report {}", path.display()))?;
    let mut snapshot: RunReportSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding run report {}", path.display()))?;

    if snapshot.schema_version == 0 {
        snapshot.schema_version = REPORT_SCHEMA_VERSION;
    }
    if snapshot.updated_at.trim().is_empty() {
        snapshot.updated_at = Utc::now().to_rfc3339();
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::RunReportStore;
    use crate::integrity::Rejection;
    use crate::pass::{ItemReport, ItemStatus, PassReport};
    use crate::phase::{ItemKind, Phase};
    use crate::source::SourceKind;

    fn item(identity: &str, status: ItemStatus) -> ItemReport {
        ItemReport {
            identity: identity.to_string(),
            kind: ItemKind::Script,
            status,
            deleted: false,
        }
    }

    #[test]
    fn record_pass_persists_counters_per_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("last-run.json");
        let mut store = RunReportStore::new(&path).expect("report store");

        let report = PassReport {
            phase: Phase::LoginOnce,
            source: SourceKind::Directory,
            items: vec![
                item("/a.sh", ItemStatus::Succeeded),
                item("/b.sh", ItemStatus::Failed { exit_code: Some(2) }),
                item("/c.sh", ItemStatus::SkippedCompleted),
                item("/d.sh", ItemStatus::Rejected(Rejection::ChecksumMissing)),
            ],
        };
        store.record_pass(&report).expect("record pass");

        let reopened = RunReportStore::new(&path).expect("reopen");
        let summary = reopened
            .snapshot()
            .phases
            .get("login-once")
            .cloned()
            .expect("login-once summary");
        assert_eq!(summary.source, "directory");
        assert_eq!(summary.executed, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.rejected, 1);
    }

    #[test]
    fn corrupt_report_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("last-run.json");
        std::fs::write(&path, "{not json").expect("write");
        assert!(RunReportStore::new(&path).is_err());
    }
}
