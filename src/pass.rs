use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::executor::{Executor, Outcome};
use crate::integrity::{IntegrityGate, Rejection};
use crate::ledger::{LedgerScope, RunDecision, RunOnceLedger};
use crate::payload::materialize;
use crate::phase::{Item, ItemKind, ItemOrigin, ItemSource, Phase};
use crate::prefs::PreferenceStore;
use crate::source::{remove_path, ResolvedItems, SourceKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Succeeded,
    Failed { exit_code: Option<i32> },
    SkippedCompleted,
    Rejected(Rejection),
    MaterializeFailed { message: String },
}

#[derive(Debug, Clone)]
pub struct ItemReport {
    pub identity: String,
    pub kind: ItemKind,
    pub status: ItemStatus,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct PassReport {
    pub phase: Phase,
    pub source: SourceKind,
    pub items: Vec<ItemReport>,
}

impl PassReport {
    pub fn empty(phase: Phase, source: SourceKind) -> Self {
        Self {
            phase,
            source,
            items: Vec::new(),
        }
    }

    pub fn item(&self, identity: &str) -> Option<&ItemReport> {
        self.items.iter().find(|item| item.identity == identity)
    }

    pub fn executed(&self) -> usize {
        self.count(|status| {
            matches!(
                status,
                ItemStatus::Succeeded | ItemStatus::Failed { .. }
            )
        })
    }

    pub fn succeeded(&self) -> usize {
        self.count(|status| matches!(status, ItemStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|status| {
            matches!(
                status,
                ItemStatus::Failed { .. } | ItemStatus::MaterializeFailed { .. }
            )
        })
    }

    pub fn skipped(&self) -> usize {
        self.count(|status| matches!(status, ItemStatus::SkippedCompleted))
    }

    pub fn rejected(&self) -> usize {
        self.count(|status| matches!(status, ItemStatus::Rejected(_)))
    }

    fn count(&self, predicate: impl Fn(&ItemStatus) -> bool) -> usize {
        self.items
            .iter()
            .filter(|item| predicate(&item.status))
            .count()
    }
}

/// One sequential pass over a phase. Packages run before scripts, and each
/// group loads and flushes its own ledger copy.
pub struct PhasePass<'a> {
    phase: Phase,
    gate: &'a IntegrityGate,
    executor: &'a Executor,
    overrides: &'a BTreeMap<String, DateTime<Utc>>,
    scope: LedgerScope,
}

impl<'a> PhasePass<'a> {
    pub fn new(
        phase: Phase,
        gate: &'a IntegrityGate,
        executor: &'a Executor,
        overrides: &'a BTreeMap<String, DateTime<Utc>>,
        console_user: &str,
    ) -> Self {
        Self {
            phase,
            gate,
            executor,
            overrides,
            scope: LedgerScope::for_phase(phase, console_user),
        }
    }

    pub fn run(&self, store: &mut dyn PreferenceStore, resolved: ResolvedItems) -> PassReport {
        let mut report = PassReport::empty(self.phase, resolved.source);
        info!(
            phase = %self.phase,
            source = resolved.source.as_str(),
            items = resolved.items.len(),
            "processing phase"
        );

        let mut packages = Vec::new();
        let mut scripts = Vec::new();
        for item in resolved.items {
            if let ItemSource::File(path) = &item.source {
                if let Err(rejection) = self.gate.verify_ownership(path) {
                    error!(item = %item.identity, reason = %rejection, "bad permissions");
                    report.items.push(ItemReport {
                        identity: item.identity.clone(),
                        kind: item.kind,
                        status: ItemStatus::Rejected(rejection),
                        deleted: false,
                    });
                    continue;
                }
            }
            match item.kind {
                ItemKind::Package => packages.push(item),
                ItemKind::Script => scripts.push(item),
            }
        }

        for group in [packages, scripts] {
            if !group.is_empty() {
                self.run_group(store, group, &mut report);
            }
        }

        info!(
            phase = %self.phase,
            executed = report.executed(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            rejected = report.rejected(),
            "phase complete"
        );
        report
    }

    fn run_group(&self, store: &mut dyn PreferenceStore, group: Vec<Item>, report: &mut PassReport) {
        let mut ledger = self
            .phase
            .is_once()
            .then(|| RunOnceLedger::load(store, self.scope.clone()));

        for item in group {
            let entry = self.process(&item, ledger.as_mut());
            report.items.push(entry);
        }

        if let Some(ledger) = ledger {
            match ledger.flush(store) {
                Ok(true) => debug!(scope = %ledger.scope().storage_key(), "run-once ledger saved"),
                Ok(false) => {}
                Err(err) => error!(error = %format!("{err:#}"), "failed saving run-once ledger"),
            }
        }
    }

    fn process(&self, item: &Item, ledger: Option<&mut RunOnceLedger>) -> ItemReport {
        // Removing the file consumes a delete-after-run item, so the ledger
        // only tracks payloads there.
        let ledger = match item.origin() {
            ItemOrigin::Directory if self.phase.deletes_after_run() => None,
            _ => ledger,
        };
        let mut entry = ItemReport {
            identity: item.identity.clone(),
            kind: item.kind,
            status: ItemStatus::SkippedCompleted,
            deleted: false,
        };

        if let Err(rejection) = self.gate.verify_checksum(item) {
            error!(item = %item.identity, reason = %rejection, "checksum verification failed");
            entry.status = ItemStatus::Rejected(rejection);
            return entry;
        }

        let decision = ledger
            .as_deref()
            .map(|ledger| ledger.decide(&item.identity, self.overrides));
        match decision {
            Some(RunDecision::Skip { last_success }) => {
                debug!(item = %item.identity, %last_success, "already completed; no newer override");
            }
            Some(RunDecision::OverrideRun {
                last_success,
                override_at,
            }) => {
                info!(item = %item.identity, %last_success, %override_at, "actioning override");
                entry.status = self.execute(item);
            }
            Some(RunDecision::FirstRun) | None => {
                entry.status = self.execute(item);
            }
        }

        if let Some(ledger) = ledger {
            let consumed = self.phase.deletes_after_run()
                && !matches!(decision, Some(RunDecision::Skip { .. }));
            if entry.status == ItemStatus::Succeeded || consumed {
                ledger.record_success(&item.identity, Utc::now());
            }
        }

        if self.phase.deletes_after_run() {
            if let ItemSource::File(path) = &item.source {
                entry.deleted = self.delete_after_run(path);
            }
        }
        entry
    }

    fn execute(&self, item: &Item) -> ItemStatus {
        let outcome = match &item.source {
            ItemSource::File(path) => self.executor.run(item, path),
            ItemSource::Inline(content) => {
                let temp = match materialize(content) {
                    Ok(temp) => temp,
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!(item = %item.identity, error = %message, "failed materializing payload");
                        return ItemStatus::MaterializeFailed { message };
                    }
                };
                let outcome = self.executor.run(item, &temp);
                if let Err(err) = temp.close() {
                    warn!(item = %item.identity, error = %err, "failed removing payload temp file");
                }
                outcome
            }
        };
        status_of(&outcome)
    }

    fn delete_after_run(&self, path: &Path) -> bool {
        match remove_path(path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed after run");
                true
            }
            Err(err) => {
                error!(path = %path.display(), error = %format!("{err:#}"), "failed removing item");
                false
            }
        }
    }
}

fn status_of(outcome: &Outcome) -> ItemStatus {
    if outcome.ok {
        ItemStatus::Succeeded
    } else {
        ItemStatus::Failed {
            exit_code: outcome.exit_code,
        }
    }
}
