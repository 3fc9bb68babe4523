use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::phase::Phase;
use crate::prefs::{read_typed, PreferenceStore};

const MACHINE_LEDGER_KEY: &str = "run_once_boot";
const USER_LEDGER_KEY_PREFIX: &str = "run_once-";

/// Where a ledger lives: boot phases share one machine-wide ledger, login
/// phases get one per console user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerScope {
    Machine,
    User(String),
}

impl LedgerScope {
    pub fn for_phase(phase: Phase, console_user: &str) -> Self {
        if phase.is_boot() {
            LedgerScope::Machine
        } else {
            LedgerScope::User(console_user.to_string())
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            LedgerScope::Machine => MACHINE_LEDGER_KEY.to_string(),
            LedgerScope::User(user) => format!("{USER_LEDGER_KEY_PREFIX}{user}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    /// No ledger entry yet.
    FirstRun,
    /// Completed before, but an administrator override is newer.
    OverrideRun {
        last_success: DateTime<Utc>,
        override_at: DateTime<Utc>,
    },
    Skip { last_success: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct RunOnceLedger {
    scope: LedgerScope,
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl RunOnceLedger {
    pub fn load(store: &dyn PreferenceStore, scope: LedgerScope) -> Self {
        let entries = read_typed(store, &scope.storage_key(), BTreeMap::new());
        debug!(scope = %scope.storage_key(), entries = entries.len(), "loaded run-once ledger");
        Self { scope, entries }
    }

    pub fn scope(&self) -> &LedgerScope {
        &self.scope
    }

    pub fn decide(
        &self,
        identity: &str,
        overrides: &BTreeMap<String, DateTime<Utc>>,
    ) -> RunDecision {
        let Some(last_success) = self.last_success(identity) else {
            return RunDecision::FirstRun;
        };
        match overrides.get(identity).copied() {
            Some(override_at) if override_at > last_success => RunDecision::OverrideRun {
                last_success,
                override_at,
            },
            _ => RunDecision::Skip { last_success },
        }
    }

    pub fn record_success(&mut self, identity: &str, at: DateTime<Utc>) {
        self.entries.insert(identity.to_string(), at);
    }

    pub fn last_success(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.entries.get(identity).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// An empty ledger is never written. Returns whether anything was.
    pub fn flush(&self, store: &mut dyn PreferenceStore) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        let key = self.scope.storage_key();
        let value = serde_json::to_value(&self.entries)
            .with_context(|| format!("failed encoding run-once ledger {key}"))?;
        store
            .set(&key, value)
            .with_context(|| format!("failed writing run-once ledger {key}"))?;
        Ok(true)
    }
}
