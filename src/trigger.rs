use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    OnDemand,
    OnDemandPrivileged,
    LoginPrivileged,
    Cleanup,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 4] = [
        TriggerKind::OnDemand,
        TriggerKind::OnDemandPrivileged,
        TriggerKind::LoginPrivileged,
        TriggerKind::Cleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TriggerKind::OnDemand => "ondemand",
            TriggerKind::OnDemandPrivileged => "ondemand-privileged",
            TriggerKind::LoginPrivileged => "login-privileged",
            TriggerKind::Cleanup => "cleanup",
        }
    }

    pub fn file_name(self) -> String {
        format!(".io.macadmins.outset.{}.launchd", self.name())
    }
}

/// Existence-only signal between invocations. Check-then-delete is not
/// atomic: a raise racing a consume may be observed late or folded into the
/// earlier one.
#[derive(Debug, Clone)]
pub struct Trigger {
    kind: TriggerKind,
    path: PathBuf,
}

impl Trigger {
    pub fn new(dir: &Path, kind: TriggerKind) -> Self {
        Self {
            kind,
            path: dir.join(kind.file_name()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raise(&self) -> Result<()> {
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .with_context(|| format!("failed creating trigger {}", self.path.display()))?;
        debug!(trigger = self.kind.name(), path = %self.path.display(), "trigger raised");
        Ok(())
    }

    pub fn is_raised(&self) -> bool {
        self.path.exists()
    }

    /// Returns whether the trigger was raised. A trigger that vanished
    /// between the check and the delete still counts as consumed.
    pub fn try_consume(&self) -> bool {
        if !self.is_raised() {
            return false;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(trigger = self.kind.name(), "trigger consumed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(trigger = self.kind.name(), error = %err, "failed removing trigger")
            }
        }
        true
    }
}
