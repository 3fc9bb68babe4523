use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::executor::{Executor, HostRunner, ProcessRunner};
use crate::integrity::{checksum_inventory, compute_sha256_hex, IntegrityGate};
use crate::pass::{PassReport, PhasePass};
use crate::payload::PayloadBundles;
use crate::phase::{working_directories, Phase};
use crate::prefs::{load_approved_checksums, FilePreferenceStore, PreferenceStore, Preferences};
use crate::source::{clear_directory, TaskSource};
use crate::system::{
    wait_for_network, LaunchctlLoginSurface, LoginSurface, NetworkProbe, SessionIdentity,
    TcpProbe,
};
use crate::telemetry::RunReportStore;
use crate::trigger::{Trigger, TriggerKind};

const PAYLOAD_OVERRIDE_PREFIX: &str = "payload=";

pub struct Collaborators {
    pub runner: Arc<dyn ProcessRunner>,
    pub probe: Box<dyn NetworkProbe>,
    pub login_surface: Box<dyn LoginSurface>,
    pub identity: SessionIdentity,
    pub store: Box<dyn PreferenceStore>,
}

#[derive(Debug, Clone)]
pub struct BootReport {
    pub network_ready: bool,
    pub login_surface_suppressed: bool,
    pub boot_once: Option<PassReport>,
    pub boot_every: Option<PassReport>,
}

pub struct OutsetApp {
    settings: Settings,
    debug: bool,
    identity: SessionIdentity,
    probe: Box<dyn NetworkProbe>,
    login_surface: Box<dyn LoginSurface>,
    store: Box<dyn PreferenceStore>,
    prefs: Preferences,
    bundles: PayloadBundles,
    gate: IntegrityGate,
    executor: Executor,
    reports: Option<RunReportStore>,
}

impl OutsetApp {
    pub fn new(settings: Settings, debug: bool) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(HostRunner);
        let identity = SessionIdentity::detect(runner.as_ref(), settings.console_user.as_deref())?;
        let store = open_preference_store(&settings, identity.is_root)?;
        let collaborators = Collaborators {
            probe: Box::new(TcpProbe::new(settings.network_probe_addr.clone())),
            login_surface: Box::new(LaunchctlLoginSurface::new(runner.clone())),
            runner,
            identity,
            store: Box::new(store),
        };
        Self::with_collaborators(settings, debug, collaborators)
    }

    pub fn with_collaborators(
        settings: Settings,
        debug: bool,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let Collaborators {
            runner,
            probe,
            login_surface,
            identity,
            store,
        } = collaborators;

        let prefs = Preferences::load(store.as_ref());
        let debug = debug || settings.debug || prefs.verbose_logging;
        let bundles = PayloadBundles::load(store.as_ref(), debug);
        let gate = IntegrityGate::new(
            settings.required_owner_uid,
            load_approved_checksums(store.as_ref()),
        );
        if gate.verified_mode() {
            info!("approved checksums present; every item must match");
        }
        let executor = Executor::new(
            runner,
            settings.shell.clone(),
            identity.console_user.clone(),
            identity.is_root,
            settings.dmg_detach_delay(),
        );
        let reports = match RunReportStore::new(&settings.report_file) {
            Ok(reports) => Some(reports),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "run report unavailable");
                None
            }
        };

        Ok(Self {
            settings,
            debug,
            identity,
            probe,
            login_surface,
            store,
            prefs,
            bundles,
            gate,
            executor,
            reports,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn trigger(&self, kind: TriggerKind) -> Trigger {
        Trigger::new(&self.settings.trigger_dir, kind)
    }

    fn task_source(&self) -> TaskSource<'_> {
        TaskSource::new(&self.settings.root, &self.bundles)
    }

    pub fn run_phase(&mut self, phase: Phase) -> Result<PassReport> {
        if phase.requires_privilege() {
            self.ensure_root(&format!("process {phase}"))?;
        }
        let resolved = self
            .task_source()
            .resolve(phase)
            .with_context(|| format!("cannot process {phase}"))?;
        if resolved.is_empty() {
            debug!(phase = %phase, source = resolved.source.as_str(), "nothing to process");
            return Ok(PassReport::empty(phase, resolved.source));
        }

        let pass = PhasePass::new(
            phase,
            &self.gate,
            &self.executor,
            &self.prefs.override_login_once,
            &self.identity.console_user,
        );
        let report = pass.run(self.store.as_mut(), resolved);

        if let Some(reports) = self.reports.as_mut() {
            if let Err(err) = reports.record_pass(&report) {
                warn!(error = %format!("{err:#}"), "failed writing run report");
            }
        }
        Ok(report)
    }

    pub fn run_boot(&mut self) -> Result<BootReport> {
        self.ensure_root("execute boot tasks")?;
        info!("processing scheduled runs for boot");

        self.ensure_working_folders()?;
        self.prefs
            .write(self.store.as_mut())
            .context("failed persisting preferences")?;

        let mut network_ready = true;
        let mut login_surface_suppressed = false;
        if self.task_source().has_work(Phase::BootOnce) && self.prefs.wait_for_network {
            match self.login_surface.set_enabled(false) {
                Ok(()) => login_surface_suppressed = true,
                Err(err) => warn!(error = %format!("{err:#}"), "failed disabling login window"),
            }
            network_ready = wait_for_network(
                self.probe.as_ref(),
                Duration::from_secs(self.prefs.network_timeout_secs),
                self.settings.network_poll_interval(),
            );
        }

        let passes = self.run_boot_passes(network_ready);

        if login_surface_suppressed {
            match self.login_surface.set_enabled(true) {
                Ok(()) => debug!("login window restored"),
                Err(err) => error!(error = %format!("{err:#}"), "failed restoring login window"),
            }
        }

        let (boot_once, boot_every) = passes?;
        info!("boot processing complete");
        Ok(BootReport {
            network_ready,
            login_surface_suppressed,
            boot_once,
            boot_every,
        })
    }

    fn run_boot_passes(
        &mut self,
        network_ready: bool,
    ) -> Result<(Option<PassReport>, Option<PassReport>)> {
        let boot_once = if network_ready {
            Some(self.run_phase(Phase::BootOnce)?)
        } else {
            error!("unable to connect to network; skipping boot-once");
            None
        };
        let boot_every = Some(self.run_phase(Phase::BootEvery)?);
        Ok((boot_once, boot_every))
    }

    pub fn run_login(&mut self) -> Result<Vec<PassReport>> {
        info!(user = %self.identity.console_user, "processing scheduled runs for login");
        if self.console_user_ignored() {
            return Ok(Vec::new());
        }

        let reports = vec![
            self.run_phase(Phase::LoginOnce)?,
            self.run_phase(Phase::LoginEvery)?,
        ];

        let source = self.task_source();
        if source.has_work(Phase::LoginPrivilegedOnce) || source.has_work(Phase::LoginPrivilegedEvery)
        {
            self.raise(TriggerKind::LoginPrivileged);
        }
        Ok(reports)
    }

    pub fn run_login_privileged(&mut self) -> Result<Vec<PassReport>> {
        self.ensure_root("execute privileged login tasks")?;
        info!(user = %self.identity.console_user, "processing scheduled runs for privileged login");
        self.trigger(TriggerKind::LoginPrivileged).try_consume();
        if self.console_user_ignored() {
            return Ok(Vec::new());
        }
        Ok(vec![
            self.run_phase(Phase::LoginPrivilegedOnce)?,
            self.run_phase(Phase::LoginPrivilegedEvery)?,
        ])
    }

    pub fn run_login_window(&mut self) -> Result<PassReport> {
        info!("processing scheduled runs for login window");
        self.run_phase(Phase::LoginWindow)
    }

    pub fn run_login_every(&mut self) -> Result<Option<PassReport>> {
        info!("processing scripts in login-every");
        if self.console_user_ignored() {
            return Ok(None);
        }
        self.run_phase(Phase::LoginEvery).map(Some)
    }

    pub fn run_login_once(&mut self) -> Result<Option<PassReport>> {
        info!("processing scripts in login-once");
        if self.console_user_ignored() {
            return Ok(None);
        }
        self.run_phase(Phase::LoginOnce).map(Some)
    }

    pub fn run_on_demand(&mut self) -> Result<Option<PassReport>> {
        info!("processing on-demand");
        if !self.identity.has_console_session() {
            info!("no current user session; skipping on-demand run");
            return Ok(None);
        }
        if !self.identity.invoker_is_console_user() {
            info!(
                user = %self.identity.current_user,
                console_user = %self.identity.console_user,
                "invoking user is not the console user; skipping on-demand run"
            );
            return Ok(None);
        }

        let report = self.run_phase(Phase::OnDemand)?;
        if !report.items.is_empty() {
            self.raise(TriggerKind::Cleanup);
        }
        Ok(Some(report))
    }

    pub fn run_on_demand_privileged(&mut self) -> Result<Option<PassReport>> {
        info!("processing on-demand-privileged");
        if !self.identity.is_root {
            error!("must be root to execute on-demand-privileged; skipping");
            return Ok(None);
        }
        if !self.identity.has_console_session() {
            info!("no current user session; skipping on-demand-privileged run");
            return Ok(None);
        }

        let report = self.run_phase(Phase::OnDemandPrivileged)?;
        if !report.items.is_empty() {
            self.trigger(TriggerKind::OnDemandPrivileged).try_consume();
            if let Some(dir) = Phase::OnDemandPrivileged.directory(&self.settings.root) {
                if let Err(err) = clear_directory(&dir) {
                    error!(error = %format!("{err:#}"), "failed clearing on-demand-privileged directory");
                }
            }
            self.raise(TriggerKind::Cleanup);
        }
        Ok(Some(report))
    }

    pub fn run_cleanup(&mut self) -> Result<usize> {
        self.ensure_root("clean up on-demand directories")?;
        info!("cleaning up on-demand directories");
        for kind in [
            TriggerKind::OnDemand,
            TriggerKind::OnDemandPrivileged,
            TriggerKind::Cleanup,
        ] {
            self.trigger(kind).try_consume();
        }

        let mut removed = 0;
        for phase in [Phase::OnDemand, Phase::OnDemandPrivileged] {
            let Some(dir) = phase.directory(&self.settings.root) else {
                continue;
            };
            match clear_directory(&dir) {
                Ok(count) => removed += count,
                Err(err) => error!(dir = %dir.display(), error = %format!("{err:#}"), "cleanup failed"),
            }
        }
        Ok(removed)
    }

    pub fn add_ignored_users(&mut self, users: &[String]) -> Result<()> {
        self.ensure_root("add to ignored users")?;
        for user in users {
            if self.prefs.is_ignored(user) {
                info!(user = %user, "user is already in the ignored users list");
            } else {
                info!(user = %user, "adding user to ignored users list");
                self.prefs.ignored_users.push(user.clone());
            }
        }
        self.persist_preferences()
    }

    pub fn remove_ignored_users(&mut self, users: &[String]) -> Result<()> {
        self.ensure_root("remove ignored users")?;
        for user in users {
            if let Some(index) = self.prefs.ignored_users.iter().position(|u| u == user) {
                info!(user = %user, "removing user from ignored users list");
                self.prefs.ignored_users.remove(index);
            } else {
                info!(user = %user, "user is not in the ignored users list");
            }
        }
        self.persist_preferences()
    }

    pub fn add_overrides(&mut self, entries: &[String]) -> Result<()> {
        self.ensure_root("add scripts to override list")?;
        let now = Utc::now();
        for entry in entries {
            let identity = self.override_identity(entry);
            debug!(identity = %identity, "adding to override list");
            self.prefs.override_login_once.insert(identity, now);
        }
        self.persist_preferences()
    }

    pub fn remove_overrides(&mut self, entries: &[String]) -> Result<()> {
        self.ensure_root("remove scripts from override list")?;
        for entry in entries {
            let identity = self.override_identity(entry);
            debug!(identity = %identity, "removing from override list");
            self.prefs.override_login_once.remove(&identity);
        }
        self.persist_preferences()
    }

    /// `payload=<name>` names a payload script verbatim; a bare name is taken
    /// to live in the login-once directory.
    pub fn override_identity(&self, entry: &str) -> String {
        if let Some(name) = entry.strip_prefix(PAYLOAD_OVERRIDE_PREFIX) {
            return name.to_string();
        }
        let root = &self.settings.root;
        let in_once_dir = [Phase::LoginOnce, Phase::LoginPrivilegedOnce]
            .into_iter()
            .filter_map(|phase| phase.directory(root))
            .any(|dir| entry.contains(&dir.display().to_string()));
        if in_once_dir {
            entry.to_string()
        } else {
            Phase::LoginOnce
                .directory(root)
                .map(|dir| dir.join(entry).display().to_string())
                .unwrap_or_else(|| entry.to_string())
        }
    }

    pub fn compute_sha_lines(&self, args: &[String]) -> Result<Vec<String>> {
        if args
            .first()
            .is_some_and(|arg| arg.eq_ignore_ascii_case("all"))
        {
            let inventory = checksum_inventory(&self.settings.root, &[self.settings.log_dir.as_path()])?;
            let mut lines = inventory
                .iter()
                .map(|(path, hex)| format!("{path} : {hex}"))
                .collect::<Vec<_>>();
            let snippet = serde_json::to_string_pretty(&json!({ "sha256sum": inventory }))
                .context("failed encoding checksum snippet")?;
            lines.push(snippet);
            return Ok(lines);
        }

        let mut lines = Vec::with_capacity(args.len());
        for file in args {
            match compute_sha256_hex(Path::new(file)) {
                Ok(hex) => lines.push(format!("SHA256 for file {file}: {hex}")),
                Err(err) => error!(file = %file, error = %format!("{err:#}"), "failed hashing file"),
            }
        }
        Ok(lines)
    }

    pub fn checksum_report(&self) -> BTreeMap<String, String> {
        info!("sha256sum report");
        let approved = load_approved_checksums(self.store.as_ref());
        for (identity, hex) in &approved {
            info!("{identity} : {hex}");
        }
        approved
    }

    pub fn status_json(&self) -> Result<String> {
        let triggers = TriggerKind::ALL
            .into_iter()
            .map(|kind| (kind.name().to_string(), self.trigger(kind).is_raised()))
            .collect::<BTreeMap<_, _>>();
        let pending = Phase::ALL
            .into_iter()
            .filter(|phase| self.task_source().has_work(*phase))
            .map(|phase| phase.name().to_string())
            .collect::<Vec<_>>();
        let report = self.reports.as_ref().map(|reports| reports.snapshot());
        serde_json::to_string_pretty(&json!({
            "console_user": self.identity.console_user,
            "current_user": self.identity.current_user,
            "is_root": self.identity.is_root,
            "debug": self.debug,
            "verified_mode": self.gate.verified_mode(),
            "ignored_users": self.prefs.ignored_users,
            "pending_phases": pending,
            "triggers": triggers,
            "last_run": report,
        }))
        .context("failed encoding status")
    }

    fn ensure_working_folders(&self) -> Result<()> {
        let mut folders: Vec<PathBuf> = working_directories(&self.settings.root);
        folders.push(self.settings.log_dir.clone());
        for folder in folders {
            if !folder.is_dir() {
                fs::create_dir_all(&folder)
                    .with_context(|| format!("failed creating {}", folder.display()))?;
                info!(dir = %folder.display(), "created working folder");
            }
        }
        Ok(())
    }

    fn ensure_root(&self, reason: &str) -> Result<()> {
        if self.identity.is_root {
            Ok(())
        } else {
            Err(anyhow!("must be root to {reason}"))
        }
    }

    fn console_user_ignored(&self) -> bool {
        let ignored = self.prefs.is_ignored(&self.identity.console_user);
        if ignored {
            info!(user = %self.identity.console_user, "user is in the ignored list; skipping");
        }
        ignored
    }

    fn raise(&self, kind: TriggerKind) {
        if let Err(err) = self.trigger(kind).raise() {
            error!(trigger = kind.name(), error = %format!("{err:#}"), "failed raising trigger");
        }
    }

    fn persist_preferences(&mut self) -> Result<()> {
        self.prefs
            .write(self.store.as_mut())
            .context("failed writing preferences")
    }
}

/// Root reads and writes the machine store; anyone else writes their own
/// store and sees machine values underneath. Managed values win either way.
pub fn open_preference_store(settings: &Settings, is_root: bool) -> Result<FilePreferenceStore> {
    let store = if is_root {
        FilePreferenceStore::open(&settings.machine_prefs_file)?
    } else {
        FilePreferenceStore::open(&settings.user_prefs_file)?
            .with_fallback(&settings.machine_prefs_file)?
    };
    store.with_managed(&settings.managed_prefs_file)
}
