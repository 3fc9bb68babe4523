use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info, warn};

use crate::phase::{extension_lowercase, Item, ItemKind};

pub const INSTALLER_BIN: &str = "/usr/sbin/installer";
pub const HDIUTIL_BIN: &str = "/usr/bin/hdiutil";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Process seam. `Err` means the program could not be started at all; a
/// non-zero exit is reported through `CommandOutput::exit_code`.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

#[derive(Debug, Default)]
pub struct HostRunner;

impl ProcessRunner for HostRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute '{}' with args {:?}", program, args))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl Outcome {
    fn from_output(output: CommandOutput) -> Self {
        Self {
            ok: output.success(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn ProcessRunner>,
    shell: String,
    console_user: String,
    is_root: bool,
    detach_delay: Duration,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        shell: impl Into<String>,
        console_user: impl Into<String>,
        is_root: bool,
        detach_delay: Duration,
    ) -> Self {
        Self {
            runner,
            shell: shell.into(),
            console_user: console_user.into(),
            is_root,
            detach_delay,
        }
    }

    pub fn run(&self, item: &Item, path: &Path) -> Outcome {
        let outcome = match item.kind {
            ItemKind::Script => self.run_script(path),
            ItemKind::Package => self.install(path),
        };

        if outcome.ok {
            info!(item = %item.identity, kind = item.kind.as_str(), "item completed");
        } else {
            error!(
                item = %item.identity,
                kind = item.kind.as_str(),
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr.trim(),
                "item failed"
            );
        }
        if !outcome.stdout.trim().is_empty() {
            debug!(item = %item.identity, stdout = %outcome.stdout.trim(), "item output");
        }
        outcome
    }

    fn run_script(&self, path: &Path) -> Outcome {
        info!(script = %path.display(), user = %self.console_user, "running script");
        let args = vec![
            "-c".to_string(),
            "\"$0\" \"$1\"".to_string(),
            path.display().to_string(),
            self.console_user.clone(),
        ];
        match self.runner.run(&self.shell, &args) {
            Ok(output) => Outcome::from_output(output),
            Err(err) => Outcome::failed(format!("{err:#}")),
        }
    }

    fn install(&self, path: &Path) -> Outcome {
        if !self.is_root {
            return Outcome::failed(format!(
                "installing {} requires root privileges",
                path.display()
            ));
        }
        if extension_lowercase(path).as_deref() == Some("dmg") {
            return self.install_from_disk_image(path);
        }
        self.install_package(path)
    }

    fn install_package(&self, path: &Path) -> Outcome {
        info!(package = %path.display(), "installing package");
        let args = vec![
            "-pkg".to_string(),
            path.display().to_string(),
            "-target".to_string(),
            "/".to_string(),
        ];
        match self.runner.run(INSTALLER_BIN, &args) {
            Ok(output) => Outcome::from_output(output),
            Err(err) => Outcome::failed(format!("{err:#}")),
        }
    }

    fn install_from_disk_image(&self, image: &Path) -> Outcome {
        let mount_point = match self.attach(image) {
            Ok(mount_point) => mount_point,
            Err(err) => return Outcome::failed(format!("{err:#}")),
        };

        let outcome = match find_installer_package(&mount_point) {
            Ok(package) => self.install_package(&package),
            Err(err) => Outcome::failed(format!("{err:#}")),
        };

        // not awaited; the process may exit first
        let _ = spawn_detach(self.runner.clone(), mount_point, self.detach_delay);
        outcome
    }

    fn attach(&self, image: &Path) -> Result<PathBuf> {
        info!(image = %image.display(), "mounting disk image");
        let args = vec![
            "attach".to_string(),
            "-readonly".to_string(),
            "-nobrowse".to_string(),
            "-noverify".to_string(),
            "-noautoopen".to_string(),
            image.display().to_string(),
        ];
        let output = self.runner.run(HDIUTIL_BIN, &args)?;
        if !output.success() {
            return Err(anyhow!(
                "failed mounting {}: {}",
                image.display(),
                output.stderr.trim()
            ));
        }
        let mount_point = parse_mount_point(&output.stdout)
            .ok_or_else(|| anyhow!("no mount point reported for {}", image.display()))?;
        debug!(image = %image.display(), mount_point = %mount_point.display(), "disk image mounted");
        Ok(mount_point)
    }
}

/// Pull the mount point out of `hdiutil attach` output: the last
/// tab-separated column that is a path outside `/dev`.
pub fn parse_mount_point(stdout: &str) -> Option<PathBuf> {
    stdout
        .lines()
        .filter_map(|line| line.split('\t').last())
        .map(str::trim)
        .filter(|field| field.starts_with('/') && !field.starts_with("/dev/"))
        .last()
        .map(PathBuf::from)
}

pub fn find_installer_package(mount_point: &Path) -> Result<PathBuf> {
    let mut entries = fs::read_dir(mount_point)
        .with_context(|| format!("failed listing {}", mount_point.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| matches!(extension_lowercase(path).as_deref(), Some("pkg" | "mpkg")))
        .collect::<Vec<_>>();
    entries.sort();
    entries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no installer package found in {}", mount_point.display()))
}

/// Force-detach a mounted image after `delay` on a background thread.
/// Failures are logged and not retried.
pub fn spawn_detach(
    runner: Arc<dyn ProcessRunner>,
    mount_point: PathBuf,
    delay: Duration,
) -> JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(delay);
        let args = vec![
            "detach".to_string(),
            mount_point.display().to_string(),
            "-force".to_string(),
        ];
        match runner.run(HDIUTIL_BIN, &args) {
            Ok(output) if output.success() => {
                debug!(mount_point = %mount_point.display(), "disk image detached")
            }
            Ok(output) => warn!(
                mount_point = %mount_point.display(),
                stderr = %output.stderr.trim(),
                "failed detaching disk image"
            ),
            Err(err) => warn!(
                mount_point = %mount_point.display(),
                error = %err,
                "failed detaching disk image"
            ),
        }
    })
}
