use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

const ENV_FILE_ENV: &str = "OUTSET_ENV_FILE";
const PREFS_FILE_NAME: &str = "io.macadmins.Outset.json";

#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub log_dir: PathBuf,
    pub log_file_name: String,
    pub log_max_files: usize,
    pub trigger_dir: PathBuf,
    pub machine_prefs_file: PathBuf,
    pub managed_prefs_file: PathBuf,
    pub user_prefs_file: PathBuf,
    pub report_file: PathBuf,
    pub debug: bool,
    pub console_user: Option<String>,
    pub required_owner_uid: u32,
    pub shell: String,
    pub network_probe_addr: String,
    pub network_poll_interval_ms: u64,
    pub dmg_detach_delay_secs: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let root = read_path_env("OUTSET_ROOT").unwrap_or_else(|| PathBuf::from("/usr/local/outset"));
        let log_dir = read_path_env("OUTSET_LOG_DIR").unwrap_or_else(|| root.join("logs"));
        let report_file =
            read_path_env("OUTSET_REPORT_FILE").unwrap_or_else(|| log_dir.join("last-run.json"));

        let machine_prefs_file = read_path_env("OUTSET_MACHINE_PREFS_FILE")
            .unwrap_or_else(|| Path::new("/Library/Preferences").join(PREFS_FILE_NAME));
        let managed_prefs_file = read_path_env("OUTSET_MANAGED_PREFS_FILE")
            .unwrap_or_else(|| Path::new("/Library/Managed Preferences").join(PREFS_FILE_NAME));
        let user_prefs_file = read_path_env("OUTSET_USER_PREFS_FILE").unwrap_or_else(|| {
            read_path_env("HOME")
                .unwrap_or_else(|| PathBuf::from("/var/root"))
                .join("Library/Preferences")
                .join(PREFS_FILE_NAME)
        });

        Ok(Self {
            log_file_name: read_non_empty_env("OUTSET_LOG_FILE_NAME")
                .unwrap_or_else(|| "outset.log".to_string()),
            log_max_files: read_usize_env("OUTSET_LOG_MAX_FILES", 30),
            trigger_dir: read_path_env("OUTSET_TRIGGER_DIR")
                .unwrap_or_else(|| PathBuf::from("/private/tmp")),
            debug: read_bool_env("OUTSET_DEBUG", false),
            console_user: read_non_empty_env("OUTSET_CONSOLE_USER"),
            required_owner_uid: read_u32_env("OUTSET_REQUIRED_OWNER_UID", 0),
            shell: read_non_empty_env("OUTSET_SHELL").unwrap_or_else(|| "/bin/sh".to_string()),
            network_probe_addr: read_non_empty_env("OUTSET_NETWORK_PROBE_ADDR")
                .unwrap_or_else(|| "1.1.1.1:443".to_string()),
            network_poll_interval_ms: read_u64_env("OUTSET_NETWORK_POLL_INTERVAL_MS", 1000),
            dmg_detach_delay_secs: read_u64_env("OUTSET_DMG_DETACH_DELAY_SECS", 5),
            root,
            log_dir,
            report_file,
            machine_prefs_file,
            managed_prefs_file,
            user_prefs_file,
        })
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_file_name)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_millis(self.network_poll_interval_ms.max(1))
    }

    pub fn dmg_detach_delay(&self) -> Duration {
        Duration::from_secs(self.dmg_detach_delay_secs)
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();
        if !self.root.is_dir() {
            warnings.push(format!(
                "OUTSET_ROOT {} does not exist; run `outset boot` as root to create working folders",
                self.root.display()
            ));
        }
        if !self.trigger_dir.is_dir() {
            warnings.push(format!(
                "OUTSET_TRIGGER_DIR {} does not exist; trigger files cannot be raised",
                self.trigger_dir.display()
            ));
        }
        if self.required_owner_uid != 0 {
            warnings.push(format!(
                "OUTSET_REQUIRED_OWNER_UID={} accepts items not owned by root",
                self.required_owner_uid
            ));
        }
        if !self.managed_prefs_file.exists() && !self.debug {
            warnings.push(format!(
                "managed preferences {} not found; unmanaged script payloads are ignored outside debug mode",
                self.managed_prefs_file.display()
            ));
        }
        if self.log_max_files == 0 {
            warnings.push("OUTSET_LOG_MAX_FILES=0 disables log rotation".to_string());
        }
        if self.network_poll_interval_ms == 0 {
            warnings.push("OUTSET_NETWORK_POLL_INTERVAL_MS should be > 0".to_string());
        }
        if !Path::new(&self.shell).exists() {
            warnings.push(format!("OUTSET_SHELL {} does not exist", self.shell));
        }

        DoctorReport {
            root: self.root.clone(),
            log_file: self.log_file_path(),
            trigger_dir: self.trigger_dir.clone(),
            machine_prefs_file: self.machine_prefs_file.clone(),
            managed_prefs_file: self.managed_prefs_file.clone(),
            user_prefs_file: self.user_prefs_file.clone(),
            report_file: self.report_file.clone(),
            debug: self.debug,
            console_user_override: self.console_user.clone(),
            required_owner_uid: self.required_owner_uid,
            shell: self.shell.clone(),
            network_probe_addr: self.network_probe_addr.clone(),
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub root: PathBuf,
    pub log_file: PathBuf,
    pub trigger_dir: PathBuf,
    pub machine_prefs_file: PathBuf,
    pub managed_prefs_file: PathBuf,
    pub user_prefs_file: PathBuf,
    pub report_file: PathBuf,
    pub debug: bool,
    pub console_user_override: Option<String>,
    pub required_owner_uid: u32,
    pub shell: String,
    pub network_probe_addr: String,
    pub warnings: Vec<String>,
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_path_env(key: &str) -> Option<PathBuf> {
    read_non_empty_env(key).map(PathBuf::from)
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_u32_env(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn read_usize_env(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}
