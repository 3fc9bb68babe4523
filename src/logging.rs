use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Installs the global subscriber: stderr plus an append-only log file.
/// With `rotate` set, a stale log is rotated before it is reopened.
pub fn init(settings: &Settings, debug_mode: bool, rotate: bool) {
    let rotation = rotate
        .then(|| rotate_logs(&settings.log_dir, &settings.log_file_name, settings.log_max_files));
    let default_level = if debug_mode { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let log_path = settings.log_file_path();
    match open_log_file(&log_path) {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
        }
        Err(err) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
            eprintln!(
                "{{\"event\":\"logging_init\",\"status\":\"degraded\",\"log_file\":{},\"message\":{}}}",
                serde_json::to_string(&log_path.display().to_string())
                    .unwrap_or_else(|_| "\"\"".to_string()),
                serde_json::to_string(&format!("{err:#}"))
                    .unwrap_or_else(|_| "\"failed to encode logging error\"".to_string())
            );
        }
    }

    match rotation {
        Some(Ok(true)) => tracing::info!(dir = %settings.log_dir.display(), "log files rotated"),
        Some(Err(err)) => tracing::warn!(error = %format!("{err:#}"), "log rotation failed"),
        _ => {}
    }
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating log dir {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed opening log file {}", path.display()))
}

/// Day-change rotation: when the active log was last written on an earlier
/// day, `name.N` becomes `name.N+1`, the oldest beyond `max_files` is
/// dropped and `name` becomes `name.1`. Returns whether a rotation happened.
pub fn rotate_logs(dir: &Path, base_name: &str, max_files: usize) -> Result<bool> {
    let active = dir.join(base_name);
    let Ok(metadata) = fs::metadata(&active) else {
        return Ok(false);
    };
    let modified: DateTime<Local> = metadata
        .modified()
        .with_context(|| format!("failed reading mtime of {}", active.display()))?
        .into();
    if modified.date_naive() == Local::now().date_naive() || max_files == 0 {
        return Ok(false);
    }

    let archived = |n: usize| -> PathBuf { dir.join(format!("{base_name}.{n}")) };
    let oldest = archived(max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)
            .with_context(|| format!("failed removing {}", oldest.display()))?;
    }
    for n in (1..max_files).rev() {
        let source = archived(n);
        if source.exists() {
            let target = archived(n + 1);
            fs::rename(&source, &target).with_context(|| {
                format!("failed moving {} -> {}", source.display(), target.display())
            })?;
        }
    }
    let first = archived(1);
    fs::rename(&active, &first)
        .with_context(|| format!("failed moving {} -> {}", active.display(), first.display()))?;
    tracing::debug!(dir = %dir.display(), "log rotation complete");
    Ok(true)
}
