use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use outset::app::OutsetApp;
use outset::config::Settings;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn reset_outset_env() {
    for key in [
        "OUTSET_ROOT",
        "OUTSET_LOG_DIR",
        "OUTSET_LOG_FILE_NAME",
        "OUTSET_LOG_MAX_FILES",
        "OUTSET_TRIGGER_DIR",
        "OUTSET_MACHINE_PREFS_FILE",
        "OUTSET_MANAGED_PREFS_FILE",
        "OUTSET_USER_PREFS_FILE",
        "OUTSET_REPORT_FILE",
        "OUTSET_DEBUG",
        "OUTSET_CONSOLE_USER",
        "OUTSET_REQUIRED_OWNER_UID",
        "OUTSET_SHELL",
        "OUTSET_NETWORK_PROBE_ADDR",
        "OUTSET_NETWORK_POLL_INTERVAL_MS",
        "OUTSET_DMG_DETACH_DELAY_SECS",
        "OUTSET_ENV_FILE",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn settings_defaults_match_managed_layout() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_outset_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let env_file = temp.path().join("empty.env");
    fs::write(&env_file, "").expect("write env");
    std::env::set_var("OUTSET_ENV_FILE", env_file.display().to_string());

    let settings = Settings::load().expect("load settings");
    assert_eq!(settings.root, PathBuf::from("/usr/local/outset"));
    assert_eq!(settings.log_dir, PathBuf::from("/usr/local/outset/logs"));
    assert_eq!(
        settings.log_file_path(),
        PathBuf::from("/usr/local/outset/logs/outset.log")
    );
    assert_eq!(settings.trigger_dir, PathBuf::from("/private/tmp"));
    assert_eq!(settings.required_owner_uid, 0);
    assert_eq!(settings.shell, "/bin/sh");
    assert_eq!(settings.log_max_files, 30);
    assert!(!settings.debug);
    assert!(settings.console_user.is_none());
}

#[test]
fn env_file_overrides_paths_and_tuning() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_outset_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("outset");

    fs::write(
        temp.path().join(".env"),
        format!(
            "OUTSET_ROOT={}\nOUTSET_DEBUG=yes\nOUTSET_CONSOLE_USER=alice\nOUTSET_NETWORK_POLL_INTERVAL_MS=25\nOUTSET_LOG_MAX_FILES=not-a-number\n",
            root.display()
        ),
    )
    .expect("write env");
    std::env::set_var(
        "OUTSET_ENV_FILE",
        temp.path().join(".env").display().to_string(),
    );

    let settings = Settings::load().expect("load settings");
    assert_eq!(settings.root, root);
    assert_eq!(settings.log_dir, root.join("logs"));
    assert_eq!(settings.report_file, root.join("logs").join("last-run.json"));
    assert!(settings.debug);
    assert_eq!(settings.console_user.as_deref(), Some("alice"));
    assert_eq!(settings.network_poll_interval_ms, 25);
    assert_eq!(settings.log_max_files, 30);
}

#[test]
fn missing_env_file_is_an_error() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_outset_env();
    let temp = tempfile::tempdir().expect("tempdir");
    std::env::set_var(
        "OUTSET_ENV_FILE",
        temp.path().join("absent.env").display().to_string(),
    );

    assert!(Settings::load().is_err());
}

#[test]
fn doctor_warns_about_missing_root_and_relaxed_ownership() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_outset_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let env_file = temp.path().join("doctor.env");
    fs::write(
        &env_file,
        format!(
            "OUTSET_ROOT={}\nOUTSET_TRIGGER_DIR={}\nOUTSET_REQUIRED_OWNER_UID=501\nOUTSET_SHELL=/nonexistent/shell\n",
            temp.path().join("missing").display(),
            temp.path().display()
        ),
    )
    .expect("write env");
    std::env::set_var("OUTSET_ENV_FILE", env_file.display().to_string());

    let report = Settings::load().expect("load settings").doctor_report();
    assert_eq!(report.required_owner_uid, 501);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("OUTSET_ROOT") && w.contains("does not exist")));
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("OUTSET_REQUIRED_OWNER_UID=501")));
    assert!(report.warnings.iter().any(|w| w.contains("OUTSET_SHELL")));
    assert!(!report
        .warnings
        .iter()
        .any(|w| w.contains("OUTSET_TRIGGER_DIR")));
}

#[test]
fn app_starts_against_host_identity() {
    let _guard = ENV_LOCK.lock().expect("lock env");
    reset_outset_env();
    let temp = tempfile::tempdir().expect("tempdir");
    let env_file = temp.path().join("app.env");
    fs::write(
        &env_file,
        format!(
            "OUTSET_ROOT={root}\nOUTSET_TRIGGER_DIR={base}\nOUTSET_MACHINE_PREFS_FILE={base}/machine.json\nOUTSET_MANAGED_PREFS_FILE={base}/managed.json\nOUTSET_USER_PREFS_FILE={base}/user.json\nOUTSET_CONSOLE_USER=alice\n",
            root = temp.path().join("outset").display(),
            base = temp.path().display()
        ),
    )
    .expect("write env");
    std::env::set_var("OUTSET_ENV_FILE", env_file.display().to_string());

    let settings = Settings::load().expect("load settings");
    let app = OutsetApp::new(settings, false).expect("new app");
    assert_eq!(app.identity().console_user, "alice");
    assert!(!app.identity().current_user.is_empty());

    let status: serde_json::Value =
        serde_json::from_str(&app.status_json().expect("status")).expect("status json");
    assert_eq!(status["console_user"], "alice");
    assert_eq!(status["pending_phases"], serde_json::json!([]));
}
