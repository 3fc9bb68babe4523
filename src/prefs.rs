use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::integrity::normalize_sha256_hex;

pub const KEY_WAIT_FOR_NETWORK: &str = "wait_for_network";
pub const KEY_NETWORK_TIMEOUT: &str = "network_timeout";
pub const KEY_IGNORED_USERS: &str = "ignored_users";
pub const KEY_OVERRIDE_LOGIN_ONCE: &str = "override_login_once";
pub const KEY_VERBOSE_LOGGING: &str = "verbose_logging";
pub const KEY_SHA256SUM: &str = "sha256sum";

const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 180;

/// Key/value preference backend. Values written by the caller land in its own
/// scope; values pushed by a configuration profile are "forced" and win.
pub trait PreferenceStore {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
    fn is_forced(&self, key: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
    values: Map<String, Value>,
    fallback: Map<String, Value>,
    managed: Map<String, Value>,
}

impl FilePreferenceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = read_json_object(&path)?;
        Ok(Self {
            path,
            values,
            fallback: Map::new(),
            managed: Map::new(),
        })
    }

    pub fn with_fallback(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.fallback = read_json_object(path.as_ref())?;
        Ok(self)
    }

    pub fn with_managed(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.managed = read_json_object(path.as_ref())?;
        Ok(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed creating preference dir {}", parent.display())
            })?;
        }
        let payload = serde_json::to_string_pretty(&Value::Object(self.values.clone()))
            .context("failed encoding preferences")?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload)
            .with_context(|| format!("failed writing preferences {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed replacing preferences {} -> {}",
                tmp.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.managed
            .get(key)
            .or_else(|| self.values.get(key))
            .or_else(|| self.fallback.get(key))
            .cloned()
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        if self.managed.contains_key(key) {
            debug!(key, "preference is managed; stored value will be shadowed");
        }
        self.values.insert(key.to_string(), value);
        self.persist()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.managed
            .keys()
            .chain(self.values.keys())
            .chain(self.fallback.keys())
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    }

    fn is_forced(&self, key: &str) -> bool {
        self.managed.contains_key(key)
    }
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading preferences {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed decoding preferences {}", path.display()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!(
            "preferences {} must contain a JSON object",
            path.display()
        )),
    }
}

pub fn read_typed<T: DeserializeOwned>(store: &dyn PreferenceStore, key: &str, default: T) -> T {
    let Some(value) = store.get(key) else {
        return default;
    };
    match serde_json::from_value::<T>(value) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(key, error = %err, "ignoring malformed preference value");
            default
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preferences {
    pub wait_for_network: bool,
    pub network_timeout_secs: u64,
    pub ignored_users: Vec<String>,
    pub override_login_once: BTreeMap<String, DateTime<Utc>>,
    pub verbose_logging: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            wait_for_network: false,
            network_timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
            ignored_users: Vec::new(),
            override_login_once: BTreeMap::new(),
            verbose_logging: false,
        }
    }
}

impl Preferences {
    pub fn load(store: &dyn PreferenceStore) -> Self {
        let defaults = Self::default();
        Self {
            wait_for_network: read_typed(store, KEY_WAIT_FOR_NETWORK, defaults.wait_for_network),
            network_timeout_secs: read_typed(
                store,
                KEY_NETWORK_TIMEOUT,
                defaults.network_timeout_secs,
            ),
            ignored_users: read_typed(store, KEY_IGNORED_USERS, defaults.ignored_users),
            override_login_once: read_typed(
                store,
                KEY_OVERRIDE_LOGIN_ONCE,
                defaults.override_login_once,
            ),
            verbose_logging: read_typed(store, KEY_VERBOSE_LOGGING, defaults.verbose_logging),
        }
    }

    pub fn write(&self, store: &mut dyn PreferenceStore) -> Result<()> {
        store.set(KEY_WAIT_FOR_NETWORK, Value::Bool(self.wait_for_network))?;
        store.set(KEY_NETWORK_TIMEOUT, Value::from(self.network_timeout_secs))?;
        store.set(
            KEY_IGNORED_USERS,
            serde_json::to_value(&self.ignored_users).context("failed encoding ignored users")?,
        )?;
        store.set(
            KEY_OVERRIDE_LOGIN_ONCE,
            serde_json::to_value(&self.override_login_once)
                .context("failed encoding override list")?,
        )?;
        Ok(())
    }

    pub fn is_ignored(&self, user: &str) -> bool {
        self.ignored_users.iter().any(|ignored| ignored == user)
    }
}

/// Approved-checksum set, keyed by item identity. A malformed digest stays in
/// the set so the item it names can never match.
pub fn load_approved_checksums(store: &dyn PreferenceStore) -> BTreeMap<String, String> {
    let raw: BTreeMap<String, String> = read_typed(store, KEY_SHA256SUM, BTreeMap::new());
    raw.into_iter()
        .map(|(identity, digest)| match normalize_sha256_hex(&digest) {
            Ok(normalized) => (identity, normalized),
            Err(err) => {
                warn!(identity = %identity, error = %err, "malformed approved checksum");
                (identity, digest.trim().to_ascii_lowercase())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        load_approved_checksums, FilePreferenceStore, PreferenceStore, Preferences,
        KEY_SHA256SUM,
    };
    use serde_json::json;
    use std::fs;

    #[test]
    fn managed_values_shadow_local_and_fallback_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let machine = dir.path().join("machine.json");
        let managed = dir.path().join("managed.json");
        let user = dir.path().join("user.json");
        fs::write(&machine, r#"{"network_timeout": 60, "ignored_users": ["admin"]}"#)
            .expect("write machine");
        fs::write(&managed, r#"{"network_timeout": 30}"#).expect("write managed");

        let mut store = FilePreferenceStore::open(&user)
            .and_then(|store| store.with_fallback(&machine))
            .and_then(|store| store.with_managed(&managed))
            .expect("open store");
        store
            .set("network_timeout", json!(90))
            .expect("set timeout");

        assert_eq!(store.get("network_timeout"), Some(json!(30)));
        assert_eq!(store.get("ignored_users"), Some(json!(["admin"])));
        assert!(store.is_forced("network_timeout"));
        assert!(!store.is_forced("ignored_users"));
        assert_eq!(
            store.keys(),
            vec!["ignored_users".to_string(), "network_timeout".to_string()]
        );

        let persisted = fs::read_to_string(&user).expect("read user");
        assert!(persisted.contains("90"));
    }

    #[test]
    fn preferences_round_trip_and_default_on_bad_types() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs.json");
        fs::write(&path, r#"{"wait_for_network": "yes", "network_timeout": 45}"#)
            .expect("write prefs");
        let mut store = FilePreferenceStore::open(&path).expect("open");

        let mut prefs = Preferences::load(&store);
        assert!(!prefs.wait_for_network);
        assert_eq!(prefs.network_timeout_secs, 45);

        prefs.wait_for_network = true;
        prefs.ignored_users.push("kiosk".to_string());
        prefs.write(&mut store).expect("write prefs");

        let reopened = FilePreferenceStore::open(&path).expect("reopen");
        let loaded = Preferences::load(&reopened);
        assert!(loaded.wait_for_network);
        assert!(loaded.is_ignored("kiosk"));
    }

    #[test]
    fn approved_checksums_are_normalized_and_malformed_ones_kept() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = FilePreferenceStore::open(dir.path().join("p.json")).expect("open");
        let upper = "A".repeat(64);
        store
            .set(
                KEY_SHA256SUM,
                json!({"/a.sh": upper, "/b.sh": " Not-A-Digest "}),
            )
            .expect("set");

        let approved = load_approved_checksums(&store);
        assert_eq!(approved.len(), 2);
        assert_eq!(approved.get("/a.sh"), Some(&"a".repeat(64)));
        assert_eq!(approved.get("/b.sh"), Some(&"not-a-digest".to_string()));
    }
}
