use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::payload::{decode_script, PayloadBundles};
use crate::phase::{Item, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Payload,
    Directory,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Payload => "payload",
            SourceKind::Directory => "directory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedItems {
    pub items: Vec<Item>,
    pub source: SourceKind,
}

impl ResolvedItems {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct TaskSource<'a> {
    root: PathBuf,
    bundles: &'a PayloadBundles,
}

impl<'a> TaskSource<'a> {
    pub fn new(root: impl Into<PathBuf>, bundles: &'a PayloadBundles) -> Self {
        Self {
            root: root.into(),
            bundles,
        }
    }

    /// A present bundle, even an empty one, suppresses the directory scan.
    /// A missing phase directory is a configuration error.
    pub fn resolve(&self, phase: Phase) -> Result<ResolvedItems> {
        if let Some(entry) = self.bundles.resolve(phase) {
            info!(phase = %phase, scripts = entry.len(), "using payload bundle; directory is not scanned");
            let mut items = Vec::with_capacity(entry.len());
            for (name, encoded) in entry {
                match decode_script(encoded) {
                    Ok(content) => items.push(Item::from_payload(name, content)),
                    Err(err) => {
                        warn!(phase = %phase, script = %name, error = %err, "skipping undecodable payload script")
                    }
                }
            }
            return Ok(ResolvedItems {
                items,
                source: SourceKind::Payload,
            });
        }

        let dir = phase
            .directory(&self.root)
            .ok_or_else(|| anyhow!("phase {phase} has no working directory"))?;
        let items = list_directory(&dir)?
            .into_iter()
            .map(Item::from_path)
            .collect::<Vec<_>>();
        debug!(phase = %phase, dir = %dir.display(), items = items.len(), "scanned phase directory");
        Ok(ResolvedItems {
            items,
            source: SourceKind::Directory,
        })
    }

    /// A missing directory counts as no work.
    pub fn has_work(&self, phase: Phase) -> bool {
        if let Some(entry) = self.bundles.resolve(phase) {
            return !entry.is_empty();
        }
        let Some(dir) = phase.directory(&self.root) else {
            return false;
        };
        match list_directory(&dir) {
            Ok(entries) => !entries.is_empty(),
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "phase directory not listable");
                false
            }
        }
    }
}

/// Non-recursive listing, sorted lexically. Hidden entries are left out.
pub fn list_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed listing phase directory {}", dir.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed reading entry in {}", dir.display()))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("failed removing {}", path.display()))
}

/// Empty a directory without removing the directory itself. A missing
/// directory is left alone.
pub fn clear_directory(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("failed listing {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed reading entry in {}", dir.display()))?;
        remove_path(&entry.path())?;
        removed += 1;
    }
    debug!(dir = %dir.display(), removed, "cleared directory");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::{clear_directory, list_directory, SourceKind, TaskSource};
    use crate::payload::{PayloadBundles, PayloadSource};
    use crate::phase::{ItemKind, Phase};
    use base64::{engine::general_purpose, Engine as _};
    use serde_json::json;
    use std::fs;

    fn bundles(value: serde_json::Value) -> PayloadBundles {
        PayloadBundles::merge(
            &[PayloadSource {
                key: "script_payloads".to_string(),
                forced: true,
                value,
            }],
            false,
        )
    }

    #[test]
    fn directory_listing_is_sorted_and_kinds_inferred() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("login-every");
        fs::create_dir_all(&dir).expect("mkdir");
        for name in ["c.sh", "a.pkg", "b.dmg", ".DS_Store"] {
            fs::write(dir.join(name), "").expect("write");
        }

        let empty = PayloadBundles::default();
        let resolved = TaskSource::new(root.path(), &empty)
            .resolve(Phase::LoginEvery)
            .expect("resolve");
        assert_eq!(resolved.source, SourceKind::Directory);
        let names = resolved
            .items
            .iter()
            .map(|item| item.identity.rsplit('/').next().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.pkg", "b.dmg", "c.sh"]);
        assert_eq!(resolved.items[0].kind, ItemKind::Package);
        assert_eq!(resolved.items[2].kind, ItemKind::Script);
    }

    #[test]
    fn empty_bundle_still_suppresses_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("login-once");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("a.sh"), "").expect("write");

        let bundles = bundles(json!({"login-once": {}}));
        let source = TaskSource::new(root.path(), &bundles);
        let resolved = source.resolve(Phase::LoginOnce).expect("resolve");
        assert_eq!(resolved.source, SourceKind::Payload);
        assert!(resolved.is_empty());
        assert!(!source.has_work(Phase::LoginOnce));
    }

    #[test]
    fn payload_scripts_become_inline_items() {
        let root = tempfile::tempdir().expect("tempdir");
        let encoded = general_purpose::STANDARD.encode("echo hi");
        let bundles = bundles(json!({"boot-every": {"hello": encoded, "broken": "%%"}}));
        let resolved = TaskSource::new(root.path(), &bundles)
            .resolve(Phase::BootEvery)
            .expect("resolve");
        assert_eq!(resolved.items.len(), 1);
        assert_eq!(resolved.items[0].identity, "hello");
        assert!(resolved.items[0].path().is_none());
    }

    #[test]
    fn missing_directory_is_fatal_for_resolve_but_not_for_has_work() {
        let root = tempfile::tempdir().expect("tempdir");
        let empty = PayloadBundles::default();
        let source = TaskSource::new(root.path(), &empty);
        assert!(source.resolve(Phase::BootOnce).is_err());
        assert!(!source.has_work(Phase::BootOnce));
        assert!(list_directory(&root.path().join("nope")).is_err());
    }

    #[test]
    fn clearing_removes_files_and_bundles_but_keeps_directory() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = root.path().join("on-demand");
        fs::create_dir_all(dir.join("Bundle.pkg/Contents")).expect("mkdir bundle");
        fs::write(dir.join("a.sh"), "").expect("write");
        fs::write(dir.join(".hidden"), "").expect("write");

        assert_eq!(clear_directory(&dir).expect("clear"), 3);
        assert!(dir.is_dir());
        assert!(list_directory(&dir).expect("list").is_empty());
        assert_eq!(clear_directory(&root.path().join("missing")).expect("clear"), 0);
    }
}
