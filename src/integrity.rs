use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::phase::{extension_lowercase, Item, ItemSource};

pub const PACKAGE_MODE: u32 = 0o644;
pub const EXECUTABLE_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unreadable { message: String },
    BadOwnerOrMode {
        owner_uid: u32,
        mode: u32,
        required_uid: u32,
        required_mode: u32,
    },
    ChecksumMissing,
    ChecksumMismatch { expected: String, actual: String },
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Unreadable { message } => write!(f, "unreadable: {message}"),
            Rejection::BadOwnerOrMode {
                owner_uid,
                mode,
                required_uid,
                required_mode,
            } => write!(
                f,
                "bad permissions: owner {owner_uid} mode {mode:o}, required owner {required_uid} mode {required_mode:o}"
            ),
            Rejection::ChecksumMissing => f.write_str("no approved checksum"),
            Rejection::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, got {actual})")
            }
        }
    }
}

/// Ownership, mode and checksum gate applied to every discovered item.
/// A non-empty approved set switches the whole pass into verified mode.
#[derive(Debug, Clone)]
pub struct IntegrityGate {
    required_uid: u32,
    approved: BTreeMap<String, String>,
}

impl IntegrityGate {
    pub fn new(required_uid: u32, approved: BTreeMap<String, String>) -> Self {
        Self {
            required_uid,
            approved,
        }
    }

    pub fn verified_mode(&self) -> bool {
        !self.approved.is_empty()
    }

    /// Owner must match and mode must be 0644 for packages, disk images and
    /// profiles, 0755 for anything else.
    pub fn verify_ownership(&self, path: &Path) -> std::result::Result<(), Rejection> {
        let metadata = fs::metadata(path).map_err(|err| Rejection::Unreadable {
            message: format!("{}: {err}", path.display()),
        })?;
        let owner_uid = metadata.uid();
        let mode = metadata.mode() & 0o7777;
        let required_mode = required_mode(path);
        debug!(path = %path.display(), owner_uid, mode = %format!("{mode:o}"), "checked ownership");

        if owner_uid != self.required_uid || mode != required_mode {
            return Err(Rejection::BadOwnerOrMode {
                owner_uid,
                mode,
                required_uid: self.required_uid,
                required_mode,
            });
        }
        Ok(())
    }

    pub fn verify_checksum(&self, item: &Item) -> std::result::Result<(), Rejection> {
        if !self.verified_mode() {
            return Ok(());
        }
        let Some(expected) = self.approved.get(&item.identity) else {
            return Err(Rejection::ChecksumMissing);
        };
        let actual = match &item.source {
            ItemSource::File(path) => {
                compute_sha256_hex(path).map_err(|err| Rejection::Unreadable {
                    message: err.to_string(),
                })?
            }
            ItemSource::Inline(content) => sha256_hex(content),
        };
        if *expected != actual {
            return Err(Rejection::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }
}

pub fn required_mode(path: &Path) -> u32 {
    match extension_lowercase(path).as_deref() {
        Some("pkg" | "mpkg" | "dmg" | "mobileconfig") => PACKAGE_MODE,
        _ => EXECUTABLE_MODE,
    }
}

pub fn compute_sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed opening file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed reading file {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn normalize_sha256_hex(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.len() != 64 {
        return Err(anyhow!("checksum must be a 64-character SHA-256 hex string"));
    }
    if !normalized.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(anyhow!("checksum must contain only hex characters"));
    }
    Ok(normalized)
}

pub fn checksum_inventory(root: &Path, skip_dirs: &[&Path]) -> Result<BTreeMap<String, String>> {
    let mut inventory = BTreeMap::new();
    collect_checksums(root, skip_dirs, &mut inventory)?;
    Ok(inventory)
}

fn collect_checksums(
    dir: &Path,
    skip_dirs: &[&Path],
    inventory: &mut BTreeMap<String, String>,
) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed listing {}", dir.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed reading entry in {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || skip_dirs.iter().any(|skip| *skip == path.as_path()) {
            continue;
        }
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed reading file type of {}", path.display()))?;
        if file_type.is_dir() {
            collect_checksums(&path, skip_dirs, inventory)?;
        } else if file_type.is_file()
            && !matches!(extension_lowercase(&path).as_deref(), Some("json" | "plist"))
        {
            inventory.insert(path.display().to_string(), compute_sha256_hex(&path)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        checksum_inventory, compute_sha256_hex, normalize_sha256_hex, required_mode, sha256_hex,
        IntegrityGate, Rejection,
    };
    use crate::phase::Item;
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::Path;

    fn write_with_mode(path: &Path, body: &str, mode: u32) {
        fs::write(path, body).expect("write");
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).expect("chmod");
    }

    fn own_uid(path: &Path) -> u32 {
        fs::metadata(path).expect("metadata").uid()
    }

    #[test]
    fn sha256_of_known_input() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("abc");
        fs::write(&file, "abc").expect("write");
        assert_eq!(compute_sha256_hex(&file).expect("hash"), sha256_hex(b"abc"));
        assert!(normalize_sha256_hex("xyz").is_err());
    }

    #[test]
    fn modes_depend_on_extension() {
        assert_eq!(required_mode(Path::new("a.pkg")), 0o644);
        assert_eq!(required_mode(Path::new("a.mobileconfig")), 0o644);
        assert_eq!(required_mode(Path::new("a.sh")), 0o755);
    }

    #[test]
    fn wrong_mode_or_owner_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("a.sh");
        let bad = dir.path().join("b.sh");
        write_with_mode(&good, "#!/bin/sh\nexit 0\n", 0o755);
        write_with_mode(&bad, "#!/bin/sh\nexit 0\n", 0o644);
        let uid = own_uid(&good);

        let gate = IntegrityGate::new(uid, BTreeMap::new());
        assert!(gate.verify_ownership(&good).is_ok());
        assert!(matches!(
            gate.verify_ownership(&bad),
            Err(Rejection::BadOwnerOrMode { mode: 0o644, .. })
        ));

        let foreign_owner = IntegrityGate::new(uid.wrapping_add(1), BTreeMap::new());
        assert!(foreign_owner.verify_ownership(&good).is_err());
    }

    #[test]
    fn verified_mode_requires_an_entry_for_every_item() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listed = dir.path().join("listed.sh");
        let unlisted = dir.path().join("unlisted.sh");
        write_with_mode(&listed, "#!/bin/sh\necho listed\n", 0o755);
        write_with_mode(&unlisted, "#!/bin/sh\necho unlisted\n", 0o755);
        let uid = own_uid(&listed);

        let mut approved = BTreeMap::new();
        approved.insert(
            listed.display().to_string(),
            compute_sha256_hex(&listed).expect("hash"),
        );
        let gate = IntegrityGate::new(uid, approved.clone());
        assert!(gate.verify_checksum(&Item::from_path(listed.clone())).is_ok());
        assert_eq!(
            gate.verify_checksum(&Item::from_path(unlisted)),
            Err(Rejection::ChecksumMissing)
        );

        fs::write(&listed, "#!/bin/sh\necho tampered\n").expect("tamper");
        assert!(matches!(
            gate.verify_checksum(&Item::from_path(listed)),
            Err(Rejection::ChecksumMismatch { .. })
        ));

        approved.insert("inline".to_string(), sha256_hex(b"echo hi\n"));
        let gate = IntegrityGate::new(uid, approved);
        assert!(gate
            .verify_checksum(&Item::from_payload("inline", b"echo hi\n".to_vec()))
            .is_ok());
    }

    #[test]
    fn malformed_approved_digest_still_enables_verified_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unlisted = dir.path().join("unlisted.sh");
        write_with_mode(&unlisted, "#!/bin/sh\nexit 0\n", 0o755);

        let mut approved = BTreeMap::new();
        approved.insert("/somewhere/else.sh".to_string(), "deadbeef".to_string());
        let gate = IntegrityGate::new(own_uid(&unlisted), approved);

        assert!(gate.verified_mode());
        assert_eq!(
            gate.verify_checksum(&Item::from_path(unlisted)),
            Err(Rejection::ChecksumMissing)
        );
    }

    #[test]
    fn inventory_skips_hidden_and_configuration_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("login-once");
        let logs = dir.path().join("logs");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::create_dir_all(&logs).expect("mkdir logs");
        fs::write(nested.join("a.sh"), "a").expect("write");
        fs::write(nested.join(".hidden"), "h").expect("write");
        fs::write(dir.path().join("prefs.json"), "{}").expect("write");
        fs::write(logs.join("outset.log"), "log").expect("write");

        let inventory = checksum_inventory(dir.path(), &[logs.as_path()]).expect("inventory");
        assert_eq!(inventory.len(), 1);
        let key = nested.join("a.sh").display().to_string();
        assert_eq!(inventory.get(&key), Some(&sha256_hex(b"a")));
    }
}
