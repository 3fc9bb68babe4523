use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    BootOnce,
    BootEvery,
    LoginWindow,
    LoginOnce,
    LoginEvery,
    LoginPrivilegedOnce,
    LoginPrivilegedEvery,
    OnDemand,
    OnDemandPrivileged,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::BootOnce,
        Phase::BootEvery,
        Phase::LoginWindow,
        Phase::LoginOnce,
        Phase::LoginEvery,
        Phase::LoginPrivilegedOnce,
        Phase::LoginPrivilegedEvery,
        Phase::OnDemand,
        Phase::OnDemandPrivileged,
        Phase::Cleanup,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::BootOnce => "boot-once",
            Phase::BootEvery => "boot-every",
            Phase::LoginWindow => "login-window",
            Phase::LoginOnce => "login-once",
            Phase::LoginEvery => "login-every",
            Phase::LoginPrivilegedOnce => "login-privileged-once",
            Phase::LoginPrivilegedEvery => "login-privileged-every",
            Phase::OnDemand => "on-demand",
            Phase::OnDemandPrivileged => "on-demand-privileged",
            Phase::Cleanup => "cleanup",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|phase| phase.name() == normalized)
    }

    /// Directory name under the working root. `Cleanup` owns no directory.
    pub fn dir_name(self) -> Option<&'static str> {
        match self {
            Phase::Cleanup => None,
            other => Some(other.name()),
        }
    }

    pub fn directory(self, root: &Path) -> Option<PathBuf> {
        self.dir_name().map(|name| root.join(name))
    }

    pub fn is_once(self) -> bool {
        matches!(
            self,
            Phase::BootOnce | Phase::LoginOnce | Phase::LoginPrivilegedOnce
        )
    }

    pub fn requires_privilege(self) -> bool {
        matches!(
            self,
            Phase::BootOnce
                | Phase::BootEvery
                | Phase::LoginPrivilegedOnce
                | Phase::LoginPrivilegedEvery
                | Phase::OnDemandPrivileged
                | Phase::Cleanup
        )
    }

    /// One-shot boot payloads are consumed whether or not they succeed.
    pub fn deletes_after_run(self) -> bool {
        matches!(self, Phase::BootOnce)
    }

    pub fn accepts_payloads(self) -> bool {
        !matches!(
            self,
            Phase::OnDemand | Phase::OnDemandPrivileged | Phase::Cleanup
        )
    }

    pub fn is_boot(self) -> bool {
        matches!(self, Phase::BootOnce | Phase::BootEvery)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub fn working_directories(root: &Path) -> Vec<PathBuf> {
    Phase::ALL
        .into_iter()
        .filter_map(|phase| phase.directory(root))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Script,
    Package,
}

impl ItemKind {
    pub fn infer(path: &Path) -> Self {
        match extension_lowercase(path).as_deref() {
            Some("pkg" | "mpkg" | "dmg") => ItemKind::Package,
            _ => ItemKind::Script,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Script => "script",
            ItemKind::Package => "package",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrigin {
    Directory,
    Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSource {
    File(PathBuf),
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub identity: String,
    pub kind: ItemKind,
    pub source: ItemSource,
}

impl Item {
    pub fn from_path(path: PathBuf) -> Self {
        Self {
            identity: path.display().to_string(),
            kind: ItemKind::infer(&path),
            source: ItemSource::File(path),
        }
    }

    pub fn from_payload(name: &str, content: Vec<u8>) -> Self {
        Self {
            identity: name.to_string(),
            kind: ItemKind::Script,
            source: ItemSource::Inline(content),
        }
    }

    pub fn origin(&self) -> ItemOrigin {
        match self.source {
            ItemSource::File(_) => ItemOrigin::Directory,
            ItemSource::Inline(_) => ItemOrigin::Payload,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ItemSource::File(path) => Some(path),
            ItemSource::Inline(_) => None,
        }
    }
}

pub(crate) fn extension_lowercase(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::{working_directories, Item, ItemKind, ItemOrigin, Phase};
    use std::path::{Path, PathBuf};

    #[test]
    fn once_flag_is_only_set_for_once_variants() {
        for phase in Phase::ALL {
            assert_eq!(phase.is_once(), phase.name().ends_with("-once"), "{phase}");
        }
    }

    #[test]
    fn phase_names_round_trip_through_parse() {
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.name()), Some(phase));
        }
        assert_eq!(Phase::parse(" LOGIN-ONCE "), Some(Phase::LoginOnce));
        assert_eq!(Phase::parse("login"), None);
    }

    #[test]
    fn cleanup_owns_no_directory() {
        let root = Path::new("/usr/local/outset");
        assert_eq!(Phase::Cleanup.directory(root), None);
        assert_eq!(
            Phase::LoginPrivilegedOnce.directory(root),
            Some(PathBuf::from("/usr/local/outset/login-privileged-once"))
        );
        assert_eq!(working_directories(root).len(), 9);
    }

    #[test]
    fn kind_is_inferred_from_extension() {
        assert_eq!(ItemKind::infer(Path::new("/x/a.pkg")), ItemKind::Package);
        assert_eq!(ItemKind::infer(Path::new("/x/a.MPKG")), ItemKind::Package);
        assert_eq!(ItemKind::infer(Path::new("/x/a.dmg")), ItemKind::Package);
        assert_eq!(ItemKind::infer(Path::new("/x/a.sh")), ItemKind::Script);
        assert_eq!(ItemKind::infer(Path::new("/x/noext")), ItemKind::Script);
        assert_eq!(
            ItemKind::infer(Path::new("/x/profile.mobileconfig")),
            ItemKind::Script
        );
    }

    #[test]
    fn payload_items_use_their_name_as_identity() {
        let item = Item::from_payload("setup-dock", b"#!/bin/sh\n".to_vec());
        assert_eq!(item.identity, "setup-dock");
        assert_eq!(item.origin(), ItemOrigin::Payload);
        assert!(item.path().is_none());

        let file = Item::from_path(PathBuf::from("/usr/local/outset/login-once/a.sh"));
        assert_eq!(file.identity, "/usr/local/outset/login-once/a.sh");
        assert_eq!(file.origin(), ItemOrigin::Directory);
    }
}
