//! Per-process filesystem scopes.
//!
//! A scope is a process's view of the mounted filesystems plus a bitset of
//! permitted verbs. Path resolution canonicalizes the caller's path and
//! matches the longest mount prefix; a verb outside the permission set
//! short-circuits with `NoPermissions` before any driver runs.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::id::ProcessId;
use muon_core::sync::SpinLock;

use crate::mount::Mount;
use crate::{FsError, path};

bitflags::bitflags! {
    /// Verb groups a scope may permit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VerbSet: u32 {
        /// Open and close files.
        const OPEN   = 1 << 0;
        /// Read file contents and directories.
        const READ   = 1 << 1;
        /// Write file contents.
        const WRITE  = 1 << 2;
        /// Namespace mutation: move, link, unlink, mkdir, set-size/access.
        const MODIFY = 1 << 3;
        /// Metadata queries: stat, statfs, storage, realpath.
        const STAT   = 1 << 4;
    }
}

/// A process's view of the mounted filesystems.
pub struct FilesystemScope {
    process: ProcessId,
    permissions: VerbSet,
    /// Mounts keyed by canonical mount path.
    mounts: SpinLock<Vec<Arc<Mount>>>,
}

impl FilesystemScope {
    /// Creates a scope for `process` with the given permissions.
    pub fn new(process: ProcessId, permissions: VerbSet) -> Arc<Self> {
        Arc::new(Self {
            process,
            permissions,
            mounts: SpinLock::new(Vec::new()),
        })
    }

    /// The owning process.
    #[must_use]
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Whether the scope permits every verb in `required`.
    #[must_use]
    pub fn allows(&self, required: VerbSet) -> bool {
        self.permissions.contains(required)
    }

    /// Makes a mount visible in this scope.
    pub fn attach(&self, mount: Arc<Mount>) {
        self.mounts.lock().push(mount);
    }

    /// Resolves a caller path to `(mount, subpath)`.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidParameters`] for malformed paths,
    /// [`FsError::PathNotFound`] when no mount prefix matches.
    pub fn resolve(&self, caller_path: &str) -> Result<(Arc<Mount>, String), FsError> {
        let canonical = path::canonicalize(caller_path).ok_or(FsError::InvalidParameters)?;
        let mounts = self.mounts.lock();
        let mount_path = path::longest_prefix_match(
            &canonical,
            mounts.iter().map(|m| m.mount_path()),
        )
        .ok_or(FsError::PathNotFound)?;
        let mount = mounts
            .iter()
            .find(|m| m.mount_path() == mount_path)
            .cloned()
            .ok_or(FsError::PathNotFound)?;
        let subpath = String::from(path::strip_mount_prefix(&canonical, mount.mount_path()));
        Ok((mount, subpath))
    }

    /// Canonicalizes a caller path without resolving it.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidParameters`] for malformed paths.
    pub fn realpath(&self, caller_path: &str) -> Result<String, FsError> {
        path::canonicalize(caller_path).ok_or(FsError::InvalidParameters)
    }
}

/// The process → scope table. The kernel owns the root scope; processes
/// without an entry are unauthenticated and every request is refused.
pub struct ScopeTable {
    scopes: SpinLock<BTreeMap<ProcessId, Arc<FilesystemScope>>>,
}

impl ScopeTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            scopes: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Binds a scope to its process.
    pub fn insert(&self, scope: Arc<FilesystemScope>) {
        self.scopes.lock().insert(scope.process(), scope);
    }

    /// The scope of `process`, or `None` for unauthenticated callers.
    #[must_use]
    pub fn get(&self, process: ProcessId) -> Option<Arc<FilesystemScope>> {
        self.scopes.lock().get(&process).cloned()
    }

    /// Drops a process's scope.
    pub fn remove(&self, process: ProcessId) {
        self.scopes.lock().remove(&process);
    }
}

impl Default for ScopeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::Mount;
    use crate::ramfs::RamFs;

    fn scope_with_mounts() -> Arc<FilesystemScope> {
        let scope = FilesystemScope::new(ProcessId::new(1), VerbSet::all());
        scope.attach(Mount::new("/mnt/ram", RamFs::new("ram")));
        scope.attach(Mount::new("/mnt", RamFs::new("disk")));
        scope
    }

    #[test]
    fn resolve_longest_prefix() {
        let scope = scope_with_mounts();
        let (mount, subpath) = scope.resolve("/mnt/ram/data").unwrap();
        assert_eq!(mount.mount_path(), "/mnt/ram");
        assert_eq!(subpath, "data");

        let (mount, subpath) = scope.resolve("/mnt/other/file").unwrap();
        assert_eq!(mount.mount_path(), "/mnt");
        assert_eq!(subpath, "other/file");
    }

    #[test]
    fn resolve_environment_prefix() {
        let scope = FilesystemScope::new(ProcessId::new(1), VerbSet::all());
        scope.attach(Mount::new("/ram", RamFs::new("ram")));
        let (mount, subpath) = scope.resolve("ram:/a/./b//c").unwrap();
        assert_eq!(mount.mount_path(), "/ram");
        assert_eq!(subpath, "a/b/c");
    }

    #[test]
    fn resolve_unknown_prefix_fails() {
        let scope = scope_with_mounts();
        assert_eq!(
            scope.resolve("/proc/cpuinfo").err(),
            Some(FsError::PathNotFound)
        );
        assert_eq!(
            scope.resolve("relative/path").err(),
            Some(FsError::InvalidParameters)
        );
    }

    #[test]
    fn permissions_are_subset_checked() {
        let scope = FilesystemScope::new(ProcessId::new(2), VerbSet::OPEN | VerbSet::READ);
        assert!(scope.allows(VerbSet::READ));
        assert!(scope.allows(VerbSet::OPEN | VerbSet::READ));
        assert!(!scope.allows(VerbSet::WRITE));
        assert!(!scope.allows(VerbSet::READ | VerbSet::MODIFY));
    }

    #[test]
    fn scope_table_lookup() {
        let table = ScopeTable::new();
        assert!(table.get(ProcessId::new(5)).is_none());
        table.insert(FilesystemScope::new(ProcessId::new(5), VerbSet::all()));
        assert!(table.get(ProcessId::new(5)).is_some());
        table.remove(ProcessId::new(5));
        assert!(table.get(ProcessId::new(5)).is_none());
    }
}
