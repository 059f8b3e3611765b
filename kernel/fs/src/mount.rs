//! Mounted filesystem instances.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::sync::Mutex;

use crate::{FileSystemOps, StorageDescriptor};

static NEXT_MOUNT_ID: AtomicU32 = AtomicU32::new(1);

/// One mounted filesystem: a driver instance rooted at a scope-visible
/// path.
pub struct Mount {
    id: u32,
    /// Scope-visible mount path (canonical, e.g. `/mnt/ram`).
    mount_path: String,
    ops: Arc<dyn FileSystemOps>,
    /// Serializes request handling per mount, preserving per-caller FIFO
    /// order within a scope-mount pair.
    serializer: Mutex<()>,
}

impl Mount {
    /// Creates a mount of `ops` at `mount_path`.
    pub fn new(mount_path: &str, ops: Arc<dyn FileSystemOps>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            mount_path: String::from(mount_path),
            ops,
            serializer: Mutex::new(()),
        })
    }

    /// Mount id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The scope-visible mount path.
    #[must_use]
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// The driver operations.
    #[must_use]
    pub fn ops(&self) -> &Arc<dyn FileSystemOps> {
        &self.ops
    }

    /// The backing storage description.
    #[must_use]
    pub fn storage(&self) -> StorageDescriptor {
        self.ops.storage()
    }

    /// Runs `f` under the mount serializer.
    pub fn serialized<R>(&self, f: impl FnOnce(&dyn FileSystemOps) -> R) -> R {
        let _guard = self.serializer.lock();
        f(self.ops.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;

    #[test]
    fn ids_are_unique() {
        let fs = RamFs::new("a");
        let m1 = Mount::new("/a", fs.clone());
        let m2 = Mount::new("/b", fs);
        assert_ne!(m1.id(), m2.id());
        assert_eq!(m1.mount_path(), "/a");
    }

    #[test]
    fn serialized_runs_closure() {
        let fs = RamFs::new("a");
        let mount = Mount::new("/a", fs);
        let storage = mount.serialized(|ops| ops.storage());
        assert_eq!(storage.driver, "ramfs");
    }
}
