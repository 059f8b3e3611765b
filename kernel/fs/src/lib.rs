//! The virtual file system.
//!
//! Core abstractions: the [`FileSystemOps`] contract every concrete
//! filesystem driver implements, per-process [`scope`]s that gate path
//! resolution, and the asynchronous [`pipeline`] that turns each RPC verb
//! into a request object dispatched onto cooperative worker tasks.
//!
//! Bulk data moves through shared memory regions: read and write requests
//! name a region handle, and handlers copy between the file and the region
//! through its kernel view.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

pub mod mount;
pub mod path;
pub mod pipeline;
pub mod ramfs;
pub mod request;
pub mod scope;

/// Filesystem error taxonomy surfaced to VFS clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The path does not resolve to a node.
    PathNotFound,
    /// The node exists but the operation is not allowed on it.
    AccessDenied,
    /// The underlying storage failed.
    DiskError,
    /// API misuse (empty path, bad range, …).
    InvalidParameters,
    /// The target already exists.
    Exists,
    /// The driver does not implement the operation.
    NotSupported,
    /// The driver ran out of internal resources.
    OutOfResources,
    /// The caller's scope does not permit the verb.
    NoPermissions,
    /// The handle does not name a live object.
    DoesNotExist,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathNotFound => write!(f, "path not found"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::DiskError => write!(f, "disk error"),
            Self::InvalidParameters => write!(f, "invalid parameters"),
            Self::Exists => write!(f, "already exists"),
            Self::NotSupported => write!(f, "not supported"),
            Self::OutOfResources => write!(f, "out of resources"),
            Self::NoPermissions => write!(f, "no permissions"),
            Self::DoesNotExist => write!(f, "does not exist"),
        }
    }
}

bitflags::bitflags! {
    /// Options for opening a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenOptions: u32 {
        /// Create the file if it does not exist.
        const CREATE    = 1 << 0;
        /// Truncate to zero length on open.
        const TRUNCATE  = 1 << 1;
        /// Fail if the path names a directory.
        const FILE_ONLY = 1 << 2;
        /// Fail unless the path names a directory.
        const DIRECTORY = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Access rights on an open file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        /// Read access.
        const READ    = 1 << 0;
        /// Write access.
        const WRITE   = 1 << 1;
        /// Execute access.
        const EXECUTE = 1 << 2;
    }
}

/// Node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Metadata for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Node name (final path component).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Node type.
    pub node_type: NodeType,
    /// Driver permission bits.
    pub permissions: u32,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The entry's metadata.
    pub stat: FileStat,
    /// Its index within the directory.
    pub index: u32,
}

/// Filesystem-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStat {
    /// Volume label.
    pub label: String,
    /// Block size in bytes.
    pub block_size: u32,
    /// Total blocks.
    pub blocks: u64,
    /// Free blocks.
    pub blocks_free: u64,
}

/// Description of the storage a filesystem sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDescriptor {
    /// Driver name ("ramdisk", "ahci", …).
    pub driver: String,
    /// Driver-assigned device id.
    pub device_id: u32,
    /// Sector size in bytes.
    pub sector_size: u32,
    /// Total sectors.
    pub sector_count: u64,
}

/// An open node handed out by a filesystem driver.
///
/// Drivers downcast through [`FileNode::as_any`] to their concrete node
/// type on every operation.
pub trait FileNode: Any + Send + Sync {
    /// Concrete-type access for the owning driver.
    fn as_any(&self) -> &dyn Any;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Node type.
    fn node_type(&self) -> NodeType;
}

/// The operation contract every mounted filesystem provides.
///
/// Paths are mount-relative ("sub paths"), already canonicalized by the
/// scope layer. Errors use the [`FsError`] taxonomy.
#[allow(clippy::missing_errors_doc)]
pub trait FileSystemOps: Send + Sync {
    /// Opens (or creates, per `options`) a node.
    fn open(
        &self,
        subpath: &str,
        options: OpenOptions,
        access: Access,
    ) -> Result<Arc<dyn FileNode>, FsError>;

    /// Releases a node obtained from [`open`](Self::open).
    fn close(&self, node: &Arc<dyn FileNode>) -> Result<(), FsError>;

    /// Reads at `offset` into `buf`; returns the bytes read.
    fn read(&self, node: &Arc<dyn FileNode>, offset: u64, buf: &mut [u8])
    -> Result<usize, FsError>;

    /// Writes `buf` at `offset`; returns the bytes written.
    fn write(&self, node: &Arc<dyn FileNode>, offset: u64, buf: &[u8]) -> Result<usize, FsError>;

    /// Position change notification; stateless drivers keep the default.
    fn seek(&self, node: &Arc<dyn FileNode>, position: u64) -> Result<(), FsError> {
        let _ = (node, position);
        Ok(())
    }

    /// Flushes dirty state for a node.
    fn flush(&self, node: &Arc<dyn FileNode>) -> Result<(), FsError>;

    /// Truncates or extends a file.
    fn truncate(&self, node: &Arc<dyn FileNode>, size: u64) -> Result<(), FsError>;

    /// Stats an open node.
    fn stat(&self, node: &Arc<dyn FileNode>) -> Result<FileStat, FsError>;

    /// Stats by sub path.
    fn stat_path(&self, subpath: &str) -> Result<FileStat, FsError>;

    /// Reads one directory entry by index; `None` past the end.
    fn read_dir(&self, node: &Arc<dyn FileNode>, index: u32)
    -> Result<Option<DirEntry>, FsError>;

    /// Creates a directory.
    fn make_dir(&self, subpath: &str, permissions: u32) -> Result<Arc<dyn FileNode>, FsError>;

    /// Removes a file or empty directory.
    fn unlink(&self, subpath: &str) -> Result<(), FsError>;

    /// Renames `from` to `to` (both mount-relative).
    fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    /// Creates a hard link `to` referring to `from`.
    fn link(&self, from: &str, to: &str) -> Result<(), FsError>;

    /// Reads a symbolic link's target.
    fn read_link(&self, subpath: &str) -> Result<String, FsError>;

    /// Filesystem-wide statistics.
    fn stat_fs(&self) -> Result<FsStat, FsError>;

    /// Describes the backing storage.
    fn storage(&self) -> StorageDescriptor;
}
