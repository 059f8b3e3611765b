//! In-memory filesystem.
//!
//! Backs the boot root before any storage driver is up and doubles as the
//! reference driver for pipeline tests. Nodes form a tree of directories
//! (child maps) and files (byte vectors); hard links insert the same node
//! under another name.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::sync::{Mutex, SpinLock};

use crate::{
    Access, DirEntry, FileNode, FileSystemOps, FileStat, FsError, FsStat, NodeType, OpenOptions,
    StorageDescriptor, path,
};

/// One node in the tree.
pub struct RamNode {
    name: SpinLock<String>,
    node_type: NodeType,
    permissions: u32,
    data: Mutex<Vec<u8>>,
    children: Mutex<alloc::collections::BTreeMap<String, Arc<RamNode>>>,
}

impl RamNode {
    fn new(name: &str, node_type: NodeType, permissions: u32) -> Arc<Self> {
        Arc::new(Self {
            name: SpinLock::new(String::from(name)),
            node_type,
            permissions,
            data: Mutex::new(Vec::new()),
            children: Mutex::new(alloc::collections::BTreeMap::new()),
        })
    }

    fn stat(&self) -> FileStat {
        FileStat {
            name: self.name.lock().clone(),
            size: self.size(),
            node_type: self.node_type,
            permissions: self.permissions,
        }
    }
}

impl FileNode for RamNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn node_type(&self) -> NodeType {
        self.node_type
    }
}

/// The in-memory filesystem.
pub struct RamFs {
    label: String,
    root: Arc<RamNode>,
    bytes_written: AtomicU64,
}

impl RamFs {
    /// Creates an empty filesystem with the given volume label.
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: String::from(label),
            root: RamNode::new("", NodeType::Directory, 0o755),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Creates a file at `subpath` with `contents`, making intermediate
    /// directories. Boot-time population helper.
    ///
    /// # Errors
    ///
    /// [`FsError::Exists`] if the path already names a node.
    pub fn add_file(&self, subpath: &str, contents: &[u8]) -> Result<(), FsError> {
        let mut current = self.root.clone();
        let parts: Vec<&str> = path::components(subpath).collect();
        let (file_name, dirs) = parts.split_last().ok_or(FsError::InvalidParameters)?;
        for dir in dirs {
            let next = {
                let mut children = current.children.lock();
                children
                    .entry(String::from(*dir))
                    .or_insert_with(|| RamNode::new(dir, NodeType::Directory, 0o755))
                    .clone()
            };
            current = next;
        }
        let mut children = current.children.lock();
        if children.contains_key(*file_name) {
            return Err(FsError::Exists);
        }
        let node = RamNode::new(file_name, NodeType::File, 0o644);
        *node.data.lock() = Vec::from(contents);
        children.insert(String::from(*file_name), node);
        Ok(())
    }

    fn resolve(&self, subpath: &str) -> Result<Arc<RamNode>, FsError> {
        let mut current = self.root.clone();
        for component in path::components(subpath) {
            if current.node_type != NodeType::Directory {
                return Err(FsError::PathNotFound);
            }
            let next = current
                .children
                .lock()
                .get(component)
                .cloned()
                .ok_or(FsError::PathNotFound)?;
            current = next;
        }
        Ok(current)
    }

    /// Resolves the parent directory of `subpath` plus the final name.
    fn resolve_parent(&self, subpath: &str) -> Result<(Arc<RamNode>, String), FsError> {
        let parts: Vec<&str> = path::components(subpath).collect();
        let (name, dirs) = parts.split_last().ok_or(FsError::InvalidParameters)?;
        let mut current = self.root.clone();
        for dir in dirs {
            let next = current
                .children
                .lock()
                .get(*dir)
                .cloned()
                .ok_or(FsError::PathNotFound)?;
            if next.node_type != NodeType::Directory {
                return Err(FsError::PathNotFound);
            }
            current = next;
        }
        Ok((current, String::from(*name)))
    }

    fn downcast(node: &Arc<dyn FileNode>) -> Result<&RamNode, FsError> {
        node.as_any()
            .downcast_ref::<RamNode>()
            .ok_or(FsError::InvalidParameters)
    }
}

impl FileSystemOps for RamFs {
    fn open(
        &self,
        subpath: &str,
        options: OpenOptions,
        _access: Access,
    ) -> Result<Arc<dyn FileNode>, FsError> {
        let node = match self.resolve(subpath) {
            Ok(node) => node,
            Err(FsError::PathNotFound) if options.contains(OpenOptions::CREATE) => {
                let (parent, name) = self.resolve_parent(subpath)?;
                let node = RamNode::new(&name, NodeType::File, 0o644);
                let mut children = parent.children.lock();
                if children.contains_key(&name) {
                    return Err(FsError::Exists);
                }
                children.insert(name, node.clone());
                node
            }
            Err(err) => return Err(err),
        };

        if options.contains(OpenOptions::FILE_ONLY) && node.node_type != NodeType::File {
            return Err(FsError::AccessDenied);
        }
        if options.contains(OpenOptions::DIRECTORY) && node.node_type != NodeType::Directory {
            return Err(FsError::AccessDenied);
        }
        if options.contains(OpenOptions::TRUNCATE) && node.node_type == NodeType::File {
            node.data.lock().clear();
        }
        Ok(node)
    }

    fn close(&self, _node: &Arc<dyn FileNode>) -> Result<(), FsError> {
        Ok(())
    }

    fn read(
        &self,
        node: &Arc<dyn FileNode>,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let node = Self::downcast(node)?;
        if node.node_type != NodeType::File {
            return Err(FsError::AccessDenied);
        }
        let data = node.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write(&self, node: &Arc<dyn FileNode>, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
        let node = Self::downcast(node)?;
        if node.node_type != NodeType::File {
            return Err(FsError::AccessDenied);
        }
        let mut data = node.data.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        self.bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&self, _node: &Arc<dyn FileNode>) -> Result<(), FsError> {
        Ok(())
    }

    fn truncate(&self, node: &Arc<dyn FileNode>, size: u64) -> Result<(), FsError> {
        let node = Self::downcast(node)?;
        if node.node_type != NodeType::File {
            return Err(FsError::AccessDenied);
        }
        node.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn stat(&self, node: &Arc<dyn FileNode>) -> Result<FileStat, FsError> {
        Ok(Self::downcast(node)?.stat())
    }

    fn stat_path(&self, subpath: &str) -> Result<FileStat, FsError> {
        Ok(self.resolve(subpath)?.stat())
    }

    fn read_dir(
        &self,
        node: &Arc<dyn FileNode>,
        index: u32,
    ) -> Result<Option<DirEntry>, FsError> {
        let node = Self::downcast(node)?;
        if node.node_type != NodeType::Directory {
            return Err(FsError::AccessDenied);
        }
        let children = node.children.lock();
        Ok(children.values().nth(index as usize).map(|child| DirEntry {
            stat: child.stat(),
            index,
        }))
    }

    fn make_dir(&self, subpath: &str, permissions: u32) -> Result<Arc<dyn FileNode>, FsError> {
        let (parent, name) = self.resolve_parent(subpath)?;
        if parent.node_type != NodeType::Directory {
            return Err(FsError::PathNotFound);
        }
        let mut children = parent.children.lock();
        if children.contains_key(&name) {
            return Err(FsError::Exists);
        }
        let node = RamNode::new(&name, NodeType::Directory, permissions);
        children.insert(name, node.clone());
        Ok(node)
    }

    fn unlink(&self, subpath: &str) -> Result<(), FsError> {
        let (parent, name) = self.resolve_parent(subpath)?;
        let mut children = parent.children.lock();
        let node = children.get(&name).ok_or(FsError::PathNotFound)?;
        if node.node_type == NodeType::Directory && !node.children.lock().is_empty() {
            return Err(FsError::AccessDenied);
        }
        children.remove(&name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let (from_parent, from_name) = self.resolve_parent(from)?;
        let (to_parent, to_name) = self.resolve_parent(to)?;
        if to_parent.children.lock().contains_key(&to_name) {
            return Err(FsError::Exists);
        }
        let node = from_parent
            .children
            .lock()
            .remove(&from_name)
            .ok_or(FsError::PathNotFound)?;
        *node.name.lock() = to_name.clone();
        to_parent.children.lock().insert(to_name, node);
        Ok(())
    }

    fn link(&self, from: &str, to: &str) -> Result<(), FsError> {
        let node = self.resolve(from)?;
        if node.node_type == NodeType::Directory {
            return Err(FsError::AccessDenied);
        }
        let (to_parent, to_name) = self.resolve_parent(to)?;
        let mut children = to_parent.children.lock();
        if children.contains_key(&to_name) {
            return Err(FsError::Exists);
        }
        children.insert(to_name, node);
        Ok(())
    }

    fn read_link(&self, _subpath: &str) -> Result<String, FsError> {
        Err(FsError::NotSupported)
    }

    fn stat_fs(&self) -> Result<FsStat, FsError> {
        Ok(FsStat {
            label: self.label.clone(),
            block_size: 4096,
            blocks: u64::MAX / 4096,
            blocks_free: u64::MAX / 4096,
        })
    }

    fn storage(&self) -> StorageDescriptor {
        StorageDescriptor {
            driver: String::from("ramfs"),
            device_id: 0,
            sector_size: 512,
            sector_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_file(fs: &RamFs, path: &str) -> Arc<dyn FileNode> {
        fs.open(path, OpenOptions::empty(), Access::READ).unwrap()
    }

    #[test]
    fn create_write_read() {
        let fs = RamFs::new("test");
        let node = fs
            .open("hello.txt", OpenOptions::CREATE, Access::WRITE)
            .unwrap();
        assert_eq!(fs.write(&node, 0, b"hello world").unwrap(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read(&node, 6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let fs = RamFs::new("test");
        fs.add_file("f", b"abc").unwrap();
        let node = open_file(&fs, "f");
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&node, 3, &mut buf).unwrap(), 0);
        assert_eq!(fs.read(&node, 100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_extends_with_zero_fill() {
        let fs = RamFs::new("test");
        fs.add_file("f", b"ab").unwrap();
        let node = open_file(&fs, "f");
        fs.write(&node, 4, b"cd").unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(fs.read(&node, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"ab\0\0cd");
    }

    #[test]
    fn nested_paths() {
        let fs = RamFs::new("test");
        fs.add_file("a/b/c.txt", b"deep").unwrap();
        let stat = fs.stat_path("a/b/c.txt").unwrap();
        assert_eq!(stat.name, "c.txt");
        assert_eq!(stat.size, 4);
        assert_eq!(fs.stat_path("a").unwrap().node_type, NodeType::Directory);
        assert_eq!(fs.stat_path("a/x").unwrap_err(), FsError::PathNotFound);
    }

    #[test]
    fn truncate_option_clears_contents() {
        let fs = RamFs::new("test");
        fs.add_file("f", b"data").unwrap();
        let node = fs
            .open("f", OpenOptions::TRUNCATE, Access::WRITE)
            .unwrap();
        assert_eq!(node.size(), 0);
    }

    #[test]
    fn mkdir_and_readdir() {
        let fs = RamFs::new("test");
        fs.make_dir("dir", 0o755).unwrap();
        fs.add_file("dir/one", b"1").unwrap();
        fs.add_file("dir/two", b"2").unwrap();

        let dir = fs
            .open("dir", OpenOptions::DIRECTORY, Access::READ)
            .unwrap();
        let first = fs.read_dir(&dir, 0).unwrap().unwrap();
        let second = fs.read_dir(&dir, 1).unwrap().unwrap();
        assert_eq!(first.stat.name, "one");
        assert_eq!(second.stat.name, "two");
        assert!(fs.read_dir(&dir, 2).unwrap().is_none());
    }

    #[test]
    fn mkdir_existing_fails() {
        let fs = RamFs::new("test");
        fs.make_dir("dir", 0o755).unwrap();
        assert_eq!(fs.make_dir("dir", 0o755).err(), Some(FsError::Exists));
    }

    #[test]
    fn unlink_refuses_nonempty_directory() {
        let fs = RamFs::new("test");
        fs.add_file("dir/child", b"x").unwrap();
        assert_eq!(fs.unlink("dir").unwrap_err(), FsError::AccessDenied);
        fs.unlink("dir/child").unwrap();
        fs.unlink("dir").unwrap();
        assert_eq!(fs.stat_path("dir").unwrap_err(), FsError::PathNotFound);
    }

    #[test]
    fn rename_moves_node() {
        let fs = RamFs::new("test");
        fs.add_file("old", b"data").unwrap();
        fs.make_dir("sub", 0o755).unwrap();
        fs.rename("old", "sub/new").unwrap();
        assert_eq!(fs.stat_path("old").unwrap_err(), FsError::PathNotFound);
        let stat = fs.stat_path("sub/new").unwrap();
        assert_eq!(stat.name, "new");
        assert_eq!(stat.size, 4);
    }

    #[test]
    fn hard_link_shares_contents() {
        let fs = RamFs::new("test");
        fs.add_file("orig", b"shared").unwrap();
        fs.link("orig", "alias").unwrap();

        let alias = open_file(&fs, "alias");
        fs.write(&alias, 0, b"SHARED").unwrap();
        let orig = open_file(&fs, "orig");
        let mut buf = [0u8; 6];
        fs.read(&orig, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"SHARED");
    }

    #[test]
    fn type_mismatch_on_open() {
        let fs = RamFs::new("test");
        fs.add_file("f", b"x").unwrap();
        fs.make_dir("d", 0o755).unwrap();
        assert_eq!(
            fs.open("f", OpenOptions::DIRECTORY, Access::READ).err(),
            Some(FsError::AccessDenied)
        );
        assert_eq!(
            fs.open("d", OpenOptions::FILE_ONLY, Access::READ).err(),
            Some(FsError::AccessDenied)
        );
    }

    #[test]
    fn open_root_directory() {
        let fs = RamFs::new("test");
        let root = fs.open("", OpenOptions::DIRECTORY, Access::READ).unwrap();
        assert_eq!(root.node_type(), NodeType::Directory);
    }
}
