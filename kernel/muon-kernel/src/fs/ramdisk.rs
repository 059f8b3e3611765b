//! Boot ramdisk filesystem driver.
//!
//! A read-only [`FileSystemOps`] implementation over a parsed ramdisk
//! image. The blob lives in loader-reserved physical memory reachable
//! through the direct map, so the image borrows it for the system's
//! lifetime.

use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

use muon_fs::{
    Access, DirEntry, FileNode, FileSystemOps, FileStat, FsError, FsStat, NodeType, OpenOptions,
    StorageDescriptor,
};
use muon_initrd::{Descriptor, DescriptorKind, Image, InitrdError};

fn initrd_to_fs(err: InitrdError) -> FsError {
    match err {
        InitrdError::NotFound => FsError::PathNotFound,
        InitrdError::WrongType => FsError::InvalidParameters,
        _ => FsError::DiskError,
    }
}

/// An open ramdisk node: its descriptor snapshot.
struct RamdiskNode {
    descriptor: Descriptor,
}

impl RamdiskNode {
    fn stat(&self) -> FileStat {
        FileStat {
            name: self.descriptor.name.clone(),
            size: match self.descriptor.kind {
                DescriptorKind::File => u64::from(self.descriptor.length),
                DescriptorKind::Directory => 0,
            },
            node_type: match self.descriptor.kind {
                DescriptorKind::File => NodeType::File,
                DescriptorKind::Directory => NodeType::Directory,
            },
            permissions: 0o444,
        }
    }
}

impl FileNode for RamdiskNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn size(&self) -> u64 {
        match self.descriptor.kind {
            DescriptorKind::File => u64::from(self.descriptor.length),
            DescriptorKind::Directory => 0,
        }
    }

    fn node_type(&self) -> NodeType {
        match self.descriptor.kind {
            DescriptorKind::File => NodeType::File,
            DescriptorKind::Directory => NodeType::Directory,
        }
    }
}

/// The boot ramdisk mount.
pub struct RamdiskFs {
    image: Image<'static>,
    label: String,
}

impl RamdiskFs {
    /// Parses `blob` and wraps it as a filesystem.
    ///
    /// # Errors
    ///
    /// Propagates image validation failures.
    pub fn new(blob: &'static [u8], label: &str) -> Result<Arc<Self>, InitrdError> {
        Ok(Arc::new(Self {
            image: Image::parse(blob)?,
            label: String::from(label),
        }))
    }

    fn node(&self, subpath: &str) -> Result<Descriptor, FsError> {
        self.image.find(subpath).map_err(initrd_to_fs)
    }

    fn downcast(node: &Arc<dyn FileNode>) -> Result<&RamdiskNode, FsError> {
        node.as_any()
            .downcast_ref::<RamdiskNode>()
            .ok_or(FsError::InvalidParameters)
    }
}

impl FileSystemOps for RamdiskFs {
    fn open(
        &self,
        subpath: &str,
        options: OpenOptions,
        access: Access,
    ) -> Result<Arc<dyn FileNode>, FsError> {
        if access.contains(Access::WRITE) || options.contains(OpenOptions::CREATE) {
            return Err(FsError::AccessDenied);
        }
        let descriptor = self.node(subpath)?;
        if options.contains(OpenOptions::FILE_ONLY) && descriptor.kind != DescriptorKind::File {
            return Err(FsError::AccessDenied);
        }
        if options.contains(OpenOptions::DIRECTORY)
            && descriptor.kind != DescriptorKind::Directory
        {
            return Err(FsError::AccessDenied);
        }
        Ok(Arc::new(RamdiskNode { descriptor }))
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
        self.image
            .read_file(&node.descriptor, offset, buf)
            .map_err(initrd_to_fs)
    }

    fn write(&self, _node: &Arc<dyn FileNode>, _offset: u64, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    fn flush(&self, _node: &Arc<dyn FileNode>) -> Result<(), FsError> {
        Ok(())
    }

    fn truncate(&self, _node: &Arc<dyn FileNode>, _size: u64) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn stat(&self, node: &Arc<dyn FileNode>) -> Result<FileStat, FsError> {
        Ok(Self::downcast(node)?.stat())
    }

    fn stat_path(&self, subpath: &str) -> Result<FileStat, FsError> {
        let descriptor = self.node(subpath)?;
        Ok(RamdiskNode { descriptor }.stat())
    }

    fn read_dir(
        &self,
        node: &Arc<dyn FileNode>,
        index: u32,
    ) -> Result<Option<DirEntry>, FsError> {
        let node = Self::downcast(node)?;
        let children = self
            .image
            .read_dir(&node.descriptor)
            .map_err(initrd_to_fs)?;
        Ok(children.into_iter().nth(index as usize).map(|descriptor| {
            DirEntry {
                stat: RamdiskNode { descriptor }.stat(),
                index,
            }
        }))
    }

    fn make_dir(&self, _subpath: &str, _permissions: u32) -> Result<Arc<dyn FileNode>, FsError> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, _subpath: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn rename(&self, _from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn link(&self, _from: &str, _to: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn read_link(&self, _subpath: &str) -> Result<String, FsError> {
        Err(FsError::NotSupported)
    }

    fn stat_fs(&self) -> Result<FsStat, FsError> {
        Ok(FsStat {
            label: self.label.clone(),
            block_size: muon_initrd::BLOCK_SIZE as u32,
            blocks: 0,
            blocks_free: 0,
        })
    }

    fn storage(&self) -> StorageDescriptor {
        StorageDescriptor {
            driver: String::from("ramdisk"),
            device_id: 0,
            sector_size: muon_initrd::BLOCK_SIZE as u32,
            sector_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muon_initrd::build::ImageBuilder;

    fn mounted() -> Arc<RamdiskFs> {
        let mut builder = ImageBuilder::new(1);
        builder.add_file("data", b"sixteen byte xx!more after that");
        builder.add_file("modules/net.drv", &[0x5A; 64]);
        let blob: &'static [u8] = Box::leak(builder.build().into_boxed_slice());
        RamdiskFs::new(blob, "boot").unwrap()
    }

    #[test]
    fn open_and_read() {
        let fs = mounted();
        let node = fs.open("data", OpenOptions::empty(), Access::READ).unwrap();
        assert_eq!(node.node_type(), NodeType::File);

        let mut buf = [0u8; 16];
        assert_eq!(fs.read(&node, 0, &mut buf).unwrap(), 16);
        assert_eq!(&buf, b"sixteen byte xx!");

        // Same bytes again from offset 0 (seek support lives in the VFS).
        let mut again = [0u8; 16];
        fs.read(&node, 0, &mut again).unwrap();
        assert_eq!(buf, again);
    }

    #[test]
    fn writes_are_refused() {
        let fs = mounted();
        assert_eq!(
            fs.open("data", OpenOptions::empty(), Access::WRITE).err(),
            Some(FsError::AccessDenied)
        );
        let node = fs.open("data", OpenOptions::empty(), Access::READ).unwrap();
        assert_eq!(fs.write(&node, 0, b"x").unwrap_err(), FsError::NotSupported);
        assert_eq!(fs.truncate(&node, 0).unwrap_err(), FsError::NotSupported);
        assert_eq!(fs.unlink("data").unwrap_err(), FsError::NotSupported);
    }

    #[test]
    fn directory_listing() {
        let fs = mounted();
        let root = fs.open("", OpenOptions::DIRECTORY, Access::READ).unwrap();
        let mut names = Vec::new();
        let mut index = 0;
        while let Some(entry) = fs.read_dir(&root, index).unwrap() {
            names.push(entry.stat.name);
            index += 1;
        }
        assert!(names.contains(&String::from("data")));
        assert!(names.contains(&String::from("modules")));
    }

    #[test]
    fn nested_stat() {
        let fs = mounted();
        let stat = fs.stat_path("modules/net.drv").unwrap();
        assert_eq!(stat.size, 64);
        assert_eq!(stat.node_type, NodeType::File);
        assert_eq!(
            fs.stat_path("modules/missing").unwrap_err(),
            FsError::PathNotFound
        );
    }

    #[test]
    fn statfs_reports_block_size() {
        let fs = mounted();
        let stat = fs.stat_fs().unwrap();
        assert_eq!(stat.label, "boot");
        assert_eq!(stat.block_size, 65536);
    }
}
