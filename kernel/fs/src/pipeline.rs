//! The file-service request pipeline.
//!
//! Each request is dispatched as a cooperative task; the worker resolves
//! the caller's scope, checks the verb against its permission set, runs
//! the operation through the mount's driver under the mount serializer,
//! and answers through the request's deferred reply sink. A request whose
//! caller disconnected is destroyed without a reply.
//!
//! Bulk reads and writes transfer through shared memory regions named by
//! handle, copied via the region's kernel view.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use muon_core::handle::{Handle, HandleError, HandleRegistry, HandleTag};
use muon_mm::VmmError;
use muon_mm::region::MemoryRegion;
use muon_sched::scheduler::Scheduler;
use muon_sched::taskq::TaskQueue;

use crate::mount::Mount;
use crate::request::{RequestState, RequestVerb, VfsReply, VfsRequest};
use crate::scope::{FilesystemScope, ScopeTable, VerbSet};
use crate::{Access, FileNode, FsError, OpenOptions};

/// An open file: the registry payload behind a file handle.
pub struct File {
    /// The mount it lives on.
    pub mount: Arc<Mount>,
    /// The driver node.
    pub node: Arc<dyn FileNode>,
    /// Canonical path the file was opened with.
    pub path: String,
    position: AtomicU64,
    access: AtomicU32,
    /// Options the file was opened with.
    pub options: OpenOptions,
}

impl File {
    fn new(
        mount: Arc<Mount>,
        node: Arc<dyn FileNode>,
        path: String,
        access: Access,
        options: OpenOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            mount,
            node,
            path,
            position: AtomicU64::new(0),
            access: AtomicU32::new(access.bits()),
            options,
        })
    }

    /// Current read/write position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Current access set.
    #[must_use]
    pub fn access(&self) -> Access {
        Access::from_bits_truncate(self.access.load(Ordering::Acquire))
    }
}

fn vmm_to_fs(err: VmmError) -> FsError {
    match err {
        VmmError::OutOfMemory => FsError::OutOfResources,
        VmmError::NotPermitted => FsError::AccessDenied,
        _ => FsError::InvalidParameters,
    }
}

fn handle_to_fs(_err: HandleError) -> FsError {
    FsError::DoesNotExist
}

/// The verb groups each request needs from the caller's scope.
fn required_verbs(verb: &RequestVerb) -> VerbSet {
    match verb {
        RequestVerb::Open { .. }
        | RequestVerb::Close { .. }
        | RequestVerb::Seek { .. }
        | RequestVerb::Flush { .. }
        | RequestVerb::Duplicate { .. }
        | RequestVerb::GetAccess { .. }
        | RequestVerb::GetSize { .. }
        | RequestVerb::GetPosition { .. }
        | RequestVerb::GetPath { .. } => VerbSet::OPEN,
        RequestVerb::Read { .. } | RequestVerb::ReadDirectory { .. } => VerbSet::READ,
        RequestVerb::Write { .. } => VerbSet::WRITE,
        RequestVerb::Move { .. }
        | RequestVerb::Link { .. }
        | RequestVerb::Unlink { .. }
        | RequestVerb::MakeDirectory { .. }
        | RequestVerb::SetAccess { .. }
        | RequestVerb::SetSize { .. } => VerbSet::MODIFY,
        RequestVerb::StatHandle { .. }
        | RequestVerb::StatPath { .. }
        | RequestVerb::StatFsHandle { .. }
        | RequestVerb::StatFsPath { .. }
        | RequestVerb::StatStorageHandle { .. }
        | RequestVerb::StatStoragePath { .. }
        | RequestVerb::RealPath { .. } => VerbSet::STAT,
    }
}

/// Builds the verb-appropriate reply carrying `err`.
fn error_reply(verb: &RequestVerb, err: FsError) -> VfsReply {
    match verb {
        RequestVerb::Open { .. }
        | RequestVerb::Duplicate { .. }
        | RequestVerb::MakeDirectory { .. } => VfsReply::Handle(Err(err)),
        RequestVerb::Read { .. } | RequestVerb::Write { .. } => VfsReply::Transfer(Err(err)),
        RequestVerb::GetSize { .. } | RequestVerb::GetPosition { .. } => {
            VfsReply::Length(Err(err))
        }
        RequestVerb::StatHandle { .. } | RequestVerb::StatPath { .. } => VfsReply::Stat(Err(err)),
        RequestVerb::StatFsHandle { .. } | RequestVerb::StatFsPath { .. } => {
            VfsReply::StatFs(Err(err))
        }
        RequestVerb::StatStorageHandle { .. } | RequestVerb::StatStoragePath { .. } => {
            VfsReply::Storage(Err(err))
        }
        RequestVerb::RealPath { .. } | RequestVerb::GetPath { .. } => VfsReply::Path(Err(err)),
        RequestVerb::ReadDirectory { .. } => VfsReply::Dir(Err(err)),
        RequestVerb::GetAccess { .. } => VfsReply::Access(Err(err)),
        _ => VfsReply::Status(Err(err)),
    }
}

/// The file service: scope table, handle registry, and the task queue the
/// handlers run on.
pub struct VfsService {
    registry: Arc<HandleRegistry>,
    scopes: ScopeTable,
    tasks: Arc<TaskQueue>,
    sched: Arc<Scheduler>,
}

impl VfsService {
    /// Creates the service.
    pub fn new(sched: Arc<Scheduler>, registry: Arc<HandleRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scopes: ScopeTable::new(),
            tasks: Arc::new(TaskQueue::new()),
            sched,
        })
    }

    /// The process → scope table.
    #[must_use]
    pub fn scopes(&self) -> &ScopeTable {
        &self.scopes
    }

    /// The task queue workers drain.
    #[must_use]
    pub fn tasks(&self) -> &Arc<TaskQueue> {
        &self.tasks
    }

    /// The handle registry the service registers files in.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Queues a request for asynchronous handling.
    pub fn submit(self: &Arc<Self>, request: VfsRequest) -> Arc<VfsRequest> {
        let request = Arc::new(request);
        let service = self.clone();
        let queued = request.clone();
        self.tasks
            .queue(&self.sched, move || service.handle(&queued));
        request
    }

    fn lookup_file(&self, handle: Handle) -> Result<Arc<File>, FsError> {
        self.registry
            .lookup::<File>(handle, HandleTag::File)
            .map_err(handle_to_fs)
    }

    fn lookup_region(&self, handle: Handle) -> Result<Arc<MemoryRegion>, FsError> {
        self.registry
            .lookup::<MemoryRegion>(handle, HandleTag::MemoryRegion)
            .map_err(handle_to_fs)
    }

    fn open(
        &self,
        scope: &FilesystemScope,
        path: &str,
        options: OpenOptions,
        access: Access,
    ) -> Result<Handle, FsError> {
        let (mount, subpath) = scope.resolve(path)?;
        let node = mount.serialized(|ops| ops.open(&subpath, options, access))?;
        let file = File::new(mount, node, scope.realpath(path)?, access, options);
        Ok(self.registry.create(HandleTag::File, file))
    }

    fn read(
        &self,
        file: &File,
        buffer: &MemoryRegion,
        buffer_offset: u64,
        length: u64,
    ) -> Result<usize, FsError> {
        if !file.access().contains(Access::READ) {
            return Err(FsError::AccessDenied);
        }
        if length == 0 {
            return Ok(0);
        }
        let position = file.position.load(Ordering::Acquire);
        let mut chunk = vec![0u8; length as usize];
        let read = file
            .mount
            .serialized(|ops| ops.read(&file.node, position, &mut chunk))?;
        if read > 0 {
            buffer.write(buffer_offset, &chunk[..read]).map_err(vmm_to_fs)?;
            file.position.store(position + read as u64, Ordering::Release);
        }
        Ok(read)
    }

    fn write(
        &self,
        file: &File,
        buffer: &MemoryRegion,
        buffer_offset: u64,
        length: u64,
    ) -> Result<usize, FsError> {
        if !file.access().contains(Access::WRITE) {
            return Err(FsError::AccessDenied);
        }
        if length == 0 {
            return Ok(0);
        }
        let mut chunk = vec![0u8; length as usize];
        let taken = buffer.read(buffer_offset, &mut chunk).map_err(vmm_to_fs)?;
        let position = file.position.load(Ordering::Acquire);
        let written = file
            .mount
            .serialized(|ops| ops.write(&file.node, position, &chunk[..taken]))?;
        file.position
            .store(position + written as u64, Ordering::Release);
        Ok(written)
    }

    /// Resolves two paths that must land on the same mount.
    fn resolve_pair(
        scope: &FilesystemScope,
        from: &str,
        to: &str,
    ) -> Result<(Arc<Mount>, String, String), FsError> {
        let (from_mount, from_sub) = scope.resolve(from)?;
        let (to_mount, to_sub) = scope.resolve(to)?;
        if from_mount.id() != to_mount.id() {
            // Cross-mount moves would need a copy pipeline.
            return Err(FsError::NotSupported);
        }
        Ok((from_mount, from_sub, to_sub))
    }

    /// Executes one request and replies. Runs on a worker task.
    fn handle(&self, request: &VfsRequest) {
        request.set_state(RequestState::InProgress);
        if request.is_cancelled() {
            request.set_state(RequestState::Done);
            return;
        }

        // Unauthenticated callers have no scope; everything is refused.
        let Some(scope) = self.scopes.get(request.process()) else {
            request.reply(error_reply(&request.verb, FsError::NoPermissions));
            return;
        };
        if !scope.allows(required_verbs(&request.verb)) {
            request.reply(error_reply(&request.verb, FsError::NoPermissions));
            return;
        }

        let reply = match &request.verb {
            RequestVerb::Open {
                path,
                options,
                access,
            } => VfsReply::Handle(self.open(&scope, path, *options, *access)),
            RequestVerb::Close { file } => {
                let result = self.lookup_file(*file).and_then(|f| {
                    f.mount.serialized(|ops| ops.close(&f.node))?;
                    let _ = self.registry.release(*file);
                    Ok(())
                });
                VfsReply::Status(result)
            }
            RequestVerb::Read {
                file,
                buffer,
                buffer_offset,
                length,
            } => {
                let result = self.lookup_file(*file).and_then(|f| {
                    let region = self.lookup_region(*buffer)?;
                    self.read(&f, &region, *buffer_offset, *length)
                });
                VfsReply::Transfer(result)
            }
            RequestVerb::Write {
                file,
                buffer,
                buffer_offset,
                length,
            } => {
                let result = self.lookup_file(*file).and_then(|f| {
                    let region = self.lookup_region(*buffer)?;
                    self.write(&f, &region, *buffer_offset, *length)
                });
                VfsReply::Transfer(result)
            }
            RequestVerb::Seek { file, position } => {
                let result = self.lookup_file(*file).and_then(|f| {
                    f.mount.serialized(|ops| ops.seek(&f.node, *position))?;
                    f.position.store(*position, Ordering::Release);
                    Ok(())
                });
                VfsReply::Status(result)
            }
            RequestVerb::Flush { file } => {
                let result = self
                    .lookup_file(*file)
                    .and_then(|f| f.mount.serialized(|ops| ops.flush(&f.node)));
                VfsReply::Status(result)
            }
            RequestVerb::Move { from, to } => {
                let result = Self::resolve_pair(&scope, from, to).and_then(
                    |(mount, from_sub, to_sub)| {
                        mount.serialized(|ops| ops.rename(&from_sub, &to_sub))
                    },
                );
                VfsReply::Status(result)
            }
            RequestVerb::Link { from, to } => {
                let result = Self::resolve_pair(&scope, from, to).and_then(
                    |(mount, from_sub, to_sub)| {
                        mount.serialized(|ops| ops.link(&from_sub, &to_sub))
                    },
                );
                VfsReply::Status(result)
            }
            RequestVerb::Unlink { path } => {
                let result = scope
                    .resolve(path)
                    .and_then(|(mount, sub)| mount.serialized(|ops| ops.unlink(&sub)));
                VfsReply::Status(result)
            }
            RequestVerb::MakeDirectory { path, permissions } => {
                let result = scope.resolve(path).and_then(|(mount, sub)| {
                    let node = mount.serialized(|ops| ops.make_dir(&sub, *permissions))?;
                    let file = File::new(
                        mount,
                        node,
                        scope.realpath(path)?,
                        Access::READ,
                        OpenOptions::DIRECTORY,
                    );
                    Ok(self.registry.create(HandleTag::File, file))
                });
                VfsReply::Handle(result)
            }
            RequestVerb::ReadDirectory { file, index } => {
                let result = self
                    .lookup_file(*file)
                    .and_then(|f| f.mount.serialized(|ops| ops.read_dir(&f.node, *index)));
                VfsReply::Dir(result)
            }
            RequestVerb::StatHandle { file } => {
                let result = self
                    .lookup_file(*file)
                    .and_then(|f| f.mount.serialized(|ops| ops.stat(&f.node)));
                VfsReply::Stat(result)
            }
            RequestVerb::StatPath { path } => {
                let result = scope
                    .resolve(path)
                    .and_then(|(mount, sub)| mount.serialized(|ops| ops.stat_path(&sub)));
                VfsReply::Stat(result)
            }
            RequestVerb::StatFsHandle { file } => {
                let result = self
                    .lookup_file(*file)
                    .and_then(|f| f.mount.serialized(|ops| ops.stat_fs()));
                VfsReply::StatFs(result)
            }
            RequestVerb::StatFsPath { path } => {
                let result = scope
                    .resolve(path)
                    .and_then(|(mount, _)| mount.serialized(|ops| ops.stat_fs()));
                VfsReply::StatFs(result)
            }
            RequestVerb::StatStorageHandle { file } => {
                let result = self.lookup_file(*file).map(|f| f.mount.storage());
                VfsReply::Storage(result)
            }
            RequestVerb::StatStoragePath { path } => {
                let result = scope.resolve(path).map(|(mount, _)| mount.storage());
                VfsReply::Storage(result)
            }
            RequestVerb::RealPath { path } => VfsReply::Path(scope.realpath(path)),
            RequestVerb::Duplicate { file } => {
                let result = self.lookup_file(*file).map(|f| {
                    let copy = File::new(
                        f.mount.clone(),
                        f.node.clone(),
                        f.path.clone(),
                        f.access(),
                        f.options,
                    );
                    copy.position
                        .store(f.position.load(Ordering::Acquire), Ordering::Release);
                    self.registry.create(HandleTag::File, copy)
                });
                VfsReply::Handle(result)
            }
            RequestVerb::GetAccess { file } => {
                VfsReply::Access(self.lookup_file(*file).map(|f| f.access()))
            }
            RequestVerb::SetAccess { file, access } => {
                let result = self.lookup_file(*file).map(|f| {
                    f.access.store(access.bits(), Ordering::Release);
                });
                VfsReply::Status(result)
            }
            RequestVerb::GetSize { file } => {
                VfsReply::Length(self.lookup_file(*file).map(|f| f.node.size()))
            }
            RequestVerb::SetSize { file, size } => {
                let result = self
                    .lookup_file(*file)
                    .and_then(|f| f.mount.serialized(|ops| ops.truncate(&f.node, *size)));
                VfsReply::Status(result)
            }
            RequestVerb::GetPosition { file } => {
                VfsReply::Length(self.lookup_file(*file).map(|f| f.position()))
            }
            RequestVerb::GetPath { file } => {
                VfsReply::Path(self.lookup_file(*file).map(|f| f.path.clone()))
            }
        };

        request.reply(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::RamFs;
    use crate::request::{OneshotReply, RequestVerb};
    use muon_core::id::{DomainId, ProcessId};
    use muon_mm::address_space::{AddressSpace, CreateFlags};
    use muon_mm::paging::MapFlags;
    use muon_mm::testing::TestEnv;
    use muon_sched::config::SchedulerConfig;
    use muon_sched::testing::TestPlatform;

    struct Harness {
        service: Arc<VfsService>,
        registry: Arc<HandleRegistry>,
        env: &'static TestEnv,
        kernel: Arc<AddressSpace>,
        caller: AddressSpace,
    }

    fn harness() -> Harness {
        let sched = Arc::new(Scheduler::new(
            TestPlatform::leak(),
            SchedulerConfig::default(),
            &[DomainId::BOOT],
        ));
        let registry = Arc::new(HandleRegistry::new());
        let service = VfsService::new(sched, registry.clone());

        let env = TestEnv::leak();
        let kernel = AddressSpace::new_kernel(env).unwrap();
        let caller = AddressSpace::new(env, CreateFlags::empty(), &kernel, None).unwrap();

        // A ramdisk-like mount with a known file, visible to process 1.
        let fs = RamFs::new("ram");
        fs.add_file("data", b"the quick brown fox jumps over it").unwrap();
        let scope = FilesystemScope::new(ProcessId::new(1), VerbSet::all());
        scope.attach(Mount::new("/mnt/ram", fs));
        service.scopes().insert(scope);

        Harness {
            service,
            registry,
            env,
            kernel,
            caller,
        }
    }

    /// Submits a request for process 1 and pumps the task queue.
    fn roundtrip(harness: &Harness, verb: RequestVerb) -> VfsReply {
        roundtrip_as(harness, ProcessId::new(1), verb)
    }

    fn roundtrip_as(harness: &Harness, process: ProcessId, verb: RequestVerb) -> VfsReply {
        let sink = OneshotReply::new();
        harness
            .service
            .submit(VfsRequest::new(process, verb, sink.clone()));
        assert_eq!(harness.service.tasks().drain(), 1);
        sink.try_take().expect("handler must reply")
    }

    fn make_region(harness: &Harness, len: u64) -> (Arc<MemoryRegion>, Handle) {
        let (region, _kview, _uview) = MemoryRegion::create(
            harness.env,
            &harness.kernel,
            &harness.caller,
            len,
            len,
            MapFlags::WRITABLE,
        )
        .unwrap();
        let handle = harness
            .registry
            .create(HandleTag::MemoryRegion, region.clone());
        (region, handle)
    }

    fn open(harness: &Harness, path: &str) -> Handle {
        match roundtrip(
            harness,
            RequestVerb::Open {
                path: String::from(path),
                options: OpenOptions::empty(),
                access: Access::READ | Access::WRITE,
            },
        ) {
            VfsReply::Handle(Ok(handle)) => handle,
            other => panic!("open failed: {other:?}"),
        }
    }

    #[test]
    fn open_read_seek_reread_close() {
        // Scenario S6: open, read 16 bytes, seek 0, re-read the same
        // bytes, close, then further reads report DoesNotExist.
        let harness = harness();
        let file = open(&harness, "/mnt/ram/data");
        let (region, buffer) = make_region(&harness, 4096);

        let read = |hb: Handle| {
            roundtrip(
                &harness,
                RequestVerb::Read {
                    file,
                    buffer: hb,
                    buffer_offset: 0,
                    length: 16,
                },
            )
        };

        assert!(matches!(read(buffer), VfsReply::Transfer(Ok(16))));
        let mut first = [0u8; 16];
        region.read(0, &mut first).unwrap();
        assert_eq!(&first, b"the quick brown ");

        assert!(matches!(
            roundtrip(&harness, RequestVerb::Seek { file, position: 0 }),
            VfsReply::Status(Ok(()))
        ));
        assert!(matches!(read(buffer), VfsReply::Transfer(Ok(16))));
        let mut second = [0u8; 16];
        region.read(0, &mut second).unwrap();
        assert_eq!(first, second);

        assert!(matches!(
            roundtrip(&harness, RequestVerb::Close { file }),
            VfsReply::Status(Ok(()))
        ));
        assert!(matches!(
            read(buffer),
            VfsReply::Transfer(Err(FsError::DoesNotExist))
        ));
    }

    #[test]
    fn sequential_reads_advance_position() {
        let harness = harness();
        let file = open(&harness, "/mnt/ram/data");
        let (region, buffer) = make_region(&harness, 4096);

        for expected in [b"the ".as_slice(), b"quic".as_slice()] {
            let reply = roundtrip(
                &harness,
                RequestVerb::Read {
                    file,
                    buffer,
                    buffer_offset: 0,
                    length: 4,
                },
            );
            assert!(matches!(reply, VfsReply::Transfer(Ok(4))));
            let mut buf = [0u8; 4];
            region.read(0, &mut buf).unwrap();
            assert_eq!(&buf, expected);
        }
    }

    #[test]
    fn write_through_region() {
        let harness = harness();
        let file = open(&harness, "/mnt/ram/data");
        let (region, buffer) = make_region(&harness, 4096);
        region.write(0, b"LAZY DOG").unwrap();

        let reply = roundtrip(
            &harness,
            RequestVerb::Write {
                file,
                buffer,
                buffer_offset: 0,
                length: 8,
            },
        );
        assert!(matches!(reply, VfsReply::Transfer(Ok(8))));

        // Re-read from the start: the file now begins with our bytes.
        assert!(matches!(
            roundtrip(&harness, RequestVerb::Seek { file, position: 0 }),
            VfsReply::Status(Ok(()))
        ));
        let reply = roundtrip(
            &harness,
            RequestVerb::Read {
                file,
                buffer,
                buffer_offset: 0,
                length: 8,
            },
        );
        assert!(matches!(reply, VfsReply::Transfer(Ok(8))));
        let mut buf = [0u8; 8];
        region.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"LAZY DOG");
    }

    #[test]
    fn unauthenticated_process_is_refused() {
        let harness = harness();
        let reply = roundtrip_as(
            &harness,
            ProcessId::new(99),
            RequestVerb::Open {
                path: String::from("/mnt/ram/data"),
                options: OpenOptions::empty(),
                access: Access::READ,
            },
        );
        assert!(matches!(
            reply,
            VfsReply::Handle(Err(FsError::NoPermissions))
        ));
    }

    #[test]
    fn scope_permission_bitset_gates_verbs() {
        let harness = harness();
        // Process 2 may open and read but not modify.
        let scope = FilesystemScope::new(
            ProcessId::new(2),
            VerbSet::OPEN | VerbSet::READ | VerbSet::STAT,
        );
        let fs = RamFs::new("ro");
        fs.add_file("f", b"x").unwrap();
        scope.attach(Mount::new("/ro", fs));
        harness.service.scopes().insert(scope);

        let reply = roundtrip_as(
            &harness,
            ProcessId::new(2),
            RequestVerb::Unlink {
                path: String::from("/ro/f"),
            },
        );
        assert!(matches!(reply, VfsReply::Status(Err(FsError::NoPermissions))));

        let reply = roundtrip_as(
            &harness,
            ProcessId::new(2),
            RequestVerb::StatPath {
                path: String::from("/ro/f"),
            },
        );
        assert!(matches!(reply, VfsReply::Stat(Ok(_))));
    }

    #[test]
    fn cancelled_request_never_replies() {
        let harness = harness();
        let sink = OneshotReply::new();
        let request = harness.service.submit(VfsRequest::new(
            ProcessId::new(1),
            RequestVerb::RealPath {
                path: String::from("/mnt/ram/data"),
            },
            sink.clone(),
        ));
        request.cancel();
        harness.service.tasks().drain();
        assert_eq!(request.state(), RequestState::Done);
        assert!(sink.try_take().is_none());
    }

    #[test]
    fn namespace_verbs_roundtrip() {
        let harness = harness();

        assert!(matches!(
            roundtrip(
                &harness,
                RequestVerb::MakeDirectory {
                    path: String::from("/mnt/ram/docs"),
                    permissions: 0o755,
                }
            ),
            VfsReply::Handle(Ok(_))
        ));
        assert!(matches!(
            roundtrip(
                &harness,
                RequestVerb::Move {
                    from: String::from("/mnt/ram/data"),
                    to: String::from("/mnt/ram/docs/data"),
                }
            ),
            VfsReply::Status(Ok(()))
        ));
        assert!(matches!(
            roundtrip(
                &harness,
                RequestVerb::Link {
                    from: String::from("/mnt/ram/docs/data"),
                    to: String::from("/mnt/ram/alias"),
                }
            ),
            VfsReply::Status(Ok(()))
        ));
        assert!(matches!(
            roundtrip(
                &harness,
                RequestVerb::StatPath {
                    path: String::from("/mnt/ram/alias"),
                }
            ),
            VfsReply::Stat(Ok(_))
        ));
        assert!(matches!(
            roundtrip(
                &harness,
                RequestVerb::Unlink {
                    path: String::from("/mnt/ram/alias"),
                }
            ),
            VfsReply::Status(Ok(()))
        ));
        // The original is gone from its old path.
        let reply = roundtrip(
            &harness,
            RequestVerb::StatPath {
                path: String::from("/mnt/ram/data"),
            },
        );
        assert!(matches!(reply, VfsReply::Stat(Err(FsError::PathNotFound))));
    }

    #[test]
    fn handle_metadata_verbs() {
        let harness = harness();
        let file = open(&harness, "/mnt/ram/data");

        assert!(matches!(
            roundtrip(&harness, RequestVerb::GetSize { file }),
            VfsReply::Length(Ok(33))
        ));
        assert!(matches!(
            roundtrip(&harness, RequestVerb::GetPosition { file }),
            VfsReply::Length(Ok(0))
        ));
        match roundtrip(&harness, RequestVerb::GetPath { file }) {
            VfsReply::Path(Ok(path)) => assert_eq!(path, "/mnt/ram/data"),
            other => panic!("unexpected: {other:?}"),
        }
        match roundtrip(&harness, RequestVerb::GetAccess { file }) {
            VfsReply::Access(Ok(access)) => {
                assert!(access.contains(Access::READ | Access::WRITE));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            roundtrip(
                &harness,
                RequestVerb::SetAccess {
                    file,
                    access: Access::READ,
                }
            ),
            VfsReply::Status(Ok(()))
        ));
        // Write access was dropped: writes now fail.
        let (_region, buffer) = make_region(&harness, 4096);
        let reply = roundtrip(
            &harness,
            RequestVerb::Write {
                file,
                buffer,
                buffer_offset: 0,
                length: 4,
            },
        );
        assert!(matches!(reply, VfsReply::Transfer(Err(FsError::AccessDenied))));
    }

    #[test]
    fn duplicate_creates_independent_handle() {
        let harness = harness();
        let file = open(&harness, "/mnt/ram/data");
        let copy = match roundtrip(&harness, RequestVerb::Duplicate { file }) {
            VfsReply::Handle(Ok(handle)) => handle,
            other => panic!("duplicate failed: {other:?}"),
        };
        assert_ne!(file, copy);

        // Seeking the copy leaves the original untouched.
        assert!(matches!(
            roundtrip(&harness, RequestVerb::Seek { file: copy, position: 8 }),
            VfsReply::Status(Ok(()))
        ));
        assert!(matches!(
            roundtrip(&harness, RequestVerb::GetPosition { file }),
            VfsReply::Length(Ok(0))
        ));
        assert!(matches!(
            roundtrip(&harness, RequestVerb::GetPosition { file: copy }),
            VfsReply::Length(Ok(8))
        ));
    }

    #[test]
    fn statfs_and_storage() {
        let harness = harness();
        match roundtrip(
            &harness,
            RequestVerb::StatFsPath {
                path: String::from("/mnt/ram/data"),
            },
        ) {
            VfsReply::StatFs(Ok(stat)) => assert_eq!(stat.label, "ram"),
            other => panic!("unexpected: {other:?}"),
        }
        match roundtrip(
            &harness,
            RequestVerb::StatStoragePath {
                path: String::from("/mnt/ram/data"),
            },
        ) {
            VfsReply::Storage(Ok(storage)) => assert_eq!(storage.driver, "ramfs"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn read_directory_through_pipeline() {
        let harness = harness();
        let dir = match roundtrip(
            &harness,
            RequestVerb::Open {
                path: String::from("/mnt/ram"),
                options: OpenOptions::DIRECTORY,
                access: Access::READ,
            },
        ) {
            VfsReply::Handle(Ok(handle)) => handle,
            other => panic!("open dir failed: {other:?}"),
        };
        match roundtrip(&harness, RequestVerb::ReadDirectory { file: dir, index: 0 }) {
            VfsReply::Dir(Ok(Some(entry))) => assert_eq!(entry.stat.name, "data"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            roundtrip(&harness, RequestVerb::ReadDirectory { file: dir, index: 9 }),
            VfsReply::Dir(Ok(None))
        ));
    }

    #[test]
    fn requests_processed_in_submission_order() {
        // FIFO per mount: two writes then a read, drained together,
        // observe both writes.
        let harness = harness();
        let file = open(&harness, "/mnt/ram/data");
        let (region, buffer) = make_region(&harness, 4096);
        region.write(0, b"AB").unwrap();

        let sinks: Vec<_> = (0..2)
            .map(|i| {
                let sink = OneshotReply::new();
                harness.service.submit(VfsRequest::new(
                    ProcessId::new(1),
                    RequestVerb::Write {
                        file,
                        buffer,
                        buffer_offset: i,
                        length: 1,
                    },
                    sink.clone(),
                ));
                sink
            })
            .collect();
        assert_eq!(harness.service.tasks().drain(), 2);
        for sink in sinks {
            assert!(matches!(sink.try_take(), Some(VfsReply::Transfer(Ok(1)))));
        }

        assert!(matches!(
            roundtrip(&harness, RequestVerb::Seek { file, position: 0 }),
            VfsReply::Status(Ok(()))
        ));
        let reply = roundtrip(
            &harness,
            RequestVerb::Read {
                file,
                buffer,
                buffer_offset: 0,
                length: 2,
            },
        );
        assert!(matches!(reply, VfsReply::Transfer(Ok(2))));
        let mut buf = [0u8; 2];
        region.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"AB");
    }
}
