//! File-service request objects.
//!
//! The IPC layer turns each incoming message into a [`VfsRequest`]: a
//! fresh monotonic id, heap copies of the verb parameters, the caller's
//! process id, and a deferred reply sink that captures the message so the
//! reply can be sent later from any thread. Requests are dispatched onto
//! the cooperative task queue and destroyed after the reply (or silently,
//! when cancelled).

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use muon_core::handle::Handle;
use muon_core::id::ProcessId;
use muon_core::sync::{Condvar, Mutex};

use crate::{Access, DirEntry, FileStat, FsError, FsStat, OpenOptions, StorageDescriptor};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Built by the IPC layer, not yet picked up.
    Created = 0,
    /// A worker is executing the handler.
    InProgress = 1,
    /// The reply has been sent (or skipped for a cancelled request).
    Done = 2,
}

/// A verb with its parameters (heap copies; nothing borrows the message).
#[derive(Debug, Clone)]
pub enum RequestVerb {
    /// Open or create a file.
    Open {
        /// Caller path.
        path: String,
        /// Open options.
        options: OpenOptions,
        /// Requested access.
        access: Access,
    },
    /// Close an open file.
    Close {
        /// File handle.
        file: Handle,
    },
    /// Read into a shared memory region.
    Read {
        /// File handle.
        file: Handle,
        /// Target region handle.
        buffer: Handle,
        /// Byte offset inside the region.
        buffer_offset: u64,
        /// Bytes to transfer.
        length: u64,
    },
    /// Write from a shared memory region.
    Write {
        /// File handle.
        file: Handle,
        /// Source region handle.
        buffer: Handle,
        /// Byte offset inside the region.
        buffer_offset: u64,
        /// Bytes to transfer.
        length: u64,
    },
    /// Set the file position.
    Seek {
        /// File handle.
        file: Handle,
        /// Absolute position.
        position: u64,
    },
    /// Flush dirty state.
    Flush {
        /// File handle.
        file: Handle,
    },
    /// Rename a node.
    Move {
        /// Source caller path.
        from: String,
        /// Destination caller path.
        to: String,
    },
    /// Hard-link a node.
    Link {
        /// Existing node's caller path.
        from: String,
        /// New link's caller path.
        to: String,
    },
    /// Remove a node.
    Unlink {
        /// Caller path.
        path: String,
    },
    /// Create a directory.
    MakeDirectory {
        /// Caller path.
        path: String,
        /// Driver permission bits.
        permissions: u32,
    },
    /// List one directory entry.
    ReadDirectory {
        /// Open directory handle.
        file: Handle,
        /// Entry index.
        index: u32,
    },
    /// Stat an open handle.
    StatHandle {
        /// File handle.
        file: Handle,
    },
    /// Stat a path.
    StatPath {
        /// Caller path.
        path: String,
    },
    /// Filesystem statistics by handle.
    StatFsHandle {
        /// File handle.
        file: Handle,
    },
    /// Filesystem statistics by path.
    StatFsPath {
        /// Caller path.
        path: String,
    },
    /// Storage description by handle.
    StatStorageHandle {
        /// File handle.
        file: Handle,
    },
    /// Storage description by path.
    StatStoragePath {
        /// Caller path.
        path: String,
    },
    /// Canonicalize a path.
    RealPath {
        /// Caller path.
        path: String,
    },
    /// Duplicate an open handle.
    Duplicate {
        /// File handle.
        file: Handle,
    },
    /// Read the access rights of a handle.
    GetAccess {
        /// File handle.
        file: Handle,
    },
    /// Change the access rights of a handle.
    SetAccess {
        /// File handle.
        file: Handle,
        /// New access set.
        access: Access,
    },
    /// Read a file's size.
    GetSize {
        /// File handle.
        file: Handle,
    },
    /// Truncate or extend a file.
    SetSize {
        /// File handle.
        file: Handle,
        /// New size.
        size: u64,
    },
    /// Read the current position.
    GetPosition {
        /// File handle.
        file: Handle,
    },
    /// Read the full path a handle was opened with.
    GetPath {
        /// File handle.
        file: Handle,
    },
}

/// The reply payload delivered through the deferred sink.
#[derive(Debug, Clone)]
pub enum VfsReply {
    /// Plain completion status.
    Status(Result<(), FsError>),
    /// A new handle (open, duplicate, mkdir).
    Handle(Result<Handle, FsError>),
    /// A transfer count (read, write).
    Transfer(Result<usize, FsError>),
    /// A 64-bit quantity (size, position).
    Length(Result<u64, FsError>),
    /// Node metadata.
    Stat(Result<FileStat, FsError>),
    /// Filesystem statistics.
    StatFs(Result<FsStat, FsError>),
    /// Storage description.
    Storage(Result<StorageDescriptor, FsError>),
    /// A path string.
    Path(Result<String, FsError>),
    /// One directory entry (`None` past the end).
    Dir(Result<Option<DirEntry>, FsError>),
    /// An access set.
    Access(Result<Access, FsError>),
}

/// The deferred reply capability captured from the incoming message.
pub trait ReplySink: Send + Sync {
    /// Delivers the reply to the caller.
    fn complete(&self, reply: VfsReply);
}

/// A [`ReplySink`] the submitter can block on: the caller-side wait on
/// asynchronous completion.
pub struct OneshotReply {
    slot: Mutex<Option<VfsReply>>,
    ready: Condvar,
}

impl OneshotReply {
    /// Creates an empty reply slot.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    /// Blocks until the reply arrives.
    pub fn wait(&self) -> VfsReply {
        let mut slot = self.slot.lock();
        loop {
            if let Some(reply) = slot.take() {
                return reply;
            }
            slot = self.ready.wait(slot);
        }
    }

    /// Non-blocking poll.
    pub fn try_take(&self) -> Option<VfsReply> {
        self.slot.lock().take()
    }
}

impl ReplySink for OneshotReply {
    fn complete(&self, reply: VfsReply) {
        *self.slot.lock() = Some(reply);
        self.ready.notify_all();
    }
}

/// One in-flight file-service request.
pub struct VfsRequest {
    id: u64,
    process: ProcessId,
    state: AtomicU8,
    cancelled: AtomicBool,
    /// The verb and its parameters.
    pub verb: RequestVerb,
    reply: Arc<dyn ReplySink>,
}

impl VfsRequest {
    /// Builds a request for `process` with a fresh id.
    pub fn new(process: ProcessId, verb: RequestVerb, reply: Arc<dyn ReplySink>) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            process,
            state: AtomicU8::new(RequestState::Created as u8),
            cancelled: AtomicBool::new(false),
            verb,
            reply,
        }
    }

    /// The request id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The calling process.
    #[must_use]
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        match self.state.load(Ordering::Acquire) {
            1 => RequestState::InProgress,
            2 => RequestState::Done,
            _ => RequestState::Created,
        }
    }

    /// Advances the lifecycle state.
    pub fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Marks the request cancelled (caller disconnected). Handlers check
    /// this at suspension points and skip the reply.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the request was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sends the reply unless the request was cancelled, and marks the
    /// request done either way.
    pub fn reply(&self, reply: VfsReply) {
        if !self.is_cancelled() {
            self.reply.complete(reply);
        }
        self.set_state(RequestState::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let sink = OneshotReply::new();
        let a = VfsRequest::new(
            ProcessId::new(1),
            RequestVerb::Flush {
                file: Handle::from_raw(0),
            },
            sink.clone(),
        );
        let b = VfsRequest::new(
            ProcessId::new(1),
            RequestVerb::Flush {
                file: Handle::from_raw(0),
            },
            sink,
        );
        assert!(b.id() > a.id());
    }

    #[test]
    fn reply_reaches_oneshot() {
        let sink = OneshotReply::new();
        let request = VfsRequest::new(
            ProcessId::new(1),
            RequestVerb::RealPath {
                path: String::from("/x"),
            },
            sink.clone(),
        );
        request.reply(VfsReply::Status(Ok(())));
        assert_eq!(request.state(), RequestState::Done);
        assert!(matches!(sink.try_take(), Some(VfsReply::Status(Ok(())))));
    }

    #[test]
    fn cancelled_request_skips_reply() {
        let sink = OneshotReply::new();
        let request = VfsRequest::new(
            ProcessId::new(1),
            RequestVerb::RealPath {
                path: String::from("/x"),
            },
            sink.clone(),
        );
        request.cancel();
        request.reply(VfsReply::Status(Ok(())));
        assert_eq!(request.state(), RequestState::Done);
        assert!(sink.try_take().is_none());
    }

    #[test]
    fn oneshot_wait_blocks_until_complete() {
        let sink = OneshotReply::new();
        let waiter = {
            let sink = sink.clone();
            std::thread::spawn(move || sink.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        sink.complete(VfsReply::Length(Ok(42)));
        assert!(matches!(waiter.join().unwrap(), VfsReply::Length(Ok(42))));
    }
}
