//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000.L, extended with 9P2000.W

use {
    crate::{
        error::{self, errno::*},
        fcall::*,
        sched::FairnessSemaphore,
        serialize,
        tracker::TrackerTable,
        utils::Result,
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{error, info},
    std::{collections::HashMap, sync::Arc},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        sync::{Mutex, RwLock},
    },
    tokio_stream::StreamExt,
    tokio_util::{codec::length_delimited::LengthDelimitedCodec, sync::CancellationToken},
};

/// Smallest `msize` a client may negotiate. Below this there is no room for
/// even the smallest request header.
pub const MSIZE_MIN: u32 = 4 * 1024;

/// Largest `msize` the server will agree to, regardless of what the client
/// asks for.
pub const MSIZE_MAX: u32 = 256 * 1024;

/// Per-connection bound on requests running concurrently, enforced by
/// [`crate::sched::FairnessSemaphore`].
pub const FAIRNESS_LIMIT: usize = 32;

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

#[async_trait]
/// Filesystem server trait for implementing 9P2000.L/9P2000.W servers.
///
/// Implementors can represent an error condition by returning an `Err`.
/// Otherwise, they must return the appropriate `FCall` response with required fields.
///
/// # Error Handling
/// All methods should return `Err(error::Error::No(errno))` to send an error to the client.
/// Common errno values include:
/// - `ENOENT` - File not found
/// - `EACCES` - Permission denied
/// - `EISDIR` - Is a directory (when file expected)
/// - `ENOTDIR` - Not a directory (when directory expected)
///
/// # Example
/// ```no_run
/// use std::path::PathBuf;
///
/// use ninep_proto::{error, srv::{Filesystem, FId}, fcall::FCall};
/// use async_trait::async_trait;
///
/// struct MyFs;
/// type Result<T> = ::std::result::Result<T, error::Error>;
///
/// #[async_trait]
/// impl Filesystem for MyFs {
///     type FId = PathBuf;
///
///     async fn rattach(&self,
///                      fid: &FId<Self::FId>,
///                      afid: Option<&FId<Self::FId>>,
///                      uname: &str,
///                      aname: &str,
///                      n_uname: u32,
/// ) -> Result<FCall> {
///         todo!("implementation")
///     }
/// }
/// ```
/// The main trait for implementing a 9P filesystem server.
///
/// This trait provides methods corresponding to 9P protocol operations. Most methods
/// have default implementations that return `EOPNOTSUPP`, allowing you to implement
/// only the operations your filesystem needs to support.
///
/// # Minimum Implementation
///
/// For a basic read-only filesystem, you typically need to implement:
/// - [`rattach`](Self::rattach) - Attach to the filesystem root
/// - [`rwalk`](Self::rwalk) - Navigate the directory tree
/// - [`rlopen`](Self::rlopen) - Open files
/// - [`rread`](Self::rread) - Read file contents
/// - [`rgetattr`](Self::rgetattr) - Get file attributes
/// - [`rreaddir`](Self::rreaddir) - Read directory entries
/// - [`rclunk`](Self::rclunk) - Close files
///
/// For a writable filesystem, additionally implement:
/// - [`rwrite`](Self::rwrite) - Write to files
/// - [`rlcreate`](Self::rlcreate) - Create files
/// - [`rmkdir`](Self::rmkdir) - Create directories
/// - [`rsetattr`](Self::rsetattr) - Modify file attributes
///
/// A server that advertises 9P2000.W additionally implements
/// [`raccess`](Self::raccess), [`rwreaddir`](Self::rwreaddir), and
/// [`rwopen`](Self::rwopen); the default implementations of all three return
/// `EOPNOTSUPP`, which is a valid answer for a 9P2000.L-only server since the
/// client negotiated `9P2000.L` and has no standing to send them.
///
/// # FId Management
///
/// The `FId` type represents a file identifier that tracks open files. Each fid
/// can store custom state via the associated `FId` type. Fids are created during
/// `rattach` and `rwalk`, and must be cleaned up in `rclunk`.
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    ///
    /// This type stores per-fid state such as the current path, open file handle,
    /// or any other metadata needed to service requests on this fid.
    type FId: Send + Sync + Default;

    // 9P2000.L

    /// Get filesystem statistics (9P2000.L).
    ///
    /// Returns information about the filesystem such as block size, total blocks,
    /// free blocks, available blocks, total files, and free files.
    ///
    /// # Arguments
    /// * `fid` - The file identifier for the filesystem root or any file
    ///
    /// # Returns
    /// `FCall::RStatFs` with filesystem statistics, or an error.
    async fn rstatfs(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Open a file (9P2000.L).
    ///
    /// Opens the file represented by the fid with the specified flags. This is one
    /// of the core operations that must be implemented for a functional filesystem.
    ///
    /// # Arguments
    /// * `fid` - The file identifier to open
    /// * `flags` - Open flags (O_RDONLY, O_WRONLY, O_RDWR, etc.)
    ///
    /// # Returns
    /// `FCall::RLOpen` containing a qid and iounit, or an error.
    async fn rlopen(&self, _: &FId<Self::FId>, _flags: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a new file (9P2000.L).
    ///
    /// Creates a new file with the given name in the directory represented by the fid.
    /// After creation, the fid represents the newly created file.
    ///
    /// # Arguments
    /// * `fid` - The directory fid where the file should be created
    /// * `name` - The name of the file to create
    /// * `flags` - Open flags for the new file
    /// * `mode` - File permissions mode
    /// * `gid` - Group ID for the new file
    ///
    /// # Returns
    /// `FCall::RLCreate` containing a qid and iounit, or an error.
    async fn rlcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _flags: u32,
        _mode: u32,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a symbolic link (9P2000.L).
    ///
    /// Creates a symbolic link with the specified name in the directory represented
    /// by the fid, pointing to the target path.
    ///
    /// # Arguments
    /// * `fid` - The directory fid where the symlink should be created
    /// * `name` - The name of the symlink to create
    /// * `sym` - The target path the symlink points to
    /// * `gid` - Group ID for the new symlink
    ///
    /// # Returns
    /// `FCall::RSymlink` containing the qid of the new symlink, or an error.
    async fn rsymlink(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _sym: &str,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a special file (9P2000.L).
    ///
    /// Creates a special file (device node, named pipe, etc.) with the specified name
    /// in the directory represented by the fid.
    ///
    /// # Arguments
    /// * `fid` - The directory fid where the special file should be created
    /// * `name` - The name of the special file to create
    /// * `mode` - File type and permissions (S_IFBLK, S_IFCHR, S_IFIFO, etc.)
    /// * `major` - Major device number (for device nodes)
    /// * `minor` - Minor device number (for device nodes)
    /// * `gid` - Group ID for the new file
    ///
    /// # Returns
    /// `FCall::RMknod` containing the qid of the new file, or an error.
    async fn rmknod(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _mode: u32,
        _major: u32,
        _minor: u32,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Rename a file (9P2000.L).
    ///
    /// Renames the file represented by the first fid to the specified name within
    /// the directory represented by the second fid.
    ///
    /// # Arguments
    /// * `fid` - The file fid to rename
    /// * `dfid` - The destination directory fid
    /// * `name` - The new name for the file
    ///
    /// # Returns
    /// `FCall::RRename` on success, or an error.
    async fn rrename(&self, _: &FId<Self::FId>, _: &FId<Self::FId>, _name: &str) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read a symbolic link target (9P2000.L).
    ///
    /// Returns the target path that the symbolic link points to.
    ///
    /// # Arguments
    /// * `fid` - The symlink fid to read
    ///
    /// # Returns
    /// `FCall::RReadlink` containing the target path, or an error.
    async fn rreadlink(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Get file attributes (9P2000.L).
    ///
    /// Returns metadata about the file such as mode, size, timestamps, owner, etc.
    /// This is a core operation that must be implemented for most filesystems.
    ///
    /// # Arguments
    /// * `fid` - The file fid to get attributes for
    /// * `req_mask` - Mask indicating which attributes are requested
    ///
    /// # Returns
    /// `FCall::RGetAttr` containing file attributes, or an error.
    async fn rgetattr(&self, _: &FId<Self::FId>, _req_mask: GetAttrMask) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Set file attributes (9P2000.L).
    ///
    /// Modifies metadata about the file such as permissions, timestamps, size, owner, etc.
    /// The `valid` mask indicates which fields in `stat` should be updated.
    ///
    /// # Arguments
    /// * `fid` - The file fid to modify attributes for
    /// * `valid` - Mask indicating which attributes to set
    /// * `stat` - The new attribute values
    ///
    /// # Returns
    /// `FCall::RSetAttr` on success, or an error.
    async fn rsetattr(
        &self,
        _: &FId<Self::FId>,
        _valid: SetAttrMask,
        _stat: &SetAttr,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Walk to an extended attribute (9P2000.L).
    ///
    /// Opens an extended attribute for reading or listing. The new fid will
    /// represent the extended attribute.
    ///
    /// # Arguments
    /// * `fid` - The file fid to access extended attributes on
    /// * `newfid` - The new fid that will represent the extended attribute
    /// * `name` - The name of the extended attribute (empty to list all)
    ///
    /// # Returns
    /// `FCall::RXAttrWalk` containing the size of the attribute, or an error.
    async fn rxattrwalk(
        &self,
        _: &FId<Self::FId>,
        _: &FId<Self::FId>,
        _name: &str,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create or replace an extended attribute (9P2000.L).
    ///
    /// Creates a new extended attribute or replaces an existing one. After this
    /// operation, the fid is used to write the attribute value.
    ///
    /// # Arguments
    /// * `fid` - The file fid to set an extended attribute on
    /// * `name` - The name of the extended attribute
    /// * `attr_size` - The size of the attribute value
    /// * `flags` - Creation flags (XATTR_CREATE or XATTR_REPLACE)
    ///
    /// # Returns
    /// `FCall::RXAttrCreate` on success, or an error.
    async fn rxattrcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _attr_size: u64,
        _flags: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read directory entries (9P2000.L).
    ///
    /// Returns a list of directory entries starting at the given offset. This is a
    /// core operation that must be implemented for directory traversal.
    ///
    /// # Arguments
    /// * `fid` - The directory fid to read entries from
    /// * `offset` - The offset to start reading from (0 for beginning)
    /// * `count` - Maximum number of bytes to return
    ///
    /// # Returns
    /// `FCall::RReadDir` containing directory entries, or an error.
    async fn rreaddir(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Flush file data to stable storage (9P2000.L).
    ///
    /// Ensures that all modified data for the file is written to persistent storage.
    ///
    /// # Arguments
    /// * `fid` - The file fid to sync
    ///
    /// # Returns
    /// `FCall::RFsync` on success, or an error.
    async fn rfsync(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Acquire or release a file lock (9P2000.L).
    ///
    /// Cross-client locking is out of scope; servers that don't track locks across
    /// fids can leave this at its default, which reports success without recording
    /// anything.
    ///
    /// # Arguments
    /// * `fid` - The file fid to lock
    /// * `lock` - Lock parameters (type, flags, start, length, etc.)
    ///
    /// # Returns
    /// `FCall::RLock` containing lock status, or an error.
    async fn rlock(&self, _: &FId<Self::FId>, _lock: &Flock) -> Result<FCall> {
        Ok(FCall::RLock {
            status: LockStatus::SUCCESS,
        })
    }

    /// Test for the existence of a file lock (9P2000.L).
    ///
    /// Stubbed the same way as [`rlock`](Self::rlock): always reports no
    /// conflicting lock.
    ///
    /// # Arguments
    /// * `fid` - The file fid to check locks on
    /// * `lock` - Lock parameters to test
    ///
    /// # Returns
    /// `FCall::RGetLock` containing lock information, or an error.
    async fn rgetlock(&self, _: &FId<Self::FId>, lock: &Getlock) -> Result<FCall> {
        Ok(FCall::RGetLock {
            flock: Getlock {
                typ: LockType::UNLOCK,
                ..lock.clone()
            },
        })
    }

    /// Create a hard link (9P2000.L).
    ///
    /// Creates a hard link to the file represented by the first fid, with the
    /// specified name in the directory represented by the second fid.
    ///
    /// # Arguments
    /// * `dfid` - The directory fid where the link should be created
    /// * `fid` - The file fid to create a link to
    /// * `name` - The name of the new link
    ///
    /// # Returns
    /// `FCall::RLink` on success, or an error.
    async fn rlink(&self, _: &FId<Self::FId>, _: &FId<Self::FId>, _name: &str) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a directory (9P2000.L).
    ///
    /// Creates a new directory with the specified name in the directory represented
    /// by the fid.
    ///
    /// # Arguments
    /// * `fid` - The parent directory fid where the directory should be created
    /// * `name` - The name of the directory to create
    /// * `mode` - Directory permissions mode
    /// * `gid` - Group ID for the new directory
    ///
    /// # Returns
    /// `FCall::RMkdir` containing the qid of the new directory, or an error.
    async fn rmkdir(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _mode: u32,
        _gid: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Rename a file between directories (9P2000.L).
    ///
    /// Renames a file from one directory to another, potentially with a different name.
    ///
    /// # Arguments
    /// * `olddirfid` - The old parent directory fid
    /// * `oldname` - The current name of the file
    /// * `newdirfid` - The new parent directory fid
    /// * `newname` - The new name for the file
    ///
    /// # Returns
    /// `FCall::RRenameAt` on success, or an error.
    async fn rrenameat(
        &self,
        _: &FId<Self::FId>,
        _oldname: &str,
        _: &FId<Self::FId>,
        _newname: &str,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Remove a file or directory (9P2000.L).
    ///
    /// Removes the file or directory with the specified name from the directory
    /// represented by the fid.
    ///
    /// # Arguments
    /// * `dirfid` - The parent directory fid
    /// * `name` - The name of the file or directory to remove
    /// * `flags` - Flags such as AT_REMOVEDIR for directories
    ///
    /// # Returns
    /// `FCall::RUnlinkAt` on success, or an error.
    async fn runlinkat(&self, _: &FId<Self::FId>, _name: &str, _flags: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /*
     * 9P2000.W
     */

    /// Check access permissions (9P2000.W).
    ///
    /// Answers the question `wopen` and POSIX `access()` both ask: can this
    /// user perform this operation on this file, independent of actually
    /// opening it. Implementations that care about sticky-bit delete
    /// semantics must special-case `AccessMask::DELETE` against the parent
    /// directory rather than the target itself.
    ///
    /// # Arguments
    /// * `fid` - The file fid to check
    /// * `flags` - The access modes being tested
    ///
    /// # Returns
    /// `FCall::RAccess` if every requested mode is permitted, or an error.
    async fn raccess(&self, _: &FId<Self::FId>, _flags: AccessMask) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read directory entries with attributes embedded (9P2000.W).
    ///
    /// Like [`rreaddir`](Self::rreaddir), but each entry carries its own
    /// `Stat`, sparing the client a `getattr` round trip per name.
    ///
    /// # Arguments
    /// * `fid` - The directory fid to read entries from
    /// * `offset` - The offset to start reading from (0 for beginning)
    /// * `count` - Maximum number of bytes to return
    ///
    /// # Returns
    /// `FCall::RWReadDir` containing directory entries and their attributes, or an error.
    async fn rwreaddir(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Fused walk, open/create, and readlink (9P2000.W).
    ///
    /// Walks from `fid` through `wnames`, binding the result to `newfid`, then
    /// in the same request either opens the destination, creates it if
    /// `wflags` and `mode` call for it, or reads it as a symlink — collapsing
    /// what would otherwise be a `walk` + `lopen`/`lcreate`/`readlink` + `getattr`
    /// sequence into one round trip. See `FCall::RWOpen::status` for the
    /// possible outcomes.
    ///
    /// # Arguments
    /// * `fid` - The starting fid to walk from
    /// * `new` - The new fid that will represent the destination
    /// * `wnames` - Path components to walk
    /// * `flags` - Open flags, same encoding as `TLOpen`
    /// * `wflags` - 9P2000.W specific flags (delete-access check, reject directories, open symlink itself)
    /// * `mode` - Permissions to use if the walk ends in a create
    /// * `gid` - Group ID to use if the walk ends in a create
    /// * `attr_mask` - Attributes the client wants echoed back in the response
    ///
    /// # Returns
    /// `FCall::RWOpen` describing the outcome, or an error.
    #[allow(clippy::too_many_arguments)]
    async fn rwopen(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
        _flags: u32,
        _wflags: WOpenFlags,
        _mode: u32,
        _gid: u32,
        _attr_mask: GetAttrMask,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /*
     * 9P2000.u subset
     */

    /// Authenticate a user (9P2000.u).
    ///
    /// Initiates authentication for a user. The fid will be used for authentication
    /// data exchange. Most filesystems return EOPNOTSUPP if they don't require
    /// authentication.
    ///
    /// # Arguments
    /// * `afid` - The authentication fid to use
    /// * `uname` - The user name
    /// * `aname` - The file tree to access
    /// * `n_uname` - Numeric user ID
    ///
    /// # Returns
    /// `FCall::RAuth` containing an authentication qid, or an error.
    async fn rauth(
        &self,
        _: &FId<Self::FId>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Attach to the filesystem root (9P2000.u).
    ///
    /// This is the first operation performed by a client to connect to the filesystem.
    /// It associates the fid with the root of the filesystem (or a subtree specified
    /// by `aname`). This is a core operation that must be implemented.
    ///
    /// # Arguments
    /// * `fid` - The fid to associate with the filesystem root
    /// * `afid` - Optional authentication fid (if authentication was performed)
    /// * `uname` - The user name
    /// * `aname` - The file tree to access (often "/" or empty)
    /// * `n_uname` - Numeric user ID
    ///
    /// # Returns
    /// `FCall::RAttach` containing the root qid, or an error.
    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /*
     * 9P2000 subset
     */

    /// Abort a pending operation (9P2000).
    ///
    /// The protocol engine already drives the cancellation and response-ordering
    /// side of `flush` itself (see [`crate::tracker`]); this hook exists for
    /// filesystems that want to observe the event, e.g. to cancel an
    /// in-progress blocking syscall. The default implementation does nothing.
    ///
    /// # Arguments
    /// * `old` - The original request to cancel (if still pending)
    ///
    /// # Returns
    /// `FCall::RFlush` on success, or an error.
    async fn rflush(&self, _old: Option<&FCall>) -> Result<FCall> {
        Ok(FCall::RFlush)
    }

    /// Walk the directory tree (9P2000).
    ///
    /// Traverses the directory tree from the given fid by following a sequence of
    /// path components. Creates a new fid representing the final destination.
    /// This is a core operation that must be implemented for navigation.
    ///
    /// # Arguments
    /// * `fid` - The starting fid to walk from
    /// * `newfid` - The new fid that will represent the destination
    /// * `wnames` - Array of path component names to traverse
    ///
    /// # Returns
    /// `FCall::RWalk` containing qids for each traversed component, or an error.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read data from a file (9P2000).
    ///
    /// Reads data from the file represented by the fid at the specified offset.
    /// This is a core operation that must be implemented for reading files.
    ///
    /// # Arguments
    /// * `fid` - The file fid to read from
    /// * `offset` - The byte offset to start reading from
    /// * `count` - Maximum number of bytes to read
    ///
    /// # Returns
    /// `FCall::RRead` containing the read data, or an error.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Write data to a file (9P2000).
    ///
    /// Writes data to the file represented by the fid at the specified offset.
    /// Required for writable filesystems.
    ///
    /// # Arguments
    /// * `fid` - The file fid to write to
    /// * `offset` - The byte offset to start writing at
    /// * `data` - The data to write
    ///
    /// # Returns
    /// `FCall::RWrite` containing the number of bytes written, or an error.
    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Close a fid and release resources (9P2000).
    ///
    /// Informs the server that the fid is no longer needed. The server should release
    /// any resources associated with the fid. This is a core operation that must be
    /// implemented for proper resource cleanup.
    ///
    /// # Arguments
    /// * `fid` - The fid to close
    ///
    /// # Returns
    /// `FCall::RClunk` on success, or an error.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Remove a file and clunk the fid (9P2000).
    ///
    /// Removes the file represented by the fid from the filesystem, then clunks the fid.
    /// This is an older operation; prefer `runlinkat` for new implementations.
    ///
    /// # Arguments
    /// * `fid` - The file fid to remove
    ///
    /// # Returns
    /// `FCall::RRemove` on success, or an error.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }
}

/// Per-connection negotiated parameters, fixed by the first successful `Tversion`.
#[derive(Clone, Debug)]
struct Negotiated {
    msize: u32,
    version: String,
}

/// Connection-wide state that `dispatch_once` has no business touching:
/// version negotiation. Held outside the fid table because it's set once by
/// `Tversion`, which is handled inline rather than dispatched like other
/// requests.
#[derive(Default)]
struct ConnState {
    negotiated: Mutex<Option<Negotiated>>,
}

impl ConnState {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validate and, on the first call, fix the connection's `msize`/version.
    /// A later `Tversion` with different parameters is rejected; one with
    /// identical parameters is treated as a no-op renegotiation.
    async fn negotiate(&self, msize: u32, version: &str) -> Result<(u32, String)> {
        if msize < MSIZE_MIN {
            return Err(error::Error::No(ENOTSUP));
        }
        let msize = msize.min(MSIZE_MAX);
        let accepted_version = match version {
            P92000L | P92000W => version.to_owned(),
            _ => VERSION_UNKNOWN.to_owned(),
        };

        let mut slot = self.negotiated.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.msize != msize || existing.version != accepted_version {
                return Err(error::Error::No(EINVAL));
            }
            return Ok((msize, accepted_version));
        }
        *slot = Some(Negotiated {
            msize,
            version: accepted_version.clone(),
        });
        Ok((msize, accepted_version))
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs, FsFId>(
    msg: &Msg,
    fs: Arc<Fs>,
    fsfids: Arc<RwLock<HashMap<u32, FId<FsFId>>>>,
) -> Result<FCall>
where
    Fs: Filesystem<FId = FsFId> + Send + Sync,
    FsFId: Send + Sync + Default,
{
    let newfid = msg.body.newfid().map(|f| FId {
        fid: f,
        aux: Default::default(),
    });

    use crate::FCall::*;
    let response = {
        let fids = fsfids.read().await;
        let get_fid = |fid: &u32| fids.get(fid).ok_or(error::Error::No(EBADF));
        let get_newfid = || newfid.as_ref().ok_or(error::Error::No(EPROTO));

        let fut = match msg.body {
            TStatFs { fid }                                                     => fs.rstatfs(get_fid(&fid)?),
            TlOpen { fid, ref flags }                                           => fs.rlopen(get_fid(&fid)?, *flags),
            TlCreate { fid, ref name, ref flags, ref mode, ref gid }            => fs.rlcreate(get_fid(&fid)?, name, *flags, *mode, *gid),
            TSymlink { fid, ref name, ref symtgt, ref gid }                     => fs.rsymlink(get_fid(&fid)?, name, symtgt, *gid),
            TMkNod { dfid, ref name, ref mode, ref major, ref minor, ref gid }  => fs.rmknod(get_fid(&dfid)?, name, *mode, *major, *minor, *gid),
            TRename { fid, dfid, ref name }                                     => fs.rrename(get_fid(&fid)?, get_fid(&dfid)?, name),
            TReadLink { fid }                                                   => fs.rreadlink(get_fid(&fid)?),
            TGetAttr { fid, ref req_mask }                                      => fs.rgetattr(get_fid(&fid)?, *req_mask),
            TSetAttr { fid, ref valid, ref stat }                               => fs.rsetattr(get_fid(&fid)?, *valid, stat),
            TxAttrWalk { fid, newfid: _, ref name }                             => fs.rxattrwalk(get_fid(&fid)?, get_newfid()?, name),
            TxAttrCreate { fid, ref name, ref attr_size, ref flags }            => fs.rxattrcreate(get_fid(&fid)?, name, *attr_size, *flags),
            TReadDir { fid, ref offset, ref count }                             => fs.rreaddir(get_fid(&fid)?, *offset, *count),
            TFSync { fid }                                                      => fs.rfsync(get_fid(&fid)?),
            TLock { fid, ref flock }                                            => fs.rlock(get_fid(&fid)?, flock),
            TGetLock { fid, ref flock }                                         => fs.rgetlock(get_fid(&fid)?, flock),
            TLink { dfid, fid, ref name }                                       => fs.rlink(get_fid(&dfid)?, get_fid(&fid)?, name),
            TMkDir { dfid, ref name, ref mode, ref gid }                        => fs.rmkdir(get_fid(&dfid)?, name, *mode, *gid),
            TRenameAt { olddirfid, ref oldname, newdirfid, ref newname }        => fs.rrenameat(get_fid(&olddirfid)?, oldname, get_fid(&newdirfid)?, newname),
            TUnlinkAt { dirfd, ref name, ref flags }                            => fs.runlinkat(get_fid(&dirfd)?, name, *flags) ,
            TAccess { fid, ref flags }                                          => fs.raccess(get_fid(&fid)?, *flags),
            TWReadDir { fid, ref offset, ref count }                            => fs.rwreaddir(get_fid(&fid)?, *offset, *count),
            TWOpen { fid, newfid: _, ref wnames, ref flags, ref wflags, ref mode, ref gid, ref attr_mask }
                                                                                 => fs.rwopen(get_fid(&fid)?, get_newfid()?, wnames, *flags, *wflags, *mode, *gid, *attr_mask),
            TAuth { afid: _, ref uname, ref aname, ref n_uname }                => fs.rauth(get_newfid()?, uname, aname, *n_uname),
            TAttach { fid: _, afid: _, ref uname, ref aname, ref n_uname }      => fs.rattach(get_newfid()?, None, uname, aname, *n_uname),
            TWalk { fid, newfid: _, ref wnames }                                => fs.rwalk(get_fid(&fid)?, get_newfid()?, wnames),
            TRead { fid, ref offset, ref count }                                => fs.rread(get_fid(&fid)?, *offset, *count),
            TWrite { fid, ref offset, ref data }                                => fs.rwrite(get_fid(&fid)?, *offset, data),
            TClunk { fid }                                                      => fs.rclunk(get_fid(&fid)?),
            TRemove { fid }                                                     => fs.rremove(get_fid(&fid)?),
            _                                                                   => return Err(error::Error::No(EOPNOTSUPP)),
        };

        fut.await?
    };

    /* Drop the fid which TClunk or TRemove contains */
    if let TClunk { fid } | TRemove { fid } = msg.body {
        let mut fids = fsfids.write().await;
        fids.remove(&fid);
    }

    if let Some(newfid) = newfid {
        let mut fids = fsfids.write().await;
        fids.insert(newfid.fid, newfid);
    }

    Ok(response)
}

type FramedWrite<Writer> = Arc<
    Mutex<tokio_util::codec::FramedWrite<Writer, LengthDelimitedCodec>>,
>;

async fn send_response<Writer>(framedwrite: &FramedWrite<Writer>, tag: u16, body: FCall)
where
    Writer: AsyncWrite + Send + std::marker::Unpin,
{
    if !MsgType::from(&body).is_r() {
        return;
    }

    let response = Msg { tag, body };
    let mut writer = bytes::BytesMut::with_capacity(4096).writer();
    if let Err(e) = serialize::write_msg(&mut writer, &response) {
        error!("Failed to serialize response for tag {}: {:?}", tag, e);
        return;
    }

    let frozen = writer.into_inner().freeze();
    let mut framedwrite = framedwrite.lock().await;
    if let Err(e) = framedwrite.send(frozen).await {
        error!("Failed to send response for tag {}: {:?}", tag, e);
        return;
    }
    info!("\t→ {:?}", response);
}

/// Drive one connection to completion: read framed requests, dispatch each
/// as its own fairness-limited task, and answer `Tflush` by cooperating with
/// the task that owns the flushed tag via [`crate::tracker::TrackerTable`].
///
/// `conn_token` is a child of the acceptor's token; its cancellation ends the
/// read loop and drains every in-flight request before returning.
pub async fn dispatch<Fs, Reader, Writer>(
    filesystem: Fs,
    reader: Reader,
    writer: Writer,
    conn_token: CancellationToken,
) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let fsfids = Arc::new(RwLock::new(HashMap::new()));
    let filesystem = Arc::new(filesystem);
    let conn_state = ConnState::new();
    let trackers = TrackerTable::new();
    let fairness = Arc::new(FairnessSemaphore::new(FAIRNESS_LIMIT));

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite: FramedWrite<Writer> = Arc::new(Mutex::new(framedwrite));

    loop {
        let bytes = tokio::select! {
            _ = conn_token.cancelled() => break,
            next = framedread.next() => match next {
                Some(bytes) => bytes?,
                None => break,
            },
        };

        let msg = serialize::read_msg(&mut bytes.reader())?;
        info!("\t← {:?}", msg);

        match msg.body {
            FCall::TVersion { msize, ref version } => {
                let body = match conn_state.negotiate(msize, version).await {
                    Ok((msize, version)) => FCall::RVersion { msize, version },
                    Err(e) => FCall::RlError {
                        ecode: e.errno() as u32,
                    },
                };
                send_response(&framedwrite, msg.tag, body).await;
            }
            FCall::TFlush { oldtag } => {
                let trackers = trackers.clone();
                let fs = filesystem.clone();
                let framedwrite = framedwrite.clone();
                let tag = msg.tag;
                tokio::spawn(async move {
                    if let Some(tracker) = trackers.take(oldtag).await {
                        tracker.cancel();
                        tracker.wait().await;
                    }
                    let _ = fs.rflush(None).await;
                    send_response(&framedwrite, tag, FCall::RFlush).await;
                });
            }
            _ => {
                let permit = fairness.acquire().await;
                let tracker = trackers.register(msg.tag).await;
                let fids = fsfids.clone();
                let fs = filesystem.clone();
                let framedwrite = framedwrite.clone();
                let trackers = trackers.clone();
                let msg = Msg {
                    tag: msg.tag,
                    body: msg.body,
                };

                tokio::spawn(async move {
                    let _permit = permit;
                    let response_fcall = dispatch_once(&msg, fs, fids).await.unwrap_or_else(|e| {
                        error!("{:?}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
                        FCall::RlError {
                            ecode: e.errno() as u32,
                        }
                    });

                    send_response(&framedwrite, msg.tag, response_fcall).await;
                    tracker.complete();
                    trackers.forget(msg.tag).await;
                });
            }
        }
    }

    fairness.drain(FAIRNESS_LIMIT as u32).await;
    Ok(())
}
