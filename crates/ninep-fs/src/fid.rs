//! The polymorphic fid: the state a client's fid number is actually bound
//! to, and the operation vocabulary every variant answers.
//!
//! A fid starts out [`FidKind::Unrooted`] (freshly allocated by the
//! dispatcher, not yet walked anywhere) and becomes a [`FidKind::File`] on
//! `attach`/`walk`, or is replaced wholesale by `xattrwalk`/`xattrcreate`
//! with an xattr variant. Unsupported operations on a variant default to
//! `EINVAL`, matching the rest of the 9P2000.L/.W vocabulary.

use {
    crate::{identity::with_identity, root::Root, utils::*, xattr as xattr_ops},
    ninep_proto::{
        error::{self, errno::*},
        *,
    },
    nix::{fcntl, sys::stat::Mode},
    std::{os::unix::fs::MetadataExt, path::PathBuf, sync::Arc},
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

// Some clients set bits in the 9p open-flags word that don't make sense on
// this side (e.g. the Linux 9p client propagates O_DIRECT, which then makes
// our non-aligned tokio reads/writes fail). Mask down to the flags we
// actually honor.
const UNIX_FLAGS: u32 = (nix::libc::O_WRONLY
    | nix::libc::O_RDONLY
    | nix::libc::O_RDWR
    | nix::libc::O_CREAT
    | nix::libc::O_TRUNC
    | nix::libc::O_EXCL
    | nix::libc::O_DIRECTORY) as u32;

const O_ACCMODE: u32 = 0x3;

/// A path-rooted file or directory fid.
pub struct FileState {
    pub root: Arc<Root>,
    pub realpath: PathBuf,
    pub dev: u64,
    pub depth: usize,
    pub file: Arc<Mutex<Option<fs::File>>>,
}

impl FileState {
    pub fn rooted(root: Arc<Root>, realpath: PathBuf, dev: u64) -> FileState {
        FileState {
            root,
            realpath,
            dev,
            depth: 0,
            file: Arc::new(Mutex::new(None)),
        }
    }

    fn sibling(&self) -> FileState {
        FileState {
            root: self.root.clone(),
            realpath: self.realpath.clone(),
            dev: self.dev,
            depth: self.depth,
            file: Arc::new(Mutex::new(None)),
        }
    }

    async fn metadata(&self) -> Result<std::fs::Metadata> {
        let path = self.realpath.clone();
        let root = self.root.clone();
        with_identity(root, move || {
            std::fs::symlink_metadata(&path).map_err(error::Error::from)
        })
        .await
    }
}

/// A read-only xattr fid produced by `xattrwalk`.
pub struct XAttrReadState {
    pub realpath: PathBuf,
    pub name: String,
}

/// A write-mode xattr fid produced by `xattrcreate`; the value is buffered
/// and only committed to the filesystem at `clunk`.
pub struct XAttrWriteState {
    pub realpath: PathBuf,
    pub name: String,
    pub flags: u32,
    pub buf: Vec<u8>,
}

pub enum FidKind {
    Unrooted,
    File(FileState),
    XAttrRead(XAttrReadState),
    XAttrWrite(XAttrWriteState),
}

impl Default for FidKind {
    fn default() -> FidKind {
        FidKind::Unrooted
    }
}

/// `Filesystem::FId` for `ninep-fs`. One lock per fid guards both the
/// variant tag and the state within it, so a walk/open transition and a
/// concurrent read of the same fid can never observe a half-updated path.
#[derive(Default)]
pub struct NinepFsFid(pub RwLock<FidKind>);

/// Crosses into a filesystem mounted over the root's export is treated as a
/// mount-boundary crossing and rejected outright: identifying the *name* of
/// a foreign filesystem type (`drvfs`/`9p`/`virtiofs`) requires walking
/// `/proc/self/mountinfo`, which is host/platform plumbing this crate
/// doesn't own. Any change in device id during a walk is the conservative
/// stand-in.
fn crosses_mount_boundary(parent_dev: u64, child_dev: u64) -> bool {
    parent_dev != child_dev
}

impl FileState {
    /// Walks a single path component from `self`, returning the resulting
    /// sibling `FileState` and its qid. Used by both `walk` and `wopen`.
    pub async fn walk_one(&self, name: &str, max_depth: usize) -> Result<(FileState, QId)> {
        if name.contains('/') || name.contains('\0') {
            return Err(error::Error::No(EINVAL));
        }

        let mut next = self.sibling();
        if name == ".." {
            next.depth = next.depth.saturating_sub(1);
        } else if name != "." {
            next.depth += 1;
            if next.depth > max_depth {
                return Err(error::Error::No(ELOOP));
            }
        }
        next.realpath.push(name);

        let attr = next.metadata().await?;
        let dev = attr.dev();
        if crosses_mount_boundary(self.dev, dev) {
            return Err(error::Error::No(EACCES));
        }
        next.dev = dev;

        Ok((next, qid_from_attr(&attr)))
    }

    pub async fn rwalk(&self, wnames: &[String], max_depth: usize) -> Result<(Vec<QId>, FileState)> {
        let mut wqids = Vec::with_capacity(wnames.len());
        let mut current = self.sibling();

        for (i, name) in wnames.iter().enumerate() {
            match current.walk_one(name, max_depth).await {
                Ok((next, qid)) => {
                    wqids.push(qid);
                    current = next;
                }
                Err(e) => {
                    if i == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        Ok((wqids, current))
    }

    pub async fn getattr(&self, req_mask: GetAttrMask) -> Result<FCall> {
        let attr = self.metadata().await?;
        Ok(FCall::RGetAttr {
            valid: req_mask,
            qid: qid_from_attr(&attr),
            stat: Stat::from(&attr),
        })
    }

    pub async fn setattr(&self, valid: SetAttrMask, stat: &SetAttr) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }

        let path = self.realpath.clone();
        let root = self.root.clone();
        let stat = *stat;
        with_identity(root, move || {
            if valid.contains(SetAttrMask::MODE) {
                std::fs::set_permissions(&path, std::os::unix::fs::PermissionsExt::from_mode(stat.mode))?;
            }
            if valid.intersects(SetAttrMask::UID | SetAttrMask::GID) {
                let uid = valid
                    .contains(SetAttrMask::UID)
                    .then(|| nix::unistd::Uid::from_raw(stat.uid));
                let gid = valid
                    .contains(SetAttrMask::GID)
                    .then(|| nix::unistd::Gid::from_raw(stat.gid));
                nix::unistd::chown(&path, uid, gid)?;
            }
            if valid.contains(SetAttrMask::SIZE) {
                let file = std::fs::OpenOptions::new().write(true).open(&path)?;
                file.set_len(stat.size)?;
            }
            if valid.intersects(SetAttrMask::ATIME_SET | SetAttrMask::MTIME_SET) {
                let attr = std::fs::symlink_metadata(&path)?;
                let atime = if valid.contains(SetAttrMask::ATIME_SET) {
                    filetime::FileTime::from_unix_time(stat.atime.sec as i64, stat.atime.nsec as u32)
                } else {
                    filetime::FileTime::from_last_access_time(&attr)
                };
                let mtime = if valid.contains(SetAttrMask::MTIME_SET) {
                    filetime::FileTime::from_unix_time(stat.mtime.sec as i64, stat.mtime.nsec as u32)
                } else {
                    filetime::FileTime::from_last_modification_time(&attr)
                };
                filetime::set_file_times(&path, atime, mtime).map_err(error::Error::Io)?;
            }
            Ok(())
        })
        .await?;

        Ok(FCall::RSetAttr)
    }

    pub async fn readlink(&self) -> Result<FCall> {
        let target = fs::read_link(&self.realpath).await?;
        Ok(FCall::RReadLink {
            target: target.to_string_lossy().into_owned(),
        })
    }

    async fn entries_from(&self, off: u64) -> Result<(u64, ReadDirStream)> {
        let offset = if off == 0 { 0 } else { off - 1 };
        let entries = ReadDirStream::new(fs::read_dir(&self.realpath).await?).skip(offset as usize);
        Ok((offset, entries))
    }

    pub async fn readdir(&self, off: u64, count: u32) -> Result<FCall> {
        let mut dirents = DirEntryData::new();
        if off == 0 {
            dirents.push(get_dirent_from(&self.realpath, ".", 0).await?);
            dirents.push(get_dirent_from(&self.realpath.join(".."), "..", 1).await?);
        }

        let (offset, mut entries) = self.entries_from(off).await?;
        let mut i = offset;
        while let Some(entry) = entries.next().await {
            let dirent = get_dirent(&entry?, 2 + i).await?;
            if dirents.size() + dirent.size() > count {
                break;
            }
            dirents.push(dirent);
            i += 1;
        }

        Ok(FCall::RReadDir { data: dirents })
    }

    pub async fn wreaddir(&self, off: u64, count: u32) -> Result<FCall> {
        let mut dirents = WDirEntryData::new();
        let (offset, mut entries) = self.entries_from(off).await?;
        let mut i = offset;
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let dirent = match get_wdirent(&entry, 2 + i).await {
                Ok(d) => d,
                // A stat failure still yields an entry; the client needs the
                // name to keep enumerating. `dtype` isn't available from
                // `DirEntry` portably, so this always reports a regular file.
                Err(_) => WDirEntry {
                    qid: QId {
                        typ: QIdType::FILE,
                        version: 0,
                        path: 0,
                    },
                    offset: 2 + i,
                    typ: 0,
                    name: entry.file_name().to_string_lossy().into_owned(),
                    stat: Stat {
                        mode: (nix::libc::DT_REG as u32) << 12,
                        uid: 0,
                        gid: 0,
                        nlink: 1,
                        rdev: 0,
                        size: 0,
                        blksize: 0,
                        blocks: 0,
                        atime: Time { sec: 0, nsec: 0 },
                        mtime: Time { sec: 0, nsec: 0 },
                        ctime: Time { sec: 0, nsec: 0 },
                    },
                },
            };
            if dirents.size() + dirent.size() > count {
                break;
            }
            dirents.push(dirent);
            i += 1;
        }

        Ok(FCall::RWReadDir { data: dirents })
    }

    pub async fn open(&self, flags: u32) -> Result<FCall> {
        {
            let file = self.file.lock().await;
            if file.is_some() {
                return Err(error::Error::No(EBADF));
            }
        }

        let attr = self.metadata().await?;
        let qid = qid_from_attr(&attr);
        if !qid.typ.contains(QIdType::DIR) {
            let fd = self.open_raw(flags, 0).await?;
            let mut file = self.file.lock().await;
            *file = Some(fd);
        }

        Ok(FCall::RlOpen { qid, iounit: 0 })
    }

    async fn open_raw(&self, flags: u32, mode: u32) -> Result<fs::File> {
        let path = self.realpath.clone();
        let root = self.root.clone();
        let std_file = with_identity(root, move || {
            let oflags = fcntl::OFlag::from_bits_truncate((flags & UNIX_FLAGS) as i32);
            let omode = Mode::from_bits_truncate(mode);
            let fd = fcntl::open(&path, oflags, omode)?;
            Ok(std::fs::File::from(fd))
        })
        .await?;
        Ok(fs::File::from_std(std_file))
    }

    pub async fn create(&mut self, name: &str, flags: u32, mode: u32, gid: u32) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        {
            let file = self.file.lock().await;
            if file.is_some() {
                return Err(error::Error::No(EBADF));
            }
        }
        if name.contains('/') || name.contains('\0') {
            return Err(error::Error::No(EINVAL));
        }

        let path = self.realpath.join(name);
        let create_flags = flags | nix::libc::O_CREAT as u32;
        let tmp = FileState {
            root: self.root.clone(),
            realpath: path.clone(),
            dev: self.dev,
            depth: self.depth,
            file: self.file.clone(),
        };
        let fd = tmp.open_raw(create_flags, mode).await?;
        Self::chown_gid(self.root.clone(), path.clone(), gid).await?;

        let attr = tmp.metadata().await?;
        let qid = qid_from_attr(&attr);
        self.realpath = path;
        self.dev = attr.dev();
        {
            let mut file = self.file.lock().await;
            *file = Some(fd);
        }

        Ok(FCall::RlCreate { qid, iounit: 0 })
    }

    /// Applies the client-requested group to a just-created filesystem
    /// object, best-effort: only the owning identity (or root) can usually
    /// hand a file to an arbitrary group, so `EPERM` here is swallowed
    /// rather than failing the whole create/mkdir/symlink/mknod — the object
    /// still exists under whatever default group the host assigned it.
    async fn chown_gid(root: Arc<Root>, path: PathBuf, gid: u32) -> Result<()> {
        let res = with_identity(root, move || {
            nix::unistd::chown(&path, None, Some(nix::unistd::Gid::from_raw(gid)))
                .map_err(error::Error::from)
        })
        .await;
        Self::ignore_eperm(res)
    }

    /// Like [`Self::chown_gid`], but operates on the symlink itself rather
    /// than whatever it points at (which may not exist yet).
    async fn lchown_gid(root: Arc<Root>, path: PathBuf, gid: u32) -> Result<()> {
        let res = with_identity(root, move || {
            nix::unistd::fchownat(
                None,
                &path,
                None,
                Some(nix::unistd::Gid::from_raw(gid)),
                nix::unistd::FchownatFlags::NoFollowSymlink,
            )
            .map_err(error::Error::from)
        })
        .await;
        Self::ignore_eperm(res)
    }

    fn ignore_eperm(res: Result<()>) -> Result<()> {
        match res {
            Err(error::Error::No(EPERM)) => Ok(()),
            other => other,
        }
    }

    pub async fn read(&self, offset: u64, count: u32) -> Result<FCall> {
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or(error::Error::No(EBADF))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0; count as usize];
        let bytes = file.read(&mut buf[..]).await?;
        buf.truncate(bytes);
        Ok(FCall::RRead { data: Data(buf) })
    }

    pub async fn write(&self, offset: u64, data: &Data) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or(error::Error::No(EBADF))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let count = file.write(&data.0).await? as u32;
        Ok(FCall::RWrite { count })
    }

    pub async fn fsync(&self) -> Result<FCall> {
        let mut file = self.file.lock().await;
        file.as_mut()
            .ok_or(error::Error::No(EBADF))?
            .sync_all()
            .await?;
        Ok(FCall::RFSync)
    }

    pub async fn statfs(&self) -> Result<FCall> {
        let path = self.realpath.clone();
        let statfs = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&path))
            .await
            .map_err(|e| error::Error::Io(std::io::Error::other(e)))??;
        Ok(FCall::RStatFs {
            statfs: From::from(statfs),
        })
    }

    pub async fn access(&self, flags: AccessMask) -> Result<FCall> {
        if flags.contains(AccessMask::DELETE) {
            self.check_delete_access().await?;
        }

        let mode = {
            let mut m = nix::unistd::AccessFlags::empty();
            if flags.contains(AccessMask::READ) {
                m |= nix::unistd::AccessFlags::R_OK;
            }
            if flags.contains(AccessMask::WRITE) {
                m |= nix::unistd::AccessFlags::W_OK;
            }
            if flags.contains(AccessMask::EXECUTE) {
                m |= nix::unistd::AccessFlags::X_OK;
            }
            if m.is_empty() {
                m = nix::unistd::AccessFlags::F_OK;
            }
            m
        };

        let path = self.realpath.clone();
        let root = self.root.clone();
        with_identity(root, move || {
            nix::unistd::access(&path, mode).map_err(error::Error::from)
        })
        .await?;

        Ok(FCall::RAccess)
    }

    async fn check_delete_access(&self) -> Result<()> {
        let parent = self
            .realpath
            .parent()
            .ok_or(error::Error::No(EACCES))?
            .to_path_buf();
        let parent_attr = fs::symlink_metadata(&parent).await?;
        let child_attr = self.metadata().await?;

        let in_parent_group =
            self.root.gid == parent_attr.gid() || self.root.groups.contains(&parent_attr.gid());
        let writable = parent_attr.mode() & 0o2 != 0
            || (self.root.uid == parent_attr.uid() && parent_attr.mode() & 0o200 != 0)
            || (in_parent_group && parent_attr.mode() & 0o020 != 0);
        if !writable {
            return Err(error::Error::No(EACCES));
        }
        if parent_attr.mode() & 0o1000 != 0
            && self.root.uid != child_attr.uid()
            && self.root.uid != parent_attr.uid()
            && self.root.uid != nix::unistd::getuid().as_raw()
        {
            return Err(error::Error::No(EACCES));
        }
        Ok(())
    }

    /// Creates `name` as a child of `self`, forcing `O_EXCL` on the
    /// underlying syscall regardless of what the caller asked for so a
    /// racing creator is always observable as `EEXIST` rather than silently
    /// overwritten.
    async fn create_child(&self, name: &str, flags: u32, mode: u32) -> Result<(FileState, bool)> {
        let path = self.realpath.join(name);
        let is_dir_create = flags & (nix::libc::O_DIRECTORY as u32) != 0;

        if is_dir_create {
            let root = self.root.clone();
            let p = path.clone();
            with_identity(root, move || {
                nix::unistd::mkdir(&p, Mode::from_bits_truncate(mode)).map_err(error::Error::from)
            })
            .await?;
            Ok((
                FileState {
                    root: self.root.clone(),
                    realpath: path,
                    dev: self.dev,
                    depth: self.depth,
                    file: Arc::new(Mutex::new(None)),
                },
                false,
            ))
        } else {
            let tmp = FileState {
                root: self.root.clone(),
                realpath: path,
                dev: self.dev,
                depth: self.depth,
                file: Arc::new(Mutex::new(None)),
            };
            let create_flags = flags | nix::libc::O_CREAT as u32 | nix::libc::O_EXCL as u32;
            let fd = tmp.open_raw(create_flags, mode).await?;
            *tmp.file.lock().await = Some(fd);
            Ok((tmp, true))
        }
    }

    pub fn sibling_path(&self, name: &str) -> PathBuf {
        self.realpath.join(name)
    }

    pub async fn mkdir(&self, name: &str, mode: u32, gid: u32) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let path = self.sibling_path(name);
        let root = self.root.clone();
        let p = path.clone();
        with_identity(root, move || {
            nix::unistd::mkdir(&p, Mode::from_bits_truncate(mode)).map_err(error::Error::from)
        })
        .await?;
        Self::chown_gid(self.root.clone(), path.clone(), gid).await?;

        let attr = fs::symlink_metadata(&path).await?;
        Ok(FCall::RMkDir {
            qid: qid_from_attr(&attr),
        })
    }

    pub async fn symlink(&self, name: &str, target: &str, gid: u32) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let path = self.sibling_path(name);
        let root = self.root.clone();
        let p = path.clone();
        let t = target.to_owned();
        with_identity(root, move || {
            std::os::unix::fs::symlink(&t, &p).map_err(error::Error::Io)
        })
        .await?;
        Self::lchown_gid(self.root.clone(), path.clone(), gid).await?;

        let attr = fs::symlink_metadata(&path).await?;
        Ok(FCall::RSymlink {
            qid: qid_from_attr(&attr),
        })
    }

    pub async fn mknod(&self, name: &str, mode: u32, major: u32, minor: u32, gid: u32) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let path = self.sibling_path(name);
        let root = self.root.clone();
        let p = path.clone();
        with_identity(root, move || {
            let dev = nix::sys::stat::makedev(major as u64, minor as u64);
            nix::sys::stat::mknod(
                &p,
                nix::sys::stat::SFlag::from_bits_truncate(mode),
                Mode::from_bits_truncate(mode),
                dev,
            )
            .map_err(error::Error::from)
        })
        .await?;
        Self::chown_gid(self.root.clone(), path.clone(), gid).await?;

        let attr = fs::symlink_metadata(&path).await?;
        Ok(FCall::RMkNod {
            qid: qid_from_attr(&attr),
        })
    }

    /// Hard-links `self` as `name` under the directory `dfid` represents.
    pub async fn link(&self, dfid: &FileState, name: &str) -> Result<FCall> {
        if dfid.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let (src, dst, root) = (self.realpath.clone(), dfid.sibling_path(name), dfid.root.clone());
        with_identity(root, move || {
            std::fs::hard_link(&src, &dst).map_err(error::Error::Io)
        })
        .await?;
        Ok(FCall::RLink)
    }

    /// Renames `self` to `name` under the directory `dfid` represents
    /// (9P2000.L `rename`).
    pub async fn rename(&self, dfid: &FileState, name: &str) -> Result<FCall> {
        if dfid.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let (src, dst, root) = (self.realpath.clone(), dfid.sibling_path(name), dfid.root.clone());
        with_identity(root, move || {
            std::fs::rename(&src, &dst).map_err(error::Error::Io)
        })
        .await?;
        Ok(FCall::RRename)
    }

    /// Renames `name` under `self` to `newname` under `newdir`
    /// (9P2000.L `renameat`).
    pub async fn renameat(&self, name: &str, newdir: &FileState, newname: &str) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        let (src, dst, root) = (self.sibling_path(name), newdir.sibling_path(newname), self.root.clone());
        with_identity(root, move || {
            std::fs::rename(&src, &dst).map_err(error::Error::Io)
        })
        .await?;
        Ok(FCall::RRenameAt)
    }

    /// Removes `name` under the directory `self` represents (9P2000.L
    /// `unlinkat`). `AT_REMOVEDIR` forces the directory branch even when the
    /// target's own type can't be determined up front.
    pub async fn unlinkat(&self, name: &str, flags: u32) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        const AT_REMOVEDIR: u32 = 0x200;
        let path = self.sibling_path(name);
        let attr = fs::symlink_metadata(&path).await?;
        let is_dir = attr.is_dir() || flags & AT_REMOVEDIR != 0;
        let root = self.root.clone();
        let p = path.clone();
        with_identity(root, move || {
            if is_dir {
                std::fs::remove_dir(&p)
            } else {
                std::fs::remove_file(&p)
            }
            .map_err(error::Error::Io)
        })
        .await?;
        Ok(FCall::RUnlinkAt)
    }

    /// Removes `self` outright and implicitly clunks the fid (the older
    /// 9P2000 `remove`, superseded by `unlinkat` but still served).
    pub async fn remove(&self) -> Result<FCall> {
        if self.root.read_only() {
            return Err(error::Error::No(EROFS));
        }
        if self.realpath == self.root.realroot() {
            return Err(error::Error::No(EPERM));
        }
        let attr = fs::symlink_metadata(&self.realpath).await?;
        let is_dir = attr.is_dir();
        let root = self.root.clone();
        let path = self.realpath.clone();
        with_identity(root, move || {
            if is_dir {
                std::fs::remove_dir(&path)
            } else {
                std::fs::remove_file(&path)
            }
            .map_err(error::Error::Io)
        })
        .await?;
        Ok(FCall::RRemove)
    }

    fn zero_wstat() -> WStat {
        WStat {
            stat: Stat {
                mode: 0,
                uid: 0,
                gid: 0,
                nlink: 0,
                rdev: 0,
                size: 0,
                blksize: 0,
                blocks: 0,
                atime: Time { sec: 0, nsec: 0 },
                mtime: Time { sec: 0, nsec: 0 },
                ctime: Time { sec: 0, nsec: 0 },
            },
            btime: Time { sec: 0, nsec: 0 },
            gen: 0,
            data_version: 0,
        }
    }

    fn partial_response(status: WOpenStatus, walked: u16) -> FCall {
        FCall::RWOpen {
            status,
            walked,
            qid: QId {
                typ: QIdType::empty(),
                version: 0,
                path: 0,
            },
            symlink_target: String::new(),
            iounit: 0,
            wstat: Self::zero_wstat(),
        }
    }

    /// The fused walk/open/create/readlink/getattr operation. Installs the
    /// resulting state into `target` regardless of outcome, so the client's
    /// newfid always reflects how far the walk got, matching `walk`'s own
    /// partial-failure behavior.
    #[allow(clippy::too_many_arguments)]
    pub async fn wopen(
        &self,
        target: &RwLock<FidKind>,
        wnames: &[String],
        flags: u32,
        wflags: WOpenFlags,
        mode: u32,
        gid: u32,
        max_depth: usize,
    ) -> Result<FCall> {
        if self.root.read_only() && (flags & nix::libc::O_CREAT as u32) != 0 {
            return Err(error::Error::No(EROFS));
        }

        let mut cur = self.sibling();
        let mut walked: u16 = 0;

        if wnames.len() > 1 {
            for name in &wnames[..wnames.len() - 1] {
                match cur.walk_one(name, max_depth).await {
                    Ok((next, _)) => {
                        cur = next;
                        walked += 1;
                    }
                    Err(error::Error::No(ENOENT)) => {
                        let resp = Self::partial_response(WOpenStatus::PARENT_NOT_FOUND, walked);
                        *target.write().await = FidKind::File(cur);
                        return Ok(resp);
                    }
                    Err(error::Error::No(ENOTDIR)) => {
                        let resp = Self::partial_response(WOpenStatus::STOPPED, walked);
                        *target.write().await = FidKind::File(cur);
                        return Ok(resp);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let want_create = flags & nix::libc::O_CREAT as u32 != 0;
        let want_excl = flags & nix::libc::O_EXCL as u32 != 0;
        let leaf_name = wnames.last();

        let (mut leaf, created) = 'attempt: {
            let Some(name) = leaf_name else {
                break 'attempt (cur.sibling(), false);
            };

            if want_create && want_excl {
                let (state, _) = cur.create_child(name, flags, mode).await?;
                break 'attempt (state, true);
            }

            let mut retries = 0;
            loop {
                match cur.walk_one(name, max_depth).await {
                    Ok((next, _)) => break 'attempt (next, false),
                    Err(error::Error::No(ENOENT)) if want_create => {
                        match cur.create_child(name, flags, mode).await {
                            Ok((state, _)) => break 'attempt (state, true),
                            Err(error::Error::No(EEXIST)) => {
                                retries += 1;
                                if retries >= 3 {
                                    return Err(error::Error::No(EIO));
                                }
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(error::Error::No(ENOENT)) => {
                        let resp = Self::partial_response(WOpenStatus::NOT_FOUND, walked);
                        *target.write().await = FidKind::File(cur);
                        return Ok(resp);
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        walked += 1;

        let attr = match leaf.metadata().await {
            Ok(a) => a,
            Err(e) => {
                *target.write().await = FidKind::File(cur);
                return Err(e);
            }
        };
        let qid = qid_from_attr(&attr);
        let is_dir = qid.typ.contains(QIdType::DIR);
        let is_symlink = qid.typ.contains(QIdType::SYMLINK);

        if wflags.contains(WOpenFlags::NON_DIRECTORY_FILE) && is_dir {
            *target.write().await = FidKind::File(leaf);
            return Err(error::Error::No(EISDIR));
        }
        if flags & nix::libc::O_DIRECTORY as u32 != 0 && !is_dir && !created {
            *target.write().await = FidKind::File(leaf);
            return Err(error::Error::No(ENOTDIR));
        }

        if wflags.contains(WOpenFlags::DELETE_ACCESS) {
            if let Err(e) = leaf.check_delete_access().await {
                *target.write().await = FidKind::File(leaf);
                return Err(e);
            }
        }

        let mut symlink_target = String::new();
        if is_symlink {
            if wflags.contains(WOpenFlags::OPEN_SYMLINK) {
                match fs::read_link(&leaf.realpath).await {
                    Ok(p) => symlink_target = p.to_string_lossy().into_owned(),
                    Err(e) => {
                        *target.write().await = FidKind::File(leaf);
                        return Err(e.into());
                    }
                }
            } else {
                let resp = Self::partial_response(WOpenStatus::STOPPED, walked);
                *target.write().await = FidKind::File(leaf);
                return Ok(resp);
            }
        } else if !created && !is_dir && flags != 0 {
            let amode = flags & O_ACCMODE;
            let effective = if amode == O_ACCMODE {
                flags & !O_ACCMODE
            } else {
                flags
            };
            match leaf.open_raw(effective, 0).await {
                Ok(fd) => *leaf.file.lock().await = Some(fd),
                Err(e) => {
                    *target.write().await = FidKind::File(leaf);
                    return Err(e);
                }
            }
        }

        let wstat = WStat {
            stat: Stat::from(&attr),
            btime: Stat::from(&attr).ctime,
            gen: 0,
            data_version: 0,
        };
        let status = if created {
            WOpenStatus::CREATED
        } else {
            WOpenStatus::OPENED
        };
        let response = FCall::RWOpen {
            status,
            walked,
            qid,
            symlink_target,
            iounit: 0,
            wstat,
        };
        let _ = gid;
        *target.write().await = FidKind::File(leaf);
        Ok(response)
    }
}

impl XAttrReadState {
    pub async fn read(&self, offset: u64, count: u32) -> Result<FCall> {
        if offset != 0 {
            return Ok(FCall::RRead { data: Data(Vec::new()) });
        }
        let mut value = xattr_ops::get(self.realpath.clone(), self.name.clone()).await?;
        value.truncate(count as usize);
        Ok(FCall::RRead { data: Data(value) })
    }
}

impl XAttrWriteState {
    pub fn write(&mut self, offset: u64, data: &Data) -> Result<FCall> {
        let offset = offset as usize;
        if offset > self.buf.len() {
            return Err(error::Error::No(EINVAL));
        }
        let end = (offset + data.0.len()).min(self.buf.len());
        let n = end - offset;
        self.buf[offset..end].copy_from_slice(&data.0[..n]);
        Ok(FCall::RWrite { count: n as u32 })
    }

    pub async fn commit(self) -> Result<()> {
        if self.buf.is_empty() {
            xattr_ops::remove(self.realpath, self.name).await
        } else {
            xattr_ops::set(self.realpath, self.name, self.buf, self.flags).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::Share;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_dir(label: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("ninep-fs-test-{label}-{}-{n}", std::process::id()))
    }

    async fn rooted_state(read_only: bool) -> (PathBuf, FileState) {
        let dir = unique_dir("root");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let root = Arc::new(Root {
            share: Arc::new(Share {
                name: "t".into(),
                root_path: dir.clone(),
                read_only,
            }),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            groups: Vec::new(),
        });
        let attr = tokio::fs::symlink_metadata(&dir).await.unwrap();
        let state = FileState::rooted(root, dir.clone(), attr.dev());
        (dir, state)
    }

    #[tokio::test]
    async fn walk_one_rejects_embedded_slash_and_nul() {
        let (_dir, state) = rooted_state(false).await;
        assert!(matches!(
            state.walk_one("a/b", 200).await.unwrap_err(),
            error::Error::No(EINVAL)
        ));
        assert!(matches!(
            state.walk_one("a\0b", 200).await.unwrap_err(),
            error::Error::No(EINVAL)
        ));
    }

    #[tokio::test]
    async fn walk_one_dotdot_does_not_underflow_depth() {
        let (_dir, state) = rooted_state(false).await;
        assert_eq!(state.depth, 0);
        let (parent, _qid) = state.walk_one("..", 200).await.unwrap();
        assert_eq!(parent.depth, 0);
    }

    #[tokio::test]
    async fn walk_one_enforces_max_depth() {
        let (_dir, state) = rooted_state(false).await;
        assert!(matches!(
            state.walk_one("child", 0).await.unwrap_err(),
            error::Error::No(ELOOP)
        ));
    }

    #[tokio::test]
    async fn rwalk_stops_at_first_missing_element_past_the_first() {
        let (dir, state) = rooted_state(false).await;
        tokio::fs::create_dir(dir.join("a")).await.unwrap();
        let (qids, result) = state
            .rwalk(&["a".into(), "missing".into(), "c".into()], 200)
            .await
            .unwrap();
        assert_eq!(qids.len(), 1);
        assert_eq!(result.realpath, dir.join("a"));
    }

    #[tokio::test]
    async fn rwalk_fails_outright_when_first_element_is_missing() {
        let (_dir, state) = rooted_state(false).await;
        let err = state.rwalk(&["missing".into()], 200).await.unwrap_err();
        assert!(matches!(err, error::Error::No(ENOENT)));
    }

    #[tokio::test]
    async fn mkdir_then_getattr_sees_a_directory() {
        let (dir, state) = rooted_state(false).await;
        state.mkdir("sub", 0o755, 0).await.unwrap();
        let child = FileState::rooted(state.root.clone(), dir.join("sub"), state.dev);
        let FCall::RGetAttr { qid, .. } = child.getattr(GetAttrMask::all()).await.unwrap() else {
            panic!("expected RGetAttr");
        };
        assert!(qid.typ.contains(QIdType::DIR));
    }

    #[tokio::test]
    async fn mkdir_on_read_only_root_is_erofs() {
        let (_dir, state) = rooted_state(true).await;
        assert!(matches!(
            state.mkdir("sub", 0o755, 0).await.unwrap_err(),
            error::Error::No(EROFS)
        ));
    }

    #[tokio::test]
    async fn create_then_write_then_read_round_trips() {
        let (_dir, mut state) = rooted_state(false).await;
        state
            .create("f", (nix::libc::O_RDWR) as u32, 0o644, 0)
            .await
            .unwrap();
        state.write(0, &Data(b"hello".to_vec())).await.unwrap();
        let FCall::RRead { data } = state.read(0, 5).await.unwrap() else {
            panic!("expected RRead");
        };
        assert_eq!(data.0, b"hello");
    }

    #[tokio::test]
    async fn create_on_read_only_root_is_erofs() {
        let (_dir, mut state) = rooted_state(true).await;
        assert!(matches!(
            state.create("f", nix::libc::O_RDWR as u32, 0o644, 0).await.unwrap_err(),
            error::Error::No(EROFS)
        ));
    }

    #[tokio::test]
    async fn read_before_open_is_ebadf() {
        let (_dir, state) = rooted_state(false).await;
        assert!(matches!(
            state.read(0, 10).await.unwrap_err(),
            error::Error::No(EBADF)
        ));
    }

    #[tokio::test]
    async fn symlink_then_readlink_round_trips() {
        let (dir, state) = rooted_state(false).await;
        state.symlink("link", "target", 0).await.unwrap();
        let child = FileState::rooted(state.root.clone(), dir.join("link"), state.dev);
        let FCall::RReadLink { target } = child.readlink().await.unwrap() else {
            panic!("expected RReadLink");
        };
        assert_eq!(target, "target");
    }

    #[tokio::test]
    async fn unlinkat_removes_a_file() {
        let (dir, mut state) = rooted_state(false).await;
        state.create("f", nix::libc::O_RDWR as u32, 0o644, 0).await.unwrap();
        state.unlinkat("f", 0).await.unwrap();
        assert!(!tokio::fs::try_exists(dir.join("f")).await.unwrap());
    }

    #[tokio::test]
    async fn remove_on_the_share_root_is_eperm() {
        let (_dir, state) = rooted_state(false).await;
        assert!(matches!(
            state.remove().await.unwrap_err(),
            error::Error::No(EPERM)
        ));
    }

    #[tokio::test]
    async fn rename_moves_the_file() {
        let (dir, mut state) = rooted_state(false).await;
        state.create("a", nix::libc::O_RDWR as u32, 0o644, 0).await.unwrap();
        let a = FileState::rooted(state.root.clone(), dir.join("a"), state.dev);
        a.rename(&state, "b").await.unwrap();
        assert!(!tokio::fs::try_exists(dir.join("a")).await.unwrap());
        assert!(tokio::fs::try_exists(dir.join("b")).await.unwrap());
    }

    #[test]
    fn xattr_write_state_truncates_to_declared_size() {
        let mut w = XAttrWriteState {
            realpath: PathBuf::from("/tmp/irrelevant"),
            name: "user.note".into(),
            flags: 0,
            buf: vec![0; 3],
        };
        let FCall::RWrite { count } = w.write(0, &Data(b"abcdef".to_vec())).unwrap() else {
            panic!("expected RWrite");
        };
        assert_eq!(count, 3);
        assert_eq!(w.buf, b"abc");
    }

    #[test]
    fn xattr_write_state_rejects_offset_past_end() {
        let mut w = XAttrWriteState {
            realpath: PathBuf::from("/tmp/irrelevant"),
            name: "user.note".into(),
            flags: 0,
            buf: vec![0; 3],
        };
        assert!(matches!(
            w.write(10, &Data(b"x".to_vec())).unwrap_err(),
            error::Error::No(EINVAL)
        ));
    }
}
