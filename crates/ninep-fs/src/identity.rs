//! Host identity resolution and scoped effective-id switching.
//!
//! Everything here must run inside [`tokio::task::spawn_blocking`]: the
//! scheduler doesn't pin an async task to one OS thread across a suspension
//! point, so holding an effective uid/gid across an `.await` would leak it
//! onto whatever thread resumes next.

use {
    ninep_proto::{
        Result,
        error::{self, errno::*},
    },
    nix::libc,
    nix::unistd::{Group, Uid, User, getgrouplist},
    std::ffi::CString,
    std::io,
};

/// Resolved identity for a connection's [`crate::root::Root`].
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Identity {
    /// Looks up `uid`'s primary gid and supplementary groups in the host
    /// password/group database. Only called when the server runs as root;
    /// a non-root server rejects identity switches before reaching here.
    pub async fn resolve(uid: u32) -> Result<Identity> {
        tokio::task::spawn_blocking(move || Self::resolve_blocking(uid))
            .await
            .map_err(|e| error::Error::Io(io::Error::other(e)))?
    }

    fn resolve_blocking(uid: u32) -> Result<Identity> {
        match User::from_uid(Uid::from_raw(uid)).map_err(error::Error::from)? {
            Some(user) => {
                let cname = CString::new(user.name).map_err(|_| error::Error::No(EINVAL))?;
                let groups = getgrouplist(&cname, user.gid)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|g| g.as_raw())
                    .collect();
                Ok(Identity {
                    uid,
                    gid: user.gid.as_raw(),
                    groups,
                })
            }
            // Source user not in the password database: fall back to the
            // `nobody` group, as a root server does for any other unmapped uid.
            None => {
                let nobody_gid = Group::from_name("nobody")
                    .map_err(error::Error::from)?
                    .ok_or(error::Error::No(EINVAL))?
                    .gid
                    .as_raw();
                Ok(Identity {
                    uid,
                    gid: nobody_gid,
                    groups: vec![nobody_gid],
                })
            }
        }
    }
}

/// Sentinel passed to `setresuid`/`setresgid` for "leave this id unchanged".
const KEEP: u32 = u32::MAX;

/// Raw `setresuid`/`setresgid`/`setgroups` syscalls, bypassing glibc's
/// wrappers. glibc's `seteuid`/`setegid`/`setgroups` broadcast the credential
/// change to every thread in the process (via a signal to each thread in the
/// thread group); since a [`ScopedIdentity`] guard lives inside one
/// [`tokio::task::spawn_blocking`] call on a thread shared with other
/// connections' blocking work, that broadcast would leak the switched
/// identity onto whichever other call happens to be running on a sibling
/// thread at the same moment. The raw syscalls change only the calling
/// thread's credentials.
mod raw {
    use std::io;

    use super::{KEEP, libc};

    unsafe fn check(ret: libc::c_long) -> io::Result<()> {
        if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    pub fn setresuid(ruid: u32, euid: u32, suid: u32) -> io::Result<()> {
        unsafe { check(libc::syscall(libc::SYS_setresuid, ruid, euid, suid)) }
    }

    pub fn setresgid(rgid: u32, egid: u32, sgid: u32) -> io::Result<()> {
        unsafe { check(libc::syscall(libc::SYS_setresgid, rgid, egid, sgid)) }
    }

    pub fn setgroups(groups: &[u32]) -> io::Result<()> {
        unsafe { check(libc::syscall(libc::SYS_setgroups, groups.len(), groups.as_ptr())) }
    }

    pub fn restore_uid() -> io::Result<()> {
        setresuid(KEEP, 0, KEEP)
    }

    pub fn restore_gid() -> io::Result<()> {
        setresgid(KEEP, 0, KEEP)
    }
}

/// Holds an effective uid/gid/supplementary-group set, on the calling thread
/// only, for the lifetime of the guard, restoring to (root, root, no groups)
/// on drop. Must be created and dropped on the same thread, which is why
/// [`with_identity`] never lets it cross an `.await`.
pub struct ScopedIdentity;

impl ScopedIdentity {
    pub fn assume(uid: u32, gid: u32, groups: &[u32]) -> io::Result<ScopedIdentity> {
        // Groups, then gid, then uid: the capability to change gid is lost
        // once the effective uid stops being root.
        raw::setgroups(groups)?;
        raw::setresgid(KEEP, gid, KEEP)?;
        raw::setresuid(KEEP, uid, KEEP)?;
        Ok(ScopedIdentity)
    }
}

impl Drop for ScopedIdentity {
    fn drop(&mut self) {
        let _ = raw::restore_uid();
        let _ = raw::restore_gid();
        let _ = raw::setgroups(&[]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolving_the_running_uid_succeeds() {
        let uid = nix::unistd::getuid().as_raw();
        let identity = Identity::resolve(uid).await.unwrap();
        assert_eq!(identity.uid, uid);
    }

    #[tokio::test]
    async fn resolving_an_unmapped_uid_falls_back_to_nobody() {
        // Far outside any real allocation range on a typical test host.
        let unmapped_uid = 0x7fff_fffe;
        match Identity::resolve(unmapped_uid).await {
            Ok(identity) => {
                let nobody_gid = Group::from_name("nobody").unwrap().unwrap().gid.as_raw();
                assert_eq!(identity.gid, nobody_gid);
            }
            // Hosts without a `nobody` group reject with EINVAL instead.
            Err(error::Error::No(EINVAL)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    #[tokio::test]
    async fn with_identity_as_server_uid_runs_without_switching() {
        let root = std::sync::Arc::new(crate::root::Root {
            share: std::sync::Arc::new(crate::share::Share {
                name: "t".into(),
                root_path: std::path::PathBuf::from("/tmp"),
                read_only: false,
            }),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            groups: Vec::new(),
        });
        let result = with_identity(root, || Ok(42)).await.unwrap();
        assert_eq!(result, 42);
    }
}

/// Runs a blocking host-syscall closure under `root`'s identity, entirely
/// inside one blocking region. If `root` is the server's own identity, no
/// switch happens and `f` just runs as-is.
pub async fn with_identity<F, T>(root: std::sync::Arc<crate::root::Root>, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let server_uid = nix::unistd::getuid().as_raw();
    tokio::task::spawn_blocking(move || {
        let _guard = if root.uid != server_uid {
            Some(ScopedIdentity::assume(root.uid, root.gid, &root.groups)?)
        } else {
            None
        };
        f()
    })
    .await
    .map_err(|e| error::Error::Io(io::Error::other(e)))?
}
