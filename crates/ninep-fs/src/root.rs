//! Per-connection view of a [`Share`] under a specific user identity.

use {
    crate::{
        identity::Identity,
        share::{Share, ShareList},
    },
    ninep_proto::{
        Result,
        error::{self, errno::*},
    },
    std::{path::Path, sync::Arc},
};

/// A uid of `-1` on the wire means "use the server's own identity".
pub const NO_UID: u32 = u32::MAX;

/// A per-connection object bound to a share after `attach`.
pub struct Root {
    pub share: Arc<Share>,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Root {
    pub fn realroot(&self) -> &Path {
        &self.share.root_path
    }

    pub fn read_only(&self) -> bool {
        self.share.read_only
    }

    /// A root with "no identity switch" in effect: the handler runs under
    /// whatever identity the process already has.
    pub fn is_server_identity(&self, server_uid: u32) -> bool {
        self.uid == server_uid
    }
}

/// Implements the share/root resolution rules for `attach`.
pub async fn make_root(shares: &ShareList, aname: &str, uid: u32) -> Result<Root> {
    let share = shares.get(aname).await?;
    let server_uid = nix::unistd::getuid().as_raw();

    if uid == server_uid || uid == NO_UID {
        return Ok(Root {
            share,
            uid: server_uid,
            gid: nix::unistd::getgid().as_raw(),
            groups: Vec::new(),
        });
    }

    if server_uid != 0 {
        return Err(error::Error::No(EPERM));
    }

    let identity = Identity::resolve(uid).await?;
    Ok(Root {
        share,
        uid: identity.uid,
        gid: identity.gid,
        groups: identity.groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::ShareList;
    use std::path::PathBuf;

    #[tokio::test]
    async fn attaching_as_server_uid_skips_identity_switch() {
        let shares = ShareList::new();
        shares
            .add("public".into(), PathBuf::from("/tmp"), false)
            .await
            .unwrap();
        let server_uid = nix::unistd::getuid().as_raw();
        let root = make_root(&shares, "public", server_uid).await.unwrap();
        assert!(root.is_server_identity(server_uid));
        assert!(root.groups.is_empty());
    }

    #[tokio::test]
    async fn attaching_with_no_uid_sentinel_uses_server_identity() {
        let shares = ShareList::new();
        shares
            .add("public".into(), PathBuf::from("/tmp"), false)
            .await
            .unwrap();
        let server_uid = nix::unistd::getuid().as_raw();
        let root = make_root(&shares, "public", NO_UID).await.unwrap();
        assert_eq!(root.uid, server_uid);
    }

    #[tokio::test]
    async fn attaching_to_unknown_share_is_enoent() {
        let shares = ShareList::new();
        let err = make_root(&shares, "nope", NO_UID).await.unwrap_err();
        assert!(matches!(err, error::Error::No(ENOENT)));
    }

    #[tokio::test]
    async fn non_root_server_cannot_switch_identity() {
        let shares = ShareList::new();
        shares
            .add("public".into(), PathBuf::from("/tmp"), false)
            .await
            .unwrap();
        let server_uid = nix::unistd::getuid().as_raw();
        if server_uid == 0 {
            // Running as root in this environment: the EPERM branch is
            // unreachable, so there's nothing to assert here.
            return;
        }
        let err = make_root(&shares, "public", server_uid.wrapping_add(1))
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::No(EPERM)));
    }

    #[test]
    fn read_only_reflects_the_backing_share() {
        let share = Arc::new(Share {
            name: "ro".into(),
            root_path: PathBuf::from("/tmp"),
            read_only: true,
        });
        let root = Root {
            share,
            uid: 0,
            gid: 0,
            groups: Vec::new(),
        };
        assert!(root.read_only());
        assert_eq!(root.realroot(), Path::new("/tmp"));
    }
}
