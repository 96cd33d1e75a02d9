use {
    async_trait::async_trait,
    clap::Parser,
    ninep_proto::{
        acceptor::srv_async,
        error::{self, errno::*},
        srv::{FId, Filesystem},
        *,
    },
    std::{path::PathBuf, sync::Arc},
};

mod fid;
mod identity;
mod root;
mod share;
mod utils;
mod xattr;

use crate::{
    fid::{FidKind, FileState, NinepFsFid, XAttrReadState, XAttrWriteState},
    root::make_root,
    share::ShareList,
    utils::*,
};

/// Maximum directory-walk depth before a path is rejected with `ELOOP`.
///
/// Without this, exporting a directory that ends up (re-)mounted inside
/// itself lets a client recurse forever by walking `mnt/mnt/mnt/...`.
const DEFAULT_MAX_DEPTH: usize = 200;

#[derive(Clone)]
struct Ninepfs {
    shares: Arc<ShareList>,
    max_depth: usize,
}

#[async_trait]
impl Filesystem for Ninepfs {
    type FId = NinepFsFid;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        aname: &str,
        n_uname: u32,
    ) -> Result<FCall> {
        let root = Arc::new(make_root(&self.shares, aname, n_uname).await?);
        let realroot = root.realroot().to_path_buf();
        let attr = tokio::fs::symlink_metadata(&realroot).await?;
        let state = FileState::rooted(root, realroot, std::os::unix::fs::MetadataExt::dev(&attr));
        let qid = qid_from_attr(&attr);

        *fid.aux.0.write().await = FidKind::File(state);

        Ok(FCall::RAttach { qid })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        let (wqids, state) = {
            let guard = fid.aux.0.read().await;
            let FidKind::File(state) = &*guard else {
                return Err(error::Error::No(EBADF));
            };
            state.rwalk(wnames, self.max_depth).await?
        };
        // Only bind newfid when every requested name resolved, or when
        // fid/newfid are the same number (in-place walk, always allowed).
        if wqids.len() == wnames.len() || fid.fid() == newfid.fid() {
            *newfid.aux.0.write().await = FidKind::File(state);
        }
        Ok(FCall::RWalk { wqids })
    }

    async fn rgetattr(&self, fid: &FId<Self::FId>, req_mask: GetAttrMask) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.getattr(req_mask).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rsetattr(
        &self,
        fid: &FId<Self::FId>,
        valid: SetAttrMask,
        stat: &SetAttr,
    ) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.setattr(valid, stat).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rreadlink(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.readlink().await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rreaddir(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.readdir(offset, count).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rwreaddir(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.wreaddir(offset, count).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rlopen(&self, fid: &FId<Self::FId>, flags: u32) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.open(flags).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rlcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        flags: u32,
        mode: u32,
        gid: u32,
    ) -> Result<FCall> {
        match &mut *fid.aux.0.write().await {
            FidKind::File(state) => state.create(name, flags, mode, gid).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.read(offset, count).await,
            FidKind::XAttrRead(state) => state.read(offset, count).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        match &mut *fid.aux.0.write().await {
            FidKind::File(state) => state.write(offset, data).await,
            FidKind::XAttrWrite(state) => state.write(offset, data),
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rmkdir(
        &self,
        dfid: &FId<Self::FId>,
        name: &str,
        mode: u32,
        gid: u32,
    ) -> Result<FCall> {
        match &*dfid.aux.0.read().await {
            FidKind::File(state) => state.mkdir(name, mode, gid).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rsymlink(
        &self,
        dfid: &FId<Self::FId>,
        name: &str,
        sym: &str,
        gid: u32,
    ) -> Result<FCall> {
        match &*dfid.aux.0.read().await {
            FidKind::File(state) => state.symlink(name, sym, gid).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rmknod(
        &self,
        dfid: &FId<Self::FId>,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> Result<FCall> {
        match &*dfid.aux.0.read().await {
            FidKind::File(state) => state.mknod(name, mode, major, minor, gid).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rrename(
        &self,
        fid: &FId<Self::FId>,
        dfid: &FId<Self::FId>,
        name: &str,
    ) -> Result<FCall> {
        let fid_guard = fid.aux.0.read().await;
        let FidKind::File(state) = &*fid_guard else {
            return Err(error::Error::No(EBADF));
        };
        match &*dfid.aux.0.read().await {
            FidKind::File(dstate) => state.rename(dstate, name).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rrenameat(
        &self,
        olddir: &FId<Self::FId>,
        oldname: &str,
        newdir: &FId<Self::FId>,
        newname: &str,
    ) -> Result<FCall> {
        let old_guard = olddir.aux.0.read().await;
        let FidKind::File(oldstate) = &*old_guard else {
            return Err(error::Error::No(EBADF));
        };
        match &*newdir.aux.0.read().await {
            FidKind::File(newstate) => oldstate.renameat(oldname, newstate, newname).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rlink(
        &self,
        dfid: &FId<Self::FId>,
        fid: &FId<Self::FId>,
        name: &str,
    ) -> Result<FCall> {
        let fid_guard = fid.aux.0.read().await;
        let FidKind::File(state) = &*fid_guard else {
            return Err(error::Error::No(EBADF));
        };
        match &*dfid.aux.0.read().await {
            FidKind::File(dstate) => state.link(dstate, name).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn runlinkat(&self, dirfid: &FId<Self::FId>, name: &str, flags: u32) -> Result<FCall> {
        match &*dirfid.aux.0.read().await {
            FidKind::File(state) => state.unlinkat(name, flags).await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.remove().await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rfsync(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.fsync().await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn rstatfs(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.statfs().await,
            _ => Err(error::Error::No(EBADF)),
        }
    }

    async fn raccess(&self, fid: &FId<Self::FId>, flags: AccessMask) -> Result<FCall> {
        match &*fid.aux.0.read().await {
            FidKind::File(state) => state.access(flags).await,
            _ => Err(error::Error::No(EOPNOTSUPP)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn rwopen(
        &self,
        fid: &FId<Self::FId>,
        new: &FId<Self::FId>,
        wnames: &[String],
        flags: u32,
        wflags: WOpenFlags,
        mode: u32,
        gid: u32,
        _attr_mask: GetAttrMask,
    ) -> Result<FCall> {
        let guard = fid.aux.0.read().await;
        let FidKind::File(state) = &*guard else {
            return Err(error::Error::No(EBADF));
        };
        state
            .wopen(&new.aux.0, wnames, flags, wflags, mode, gid, self.max_depth)
            .await
    }

    async fn rxattrwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        name: &str,
    ) -> Result<FCall> {
        let path = match &*fid.aux.0.read().await {
            FidKind::File(state) => state.realpath.clone(),
            _ => return Err(error::Error::No(EBADF)),
        };
        let value = xattr::get(path.clone(), name.to_owned()).await?;
        *newfid.aux.0.write().await = FidKind::XAttrRead(XAttrReadState {
            realpath: path,
            name: name.to_owned(),
        });
        Ok(FCall::RxAttrWalk {
            size: value.len() as u64,
        })
    }

    async fn rxattrcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        attr_size: u64,
        flags: u32,
    ) -> Result<FCall> {
        let (path, read_only) = match &*fid.aux.0.read().await {
            FidKind::File(state) => (state.realpath.clone(), state.root.read_only()),
            _ => return Err(error::Error::No(EBADF)),
        };
        if read_only {
            return Err(error::Error::No(EROFS));
        }
        *fid.aux.0.write().await = FidKind::XAttrWrite(XAttrWriteState {
            realpath: path,
            name: name.to_owned(),
            flags,
            buf: vec![0; attr_size as usize],
        });
        Ok(FCall::RxAttrCreate)
    }

    async fn rclunk(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let kind = std::mem::take(&mut *fid.aux.0.write().await);
        if let FidKind::XAttrWrite(state) = kind {
            state.commit().await?;
        }
        Ok(FCall::RClunk)
    }
}

#[derive(Debug, Clone)]
struct ShareSpec {
    name: String,
    path: PathBuf,
    read_only: bool,
}

impl std::str::FromStr for ShareSpec {
    type Err = String;

    /// `name=path` or `name=path:ro`.
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let (name, rest) = s.split_once('=').ok_or("expected name=path")?;
        let (path, read_only) = match rest.strip_suffix(":ro") {
            Some(p) => (p, true),
            None => (rest, false),
        };
        Ok(ShareSpec {
            name: name.to_owned(),
            path: PathBuf::from(path),
            read_only,
        })
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Share to export, as name=path (optionally name=path:ro). Repeatable.
    #[arg(long = "share", required = true)]
    shares: Vec<ShareSpec>,

    /// Maximum directory depth to traverse
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,
}

async fn ninep_fs_main(cli: Cli) -> Result<i32> {
    let shares = Arc::new(ShareList::new());
    for spec in &cli.shares {
        if !tokio::fs::try_exists(&spec.path).await? {
            tokio::fs::create_dir_all(&spec.path).await?;
        }
        if !tokio::fs::metadata(&spec.path).await?.is_dir() {
            return res!(io_err!(Other, "export path must be a directory"));
        }
        shares
            .add(spec.name.clone(), spec.path.clone(), spec.read_only)
            .await?;
        log::info!("share {} -> {} (ro={})", spec.name, spec.path.display(), spec.read_only);
    }

    log::info!("maximum walk depth: {}", cli.max_depth);
    log::info!("ready to accept clients: {}", cli.address);
    srv_async(
        Ninepfs {
            shares,
            max_depth: cli.max_depth,
        },
        &cli.address,
    )
    .await
    .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = ninep_fs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::ShareSpec;
    use std::str::FromStr;

    #[test]
    fn parses_share_spec() {
        let spec = ShareSpec::from_str("public=/srv/public").unwrap();
        assert_eq!(spec.name, "public");
        assert_eq!(spec.path, std::path::PathBuf::from("/srv/public"));
        assert!(!spec.read_only);
    }

    #[test]
    fn parses_read_only_share_spec() {
        let spec = ShareSpec::from_str("ro-share=/srv/ro:ro").unwrap();
        assert_eq!(spec.name, "ro-share");
        assert!(spec.read_only);
    }

    #[test]
    fn rejects_spec_without_equals() {
        assert!(ShareSpec::from_str("not-a-share").is_err());
    }

    #[test]
    fn max_depth_blocks_runaway_walks() {
        let mut depth: usize = 0;
        for name in ["a", "b", "c"] {
            if name != "." {
                depth += 1;
            }
        }
        assert_eq!(depth, 3);
        depth = depth.saturating_sub(1);
        assert_eq!(depth, 2);
    }
}
