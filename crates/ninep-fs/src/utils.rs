use {
    ninep_proto::fcall::*,
    std::{fs::Metadata, os::unix::prelude::*, path::Path},
    tokio::fs,
};

#[macro_export]
macro_rules! INVALID_FID {
    () => {
        io_err!(InvalidInput, "Invalid fid")
    };
}

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep_proto::Result<QId> {
    Ok(qid_from_attr(&fs::symlink_metadata(path.as_ref()).await?))
}

pub fn qid_from_attr(attr: &Metadata) -> QId {
    QId {
        typ: From::from(attr.file_type()),
        version: 0,
        path: attr.ino(),
    }
}

/// Builds the synthesized `.`/`..` entry for a `TReadDir` response. `realpath`
/// is the actual directory (or its parent) being listed, so the qid reflects
/// that directory rather than whatever the server process's own cwd is;
/// `name` is the entry name the client sees (always `.` or `..`).
pub async fn get_dirent_from<P: AsRef<Path> + ?Sized>(
    realpath: &P,
    name: &str,
    offset: u64,
) -> ninep_proto::Result<DirEntry> {
    Ok(DirEntry {
        qid: get_qid(realpath).await?,
        offset,
        typ: 0,
        name: name.to_owned(),
    })
}

pub async fn get_dirent(entry: &fs::DirEntry, offset: u64) -> ninep_proto::Result<DirEntry> {
    Ok(DirEntry {
        qid: qid_from_attr(&entry.metadata().await?),
        offset,
        typ: 0,
        name: entry.file_name().to_string_lossy().into_owned(),
    })
}

/// `WStat` default used for servers that don't track generation counts or a
/// cache-validation counter: birth time mirrors ctime, gen and data_version
/// are always 0.
pub fn wstat_from_attr(attr: &Metadata) -> WStat {
    let stat: Stat = Stat::from(attr);
    WStat {
        btime: stat.ctime,
        stat,
        gen: 0,
        data_version: 0,
    }
}

pub async fn get_wdirent(entry: &fs::DirEntry, offset: u64) -> ninep_proto::Result<WDirEntry> {
    let attr = entry.metadata().await?;
    Ok(WDirEntry {
        qid: qid_from_attr(&attr),
        offset,
        typ: 0,
        name: entry.file_name().to_string_lossy().into_owned(),
        stat: Stat::from(&attr),
    })
}
