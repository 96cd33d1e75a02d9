//! Named, process-wide registry of export roots.

use {
    ninep_proto::{
        Result,
        error::{self, errno::*},
    },
    std::{collections::HashMap, path::PathBuf, sync::Arc},
    tokio::sync::RwLock,
};

/// A named mountable root exposed by the server.
#[derive(Debug)]
pub struct Share {
    pub name: String,
    pub root_path: PathBuf,
    pub read_only: bool,
}

/// Concurrent `name -> Share` map with a unique-name invariant.
#[derive(Default)]
pub struct ShareList {
    shares: RwLock<HashMap<String, Arc<Share>>>,
}

impl ShareList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, name: String, root_path: PathBuf, read_only: bool) -> Result<()> {
        let mut shares = self.shares.write().await;
        if shares.contains_key(&name) {
            return Err(error::Error::No(EEXIST));
        }
        shares.insert(
            name.clone(),
            Arc::new(Share {
                name,
                root_path,
                read_only,
            }),
        );
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut shares = self.shares.write().await;
        shares
            .remove(name)
            .map(|_| ())
            .ok_or(error::Error::No(ENOENT))
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Share>> {
        self.shares
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(error::Error::No(ENOENT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let shares = ShareList::new();
        shares
            .add("public".into(), PathBuf::from("/tmp/pub"), false)
            .await
            .unwrap();
        let share = shares.get("public").await.unwrap();
        assert_eq!(share.name, "public");
        assert!(!share.read_only);
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let shares = ShareList::new();
        shares
            .add("public".into(), PathBuf::from("/tmp/a"), false)
            .await
            .unwrap();
        let err = shares
            .add("public".into(), PathBuf::from("/tmp/b"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, error::Error::No(EEXIST)));
    }

    #[tokio::test]
    async fn get_unknown_share_is_enoent() {
        let shares = ShareList::new();
        let err = shares.get("nope").await.unwrap_err();
        assert!(matches!(err, error::Error::No(ENOENT)));
    }

    #[tokio::test]
    async fn remove_drops_the_share() {
        let shares = ShareList::new();
        shares
            .add("ro".into(), PathBuf::from("/tmp/ro"), true)
            .await
            .unwrap();
        shares.remove("ro").await.unwrap();
        assert!(matches!(
            shares.get("ro").await.unwrap_err(),
            error::Error::No(ENOENT)
        ));
    }

    #[tokio::test]
    async fn remove_unknown_share_is_enoent() {
        let shares = ShareList::new();
        let err = shares.remove("nope").await.unwrap_err();
        assert!(matches!(err, error::Error::No(ENOENT)));
    }
}
