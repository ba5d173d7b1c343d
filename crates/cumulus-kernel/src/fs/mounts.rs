//! Mount table: routes node paths to providers.
//!
//! Mount points are matched by longest prefix. Uid selectors carry no
//! path, so they are offered to each provider in turn.

use std::collections::BTreeMap;
use std::sync::Arc;

use cumulus_types::{CoreError, CoreResult, FsEntry, Selector, normalize_path};

use super::provider::{FsProvider, StatOptions};

/// Information about a mount point.
#[derive(Debug, Clone)]
pub struct MountInfo {
    pub path: String,
    pub provider: String,
}

#[derive(Default)]
pub struct MountTable {
    mounts: BTreeMap<String, Arc<dyn FsProvider>>,
}

impl std::fmt::Debug for MountTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountTable")
            .field("mounts", &self.mounts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with `provider` at `/`.
    pub fn single(provider: Arc<dyn FsProvider>) -> Self {
        let mut table = Self::new();
        table.mount("/", provider);
        table
    }

    /// Mount at `path`, replacing any provider already there.
    pub fn mount(&mut self, path: &str, provider: Arc<dyn FsProvider>) {
        self.mounts.insert(normalize_path(path), provider);
    }

    pub fn unmount(&mut self, path: &str) -> bool {
        self.mounts.remove(&normalize_path(path)).is_some()
    }

    pub fn list_mounts(&self) -> Vec<MountInfo> {
        self.mounts
            .iter()
            .map(|(path, provider)| MountInfo {
                path: path.clone(),
                provider: provider.name().to_string(),
            })
            .collect()
    }

    /// The provider whose mount point is the longest prefix of `path`.
    pub fn provider_for_path(&self, path: &str) -> CoreResult<&Arc<dyn FsProvider>> {
        let path = normalize_path(path);
        self.mounts
            .iter()
            .filter(|(mount, _)| {
                mount.as_str() == "/"
                    || path == **mount
                    || path.starts_with(&format!("{}/", mount))
            })
            .max_by_key(|(mount, _)| mount.len())
            .map(|(_, provider)| provider)
            .ok_or_else(|| CoreError::NotFound(format!("no provider mounted for {}", path)))
    }

    /// The provider that owns `entry`.
    pub fn provider_for(&self, entry: &FsEntry) -> CoreResult<&Arc<dyn FsProvider>> {
        self.provider_for_path(&entry.path)
    }

    /// Resolve a selector against the right provider.
    pub async fn stat(&self, selector: &Selector, options: &StatOptions) -> CoreResult<Option<FsEntry>> {
        match selector {
            Selector::Root | Selector::Path(_) => {
                let path = selector.as_path().unwrap_or("/");
                self.provider_for_path(path)?.stat(selector, options).await
            }
            Selector::Uid(_) | Selector::InternalId(_) => {
                for provider in self.mounts.values().rev() {
                    if let Some(entry) = provider.stat(selector, options).await? {
                        return Ok(Some(entry));
                    }
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{LocalProvider, TreeProvider};

    #[tokio::test]
    async fn longest_prefix_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("disk.txt"), b"1").unwrap();

        let mut table = MountTable::single(Arc::new(TreeProvider::new()));
        table.mount("/mnt/disk", Arc::new(LocalProvider::new(dir.path()).mounted_at("/mnt/disk")));

        assert_eq!(table.provider_for_path("/home/a").unwrap().name(), "tree");
        assert_eq!(table.provider_for_path("/mnt/disk").unwrap().name(), "local");
        assert_eq!(table.provider_for_path("/mnt/disk/x").unwrap().name(), "local");
        assert_eq!(table.provider_for_path("/mnt/diskette").unwrap().name(), "tree");

        let entry = table
            .stat(&Selector::path("/mnt/disk/disk.txt").unwrap(), &StatOptions::default())
            .await
            .unwrap()
            .unwrap();
        let by_uid = table.stat(&Selector::Uid(entry.uid), &StatOptions::default()).await.unwrap();
        assert_eq!(by_uid.map(|e| e.path), Some("/mnt/disk/disk.txt".to_string()));
    }

    #[test]
    fn unmounted_path_is_not_found() {
        let mut table = MountTable::new();
        table.mount("/data", Arc::new(TreeProvider::new()));
        assert_eq!(table.provider_for_path("/other").map(|_| ()).unwrap_err().code(), "not_found");
        assert!(table.unmount("/data/"));
    }
}
