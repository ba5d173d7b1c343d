//! Local disk provider.
//!
//! Serves a directory on the host filesystem under a mount path. Node uids
//! are derived from the path (uuid v5), so they are stable across restarts
//! but change when a node is moved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use cumulus_types::{
    Capability, CapabilitySet, CoreError, CoreResult, FsEntry, Selector, UserId, join_path,
    normalize_path, validate_file_name,
};

use super::provider::{FsProvider, ProviderMethod, StatOptions};

const LOCAL_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_6361_6c2d_4e53_8000_0000_0000_0001);

fn epoch_secs(time: std::io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64)
}

/// Host directory mounted into the node namespace.
#[derive(Debug)]
pub struct LocalProvider {
    root: PathBuf,
    mount: String,
    owner: Option<UserId>,
    read_only: bool,
    /// uid → mount path, for every node this provider has reported.
    known: RwLock<HashMap<Uuid, String>>,
}

impl LocalProvider {
    /// Serve `root` at `/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mount: "/".to_string(),
            owner: None,
            read_only: false,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Serve at `mount` instead of `/`.
    pub fn mounted_at(mut self, mount: &str) -> Self {
        self.mount = normalize_path(mount);
        self
    }

    /// Report every node as owned by `owner`.
    pub fn owned_by(mut self, owner: UserId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn uid_for(&self, path: &str) -> Uuid {
        let key = format!("{}:{}", self.root.display(), path);
        Uuid::new_v5(&LOCAL_NAMESPACE, key.as_bytes())
    }

    /// Host path for a node path under this mount.
    fn real_path(&self, path: &str) -> CoreResult<PathBuf> {
        let path = normalize_path(path);
        let relative = if self.mount == "/" {
            path.as_str()
        } else {
            match path.strip_prefix(&self.mount) {
                Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
                _ => {
                    return Err(CoreError::InvalidInput(format!(
                        "{} is outside mount {}",
                        path, self.mount
                    )));
                }
            }
        };
        Ok(self.root.join(relative.trim_start_matches('/')))
    }

    fn check_writable(&self) -> CoreResult<()> {
        if self.read_only {
            Err(CoreError::Immutable(format!("{} is mounted read-only", self.mount)))
        } else {
            Ok(())
        }
    }

    fn remember(&self, uid: Uuid, path: &str) {
        if let Ok(mut known) = self.known.write() {
            known.insert(uid, path.to_string());
        }
    }

    fn path_of(&self, selector: &Selector) -> CoreResult<Option<String>> {
        Ok(match selector {
            Selector::Root => Some(self.mount.clone()),
            Selector::Path(path) => Some(path.clone()),
            Selector::Uid(uid) => self
                .known
                .read()
                .map_err(|_| CoreError::Internal("uid index lock poisoned".to_string()))?
                .get(uid)
                .cloned(),
            Selector::InternalId(id) => {
                return Err(CoreError::InvalidInput(format!(
                    "local provider has no internal ids (got {})",
                    id
                )));
            }
        })
    }

    async fn entry_at(&self, path: &str) -> CoreResult<Option<FsEntry>> {
        let meta = match fs::metadata(self.real_path(path)?).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let uid = self.uid_for(path);
        self.remember(uid, path);
        let is_mount_root = path == self.mount;
        let parent_uid = if is_mount_root {
            None
        } else {
            let parent = path.rsplit_once('/').map_or("/", |(p, _)| if p.is_empty() { "/" } else { p });
            Some(self.uid_for(parent))
        };

        Ok(Some(FsEntry {
            uid,
            id: None,
            name: if is_mount_root {
                String::new()
            } else {
                path.rsplit('/').next().unwrap_or_default().to_string()
            },
            path: path.to_string(),
            parent_uid,
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
            immutable: self.read_only || is_mount_root,
            owner_id: self.owner,
            modified: epoch_secs(meta.modified()),
            created: epoch_secs(meta.created()),
            thumbnail: None,
            versions: None,
            shares: None,
            subdomains: None,
        }))
    }

    async fn require_entry(&self, path: &str) -> CoreResult<FsEntry> {
        self.entry_at(path)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("{} vanished after write", path)))
    }
}

#[async_trait]
impl FsProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut caps = CapabilitySet::default()
            .with(Capability::Uuid)
            .with(Capability::Read)
            .with(Capability::CaseSensitive);
        if !self.read_only {
            caps.insert(Capability::Write);
        }
        if cfg!(unix) {
            caps.insert(Capability::UnixPerms);
        }
        caps
    }

    fn implements(&self, method: ProviderMethod) -> bool {
        method != ProviderMethod::CopyTree
    }

    async fn stat(&self, selector: &Selector, _options: &StatOptions) -> CoreResult<Option<FsEntry>> {
        let found = match self.path_of(selector)? {
            Some(path) => self.entry_at(&path).await?,
            None => None,
        };
        if found.is_none() {
            tracing::info!(selector = %selector, provider = "local", "stat: no such node");
        }
        Ok(found)
    }

    async fn readdir(&self, dir: &FsEntry) -> CoreResult<Vec<Uuid>> {
        let mut names = Vec::new();
        let mut reader = fs::read_dir(self.real_path(&dir.path)?).await?;
        while let Some(entry) = reader.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        Ok(names
            .iter()
            .map(|name| {
                let path = join_path(&dir.path, name);
                let uid = self.uid_for(&path);
                self.remember(uid, &path);
                uid
            })
            .collect())
    }

    async fn read(&self, node: &FsEntry) -> CoreResult<Vec<u8>> {
        Ok(fs::read(self.real_path(&node.path)?).await?)
    }

    async fn write_new(
        &self,
        parent: &FsEntry,
        name: &str,
        data: &[u8],
        _owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        self.check_writable()?;
        validate_file_name(name)?;
        let path = join_path(&parent.path, name);
        let real = self.real_path(&path)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&real)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => CoreError::AlreadyExists(path.clone()),
                _ => e.into(),
            })?;
        file.write_all(data).await?;
        file.flush().await?;
        self.require_entry(&path).await
    }

    async fn write_overwrite(&self, node: &FsEntry, data: &[u8]) -> CoreResult<FsEntry> {
        self.check_writable()?;
        fs::write(self.real_path(&node.path)?, data).await?;
        self.require_entry(&node.path).await
    }

    async fn mkdir(&self, parent: &FsEntry, name: &str, _owner: Option<UserId>) -> CoreResult<FsEntry> {
        self.check_writable()?;
        validate_file_name(name)?;
        let path = join_path(&parent.path, name);
        fs::create_dir(self.real_path(&path)?)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => CoreError::AlreadyExists(path.clone()),
                _ => e.into(),
            })?;
        self.require_entry(&path).await
    }

    async fn unlink(&self, node: &FsEntry) -> CoreResult<()> {
        self.check_writable()?;
        Ok(fs::remove_file(self.real_path(&node.path)?).await?)
    }

    async fn rmdir(&self, node: &FsEntry) -> CoreResult<()> {
        self.check_writable()?;
        if node.path == self.mount {
            return Err(CoreError::Immutable(node.path.clone()));
        }
        let real = self.real_path(&node.path)?;
        let mut reader = fs::read_dir(&real).await?;
        if reader.next_entry().await?.is_some() {
            return Err(CoreError::DirNotEmpty(node.path.clone()));
        }
        Ok(fs::remove_dir(real).await?)
    }

    async fn move_node(&self, node: &FsEntry, new_parent: &FsEntry, new_name: &str) -> CoreResult<FsEntry> {
        self.check_writable()?;
        validate_file_name(new_name)?;
        let path = join_path(&new_parent.path, new_name);
        let target = self.real_path(&path)?;
        if fs::try_exists(&target).await? {
            return Err(CoreError::AlreadyExists(path));
        }
        fs::rename(self.real_path(&node.path)?, &target).await?;
        if let Ok(mut known) = self.known.write() {
            known.remove(&node.uid);
        }
        self.require_entry(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (LocalProvider, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (LocalProvider::new(dir.path()), dir)
    }

    async fn root(p: &LocalProvider) -> FsEntry {
        p.stat(&Selector::Root, &StatOptions::default()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (p, _dir) = setup().await;
        let file = p.write_new(&root(&p).await, "test.txt", b"hello", None).await.unwrap();
        assert_eq!(file.path, "/test.txt");
        assert_eq!(p.read(&file).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn uids_are_stable_and_resolvable() {
        let (p, dir) = setup().await;
        let file = p.write_new(&root(&p).await, "a.txt", b"a", None).await.unwrap();

        let again = LocalProvider::new(dir.path());
        let by_path = again
            .stat(&Selector::path("/a.txt").unwrap(), &StatOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_path.uid, file.uid);

        let by_uid = p.stat(&Selector::Uid(file.uid), &StatOptions::default()).await.unwrap();
        assert_eq!(by_uid.map(|e| e.path), Some("/a.txt".to_string()));
    }

    #[tokio::test]
    async fn test_empty_readdir() {
        let (p, _dir) = setup().await;
        let sub = p.mkdir(&root(&p).await, "empty", None).await.unwrap();
        assert!(p.readdir(&sub).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only() {
        let (_, dir) = setup().await;
        let p = LocalProvider::new(dir.path()).read_only();
        assert!(!p.capabilities().contains(Capability::Write));
        let err = p.write_new(&root(&p).await, "x", b"", None).await.unwrap_err();
        assert_eq!(err.code(), "immutable");
    }

    #[tokio::test]
    async fn no_native_copy() {
        let (p, _dir) = setup().await;
        assert!(!p.capabilities().contains(Capability::CopyTree));
        assert!(!p.implements(ProviderMethod::CopyTree));
        let root = root(&p).await;
        let err = p
            .copy_tree(&root, &root, "copy", Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_operation");
    }

    #[tokio::test]
    async fn mounted_paths_map_into_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.txt"), b"x").unwrap();
        let p = LocalProvider::new(dir.path()).mounted_at("/mnt/disk");
        let entry = p
            .stat(&Selector::path("/mnt/disk/n.txt").unwrap(), &StatOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.size, 1);
        let mount_root = p.stat(&Selector::Root, &StatOptions::default()).await.unwrap().unwrap();
        assert_eq!(entry.parent_uid, Some(mount_root.uid));
    }

    #[tokio::test]
    async fn rmdir_non_empty() {
        let (p, _dir) = setup().await;
        let d = p.mkdir(&root(&p).await, "d", None).await.unwrap();
        p.write_new(&d, "f", b"", None).await.unwrap();
        assert_eq!(p.rmdir(&d).await.unwrap_err().code(), "dir_not_empty");
    }
}
