//! In-memory node tree provider.
//!
//! Every node has a uuid and a sequential internal id; directories keep
//! their children by name. Writes are two-phase ([`TreeProvider::begin_write`]
//! then [`PendingWrite::commit`]) so concurrent `stat` calls can wait on a
//! node that is still being created.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use cumulus_types::{
    Capability, CapabilitySet, CoreError, CoreResult, EntryVersion, FsEntry, Selector, UserId,
    join_path, validate_file_name,
};

use super::coordination::{EntryRegistry, ResourceGuard, ResourceRegistry, wait_pending};
use super::provider::{FsProvider, StatOptions};

#[derive(Debug, Clone)]
struct TreeNode {
    entry: FsEntry,
    children: BTreeMap<String, Uuid>,
    data: Vec<u8>,
    thumbnail: Option<String>,
    versions: Vec<EntryVersion>,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<Uuid, TreeNode>,
    by_id: HashMap<i64, Uuid>,
    root: Uuid,
    next_id: i64,
}

impl Tree {
    fn new() -> Self {
        let now = chrono::Utc::now().timestamp();
        let root = Uuid::new_v4();
        let entry = FsEntry {
            uid: root,
            id: Some(1),
            name: String::new(),
            path: "/".to_string(),
            parent_uid: None,
            size: 0,
            is_dir: true,
            immutable: true,
            owner_id: None,
            modified: now,
            created: now,
            thumbnail: None,
            versions: None,
            shares: None,
            subdomains: None,
        };
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            TreeNode {
                entry,
                children: BTreeMap::new(),
                data: Vec::new(),
                thumbnail: None,
                versions: Vec::new(),
            },
        );
        let mut by_id = HashMap::new();
        by_id.insert(1, root);
        Self {
            nodes,
            by_id,
            root,
            next_id: 2,
        }
    }

    fn node(&self, uid: Uuid) -> CoreResult<&TreeNode> {
        self.nodes
            .get(&uid)
            .ok_or_else(|| CoreError::NotFound(format!("[uid:{}]", uid)))
    }

    fn node_mut(&mut self, uid: Uuid) -> CoreResult<&mut TreeNode> {
        self.nodes
            .get_mut(&uid)
            .ok_or_else(|| CoreError::NotFound(format!("[uid:{}]", uid)))
    }

    fn find(&self, selector: &Selector) -> Option<Uuid> {
        match selector {
            Selector::Root => Some(self.root),
            Selector::Uid(uid) => self.nodes.contains_key(uid).then_some(*uid),
            Selector::InternalId(id) => self.by_id.get(id).copied(),
            Selector::Path(path) => {
                let mut current = self.root;
                for name in path.split('/').filter(|c| !c.is_empty()) {
                    current = *self.nodes.get(&current)?.children.get(name)?;
                }
                Some(current)
            }
        }
    }

    fn entry(&self, uid: Uuid, options: &StatOptions) -> CoreResult<FsEntry> {
        let node = self.node(uid)?;
        let mut entry = node.entry.clone();
        if options.thumbnail {
            entry.thumbnail = node.thumbnail.clone();
        }
        if options.versions && !entry.is_dir {
            entry.versions = Some(node.versions.clone());
        }
        Ok(entry)
    }

    fn require_dir(&self, uid: Uuid) -> CoreResult<&TreeNode> {
        let node = self.node(uid)?;
        if !node.entry.is_dir {
            return Err(CoreError::InvalidInput(format!(
                "{} is not a directory",
                node.entry.path
            )));
        }
        Ok(node)
    }

    fn insert(
        &mut self,
        parent: Uuid,
        name: &str,
        uid: Uuid,
        is_dir: bool,
        data: Vec<u8>,
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        let parent_node = self.require_dir(parent)?;
        if parent_node.children.contains_key(name) {
            return Err(CoreError::AlreadyExists(join_path(&parent_node.entry.path, name)));
        }
        let path = join_path(&parent_node.entry.path, name);
        let now = chrono::Utc::now().timestamp();
        let id = self.next_id;
        self.next_id += 1;

        let entry = FsEntry {
            uid,
            id: Some(id),
            name: name.to_string(),
            path,
            parent_uid: Some(parent),
            size: data.len() as u64,
            is_dir,
            immutable: false,
            owner_id: owner,
            modified: now,
            created: now,
            thumbnail: None,
            versions: None,
            shares: None,
            subdomains: None,
        };
        self.nodes.insert(
            uid,
            TreeNode {
                entry: entry.clone(),
                children: BTreeMap::new(),
                data,
                thumbnail: None,
                versions: Vec::new(),
            },
        );
        self.by_id.insert(id, uid);
        self.node_mut(parent)?.children.insert(name.to_string(), uid);
        Ok(entry)
    }

    fn detach(&mut self, uid: Uuid) -> CoreResult<TreeNode> {
        let node = self
            .nodes
            .remove(&uid)
            .ok_or_else(|| CoreError::NotFound(format!("[uid:{}]", uid)))?;
        if let Some(id) = node.entry.id {
            self.by_id.remove(&id);
        }
        if let Some(parent) = node.entry.parent_uid {
            self.node_mut(parent)?.children.remove(&node.entry.name);
        }
        Ok(node)
    }

    fn is_ancestor(&self, ancestor: Uuid, mut uid: Uuid) -> bool {
        loop {
            if uid == ancestor {
                return true;
            }
            match self.nodes.get(&uid).and_then(|n| n.entry.parent_uid) {
                Some(parent) => uid = parent,
                None => return false,
            }
        }
    }

    fn repath(&mut self, uid: Uuid, parent_path: &str) -> CoreResult<()> {
        let node = self.node_mut(uid)?;
        node.entry.path = join_path(parent_path, &node.entry.name);
        let path = node.entry.path.clone();
        let children: Vec<Uuid> = node.children.values().copied().collect();
        for child in children {
            self.repath(child, &path)?;
        }
        Ok(())
    }

    fn copy_into(
        &mut self,
        source: Uuid,
        parent: Uuid,
        name: &str,
        uid: Uuid,
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        let src = self.node(source)?.clone();
        let entry = self.insert(parent, name, uid, src.entry.is_dir, src.data.clone(), owner)?;
        self.node_mut(uid)?.thumbnail = src.thumbnail.clone();
        for (child_name, child_uid) in &src.children {
            self.copy_into(*child_uid, uid, child_name, Uuid::new_v4(), owner)?;
        }
        Ok(entry)
    }
}

/// In-memory provider with uuid identities and native tree copy.
#[derive(Debug)]
pub struct TreeProvider {
    tree: RwLock<Tree>,
    capabilities: CapabilitySet,
    resources: ResourceRegistry,
    entries: EntryRegistry,
}

impl Default for TreeProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn uid_key(uid: Uuid) -> String {
    format!("uid:{}", uid)
}

fn coordination_key(selector: &Selector) -> Option<String> {
    match selector {
        Selector::Path(path) => Some(path.clone()),
        Selector::Uid(uid) => Some(uid_key(*uid)),
        Selector::Root | Selector::InternalId(_) => None,
    }
}

impl TreeProvider {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::new()),
            capabilities: CapabilitySet::default()
                .with(Capability::Thumbnail)
                .with(Capability::Uuid)
                .with(Capability::OperationTrace)
                .with(Capability::ReaddirUuidMode)
                .with(Capability::CopyTree)
                .with(Capability::Read)
                .with(Capability::Write)
                .with(Capability::CaseSensitive),
            resources: ResourceRegistry::new(),
            entries: EntryRegistry::new(),
        }
    }

    /// Replace the declared capability set, e.g. to drop `copy-tree`.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn entries(&self) -> &EntryRegistry {
        &self.entries
    }

    fn read_tree(&self) -> CoreResult<RwLockReadGuard<'_, Tree>> {
        self.tree
            .read()
            .map_err(|_| CoreError::Internal("tree lock poisoned".to_string()))
    }

    fn write_tree(&self) -> CoreResult<RwLockWriteGuard<'_, Tree>> {
        self.tree
            .write()
            .map_err(|_| CoreError::Internal("tree lock poisoned".to_string()))
    }

    /// Attach a thumbnail (a data URL) to a node.
    pub fn set_thumbnail(&self, uid: Uuid, thumbnail: impl Into<String>) -> CoreResult<()> {
        self.write_tree()?.node_mut(uid)?.thumbnail = Some(thumbnail.into());
        Ok(())
    }

    /// Mark a node as immutable.
    pub fn set_immutable(&self, uid: Uuid, immutable: bool) -> CoreResult<()> {
        self.write_tree()?.node_mut(uid)?.entry.immutable = immutable;
        Ok(())
    }

    /// Start creating `name` under `parent`.
    ///
    /// The new node's path and uid stay locked until the returned
    /// [`PendingWrite`] is committed or dropped.
    pub async fn begin_write(&self, parent: &FsEntry, name: &str) -> CoreResult<PendingWrite<'_>> {
        validate_file_name(name)?;
        let uid = Uuid::new_v4();
        let path = join_path(&parent.path, name);
        let keys = vec![path.clone(), uid_key(uid)];

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.resources.lock(key).await);
        }
        {
            let tree = self.read_tree()?;
            if tree.require_dir(parent.uid)?.children.contains_key(name) {
                return Err(CoreError::AlreadyExists(path));
            }
        }
        tracing::debug!(%path, %uid, "write started");
        Ok(PendingWrite {
            provider: self,
            parent: parent.uid,
            name: name.to_string(),
            uid,
            keys,
            guards,
        })
    }
}

/// A file creation that has reserved its path but not yet stored data.
#[derive(Debug)]
pub struct PendingWrite<'p> {
    provider: &'p TreeProvider,
    parent: Uuid,
    name: String,
    uid: Uuid,
    keys: Vec<String>,
    guards: Vec<ResourceGuard>,
}

impl PendingWrite<'_> {
    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// Store the node, publish it to waiting readers, then release it.
    pub fn commit(self, data: &[u8], owner: Option<UserId>) -> CoreResult<FsEntry> {
        let entry = self.provider.write_tree()?.insert(
            self.parent,
            &self.name,
            self.uid,
            false,
            data.to_vec(),
            owner,
        )?;
        self.provider.entries.publish(&self.keys, &entry);
        drop(self.guards);
        self.provider.entries.complete(&self.keys);
        tracing::debug!(path = %entry.path, uid = %entry.uid, "write committed");
        Ok(entry)
    }
}

#[async_trait]
impl FsProvider for TreeProvider {
    fn name(&self) -> &str {
        "tree"
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    async fn stat(&self, selector: &Selector, options: &StatOptions) -> CoreResult<Option<FsEntry>> {
        if let Some(key) = coordination_key(selector) {
            if let Some(entry) = wait_pending(&self.resources, &self.entries, &key).await {
                return Ok(Some(entry));
            }
        }

        let tree = self.read_tree()?;
        match tree.find(selector) {
            Some(uid) => Ok(Some(tree.entry(uid, options)?)),
            None => {
                tracing::info!(selector = %selector, provider = "tree", "stat: no such node");
                Ok(None)
            }
        }
    }

    async fn readdir(&self, dir: &FsEntry) -> CoreResult<Vec<Uuid>> {
        let tree = self.read_tree()?;
        Ok(tree.require_dir(dir.uid)?.children.values().copied().collect())
    }

    async fn copy_tree(
        &self,
        source: &FsEntry,
        parent: &FsEntry,
        target_name: &str,
        target_uid: Uuid,
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        validate_file_name(target_name)?;
        let mut tree = self.write_tree()?;
        if tree.is_ancestor(source.uid, parent.uid) {
            return Err(CoreError::InvalidInput(format!(
                "cannot copy {} into itself",
                source.path
            )));
        }
        tree.copy_into(source.uid, parent.uid, target_name, target_uid, owner)
    }

    async fn read(&self, node: &FsEntry) -> CoreResult<Vec<u8>> {
        let tree = self.read_tree()?;
        let node = tree.node(node.uid)?;
        if node.entry.is_dir {
            return Err(CoreError::InvalidInput(format!("{} is a directory", node.entry.path)));
        }
        Ok(node.data.clone())
    }

    async fn write_new(
        &self,
        parent: &FsEntry,
        name: &str,
        data: &[u8],
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        self.begin_write(parent, name).await?.commit(data, owner)
    }

    async fn write_overwrite(&self, node: &FsEntry, data: &[u8]) -> CoreResult<FsEntry> {
        let _guard = self.resources.lock(&node.path).await;
        let mut tree = self.write_tree()?;
        let stored = tree.node_mut(node.uid)?;
        if stored.entry.is_dir {
            return Err(CoreError::InvalidInput(format!("{} is a directory", node.path)));
        }
        let now = chrono::Utc::now().timestamp();
        stored.versions.push(EntryVersion {
            id: Uuid::new_v4().to_string(),
            timestamp: stored.entry.modified,
            user_id: stored.entry.owner_id,
        });
        stored.data = data.to_vec();
        stored.entry.size = data.len() as u64;
        stored.entry.modified = now;
        Ok(stored.entry.clone())
    }

    async fn mkdir(&self, parent: &FsEntry, name: &str, owner: Option<UserId>) -> CoreResult<FsEntry> {
        validate_file_name(name)?;
        let _guard = self.resources.lock(&join_path(&parent.path, name)).await;
        self.write_tree()?
            .insert(parent.uid, name, Uuid::new_v4(), true, Vec::new(), owner)
    }

    async fn unlink(&self, node: &FsEntry) -> CoreResult<()> {
        let mut tree = self.write_tree()?;
        if tree.node(node.uid)?.entry.is_dir {
            return Err(CoreError::InvalidInput(format!("{} is a directory", node.path)));
        }
        tree.detach(node.uid)?;
        Ok(())
    }

    async fn rmdir(&self, node: &FsEntry) -> CoreResult<()> {
        let mut tree = self.write_tree()?;
        let stored = tree.require_dir(node.uid)?;
        if stored.entry.parent_uid.is_none() {
            return Err(CoreError::Immutable(node.path.clone()));
        }
        if !stored.children.is_empty() {
            return Err(CoreError::DirNotEmpty(node.path.clone()));
        }
        tree.detach(node.uid)?;
        Ok(())
    }

    async fn move_node(&self, node: &FsEntry, new_parent: &FsEntry, new_name: &str) -> CoreResult<FsEntry> {
        validate_file_name(new_name)?;
        let mut tree = self.write_tree()?;
        if tree.is_ancestor(node.uid, new_parent.uid) {
            return Err(CoreError::InvalidInput(format!(
                "cannot move {} into itself",
                node.path
            )));
        }
        let target_path = {
            let parent = tree.require_dir(new_parent.uid)?;
            if parent.children.contains_key(new_name) {
                return Err(CoreError::AlreadyExists(join_path(&parent.entry.path, new_name)));
            }
            parent.entry.path.clone()
        };

        let old_parent = tree
            .node(node.uid)?
            .entry
            .parent_uid
            .ok_or_else(|| CoreError::Immutable(node.path.clone()))?;
        let old_name = tree.node(node.uid)?.entry.name.clone();
        tree.node_mut(old_parent)?.children.remove(&old_name);
        tree.node_mut(new_parent.uid)?
            .children
            .insert(new_name.to_string(), node.uid);

        let moved = tree.node_mut(node.uid)?;
        moved.entry.name = new_name.to_string();
        moved.entry.parent_uid = Some(new_parent.uid);
        moved.entry.modified = chrono::Utc::now().timestamp();
        tree.repath(node.uid, &target_path)?;
        Ok(tree.node(node.uid)?.entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn root(p: &TreeProvider) -> FsEntry {
        p.stat(&Selector::Root, &StatOptions::default()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_empty_readdir() {
        let p = TreeProvider::new();
        let dir = p.mkdir(&root(&p).await, "empty", None).await.unwrap();
        assert!(p.readdir(&dir).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stat_by_every_selector() {
        let p = TreeProvider::new();
        let dir = p.mkdir(&root(&p).await, "docs", Some(4)).await.unwrap();
        let file = p.write_new(&dir, "a.txt", b"hi", Some(4)).await.unwrap();
        let opts = StatOptions::default();

        let by_path = p.stat(&Selector::path("/docs/a.txt").unwrap(), &opts).await.unwrap();
        let by_uid = p.stat(&Selector::Uid(file.uid), &opts).await.unwrap();
        let by_id = p.stat(&Selector::InternalId(file.id.unwrap()), &opts).await.unwrap();
        assert_eq!(by_path.as_ref(), Some(&file));
        assert_eq!(by_uid.as_ref(), Some(&file));
        assert_eq!(by_id.as_ref(), Some(&file));
        file.validate().unwrap();

        assert!(p.stat(&Selector::path("/nope").unwrap(), &opts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stat_waits_for_pending_write() {
        let p = Arc::new(TreeProvider::new());
        let root = root(&p).await;
        let pending = p.begin_write(&root, "late.txt").await.unwrap();

        let reader = Arc::clone(&p);
        let stat = tokio::spawn(async move {
            reader
                .stat(&Selector::path("/late.txt").unwrap(), &StatOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!stat.is_finished());

        let written = pending.commit(b"done", None).unwrap();
        let seen = stat.await.unwrap().unwrap();
        assert_eq!(seen.map(|e| e.uid), Some(written.uid));
        assert_eq!(p.entries().listener_count("/late.txt"), 0);
    }

    #[tokio::test]
    async fn name_collisions_are_rejected() {
        let p = TreeProvider::new();
        let root = root(&p).await;
        p.write_new(&root, "x", b"", None).await.unwrap();
        let err = p.write_new(&root, "x", b"", None).await.unwrap_err();
        assert_eq!(err.code(), "item_with_same_name_exists");
        let err = p.mkdir(&root, "x", None).await.unwrap_err();
        assert_eq!(err.code(), "item_with_same_name_exists");
    }

    #[tokio::test]
    async fn rmdir_requires_empty_directory() {
        let p = TreeProvider::new();
        let dir = p.mkdir(&root(&p).await, "d", None).await.unwrap();
        p.write_new(&dir, "f", b"1", None).await.unwrap();
        assert_eq!(p.rmdir(&dir).await.unwrap_err().code(), "dir_not_empty");
    }

    #[tokio::test]
    async fn copy_tree_is_deep_and_fresh() {
        let p = TreeProvider::new();
        let root = root(&p).await;
        let src = p.mkdir(&root, "src", None).await.unwrap();
        let inner = p.write_new(&src, "f.txt", b"data", None).await.unwrap();
        p.set_thumbnail(src.uid, "data:image/png;base64,AA").unwrap();

        let target = Uuid::new_v4();
        let copy = p.copy_tree(&src, &root, "dst", target, Some(9)).await.unwrap();
        assert_eq!(copy.uid, target);
        assert_eq!(copy.path, "/dst");
        assert_eq!(copy.owner_id, Some(9));

        let children = p.readdir(&copy).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_ne!(children[0], inner.uid);
        let copied = p
            .stat(&Selector::path("/dst/f.txt").unwrap(), &StatOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.read(&copied).await.unwrap(), b"data");

        let with_thumb = p
            .stat(&Selector::Uid(target), &StatOptions::with_thumbnail())
            .await
            .unwrap()
            .unwrap();
        assert!(with_thumb.thumbnail.is_some());
    }

    #[tokio::test]
    async fn move_rewrites_descendant_paths() {
        let p = TreeProvider::new();
        let root = root(&p).await;
        let a = p.mkdir(&root, "a", None).await.unwrap();
        let b = p.mkdir(&root, "b", None).await.unwrap();
        let f = p.write_new(&a, "f", b"", None).await.unwrap();

        let moved = p.move_node(&a, &b, "renamed").await.unwrap();
        assert_eq!(moved.path, "/b/renamed");
        let f = p.stat(&Selector::Uid(f.uid), &StatOptions::default()).await.unwrap().unwrap();
        assert_eq!(f.path, "/b/renamed/f");

        let err = p.move_node(&b, &moved, "loop").await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn overwrite_keeps_versions() {
        let p = TreeProvider::new();
        let f = p.write_new(&root(&p).await, "v", b"one", None).await.unwrap();
        p.write_overwrite(&f, b"two!").await.unwrap();
        let opts = StatOptions {
            versions: true,
            ..StatOptions::default()
        };
        let f = p.stat(&Selector::Uid(f.uid), &opts).await.unwrap().unwrap();
        assert_eq!(f.size, 4);
        assert_eq!(f.versions.map(|v| v.len()), Some(1));
    }
}
