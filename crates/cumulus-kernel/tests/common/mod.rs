//! Shared fixtures for kernel integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use cumulus_kernel::db::Row;
use cumulus_kernel::fs::{StatOptions, TreeProvider};
use cumulus_kernel::{
    Actor, CoreConfig, CoreResult, Database, FilesystemOps, FsEntry, FsProvider, MountTable,
    PermissionAcl, PermissionService, Selector, SqliteDatabase, TraceService, UserRecord,
};

/// In-memory SQLite that counts round-trips.
pub struct CountingDatabase {
    inner: SqliteDatabase,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl CountingDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteDatabase::in_memory().unwrap(),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.reads.store(0, Ordering::SeqCst);
        self.writes.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for CountingDatabase {
    async fn read(&self, sql: &str, params: &[Value]) -> CoreResult<Vec<Row>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(sql, params).await
    }

    async fn write(&self, sql: &str, params: &[Value]) -> CoreResult<u64> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(sql, params).await
    }
}

/// A kernel over one tree provider mounted at `/`.
pub struct Kernel {
    pub db: Arc<CountingDatabase>,
    pub tree: Arc<TreeProvider>,
    pub mounts: Arc<MountTable>,
    pub permissions: Arc<PermissionService>,
    pub ops: FilesystemOps,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        Self::with_tree(TreeProvider::new(), config)
    }

    pub fn with_tree(tree: TreeProvider, config: CoreConfig) -> Self {
        let tree = Arc::new(tree);
        Self::with_mounts(tree.clone(), MountTable::single(tree), config)
    }

    pub fn with_mounts(tree: Arc<TreeProvider>, mounts: MountTable, config: CoreConfig) -> Self {
        let db = CountingDatabase::new();
        let mounts = Arc::new(mounts);
        let permissions = PermissionService::builder(db.clone(), config.clone())
            .fs_rules(Arc::clone(&mounts))
            .build();
        let acl = Arc::new(PermissionAcl::new(Arc::clone(&permissions), Arc::clone(&mounts)));
        let ops = FilesystemOps::new(Arc::clone(&mounts), acl, TraceService::new(), config)
            .with_permissions(Arc::clone(&permissions));
        Self {
            db,
            tree,
            mounts,
            permissions,
            ops,
        }
    }

    pub async fn user(&self, username: &str) -> (UserRecord, Actor) {
        let user = self
            .permissions
            .directory()
            .create_user(username, Some(&format!("{}@example.com", username)))
            .await
            .unwrap();
        (user.clone(), Actor::user(user))
    }

    /// A user with a home directory `/<username>` they own.
    pub async fn user_with_home(&self, username: &str) -> (Actor, FsEntry) {
        let (user, actor) = self.user(username).await;
        let home = self.tree.mkdir(&self.root().await, username, Some(user.id)).await.unwrap();
        (actor, home)
    }

    pub async fn root(&self) -> FsEntry {
        self.tree
            .stat(&Selector::Root, &StatOptions::default())
            .await
            .unwrap()
            .unwrap()
    }
}

pub fn path(p: &str) -> Selector {
    Selector::path(p).unwrap()
}
