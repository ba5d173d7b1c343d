//! Filesystem access control on top of the permission resolver.
//!
//! Access to a node in mode `m` is granted to the system actor, to the
//! node's owner, or to anyone holding `fs:<uid>:m` (or something that
//! implies it) on the node or one of its ancestors.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use cumulus_types::{Actor, CoreError, CoreResult, FsEntry, Selector};

use crate::fs::{MountTable, StatOptions};
use crate::permissions::{
    PermissionImplicator, PermissionRewriter, PermissionService, PermissionServiceBuilder, util,
};

/// What an actor wants to do with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclAction {
    See,
    List,
    Read,
    Write,
}

impl AclAction {
    /// The `fs:` permission mode for this action.
    pub fn mode(&self) -> &'static str {
        match self {
            AclAction::See => "see",
            AclAction::List => "list",
            AclAction::Read => "read",
            AclAction::Write => "write",
        }
    }
}

impl fmt::Display for AclAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

/// `fs:<uid>:<mode>`
pub fn fs_permission(uid: Uuid, action: AclAction) -> String {
    util::join(&["fs", &uid.to_string(), action.mode()])
}

#[async_trait]
pub trait AclService: Send + Sync {
    async fn check(&self, actor: &Actor, node: &FsEntry, action: AclAction) -> CoreResult<bool>;

    /// A permission error safe to show `actor`: it names the node only if
    /// the actor may see it.
    async fn safe_acl_error(&self, actor: &Actor, node: &FsEntry, action: AclAction) -> CoreResult<CoreError>;

    /// `Ok(())` if allowed, otherwise the safe error.
    async fn require(&self, actor: &Actor, node: &FsEntry, action: AclAction) -> CoreResult<()> {
        if self.check(actor, node, action).await? {
            return Ok(());
        }
        Err(self.safe_acl_error(actor, node, action).await?)
    }
}

/// [`AclService`] backed by [`PermissionService`].
pub struct PermissionAcl {
    permissions: Arc<PermissionService>,
    mounts: Arc<MountTable>,
}

impl PermissionAcl {
    pub fn new(permissions: Arc<PermissionService>, mounts: Arc<MountTable>) -> Self {
        Self { permissions, mounts }
    }

    async fn parent_of(&self, node: &FsEntry) -> CoreResult<Option<FsEntry>> {
        match node.parent_uid {
            Some(parent) => {
                self.mounts
                    .stat(&Selector::Uid(parent), &StatOptions::default())
                    .await
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AclService for PermissionAcl {
    async fn check(&self, actor: &Actor, node: &FsEntry, action: AclAction) -> CoreResult<bool> {
        if actor.is_system() {
            return Ok(true);
        }
        if let (Some(user), Some(owner)) = (actor.as_user(), node.owner_id) {
            if user.id == owner {
                return Ok(true);
            }
        }

        let mut current = Some(node.clone());
        while let Some(entry) = current {
            let permission = fs_permission(entry.uid, action);
            if self.permissions.check(actor, &permission).await?.is_some() {
                tracing::debug!(actor = %actor, %permission, node = %node.path, "acl granted");
                return Ok(true);
            }
            current = self.parent_of(&entry).await?;
        }
        tracing::debug!(actor = %actor, action = %action, node = %node.path, "acl denied");
        Ok(false)
    }

    async fn safe_acl_error(&self, actor: &Actor, node: &FsEntry, action: AclAction) -> CoreResult<CoreError> {
        let can_see = action == AclAction::See || self.check(actor, node, AclAction::See).await?;
        Ok(if can_see && action != AclAction::See {
            CoreError::PermissionDenied(format!("{} access to {}", action, node.path))
        } else {
            CoreError::PermissionDenied(format!("{} access to an item you cannot see", action))
        })
    }
}

/// Rewrites path-based `fs:/a/b:mode` to uid-based `fs:<uid>:mode`.
pub struct FsPathRewriter {
    mounts: Arc<MountTable>,
}

impl FsPathRewriter {
    pub fn new(mounts: Arc<MountTable>) -> Self {
        Self { mounts }
    }
}

#[async_trait]
impl PermissionRewriter for FsPathRewriter {
    fn id(&self) -> &str {
        "fs-path-to-uid"
    }

    fn matches(&self, permission: &str) -> bool {
        let parts = util::split(permission);
        parts.len() >= 2 && parts[0] == "fs" && parts[1].starts_with('/')
    }

    async fn rewrite(&self, permission: &str) -> CoreResult<String> {
        let mut parts = util::split(permission);
        let selector = Selector::path(&parts[1])?;
        let entry = self
            .mounts
            .stat(&selector, &StatOptions::default())
            .await?
            .ok_or_else(|| CoreError::NotFound(parts[1].clone()))?;
        parts[1] = entry.uid.to_string();
        Ok(util::join(&parts))
    }
}

/// Owners implicitly hold every `fs:` mode on their own nodes.
pub struct OwnerImplicator {
    mounts: Arc<MountTable>,
}

impl OwnerImplicator {
    pub fn new(mounts: Arc<MountTable>) -> Self {
        Self { mounts }
    }
}

#[async_trait]
impl PermissionImplicator for OwnerImplicator {
    fn id(&self) -> &str {
        "is-owner"
    }

    fn matches(&self, permission: &str) -> bool {
        let parts = util::split(permission);
        parts.len() == 3 && parts[0] == "fs" && Uuid::parse_str(&parts[1]).is_ok()
    }

    async fn check(&self, actor: &Actor, permission: &str) -> CoreResult<Option<Value>> {
        let Some(user) = actor.as_user() else {
            return Ok(None);
        };
        let parts = util::split(permission);
        let uid = Uuid::parse_str(&parts[1])
            .map_err(|e| CoreError::InvalidInput(format!("bad node uid in {}: {}", permission, e)))?;
        let entry = self
            .mounts
            .stat(&Selector::Uid(uid), &StatOptions::default())
            .await?;
        Ok(match entry {
            Some(entry) if entry.owner_id == Some(user.id) => Some(json!({ "via": "owner" })),
            _ => None,
        })
    }
}

impl PermissionServiceBuilder {
    /// Register the filesystem rules: path rewriting and owner implication.
    pub fn fs_rules(self, mounts: Arc<MountTable>) -> Self {
        self.rewriter(FsPathRewriter::new(Arc::clone(&mounts)))
            .implicator(OwnerImplicator::new(mounts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::db::{Database, SqliteDatabase};
    use crate::fs::{FsProvider, TreeProvider};
    use cumulus_types::UserRecord;

    struct Fixture {
        tree: Arc<TreeProvider>,
        permissions: Arc<PermissionService>,
        acl: PermissionAcl,
        alice: UserRecord,
        bob: UserRecord,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(SqliteDatabase::in_memory().unwrap());
        let tree = Arc::new(TreeProvider::new());
        let mounts = Arc::new(MountTable::single(tree.clone()));
        let permissions = PermissionService::builder(db, CoreConfig::default())
            .fs_rules(Arc::clone(&mounts))
            .build();
        let alice = permissions.directory().create_user("alice", None).await.unwrap();
        let bob = permissions.directory().create_user("bob", None).await.unwrap();
        Fixture {
            tree,
            acl: PermissionAcl::new(Arc::clone(&permissions), mounts),
            permissions,
            alice,
            bob,
        }
    }

    async fn root(tree: &TreeProvider) -> FsEntry {
        tree.stat(&Selector::Root, &StatOptions::default()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn owner_and_system_are_allowed() {
        let f = fixture().await;
        let home = f.tree.mkdir(&root(&f.tree).await, "alice", Some(f.alice.id)).await.unwrap();

        assert!(f.acl.check(&Actor::user(f.alice.clone()), &home, AclAction::Write).await.unwrap());
        assert!(f.acl.check(&Actor::system(f.bob.clone()), &home, AclAction::Write).await.unwrap());
        assert!(!f.acl.check(&Actor::user(f.bob.clone()), &home, AclAction::See).await.unwrap());
    }

    #[tokio::test]
    async fn grants_on_ancestors_apply() {
        let f = fixture().await;
        let home = f.tree.mkdir(&root(&f.tree).await, "alice", Some(f.alice.id)).await.unwrap();
        let doc = f.tree.write_new(&home, "doc.txt", b"x", Some(f.alice.id)).await.unwrap();
        let bob = Actor::user(f.bob.clone());

        f.permissions
            .grant_user_user_permission(&Actor::user(f.alice.clone()), "bob", "fs:/alice:read", json!({}), None)
            .await
            .unwrap();

        assert!(f.acl.check(&bob, &doc, AclAction::Read).await.unwrap());
        assert!(f.acl.check(&bob, &doc, AclAction::See).await.unwrap());
        assert!(!f.acl.check(&bob, &doc, AclAction::Write).await.unwrap());
    }

    #[tokio::test]
    async fn safe_error_hides_unseen_paths() {
        let f = fixture().await;
        let home = f.tree.mkdir(&root(&f.tree).await, "alice", Some(f.alice.id)).await.unwrap();
        let bob = Actor::user(f.bob.clone());

        let err = f.acl.require(&bob, &home, AclAction::Write).await.unwrap_err();
        assert_eq!(err.code(), "permission_denied");
        assert!(!err.to_string().contains("/alice"));

        f.permissions
            .grant_user_user_permission(&Actor::user(f.alice.clone()), "bob", "fs:/alice:see", json!({}), None)
            .await
            .unwrap();
        let err = f.acl.require(&bob, &home, AclAction::Write).await.unwrap_err();
        assert!(err.to_string().contains("/alice"));
    }

    #[tokio::test]
    async fn path_permissions_rewrite_to_uid() {
        let f = fixture().await;
        let home = f.tree.mkdir(&root(&f.tree).await, "alice", None).await.unwrap();
        let rewritten = f.permissions.rewrite_permission("fs:/alice:read").await.unwrap();
        assert_eq!(rewritten, format!("fs:{}:read", home.uid));
        let err = f.permissions.rewrite_permission("fs:/missing:read").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
