//! Filesystem operations.
//!
//! [`FilesystemOps`] is the entry point request handlers use. Every method
//! runs as a traced [`Operation`](crate::operation::Operation), enforces
//! access through the [`AclService`] and raises the stable error codes
//! handlers map to status codes.

mod copy;
mod node;

pub use copy::LowLevelCopy;
pub use node::{DeleteOp, DeleteTarget, MkdirOp, MoveOp, ReadOp, ReaddirOp, StatOp, WriteOp};

use std::sync::Arc;

use cumulus_types::{
    Actor, Capability, CoreError, CoreResult, EntryShares, FsEntry, Selector, ShareHolder,
};

use crate::acl::AclService;
use crate::config::CoreConfig;
use crate::fs::{FsProvider, MountTable, StatOptions};
use crate::operation::{OpContext, Operation};
use crate::permissions::PermissionService;
use crate::trace::TraceService;

/// Traced, access-controlled filesystem operations.
pub struct FilesystemOps {
    mounts: Arc<MountTable>,
    acl: Arc<dyn AclService>,
    trace: TraceService,
    config: CoreConfig,
    permissions: Option<Arc<PermissionService>>,
}

impl FilesystemOps {
    pub fn new(
        mounts: Arc<MountTable>,
        acl: Arc<dyn AclService>,
        trace: TraceService,
        config: CoreConfig,
    ) -> Self {
        Self {
            mounts,
            acl,
            trace,
            config,
            permissions: None,
        }
    }

    /// Enables share listings in `stat`.
    pub fn with_permissions(mut self, permissions: Arc<PermissionService>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn mounts(&self) -> &Arc<MountTable> {
        &self.mounts
    }

    pub fn trace(&self) -> &TraceService {
        &self.trace
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// A fresh top-level context for `actor`.
    pub fn context(&self, actor: &Actor) -> OpContext {
        OpContext::new(actor.clone(), self.trace.clone())
    }

    pub async fn stat(&self, actor: &Actor, selector: &Selector, options: StatOptions) -> CoreResult<Option<FsEntry>> {
        StatOp { ops: self, selector, options }.run(&self.context(actor)).await
    }

    pub async fn readdir(&self, actor: &Actor, selector: &Selector) -> CoreResult<Vec<FsEntry>> {
        ReaddirOp { ops: self, selector }.run(&self.context(actor)).await
    }

    pub async fn read(&self, actor: &Actor, selector: &Selector) -> CoreResult<Vec<u8>> {
        ReadOp { ops: self, selector }.run(&self.context(actor)).await
    }

    /// Create `name` in `parent`, or replace it when `overwrite` is set.
    pub async fn write(
        &self,
        actor: &Actor,
        parent: &Selector,
        name: &str,
        data: &[u8],
        overwrite: bool,
    ) -> CoreResult<FsEntry> {
        WriteOp {
            ops: self,
            parent,
            name,
            data,
            overwrite,
        }
        .run(&self.context(actor))
        .await
    }

    pub async fn mkdir(&self, actor: &Actor, parent: &Selector, name: &str) -> CoreResult<FsEntry> {
        MkdirOp { ops: self, parent, name }.run(&self.context(actor)).await
    }

    /// Delete a node. Non-empty directories need `recursive`.
    pub async fn delete(&self, actor: &Actor, selector: &Selector, recursive: bool) -> CoreResult<()> {
        DeleteOp {
            ops: self,
            target: DeleteTarget::Selector(selector),
            recursive,
        }
        .run(&self.context(actor))
        .await
    }

    /// Move `source` into `dest_parent`, optionally renaming it.
    pub async fn move_node(
        &self,
        actor: &Actor,
        source: &Selector,
        dest_parent: &Selector,
        new_name: Option<&str>,
    ) -> CoreResult<FsEntry> {
        MoveOp {
            ops: self,
            source,
            dest_parent,
            new_name,
        }
        .run(&self.context(actor))
        .await
    }

    /// Copy `source` into `dest_parent`, optionally renaming the copy.
    pub async fn copy(
        &self,
        actor: &Actor,
        source: &Selector,
        dest_parent: &Selector,
        new_name: Option<&str>,
    ) -> CoreResult<FsEntry> {
        LowLevelCopy {
            ops: self,
            source,
            parent: dest_parent,
            target_name: new_name,
        }
        .run(&self.context(actor))
        .await
    }

    // ----------------------------------------------------------------
    // Shared helpers
    // ----------------------------------------------------------------

    async fn lookup(&self, selector: &Selector, options: &StatOptions) -> CoreResult<Option<FsEntry>> {
        self.mounts.stat(selector, options).await
    }

    /// Resolve a node that must exist.
    async fn resolve(&self, selector: &Selector) -> CoreResult<FsEntry> {
        self.lookup(selector, &StatOptions::default())
            .await?
            .ok_or_else(|| CoreError::NotFound(selector.describe()))
    }

    /// Resolve a destination directory.
    async fn resolve_destination(&self, selector: &Selector) -> CoreResult<FsEntry> {
        let dest = self
            .lookup(selector, &StatOptions::default())
            .await?
            .ok_or_else(|| CoreError::DestDoesNotExist(selector.describe()))?;
        if !dest.is_dir {
            return Err(CoreError::DestDoesNotExist(format!(
                "{} is not a directory",
                dest.path
            )));
        }
        Ok(dest)
    }

    async fn child(&self, parent: &FsEntry, name: &str) -> CoreResult<Option<FsEntry>> {
        let path = cumulus_types::join_path(&parent.path, name);
        self.lookup(&Selector::Path(path), &StatOptions::default()).await
    }

    fn provider_for(&self, entry: &FsEntry) -> CoreResult<&Arc<dyn FsProvider>> {
        self.mounts.provider_for(entry)
    }

    /// Fail unless the provider owning `entry` declares `cap`.
    fn require_capability(&self, entry: &FsEntry, cap: Capability) -> CoreResult<&Arc<dyn FsProvider>> {
        let provider = self.provider_for(entry)?;
        if !provider.capabilities().contains(cap) {
            return Err(CoreError::Unsupported(format!(
                "{} does not support {}",
                provider.name(),
                cap.as_str()
            )));
        }
        Ok(provider)
    }

    async fn shares_of(&self, entry: &FsEntry) -> CoreResult<Option<EntryShares>> {
        let (Some(permissions), Some(owner_id)) = (&self.permissions, entry.owner_id) else {
            return Ok(None);
        };
        let Some(owner) = permissions.directory().user_by_id(owner_id).await? else {
            return Ok(None);
        };
        let issued = permissions
            .query_issuer_permissions_by_prefix(&owner, &format!("fs:{}", entry.uid))
            .await?;
        Ok(Some(EntryShares {
            users: issued
                .users
                .into_iter()
                .map(|(user, permission)| ShareHolder {
                    name: user.username,
                    permission,
                })
                .collect(),
            apps: issued
                .apps
                .into_iter()
                .map(|(app, permission)| ShareHolder {
                    name: app.name,
                    permission,
                })
                .collect(),
        }))
    }
}

/// True when `dest` is `source` or sits somewhere below it.
fn is_within(source: &FsEntry, dest: &FsEntry) -> bool {
    if dest.uid == source.uid {
        return true;
    }
    let prefix = format!("{}/", source.path.trim_end_matches('/'));
    dest.path.starts_with(&prefix)
}

fn owner_of(cx: &OpContext) -> Option<cumulus_types::UserId> {
    Some(cx.actor.user_record().id)
}
