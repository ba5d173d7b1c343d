//! Low-level copy.
//!
//! Fetches the destination parent before the source so a missing parent
//! fails before thumbnail data is loaded. Providers declaring `copy-tree`
//! copy atomically. Otherwise, when fallback is enabled and both sides
//! support read/write, the tree is walked and copied node by node.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use cumulus_types::{Capability, CoreError, CoreResult, FsEntry, Selector, UserId, validate_file_name};

use super::{FilesystemOps, is_within, owner_of};
use crate::acl::AclAction;
use crate::fs::{FsProvider, StatOptions};
use crate::operation::{OpContext, Operation};

pub struct LowLevelCopy<'a> {
    pub ops: &'a FilesystemOps,
    pub source: &'a Selector,
    pub parent: &'a Selector,
    pub target_name: Option<&'a str>,
}

#[async_trait]
impl<'a> Operation for LowLevelCopy<'a> {
    type Output = FsEntry;

    fn label(&self) -> &'static str {
        "copy"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<FsEntry> {
        let target_uid = Uuid::new_v4();
        cx.field("target_uid", target_uid.to_string());

        cx.checkpoint("fetch parent");
        let parent = self.ops.resolve_destination(self.parent).await?;

        cx.checkpoint("fetch source");
        let source = self
            .ops
            .lookup(self.source, &StatOptions::with_thumbnail())
            .await?
            .ok_or_else(|| CoreError::NotFound(self.source.describe()))?;

        let target_name = self.target_name.unwrap_or(&source.name).to_string();
        validate_file_name(&target_name)?;
        cx.field("source", source.path.clone());
        cx.field("parent", parent.path.clone());

        cx.checkpoint("acl");
        self.ops.acl.require(&cx.actor, &source, AclAction::Read).await?;
        self.ops.acl.require(&cx.actor, &parent, AclAction::Write).await?;

        if is_within(&source, &parent) {
            return Err(CoreError::CopyIntoItself(format!(
                "{} into {}",
                source.path, parent.path
            )));
        }

        if let Some(existing) = self.ops.child(&parent, &target_name).await? {
            return Err(CoreError::AlreadyExists(existing.path));
        }

        let source_provider = self.ops.provider_for(&source)?;
        let dest_provider = self.ops.provider_for(&parent)?;
        let owner = owner_of(cx);

        if source_provider.capabilities().contains(Capability::CopyTree)
            && Arc::ptr_eq(source_provider, dest_provider)
        {
            cx.checkpoint("copy_tree");
            return source_provider
                .copy_tree(&source, &parent, &target_name, target_uid, owner)
                .await;
        }

        let walkable = source_provider.capabilities().contains(Capability::Read)
            && dest_provider.capabilities().contains(Capability::Write);
        if !self.ops.config.copy_fallback || !walkable {
            return Err(CoreError::Unsupported(format!(
                "{} cannot copy {} to {}",
                source_provider.name(),
                source.path,
                parent.path
            )));
        }

        tracing::debug!(
            source = %source.path,
            parent = %parent.path,
            "provider lacks copy-tree, walking"
        );
        cx.field("fallback", true);
        FallbackCopy {
            from: source_provider,
            to: dest_provider,
            source,
            parent,
            name: target_name,
            owner,
        }
        .run(cx)
        .await
    }
}

/// One node of a manual tree copy. Directories recurse as child operations.
struct FallbackCopy<'a> {
    from: &'a Arc<dyn FsProvider>,
    to: &'a Arc<dyn FsProvider>,
    source: FsEntry,
    parent: FsEntry,
    name: String,
    owner: Option<UserId>,
}

#[async_trait]
impl<'a> Operation for FallbackCopy<'a> {
    type Output = FsEntry;

    fn label(&self) -> &'static str {
        "copy-fallback"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<FsEntry> {
        cx.field("source", self.source.path.clone());

        if !self.source.is_dir {
            let data = self.from.read(&self.source).await?;
            return self.to.write_new(&self.parent, &self.name, &data, self.owner).await;
        }

        let children = self.from.readdir(&self.source).await?;
        let created = self.to.mkdir(&self.parent, &self.name, self.owner).await?;
        for uid in children {
            let Some(child) = self.from.stat(&Selector::Uid(uid), &StatOptions::default()).await? else {
                continue;
            };
            let name = child.name.clone();
            FallbackCopy {
                from: self.from,
                to: self.to,
                source: child,
                parent: created.clone(),
                name,
                owner: self.owner,
            }
            .run(cx)
            .await?;
        }
        Ok(created)
    }
}
