//! Single-node operations: stat, readdir, read, write, mkdir, delete, move.

use std::sync::Arc;

use async_trait::async_trait;

use cumulus_types::{Capability, CoreError, CoreResult, FsEntry, Selector, validate_file_name};

use super::{FilesystemOps, is_within, owner_of};
use crate::acl::AclAction;
use crate::fs::StatOptions;
use crate::operation::{OpContext, Operation};

pub struct StatOp<'a> {
    pub ops: &'a FilesystemOps,
    pub selector: &'a Selector,
    pub options: StatOptions,
}

#[async_trait]
impl<'a> Operation for StatOp<'a> {
    type Output = Option<FsEntry>;

    fn label(&self) -> &'static str {
        "stat"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<Option<FsEntry>> {
        cx.field("selector", self.selector.describe());
        let Some(mut entry) = self.ops.lookup(self.selector, &self.options).await? else {
            return Ok(None);
        };
        self.ops.acl.require(&cx.actor, &entry, AclAction::See).await?;
        if self.options.shares {
            entry.shares = self.ops.shares_of(&entry).await?;
        }
        Ok(Some(entry))
    }
}

pub struct ReaddirOp<'a> {
    pub ops: &'a FilesystemOps,
    pub selector: &'a Selector,
}

#[async_trait]
impl<'a> Operation for ReaddirOp<'a> {
    type Output = Vec<FsEntry>;

    fn label(&self) -> &'static str {
        "readdir"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<Vec<FsEntry>> {
        let dir = self.ops.resolve(self.selector).await?;
        cx.field("path", dir.path.clone());
        if !dir.is_dir {
            return Err(CoreError::InvalidInput(format!("{} is not a directory", dir.path)));
        }
        self.ops.acl.require(&cx.actor, &dir, AclAction::List).await?;

        let provider = self.ops.provider_for(&dir)?;
        let uids = provider.readdir(&dir).await?;
        cx.checkpoint("readdir");

        let mut children = Vec::with_capacity(uids.len());
        for uid in uids {
            if let Some(child) = provider.stat(&Selector::Uid(uid), &StatOptions::default()).await? {
                children.push(child);
            }
        }
        Ok(children)
    }
}

pub struct ReadOp<'a> {
    pub ops: &'a FilesystemOps,
    pub selector: &'a Selector,
}

#[async_trait]
impl<'a> Operation for ReadOp<'a> {
    type Output = Vec<u8>;

    fn label(&self) -> &'static str {
        "read"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<Vec<u8>> {
        let node = self.ops.resolve(self.selector).await?;
        cx.field("path", node.path.clone());
        if node.is_dir {
            return Err(CoreError::InvalidInput(format!("{} is a directory", node.path)));
        }
        self.ops.acl.require(&cx.actor, &node, AclAction::Read).await?;
        let provider = self.ops.require_capability(&node, Capability::Read)?;
        provider.read(&node).await
    }
}

pub struct WriteOp<'a> {
    pub ops: &'a FilesystemOps,
    pub parent: &'a Selector,
    pub name: &'a str,
    pub data: &'a [u8],
    pub overwrite: bool,
}

#[async_trait]
impl<'a> Operation for WriteOp<'a> {
    type Output = FsEntry;

    fn label(&self) -> &'static str {
        "write"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<FsEntry> {
        validate_file_name(self.name)?;
        let size = self.data.len() as u64;
        if let Some(max) = self.ops.config.max_file_size {
            if size > max {
                return Err(CoreError::FileTooLarge { size, max });
            }
        }

        let parent = self.ops.resolve_destination(self.parent).await?;
        cx.field("parent", parent.path.clone());
        cx.field("name", self.name);
        let provider = self.ops.require_capability(&parent, Capability::Write)?;

        match self.ops.child(&parent, self.name).await? {
            Some(existing) => {
                if !self.overwrite || existing.is_dir {
                    return Err(CoreError::AlreadyExists(existing.path));
                }
                if existing.immutable {
                    return Err(CoreError::Immutable(existing.path));
                }
                self.ops.acl.require(&cx.actor, &existing, AclAction::Write).await?;
                cx.checkpoint("overwrite");
                provider.write_overwrite(&existing, self.data).await
            }
            None => {
                self.ops.acl.require(&cx.actor, &parent, AclAction::Write).await?;
                cx.checkpoint("write_new");
                provider.write_new(&parent, self.name, self.data, owner_of(cx)).await
            }
        }
    }
}

pub struct MkdirOp<'a> {
    pub ops: &'a FilesystemOps,
    pub parent: &'a Selector,
    pub name: &'a str,
}

#[async_trait]
impl<'a> Operation for MkdirOp<'a> {
    type Output = FsEntry;

    fn label(&self) -> &'static str {
        "mkdir"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<FsEntry> {
        validate_file_name(self.name)?;
        let parent = self.ops.resolve_destination(self.parent).await?;
        cx.field("parent", parent.path.clone());
        if let Some(existing) = self.ops.child(&parent, self.name).await? {
            return Err(CoreError::AlreadyExists(existing.path));
        }
        self.ops.acl.require(&cx.actor, &parent, AclAction::Write).await?;
        let provider = self.ops.require_capability(&parent, Capability::Write)?;
        provider.mkdir(&parent, self.name, owner_of(cx)).await
    }
}

/// What a [`DeleteOp`] removes: a caller's selector, resolved inside the
/// operation's frame, or a node already in hand during recursion.
pub enum DeleteTarget<'a> {
    Selector(&'a Selector),
    Node(FsEntry),
}

pub struct DeleteOp<'a> {
    pub ops: &'a FilesystemOps,
    pub target: DeleteTarget<'a>,
    pub recursive: bool,
}

#[async_trait]
impl<'a> Operation for DeleteOp<'a> {
    type Output = ();

    fn label(&self) -> &'static str {
        "delete"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<()> {
        let resolved;
        let node = match &self.target {
            DeleteTarget::Node(node) => node,
            DeleteTarget::Selector(selector) => {
                cx.field("selector", selector.describe());
                resolved = self.ops.resolve(selector).await?;
                &resolved
            }
        };
        cx.field("path", node.path.clone());
        if node.immutable || node.is_root() {
            return Err(CoreError::Immutable(node.path.clone()));
        }
        self.ops.acl.require(&cx.actor, node, AclAction::Write).await?;
        let provider = self.ops.require_capability(node, Capability::Write)?;

        if !node.is_dir {
            return provider.unlink(node).await;
        }

        let children = provider.readdir(node).await?;
        if !children.is_empty() {
            if !self.recursive {
                return Err(CoreError::DirNotEmpty(node.path.clone()));
            }
            for uid in children {
                let Some(child) = provider.stat(&Selector::Uid(uid), &StatOptions::default()).await? else {
                    continue;
                };
                DeleteOp {
                    ops: self.ops,
                    target: DeleteTarget::Node(child),
                    recursive: true,
                }
                .run(cx)
                .await?;
            }
        }
        provider.rmdir(node).await
    }
}

pub struct MoveOp<'a> {
    pub ops: &'a FilesystemOps,
    pub source: &'a Selector,
    pub dest_parent: &'a Selector,
    pub new_name: Option<&'a str>,
}

#[async_trait]
impl<'a> Operation for MoveOp<'a> {
    type Output = FsEntry;

    fn label(&self) -> &'static str {
        "move"
    }

    async fn execute(&self, cx: &OpContext) -> CoreResult<FsEntry> {
        let source = self.ops.resolve(self.source).await?;
        let name = self.new_name.unwrap_or(&source.name).to_string();
        validate_file_name(&name)?;
        if source.immutable || source.is_root() {
            return Err(CoreError::Immutable(source.path.clone()));
        }

        let dest = self.ops.resolve_destination(self.dest_parent).await?;
        cx.field("source", source.path.clone());
        cx.field("destination", cumulus_types::join_path(&dest.path, &name));

        self.ops.acl.require(&cx.actor, &source, AclAction::Write).await?;
        self.ops.acl.require(&cx.actor, &dest, AclAction::Write).await?;

        if is_within(&source, &dest) {
            return Err(CoreError::MoveIntoItself(format!("{} into {}", source.path, dest.path)));
        }

        if let Some(existing) = self.ops.child(&dest, &name).await? {
            return Err(CoreError::AlreadyExists(existing.path));
        }

        let provider = self.ops.require_capability(&source, Capability::Write)?;
        let dest_provider = self.ops.provider_for(&dest)?;
        if !Arc::ptr_eq(provider, dest_provider) {
            return Err(CoreError::Unsupported(format!(
                "move from {} to {} crosses providers",
                source.path, dest.path
            )));
        }
        provider.move_node(&source, &dest, &name).await
    }
}
