//! The storage provider contract.

use async_trait::async_trait;
use uuid::Uuid;

use cumulus_types::{CapabilitySet, CoreError, CoreResult, FsEntry, Selector, UserId};

/// Which optional attributes `stat` should fill in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatOptions {
    pub thumbnail: bool,
    pub versions: bool,
    pub shares: bool,
    pub subdomains: bool,
}

impl StatOptions {
    pub fn with_thumbnail() -> Self {
        Self {
            thumbnail: true,
            ..Self::default()
        }
    }
}

/// Every member of [`FsProvider`] that can be dispatched independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderMethod {
    Stat,
    Readdir,
    CopyTree,
    Read,
    WriteNew,
    WriteOverwrite,
    Mkdir,
    Unlink,
    Rmdir,
    MoveNode,
}

impl ProviderMethod {
    pub const ALL: [ProviderMethod; 10] = [
        ProviderMethod::Stat,
        ProviderMethod::Readdir,
        ProviderMethod::CopyTree,
        ProviderMethod::Read,
        ProviderMethod::WriteNew,
        ProviderMethod::WriteOverwrite,
        ProviderMethod::Mkdir,
        ProviderMethod::Unlink,
        ProviderMethod::Rmdir,
        ProviderMethod::MoveNode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMethod::Stat => "stat",
            ProviderMethod::Readdir => "readdir",
            ProviderMethod::CopyTree => "copy_tree",
            ProviderMethod::Read => "read",
            ProviderMethod::WriteNew => "write_new",
            ProviderMethod::WriteOverwrite => "write_overwrite",
            ProviderMethod::Mkdir => "mkdir",
            ProviderMethod::Unlink => "unlink",
            ProviderMethod::Rmdir => "rmdir",
            ProviderMethod::MoveNode => "move_node",
        }
    }
}

pub(crate) fn unsupported(provider: &str, method: ProviderMethod) -> CoreError {
    CoreError::Unsupported(format!("{} does not implement {}", provider, method.as_str()))
}

/// A storage backend.
///
/// Callers must consult [`capabilities`](Self::capabilities) before relying
/// on optional behavior. Methods a backend does not implement keep their
/// default body, which fails with `unsupported_operation`, and the backend
/// reports them as absent through [`implements`](Self::implements).
///
/// Every node argument is an entry previously returned by this provider.
#[async_trait]
pub trait FsProvider: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &str;

    /// The capabilities this provider declares. Not cached by callers.
    fn capabilities(&self) -> CapabilitySet;

    /// Whether this provider supplies its own body for `method`.
    fn implements(&self, method: ProviderMethod) -> bool {
        let _ = method;
        true
    }

    /// Resolve a selector. `Ok(None)` means the node does not exist.
    async fn stat(&self, selector: &Selector, options: &StatOptions) -> CoreResult<Option<FsEntry>>;

    /// Uids of a directory's immediate children.
    async fn readdir(&self, dir: &FsEntry) -> CoreResult<Vec<Uuid>>;

    /// Copy `source` and everything under it into `parent` as
    /// `target_name`, giving the new top node `target_uid`. Copies belong
    /// to `owner`.
    ///
    /// Only available when the provider declares `copy-tree`.
    async fn copy_tree(
        &self,
        source: &FsEntry,
        parent: &FsEntry,
        target_name: &str,
        target_uid: Uuid,
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        let _ = (source, parent, target_name, target_uid, owner);
        Err(unsupported(self.name(), ProviderMethod::CopyTree))
    }

    async fn read(&self, node: &FsEntry) -> CoreResult<Vec<u8>> {
        let _ = node;
        Err(unsupported(self.name(), ProviderMethod::Read))
    }

    /// Create a new file named `name` in `parent`.
    async fn write_new(
        &self,
        parent: &FsEntry,
        name: &str,
        data: &[u8],
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        let _ = (parent, name, data, owner);
        Err(unsupported(self.name(), ProviderMethod::WriteNew))
    }

    /// Replace the contents of an existing file.
    async fn write_overwrite(&self, node: &FsEntry, data: &[u8]) -> CoreResult<FsEntry> {
        let _ = (node, data);
        Err(unsupported(self.name(), ProviderMethod::WriteOverwrite))
    }

    async fn mkdir(&self, parent: &FsEntry, name: &str, owner: Option<UserId>) -> CoreResult<FsEntry> {
        let _ = (parent, name, owner);
        Err(unsupported(self.name(), ProviderMethod::Mkdir))
    }

    /// Remove a file.
    async fn unlink(&self, node: &FsEntry) -> CoreResult<()> {
        let _ = node;
        Err(unsupported(self.name(), ProviderMethod::Unlink))
    }

    /// Remove an empty directory.
    async fn rmdir(&self, node: &FsEntry) -> CoreResult<()> {
        let _ = node;
        Err(unsupported(self.name(), ProviderMethod::Rmdir))
    }

    async fn move_node(&self, node: &FsEntry, new_parent: &FsEntry, new_name: &str) -> CoreResult<FsEntry> {
        let _ = (node, new_parent, new_name);
        Err(unsupported(self.name(), ProviderMethod::MoveNode))
    }
}
