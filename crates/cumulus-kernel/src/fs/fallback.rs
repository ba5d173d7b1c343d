//! Per-method fallback between a new provider and a legacy one.
//!
//! Lets a backend migrate one method at a time: every method the new
//! provider implements goes to it, everything else goes to the legacy
//! provider. The routing table is fixed at construction and can be
//! overridden per method.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use cumulus_types::{Capability, CapabilitySet, CoreResult, FsEntry, Selector, UserId};

use super::provider::{FsProvider, ProviderMethod, StatOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Primary,
    Legacy,
}

pub struct FallbackProvider {
    name: String,
    primary: Arc<dyn FsProvider>,
    legacy: Arc<dyn FsProvider>,
    routes: BTreeMap<ProviderMethod, Route>,
}

impl std::fmt::Debug for FallbackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackProvider")
            .field("primary", &self.primary.name())
            .field("legacy", &self.legacy.name())
            .field("routes", &self.routes)
            .finish()
    }
}

impl FallbackProvider {
    pub fn new(primary: Arc<dyn FsProvider>, legacy: Arc<dyn FsProvider>) -> Self {
        let routes = ProviderMethod::ALL
            .into_iter()
            .map(|method| {
                let route = if primary.implements(method) {
                    Route::Primary
                } else {
                    Route::Legacy
                };
                (method, route)
            })
            .collect();
        let name = format!("{}+{}", primary.name(), legacy.name());
        Self {
            name,
            primary,
            legacy,
            routes,
        }
    }

    /// Force `method` to one side.
    pub fn route(mut self, method: ProviderMethod, route: Route) -> Self {
        self.routes.insert(method, route);
        self
    }

    pub fn route_of(&self, method: ProviderMethod) -> Route {
        self.routes.get(&method).copied().unwrap_or(Route::Legacy)
    }

    fn target(&self, method: ProviderMethod) -> &Arc<dyn FsProvider> {
        let target = match self.route_of(method) {
            Route::Primary => &self.primary,
            Route::Legacy => &self.legacy,
        };
        tracing::trace!(method = method.as_str(), provider = target.name(), "dispatch");
        target
    }
}

#[async_trait]
impl FsProvider for FallbackProvider {
    fn name(&self) -> &str {
        &self.name
    }

    /// Union of both sides, except that method-backed capabilities come
    /// only from the side that method is routed to.
    fn capabilities(&self) -> CapabilitySet {
        let gated = [
            (Capability::CopyTree, ProviderMethod::CopyTree),
            (Capability::Read, ProviderMethod::Read),
            (Capability::Write, ProviderMethod::WriteNew),
        ];
        let mut caps = self.primary.capabilities().union(&self.legacy.capabilities());
        for (cap, method) in gated {
            caps.remove(cap);
            if self.target(method).capabilities().contains(cap) {
                caps.insert(cap);
            }
        }
        caps
    }

    fn implements(&self, method: ProviderMethod) -> bool {
        self.target(method).implements(method)
    }

    async fn stat(&self, selector: &Selector, options: &StatOptions) -> CoreResult<Option<FsEntry>> {
        self.target(ProviderMethod::Stat).stat(selector, options).await
    }

    async fn readdir(&self, dir: &FsEntry) -> CoreResult<Vec<Uuid>> {
        self.target(ProviderMethod::Readdir).readdir(dir).await
    }

    async fn copy_tree(
        &self,
        source: &FsEntry,
        parent: &FsEntry,
        target_name: &str,
        target_uid: Uuid,
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        self.target(ProviderMethod::CopyTree)
            .copy_tree(source, parent, target_name, target_uid, owner)
            .await
    }

    async fn read(&self, node: &FsEntry) -> CoreResult<Vec<u8>> {
        self.target(ProviderMethod::Read).read(node).await
    }

    async fn write_new(
        &self,
        parent: &FsEntry,
        name: &str,
        data: &[u8],
        owner: Option<UserId>,
    ) -> CoreResult<FsEntry> {
        self.target(ProviderMethod::WriteNew)
            .write_new(parent, name, data, owner)
            .await
    }

    async fn write_overwrite(&self, node: &FsEntry, data: &[u8]) -> CoreResult<FsEntry> {
        self.target(ProviderMethod::WriteOverwrite)
            .write_overwrite(node, data)
            .await
    }

    async fn mkdir(&self, parent: &FsEntry, name: &str, owner: Option<UserId>) -> CoreResult<FsEntry> {
        self.target(ProviderMethod::Mkdir).mkdir(parent, name, owner).await
    }

    async fn unlink(&self, node: &FsEntry) -> CoreResult<()> {
        self.target(ProviderMethod::Unlink).unlink(node).await
    }

    async fn rmdir(&self, node: &FsEntry) -> CoreResult<()> {
        self.target(ProviderMethod::Rmdir).rmdir(node).await
    }

    async fn move_node(&self, node: &FsEntry, new_parent: &FsEntry, new_name: &str) -> CoreResult<FsEntry> {
        self.target(ProviderMethod::MoveNode)
            .move_node(node, new_parent, new_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::TreeProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Implements stat and readdir only, on top of a shared tree.
    struct ReadPath {
        tree: Arc<TreeProvider>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FsProvider for ReadPath {
        fn name(&self) -> &str {
            "read-path"
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::default().with(Capability::Uuid)
        }

        fn implements(&self, method: ProviderMethod) -> bool {
            matches!(method, ProviderMethod::Stat | ProviderMethod::Readdir)
        }

        async fn stat(&self, selector: &Selector, options: &StatOptions) -> CoreResult<Option<FsEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tree.stat(selector, options).await
        }

        async fn readdir(&self, dir: &FsEntry) -> CoreResult<Vec<Uuid>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tree.readdir(dir).await
        }
    }

    #[tokio::test]
    async fn unimplemented_methods_go_to_legacy() {
        let tree = Arc::new(TreeProvider::new());
        let primary = Arc::new(ReadPath {
            tree: Arc::clone(&tree),
            calls: AtomicUsize::new(0),
        });
        let fallback = FallbackProvider::new(primary.clone(), tree.clone());

        assert_eq!(fallback.route_of(ProviderMethod::Stat), Route::Primary);
        assert_eq!(fallback.route_of(ProviderMethod::WriteNew), Route::Legacy);

        let root = fallback
            .stat(&Selector::Root, &StatOptions::default())
            .await
            .unwrap()
            .unwrap();
        let file = fallback.write_new(&root, "f", b"abc", None).await.unwrap();
        assert_eq!(fallback.read(&file).await.unwrap(), b"abc");
        assert_eq!(fallback.readdir(&root).await.unwrap(), vec![file.uid]);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn capabilities_follow_routes() {
        let tree = Arc::new(TreeProvider::new());
        let primary = Arc::new(ReadPath {
            tree: Arc::clone(&tree),
            calls: AtomicUsize::new(0),
        });
        let fallback = FallbackProvider::new(primary.clone(), tree.clone());
        assert!(fallback.capabilities().contains(Capability::CopyTree));

        let pinned = FallbackProvider::new(primary, tree).route(ProviderMethod::CopyTree, Route::Primary);
        assert!(!pinned.capabilities().contains(Capability::CopyTree));
        assert!(!pinned.implements(ProviderMethod::CopyTree));
    }
}
