//! Storage providers.
//!
//! Backends implement [`FsProvider`] and declare a capability set;
//! [`MountTable`] routes paths to them.

pub mod coordination;
mod fallback;
mod local;
mod mounts;
mod provider;
mod tree;

pub use coordination::{EntryListener, EntryRegistry, ResourceGuard, ResourceRegistry};
pub use fallback::{FallbackProvider, Route};
pub use local::LocalProvider;
pub use mounts::{MountInfo, MountTable};
pub use provider::{FsProvider, ProviderMethod, StatOptions};
pub use tree::{PendingWrite, TreeProvider};
