//! Pure data types for cumulus: actors, node selectors, entries,
//! provider capabilities and permission readings.
//!
//! This crate is a leaf dependency with no async runtime and no I/O, so
//! HTTP or WebDAV front-ends can speak the kernel's vocabulary without
//! pulling in the resolver, the database layer or tokio.

pub mod actor;
pub mod capability;
pub mod error;
pub mod node;
pub mod reading;

// Flat re-exports for convenience
pub use actor::*;
pub use capability::*;
pub use error::*;
pub use node::*;
pub use reading::*;
