//! cumulus-kernel: the permission-resolution and storage-provider core.
//!
//! The kernel answers two questions for every filesystem request:
//!
//! - **May this actor do this?** The [`permissions`] resolver rewrites and
//!   explodes a permission string, consults implicators and configured
//!   grants, then follows user, group and app delegation chains through the
//!   [`db::Database`] contract.
//! - **Where does the node live?** Storage backends implement
//!   [`fs::FsProvider`] and advertise a [`cumulus_types::CapabilitySet`];
//!   operations branch on declared capabilities, never on concrete types.
//!
//! Multi-step work runs as a [`sequence::Sequence`] or as a traced
//! [`operation`], so nested calls show up in the [`trace::TraceService`]
//! frame tree with pending/working/stuck/ready/done status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   FilesystemOps (ops)                    │
//! │  stat · readdir · read · write · mkdir · delete · copy   │
//! └──────┬───────────────────┬────────────────────┬──────────┘
//!        │                   │                    │
//! ┌──────▼──────┐   ┌────────▼────────┐   ┌──────▼──────────┐
//! │ TraceService│   │  PermissionAcl  │   │   MountTable    │
//! │   frames    │   │ PermissionSvc   │   │  FsProvider(s)  │
//! └─────────────┘   │ scanners · db   │   └─────────────────┘
//!                   └─────────────────┘
//! ```

pub mod acl;
pub mod config;
pub mod db;
pub mod fs;
pub mod operation;
pub mod ops;
pub mod permissions;
pub mod sequence;
pub mod share;
pub mod trace;
pub mod worklist;

pub use acl::{AclAction, AclService, PermissionAcl};
pub use config::CoreConfig;
pub use db::{Database, SqliteDatabase};
pub use fs::{FsProvider, MountTable};
pub use ops::FilesystemOps;
pub use permissions::PermissionService;
pub use sequence::{Sequence, SequenceState};
pub use share::{ShareReport, ShareRequest, ShareService};
pub use trace::{FrameStatus, OperationFrame, TraceService};
pub use worklist::WorkList;

pub use cumulus_types::*;
