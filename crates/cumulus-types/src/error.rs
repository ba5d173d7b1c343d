//! Error kinds shared by the resolver, the storage providers and the
//! filesystem operations.
//!
//! Callers at the system boundary map errors by [`CoreError::code`] or
//! [`CoreError::kind`], never by matching on message text.

use thiserror::Error;

/// Result type for kernel operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse error taxonomy used to pick a user-facing status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The subject does not exist (404-class).
    NotFound,
    /// Access was denied (403-class).
    PermissionDenied,
    /// A name collision on create, copy or move.
    AlreadyExists,
    /// The request conflicts with current state (409/412-class).
    Conflict,
    /// The provider lacks the capability and no fallback exists.
    Unsupported,
    /// Malformed selector, permission string or argument.
    InvalidInput,
    /// A quota or size limit was hit.
    LimitExceeded,
    /// Unexpected provider or database failure.
    Internal,
}

/// Kernel errors.
///
/// Every variant except [`CoreError::Internal`] is an "API error": an
/// expected, user-presentable outcome with a stable [`code`](Self::code).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("an item with the same name already exists: {0}")]
    AlreadyExists(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("immutable: {0}")]
    Immutable(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("destination does not exist: {0}")]
    DestDoesNotExist(String),
    #[error("invalid file name: {0}")]
    InvalidFileName(String),
    #[error("cannot copy an item into itself: {0}")]
    CopyIntoItself(String),
    #[error("cannot move an item into itself: {0}")]
    MoveIntoItself(String),
    #[error("storage limit reached")]
    StorageLimitReached,
    #[error("file too large: {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable string code consumed by WebDAV and HTTP handlers.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::PermissionDenied(_) => "permission_denied",
            CoreError::AlreadyExists(_) => "item_with_same_name_exists",
            CoreError::Unsupported(_) => "unsupported_operation",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::Immutable(_) => "immutable",
            CoreError::DirNotEmpty(_) => "dir_not_empty",
            CoreError::DestDoesNotExist(_) => "dest_does_not_exist",
            CoreError::InvalidFileName(_) => "invalid_file_name",
            CoreError::CopyIntoItself(_) => "cannot_copy_item_into_itself",
            CoreError::MoveIntoItself(_) => "cannot_move_item_into_itself",
            CoreError::StorageLimitReached => "storage_limit_reached",
            CoreError::FileTooLarge { .. } => "file_too_large",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::PermissionDenied(_) | CoreError::Immutable(_) => {
                ErrorKind::PermissionDenied
            }
            CoreError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CoreError::DirNotEmpty(_) | CoreError::DestDoesNotExist(_) => ErrorKind::Conflict,
            CoreError::Unsupported(_) => ErrorKind::Unsupported,
            CoreError::InvalidInput(_)
            | CoreError::InvalidFileName(_)
            | CoreError::CopyIntoItself(_)
            | CoreError::MoveIntoItself(_) => ErrorKind::InvalidInput,
            CoreError::StorageLimitReached | CoreError::FileTooLarge { .. } => {
                ErrorKind::LimitExceeded
            }
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for expected outcomes that carry a user-facing code.
    pub fn is_api_error(&self) -> bool {
        !matches!(self, CoreError::Internal(_))
    }

    /// Shorthand for an internal error from anything displayable.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::NotFound => CoreError::NotFound(err.to_string()),
            Io::AlreadyExists => CoreError::AlreadyExists(err.to_string()),
            Io::PermissionDenied => CoreError::PermissionDenied(err.to_string()),
            Io::DirectoryNotEmpty => CoreError::DirNotEmpty(err.to_string()),
            Io::ReadOnlyFilesystem => CoreError::Immutable(err.to_string()),
            Io::InvalidInput => CoreError::InvalidInput(err.to_string()),
            _ => CoreError::Internal(err.to_string()),
        }
    }
}
