#![forbid(unsafe_code)]

//! Shared identifiers, the crate error taxonomy, and checksum helpers.

use std::fmt;

pub mod checksum;

pub use checksum::{frame_crc32, Checksum, Crc32Fast};

/// Location of a record inside a record store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordId(pub i64);

impl RecordId {
    /// Smallest possible location; sorts before every real record.
    pub const MIN: RecordId = RecordId(i64::MIN);
    /// Largest possible location; sorts after every real record.
    pub const MAX: RecordId = RecordId(i64::MAX);

    /// Returns `true` for locations handed out by a record store.
    pub fn is_normal(self) -> bool {
        self.0 > 0 && self != Self::MAX
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque numeric identifier of one operation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an operation stopped at an interruption checkpoint.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum InterruptReason {
    /// The process is shutting down and every operation is being killed.
    Shutdown,
    /// The operation's deadline passed.
    DeadlineExceeded,
    /// Someone killed the operation explicitly.
    Killed,
    /// The fault-injection policy chose this operation.
    FaultInjected,
}

impl InterruptReason {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            InterruptReason::Shutdown => 1,
            InterruptReason::DeadlineExceeded => 2,
            InterruptReason::Killed => 3,
            InterruptReason::FaultInjected => 4,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(InterruptReason::Shutdown),
            2 => Some(InterruptReason::DeadlineExceeded),
            3 => Some(InterruptReason::Killed),
            4 => Some(InterruptReason::FaultInjected),
            _ => None,
        }
    }
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InterruptReason::Shutdown => "interrupted at shutdown",
            InterruptReason::DeadlineExceeded => "operation exceeded time limit",
            InterruptReason::Killed => "operation was interrupted",
            InterruptReason::FaultInjected => "operation was interrupted by fault injection",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by the storage and transaction core.
#[derive(thiserror::Error, Debug)]
pub enum DuskError {
    /// Filesystem failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted state failed validation.
    #[error("corruption: {0}")]
    Corruption(String),
    /// The engine refused the request while the resource is in use.
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    /// Another transaction touched the same key first; retry the unit of work.
    #[error("write conflict")]
    WriteConflict,
    /// Named object does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Collection namespace is not in the catalog.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    /// Collection namespace is already in the catalog.
    #[error("namespace exists: {0}")]
    NamespaceExists(String),
    /// An update or delete matched no document.
    #[error("no matching document: {0}")]
    NoMatchingDocument(String),
    /// Lookup key is absent.
    #[error("no such key: {0}")]
    NoSuchKey(String),
    /// Stored data has an unexpected type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A unique index already holds the key for another record.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    /// The operation was killed, timed out, or hit an injected fault.
    #[error("{0}")]
    Interrupted(InterruptReason),
    /// A lock could not be granted before its deadline.
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    /// Caller passed a malformed or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Engine failure with no closer mapping.
    #[error("engine error: {0}")]
    Engine(String),
}

impl DuskError {
    /// Stable numeric code for mapping onto a wire surface.
    pub fn code(&self) -> i32 {
        match self {
            DuskError::Io(_) => 1,
            DuskError::InvalidArgument(_) => 2,
            DuskError::NoSuchKey(_) => 4,
            DuskError::Interrupted(InterruptReason::Shutdown) => 11600,
            DuskError::Interrupted(InterruptReason::DeadlineExceeded) => 50,
            DuskError::Interrupted(_) => 11601,
            DuskError::TypeMismatch(_) => 14,
            DuskError::NotFound(_) => 70,
            DuskError::NamespaceNotFound(_) => 26,
            DuskError::NamespaceExists(_) => 48,
            DuskError::NoMatchingDocument(_) => 47,
            DuskError::LockTimeout(_) => 24,
            DuskError::WriteConflict => 112,
            DuskError::ResourceBusy(_) => 16,
            DuskError::DuplicateKey(_) => 11000,
            DuskError::Corruption(_) => 100,
            DuskError::Engine(_) => 8,
        }
    }

    /// Returns `true` for the write-conflict signal that asks the caller to
    /// restart its whole logical operation.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, DuskError::WriteConflict)
    }

    /// Returns `true` when an interruption checkpoint aborted the operation.
    pub fn is_interruption(&self) -> bool {
        matches!(self, DuskError::Interrupted(_))
    }

    /// Returns `true` for transient failures a client may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DuskError::WriteConflict | DuskError::LockTimeout(_))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DuskError>;

/// Terminates the process on a broken programming invariant.
///
/// Invariant failures are never surfaced as [`DuskError`]; continuing after one
/// risks silent data corruption.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::types::invariant_failure(stringify!($cond), format_args!($($arg)+));
        }
    };
}

/// Logs and panics; the diverging half of [`invariant!`].
#[cold]
#[track_caller]
pub fn invariant_failure(condition: &str, message: fmt::Arguments<'_>) -> ! {
    tracing::error!(invariant = condition, "{message}");
    panic!("invariant failure: {message}");
}
