//! Unified error handling for npu-memory-saver
//!
//! Every error in this crate is unrecoverable: the allocator sits below a
//! host runtime that cannot keep running on top of a broken memory
//! substrate. Errors still propagate as `Result`s inside the crate so the
//! failing operation, address and tag can be attached on the way up. The C
//! entry points turn them into a logged process exit through [`fatal`].
//!
//! [`ErrorCategory`] exists for diagnostics only:
//! - Backend: a driver call returned a failure status
//! - Contract: the caller broke the allocator's contract (unknown free,
//!   null tag, hook used outside a region)
//! - Initialization: symbol resolution or environment checks failed
//! - Internal: allocator state is inconsistent (poisoned lock, lost record)

use std::fmt;
use std::panic::Location;

use crate::backend::{AclError, DevicePtr};

/// Unified error type for npu-memory-saver
#[derive(Debug, thiserror::Error)]
pub enum SaverError {
    // ========== Backend Errors ==========
    /// ACL driver call failed
    #[error("ACL error: {0}")]
    Acl(#[from] AclError),

    /// Pause of a single record failed; the batch stopped here
    #[error("pause failed at {ptr} (tag={tag}): {source}")]
    PauseFailed {
        ptr: DevicePtr,
        tag: String,
        #[source]
        source: Box<SaverError>,
    },

    /// Resume of a single record failed; the batch stopped here
    #[error("resume failed at {ptr} (tag={tag}): {source}")]
    ResumeFailed {
        ptr: DevicePtr,
        tag: String,
        #[source]
        source: Box<SaverError>,
    },

    // ========== Contract Errors ==========
    /// Free of an address this allocator does not track
    #[error("Trying to free a pointer not allocated here: {0}")]
    UntrackedAddress(DevicePtr),

    /// A required C argument was null
    #[error("{0} should not be null")]
    NullArgument(&'static str),

    /// A C argument could not be interpreted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Framework hook called while virtualization is off
    #[error("only support interesting region: {0} called outside a region")]
    OutsideRegion(&'static str),

    /// A region was entered while another one is active on this thread
    #[error("Region already active on this thread (tag={0})")]
    RegionAlreadyActive(String),

    /// Free raced a pause or resume of the same address
    #[error("Allocation {0} is being paused or resumed")]
    AllocationBusy(DevicePtr),

    // ========== Initialization Errors ==========
    /// The real driver entry point could not be resolved
    #[error("dlsym failed for {symbol}: {reason}")]
    SymbolResolution { symbol: String, reason: String },

    /// The process environment is incompatible with virtualized allocation
    #[error("Unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Host backup missing for a record that requires one
    #[error("cpu_backup should not be null for {0}")]
    BackupMissing(DevicePtr),

    /// The driver handed out an address that is already tracked
    #[error("Address {0} is already tracked")]
    DuplicateAddress(DevicePtr),

    /// A record disappeared while its pause/resume was in flight
    #[error("Allocation record {0} vanished mid-operation")]
    RecordLost(DevicePtr),

    /// Lock poisoned (a thread panicked while holding the registry)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl SaverError {
    /// Categorize the error for diagnostics
    pub fn category(&self) -> ErrorCategory {
        match self {
            SaverError::Acl(_) => ErrorCategory::Backend,

            SaverError::PauseFailed { source, .. } | SaverError::ResumeFailed { source, .. } => {
                source.category()
            }

            SaverError::UntrackedAddress(_)
            | SaverError::NullArgument(_)
            | SaverError::InvalidArgument(_)
            | SaverError::OutsideRegion(_)
            | SaverError::RegionAlreadyActive(_)
            | SaverError::AllocationBusy(_) => ErrorCategory::Contract,

            SaverError::SymbolResolution { .. }
            | SaverError::UnsupportedEnvironment(_)
            | SaverError::InvalidConfiguration(_) => ErrorCategory::Initialization,

            SaverError::BackupMissing(_)
            | SaverError::DuplicateAddress(_)
            | SaverError::RecordLost(_)
            | SaverError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the process must stop using the allocator.
    ///
    /// Always true; the method exists so call sites read as a decision
    /// rather than an assumption.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Driver call that ultimately failed, if any
    pub fn failed_call(&self) -> Option<&'static str> {
        match self {
            SaverError::Acl(err) => Some(err.call()),
            SaverError::PauseFailed { source, .. } | SaverError::ResumeFailed { source, .. } => {
                source.failed_call()
            }
            _ => None,
        }
    }
}

/// Error category for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Driver failure
    Backend,
    /// Caller broke the allocator contract
    Contract,
    /// Symbol resolution or environment failure
    Initialization,
    /// Allocator bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Contract => write!(f, "Contract"),
            ErrorCategory::Initialization => write!(f, "Initialization"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SaverError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SaverError::LockPoisoned(err.to_string())
    }
}

/// Result type used throughout the crate
pub type SaverResult<T> = std::result::Result<T, SaverError>;

/// Message written by [`fatal`], exposed for tests
pub fn fatal_message(err: &SaverError, location: &Location<'_>) -> String {
    format!(
        "[npu_memory_saver] {} category={} file={} line={}",
        err,
        err.category(),
        location.file(),
        location.line()
    )
}

/// Log `err` and terminate the process.
///
/// Reports the caller's file and line. Used only at the C boundary, where
/// there is no caller that could handle the error.
#[track_caller]
pub fn fatal(err: SaverError) -> ! {
    let location = Location::caller();
    let message = fatal_message(&err, location);
    tracing::error!(
        category = %err.category(),
        call = err.failed_call().unwrap_or("-"),
        "{}",
        message
    );
    eprintln!("{}", message);
    std::process::exit(1)
}

/// Terminate on error instead of returning it
pub trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for SaverResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let ptr = DevicePtr::from_addr(0x1000);
        assert_eq!(
            SaverError::UntrackedAddress(ptr).category(),
            ErrorCategory::Contract
        );
        assert_eq!(
            SaverError::NullArgument("tag").category(),
            ErrorCategory::Contract
        );
        assert_eq!(
            SaverError::SymbolResolution {
                symbol: "aclrtFree".to_string(),
                reason: "not found".to_string(),
            }
            .category(),
            ErrorCategory::Initialization
        );
        assert_eq!(
            SaverError::LockPoisoned("registry".to_string()).category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            SaverError::Acl(AclError::UnmapFailed("code 1".to_string())).category(),
            ErrorCategory::Backend
        );
    }

    #[test]
    fn test_batch_errors_inherit_source_category() {
        let err = SaverError::PauseFailed {
            ptr: DevicePtr::from_addr(0x2000),
            tag: "kv".to_string(),
            source: Box::new(SaverError::Acl(AclError::MemoryCopyFailed(
                "code 5".to_string(),
            ))),
        };
        assert_eq!(err.category(), ErrorCategory::Backend);
        assert_eq!(err.failed_call(), Some("aclrtMemcpy"));
        let text = err.to_string();
        assert!(text.contains("0x2000"), "{}", text);
        assert!(text.contains("tag=kv"), "{}", text);
    }

    #[test]
    fn test_every_error_is_fatal() {
        assert!(SaverError::OutsideRegion("tms_torch_malloc").is_fatal());
        assert!(SaverError::BackupMissing(DevicePtr::from_addr(1)).is_fatal());
    }

    #[test]
    fn test_fatal_message_names_location() {
        let location = Location::caller();
        let msg = fatal_message(&SaverError::NullArgument("tag"), location);
        assert!(msg.starts_with("[npu_memory_saver] tag should not be null"));
        assert!(msg.contains("category=Contract"));
        assert!(msg.contains(&format!("line={}", location.line())));
        assert!(msg.contains("error.rs"));
    }

    #[test]
    fn test_poison_error_conversion() {
        let lock = std::sync::Mutex::new(0);
        let _ = std::panic::catch_unwind(|| {
            let _guard = lock.lock().unwrap();
            panic!("poison");
        });
        let err: SaverError = lock.lock().unwrap_err().into();
        assert!(matches!(err, SaverError::LockPoisoned(_)));
    }
}
