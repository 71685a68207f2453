use crate::backend::{FileError, MemoryFailureError};
use core::sync::atomic::{AtomicBool, Ordering};
use log::warn;

/// Linux-compatible error numbers reported by [`AdviseError::errno`].
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const EOPNOTSUPP: i32 = 95;
    pub const EHWPOISON: i32 = 133;
    pub const ERESTARTNOINTR: i32 = 513;
}

/// Why an advice request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdviseError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("range includes unmapped memory")]
    NoMapping,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("mapping does not permit the operation")]
    AccessDenied,
    /// The mapping is backed by a file where anonymous memory is required.
    #[error("mapping is backed by a file")]
    BadFile,
    #[error("kernel resources temporarily exhausted")]
    ResourceExhausted,
    #[error("out of memory")]
    OutOfMemory,
    #[error("interrupted by a fatal signal")]
    Interrupted,
    #[error("I/O error")]
    Io,
    #[error("resource busy")]
    Busy,
    #[error("operation not supported by the backing file")]
    NotSupported,
    #[error("operation must be restarted")]
    Restart,
    #[error("memory is poisoned")]
    Poisoned,
    #[error("bad address")]
    Fault,
}

impl AdviseError {
    /// The positive errno a system-call layer reports for this error.
    ///
    /// [`ResourceExhausted`](Self::ResourceExhausted) maps to `EAGAIN` so callers
    /// retry instead of treating transient pressure as a permanent failure.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::NoMapping | Self::OutOfMemory => errno::ENOMEM,
            Self::PermissionDenied => errno::EPERM,
            Self::AccessDenied => errno::EACCES,
            Self::BadFile => errno::EBADF,
            Self::ResourceExhausted => errno::EAGAIN,
            Self::Interrupted => errno::EINTR,
            Self::Io => errno::EIO,
            Self::Busy => errno::EBUSY,
            Self::NotSupported => errno::EOPNOTSUPP,
            Self::Restart => errno::ERESTARTNOINTR,
            Self::Poisoned => errno::EHWPOISON,
            Self::Fault => errno::EFAULT,
        }
    }

    /// Whether re-issuing the same request may succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ResourceExhausted | Self::Restart)
    }
}

/// Structural failures of the mapping tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("no mapping at the given address")]
    NotFound,
    #[error("range overlaps an existing mapping")]
    Overlap,
    #[error("range is empty, misaligned or outside user space")]
    InvalidRange,
    #[error("mapping count limit reached")]
    TooManyMappings,
    #[error("file-backed mappings cannot be named")]
    FileBacked,
}

impl From<MappingError> for AdviseError {
    fn from(e: MappingError) -> Self {
        match e {
            MappingError::NotFound => Self::NoMapping,
            MappingError::TooManyMappings => Self::ResourceExhausted,
            MappingError::FileBacked => Self::BadFile,
            MappingError::Overlap | MappingError::InvalidRange => Self::InvalidArgument,
        }
    }
}

/// Failures of the fault resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("no mapping covers the address")]
    NoMapping,
    #[error("out of memory")]
    OutOfMemory,
    #[error("access not permitted by the mapping")]
    Fault,
    #[error("page is poisoned")]
    Poisoned,
    #[error("mapping cannot be faulted in")]
    InvalidArgument,
    #[error("interrupted by a fatal signal")]
    Interrupted,
    #[error("swap-in failed")]
    Io,
}

/// How a failed fault surfaces to the caller. Errors without a meaning
/// of their own are logged once and reported as out of memory.
impl From<FaultError> for AdviseError {
    fn from(e: FaultError) -> Self {
        static WARNED: AtomicBool = AtomicBool::new(false);
        match e {
            FaultError::Interrupted => Self::Interrupted,
            FaultError::InvalidArgument => Self::InvalidArgument,
            FaultError::Poisoned => Self::Poisoned,
            FaultError::Fault => Self::Fault,
            FaultError::NoMapping | FaultError::OutOfMemory => Self::OutOfMemory,
            FaultError::Io => {
                if !WARNED.swap(true, Ordering::Relaxed) {
                    warn!("unexpected fault error: {e}");
                }
                Self::OutOfMemory
            }
        }
    }
}

impl From<FileError> for AdviseError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotSupported => Self::NotSupported,
            FileError::PermissionDenied => Self::AccessDenied,
            FileError::Io => Self::Io,
        }
    }
}

impl From<MemoryFailureError> for AdviseError {
    fn from(e: MemoryFailureError) -> Self {
        match e {
            MemoryFailureError::NotSupported => Self::NotSupported,
            MemoryFailureError::Busy => Self::Busy,
            MemoryFailureError::Poisoned => Self::Poisoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_reported_as_retryable() {
        let e = AdviseError::from(MappingError::TooManyMappings);
        assert_eq!(e, AdviseError::ResourceExhausted);
        assert_eq!(e.errno(), errno::EAGAIN);
        assert!(e.is_retryable());
        assert!(!AdviseError::NoMapping.is_retryable());
    }

    #[test]
    fn file_backed_naming_is_a_bad_file() {
        let e = AdviseError::from(MappingError::FileBacked);
        assert_eq!(e, AdviseError::BadFile);
        assert_eq!(e.errno(), errno::EBADF);
    }

    #[test]
    fn fault_errors_map_to_advice_errors() {
        assert_eq!(AdviseError::from(FaultError::NoMapping), AdviseError::OutOfMemory);
        assert_eq!(AdviseError::from(FaultError::Fault), AdviseError::Fault);
        assert_eq!(AdviseError::from(FaultError::Poisoned), AdviseError::Poisoned);
        assert_eq!(AdviseError::from(FaultError::OutOfMemory), AdviseError::OutOfMemory);
        assert_eq!(AdviseError::from(FaultError::Interrupted), AdviseError::Interrupted);
        assert_eq!(
            AdviseError::from(FaultError::InvalidArgument),
            AdviseError::InvalidArgument
        );
        assert_eq!(AdviseError::from(FaultError::Io), AdviseError::OutOfMemory);
    }

    #[test]
    fn restart_and_poison_have_dedicated_codes() {
        assert_eq!(AdviseError::Restart.errno(), errno::ERESTARTNOINTR);
        assert_eq!(AdviseError::Poisoned.errno(), errno::EHWPOISON);
        assert_eq!(AdviseError::NoMapping.errno(), errno::ENOMEM);
    }
}
