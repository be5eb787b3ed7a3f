//! Unified error handling for hostforge
//!
//! Every fallible operation in the crate returns [`ForgeResult`]. Errors are
//! grouped into categories so callers can decide what to do with them:
//! - Usage errors (precondition violations such as bad alignment or map misuse)
//! - Recoverable errors (an import that did not achieve zero copy)
//! - Resource errors (host out of memory)
//! - Device errors (device calls failing or timing out)
//! - Internal errors (bugs)

use std::fmt;
use std::time::Duration;

/// Unified error type for hostforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Host Memory Errors ==========
    /// The general-purpose allocator could not satisfy the request
    #[error("Host allocation of {requested} bytes failed")]
    OutOfMemory { requested: usize },

    /// Alignment precondition violated (not a power of two, too small,
    /// stale relative to the device, or a corrupted allocation stash)
    #[error("Invalid alignment: {0}")]
    InvalidAlignment(String),

    /// Size precondition violated (zero, overflowing, or not granular)
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    // ========== Device Errors ==========
    /// A device-side buffer, queue or kernel call failed
    #[error("Device resource error: {0}")]
    DeviceResourceError(String),

    /// No usable device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The import succeeded but the device is not using the host memory
    #[error("Not zero-copy: expected backing address {expected:#x}, device reported {}", fmt_addr(*.actual))]
    NotZeroCopy {
        expected: usize,
        actual: Option<usize>,
    },

    /// A wait on the device queue did not complete in time
    #[error("Device timeout: {operation} did not complete within {timeout:?}")]
    DeviceTimeout {
        operation: String,
        timeout: Duration,
    },

    // ========== Mapping Discipline Errors ==========
    /// Illegal mapping transition or enqueue against a mapped binding
    #[error("Mapping state violation: {0}")]
    MapStateViolation(String),

    /// Write access requested on something that only allows reads (or the reverse)
    #[error("Access violation: {0}")]
    AccessViolation(String),

    // ========== Configuration Errors ==========
    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Lock poisoned (indicates a panic on the device worker)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

fn fmt_addr(addr: Option<usize>) -> String {
    match addr {
        Some(addr) => format!("{:#x}", addr),
        None => "no host-visible address".to_string(),
    }
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::InvalidAlignment(_)
            | ForgeError::InvalidSize(_)
            | ForgeError::MapStateViolation(_)
            | ForgeError::AccessViolation(_)
            | ForgeError::InvalidConfiguration(_) => ErrorCategory::Usage,

            ForgeError::NotZeroCopy { .. } => ErrorCategory::Recoverable,

            ForgeError::OutOfMemory { .. } => ErrorCategory::Resource,

            ForgeError::DeviceResourceError(_)
            | ForgeError::DeviceNotFound(_)
            | ForgeError::DeviceTimeout { .. } => ErrorCategory::Device,

            ForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error has a defined recovery path
    ///
    /// Only `NotZeroCopy` does: the caller falls back to a copy-based buffer.
    /// Everything else terminates the operation and is never retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// Check if this is a precondition violation by the caller
    pub fn is_usage_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Usage)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - Usage: programmer error, fix the call site
/// - Recoverable: fall back to the copy-based path
/// - Resource: host memory exhausted
/// - Device: the device or its driver failed
/// - Internal: report as a bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Precondition violation
    Usage,
    /// Non-fatal, has a fallback
    Recoverable,
    /// Host resource exhaustion
    Resource,
    /// Device-side failure
    Device,
    /// Bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Usage => write!(f, "Usage"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

/// Create a device resource error with context
///
/// # Examples
/// ```ignore
/// return Err(device_error!("buffer creation failed for {} bytes", size));
/// ```
#[macro_export]
macro_rules! device_error {
    ($msg:expr) => {
        $crate::error::ForgeError::DeviceResourceError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::DeviceResourceError(format!($fmt, $($arg)*))
    };
}

/// Create an alignment precondition error with context
#[macro_export]
macro_rules! alignment_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidAlignment($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidAlignment(format!($fmt, $($arg)*))
    };
}

/// Create a mapping discipline error with context
#[macro_export]
macro_rules! map_state_error {
    ($msg:expr) => {
        $crate::error::ForgeError::MapStateViolation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::MapStateViolation(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ForgeError::InvalidAlignment("3".to_string()).category(),
            ErrorCategory::Usage
        );
        assert_eq!(
            ForgeError::MapStateViolation("double map".to_string()).category(),
            ErrorCategory::Usage
        );
        assert_eq!(
            ForgeError::NotZeroCopy {
                expected: 0x1000,
                actual: Some(0x2000)
            }
            .category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            ForgeError::OutOfMemory { requested: 1 }.category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            ForgeError::DeviceTimeout {
                operation: "finish".to_string(),
                timeout: Duration::from_millis(5)
            }
            .category(),
            ErrorCategory::Device
        );
        assert_eq!(
            ForgeError::LockPoisoned("queue".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_only_not_zero_copy_is_recoverable() {
        assert!(ForgeError::NotZeroCopy {
            expected: 0,
            actual: None
        }
        .is_recoverable());

        assert!(!ForgeError::OutOfMemory { requested: 64 }.is_recoverable());
        assert!(!ForgeError::DeviceResourceError("x".to_string()).is_recoverable());
        assert!(!ForgeError::DeviceTimeout {
            operation: "map".to_string(),
            timeout: Duration::from_secs(1)
        }
        .is_recoverable());
        assert!(!ForgeError::InvalidAlignment("x".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ForgeError::NotZeroCopy {
            expected: 0x1000,
            actual: Some(0x2040),
        };
        assert_eq!(
            err.to_string(),
            "Not zero-copy: expected backing address 0x1000, device reported 0x2040"
        );

        let err = ForgeError::NotZeroCopy {
            expected: 0x1000,
            actual: None,
        };
        assert!(err.to_string().contains("no host-visible address"));

        let err = ForgeError::OutOfMemory { requested: 4096 };
        assert_eq!(err.to_string(), "Host allocation of 4096 bytes failed");
    }

    #[test]
    fn test_macros() {
        let err = device_error!("queue lost");
        assert!(matches!(err, ForgeError::DeviceResourceError(_)));

        let err = alignment_error!("alignment {} is not a power of two", 24);
        assert_eq!(
            err.to_string(),
            "Invalid alignment: alignment 24 is not a power of two"
        );

        let err = map_state_error!("already mapped");
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::{Arc, Mutex};

        let lock = Arc::new(Mutex::new(0u32));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let err: ForgeError = lock.lock().unwrap_err().into();
        assert!(err.is_internal_error());
    }

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Usage.to_string(), "Usage");
        assert_eq!(ErrorCategory::Recoverable.to_string(), "Recoverable");
        assert_eq!(ErrorCategory::Resource.to_string(), "Resource");
        assert_eq!(ErrorCategory::Device.to_string(), "Device");
        assert_eq!(ErrorCategory::Internal.to_string(), "Internal");
    }
}
