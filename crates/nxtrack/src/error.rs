//! Error Module - Tracking Error Types
//!
//! # Error Categories
//!
//! ## Access Errors
//! - `InvalidMemoryRegion` - An access hit memory that is neither tracked nor
//!   mapped. Protection cannot be lifted from such a page, so the faulting
//!   access can never complete.
//!
//! ## Usage Errors
//! - `InvalidArgument` - A factory was given an unusable range or granularity
//! - `Configuration` - Invalid tracking configuration
//! - `Range` - Empty or overflowing address range
//!
//! Using a handle after disposal is not represented here: disposal consumes
//! the handle, so such misuse does not compile.

use crate::config::ConfigError;
use nxtrack_util::RangeError;
use thiserror::Error;

/// Main error type for all tracking operations
#[derive(Debug, Error)]
pub enum TrackingError {
    /// Access to memory that is neither tracked nor mapped
    ///
    /// **When returned:** `virtual_memory_event` found no region for the
    /// access and the memory manager reports the range unmapped. The
    /// invalid access handler has already been called.
    ///
    /// **Recovery strategy:** None. The faulting access cannot be serviced.
    #[error("Invalid memory region: address {address:#x}, size {size:#x}")]
    InvalidMemoryRegion { address: u64, size: u64 },

    /// Invalid argument
    ///
    /// **Example scenarios:**
    /// - Granularity of zero, or not a multiple of the page size
    /// - Seed handle outside the multi-region range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Address range error
    #[error("Range error: {0}")]
    Range(#[from] RangeError),
}

impl TrackingError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        false
    }

    /// Check if this error indicates a bug in the caller
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            TrackingError::InvalidArgument(_) | TrackingError::Range(_)
        )
    }
}

/// Result type alias for tracking operations
pub type Result<T> = std::result::Result<T, TrackingError>;
