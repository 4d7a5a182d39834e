//! Core error types for nxtrack-util crate

use thiserror::Error;

/// Error type for address range validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// A range must cover at least one byte
    #[error("Empty range at address {address:#x}")]
    EmptyRange { address: u64 },

    /// `address + size` does not fit in the address space
    #[error("Range overflows the address space: address {address:#x}, size {size:#x}")]
    Overflow { address: u64, size: u64 },
}
