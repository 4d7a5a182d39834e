//! nxtrack-util - Foundation Types for Memory Tracking
//!
//! ============================================================================
//! MODULE OVERVIEW
//! ============================================================================
//!
//! Reusable building blocks that the tracking engine relies on but that carry
//! no tracking semantics of their own:
//!
//! - [`range_list`]: an ordered container of non-overlapping address ranges,
//!   supporting overlap queries, splitting and gap filling.
//! - [`error`]: error types for range validation.
//!
//! Every item stored in a [`RangeList`] implements [`NonOverlappingRange`],
//! which only asks for a start address, a size and the ability to split in
//! two at an interior address.

pub mod error;
pub mod range_list;

pub use error::RangeError;
pub use range_list::{checked_end, NonOverlappingRange, RangeList};
