//! Configuration Module - Tracking Parameters
//!
//! # Examples
//!
//! ```rust
//! use nxtrack::TrackingConfig;
//!
//! let config = TrackingConfig {
//!     page_size: 4096,
//!     single_byte_guest_tracking: true,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::memory::page::system_page_size;

/// Smallest accepted page size
const MIN_PAGE_SIZE: u64 = 1024;

/// Main configuration for memory tracking
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Page size used for alignment and protection
    ///
    /// Must be a power of two.
    /// Default: system page size
    pub page_size: u64,

    /// The guest memory manager only reports the first byte of each access
    ///
    /// Handles created with `RegionFlags::UNALIGNED_ACCESS` then also protect
    /// the page before their range, and guest events are widened by one page,
    /// so accesses straddling a page boundary are still caught.
    ///
    /// Default: false
    pub single_byte_guest_tracking: bool,

    /// Log map/unmap, splits and handle creation at debug level
    ///
    /// Default: false
    pub verbose: bool,

    /// Collect tracking statistics
    ///
    /// Default: true
    pub stats_enabled: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            page_size: system_page_size(),
            single_byte_guest_tracking: false,
            verbose: false,
            stats_enabled: true,
        }
    }
}

impl TrackingConfig {
    /// Configuration with an explicit page size and defaults otherwise
    pub fn with_page_size(page_size: u64) -> Self {
        TrackingConfig {
            page_size,
            ..Default::default()
        }
    }

    /// Validate configuration
    ///
    /// ```rust
    /// use nxtrack::TrackingConfig;
    ///
    /// let config = TrackingConfig { page_size: 3000, ..Default::default() };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::InvalidPageSize(format!(
                "page_size ({}) must be a power of two",
                self.page_size
            )));
        }

        if self.page_size < MIN_PAGE_SIZE {
            return Err(ConfigError::InvalidPageSize(format!(
                "page_size ({}) must be at least {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with:
    /// - NXTRACK_PAGE_SIZE
    /// - NXTRACK_SINGLE_BYTE_GUEST
    /// - NXTRACK_VERBOSE
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("NXTRACK_PAGE_SIZE") {
            if let Ok(size) = val.parse::<u64>() {
                config.page_size = size;
            }
        }

        if let Ok(val) = std::env::var("NXTRACK_SINGLE_BYTE_GUEST") {
            config.single_byte_guest_tracking = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("NXTRACK_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }
}

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid page size: {0}")]
    InvalidPageSize(String),
}
