//! Volatility Heuristic
//!
//! Reprotecting a page that is written again right after every check costs a
//! protection change plus a fault per cycle and buys nothing. A handle that
//! keeps being found dirty shortly after it was cleared is therefore promoted
//! to *volatile*: it always reports dirty and skips reprotection until its
//! state is explicitly reset.
//!
//! ```text
//!            cleared while checks are infrequent-but-present
//! Checking ──────────────────────────────────▶ FrequentlyDirty(1..)
//!    ▲                                               │
//!    │ checks too sparse / reset                     │ streak reaches
//!    └───────────────────────────────────────────────┤ VOLATILE_THRESHOLD
//!                                                    ▼
//!                                                 Volatile
//! ```

/// Checks since the last reprotect below which a handle counts as checked
/// between writes.
pub const CHECK_COUNT_FOR_INFREQUENT: i32 = 3;

/// Consecutive dirty-after-clear cycles that make a handle volatile.
pub const VOLATILE_THRESHOLD: u32 = 5;

/// Where a handle stands in the volatility state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityState {
    /// Dirty flag consumed normally
    Checking,
    /// Found dirty right after being cleared this many times in a row
    FrequentlyDirty(u32),
    /// Always reported dirty, reprotection skipped
    Volatile,
}

/// Counters driving [`VolatilityState`] transitions
#[derive(Debug)]
pub(crate) struct Volatility {
    check_count: i32,
    state: VolatilityState,
}

impl Volatility {
    pub fn new() -> Self {
        Self {
            check_count: 0,
            state: VolatilityState::Checking,
        }
    }

    pub fn state(&self) -> VolatilityState {
        self.state
    }

    pub fn is_volatile(&self) -> bool {
        self.state == VolatilityState::Volatile
    }

    /// The dirty flag was inspected
    pub fn record_check(&mut self) {
        self.check_count += 1;
    }

    /// Forget the streak and leave the volatile state
    pub fn clear(&mut self) {
        self.state = VolatilityState::Checking;
    }

    /// Account for a reprotect. Returns `true` if the handle just became
    /// volatile.
    pub fn on_reprotect(
        &mut self,
        protection_changed: bool,
        as_dirty: bool,
        consecutive_check: bool,
        has_pre_action: bool,
    ) -> bool {
        if !protection_changed {
            // The handle was only forced dirty; no write was intercepted, so
            // the check that found it does not count.
            self.check_count -= 1;
            return false;
        }

        if as_dirty {
            return false;
        }

        let infrequent = self.check_count > 0 && self.check_count < CHECK_COUNT_FOR_INFREQUENT;

        if consecutive_check || infrequent {
            let streak = match self.state {
                VolatilityState::Checking => 1,
                VolatilityState::FrequentlyDirty(n) => n + 1,
                VolatilityState::Volatile => return false,
            };

            if streak >= VOLATILE_THRESHOLD && !has_pre_action {
                self.state = VolatilityState::Volatile;
                return true;
            }

            self.state = VolatilityState::FrequentlyDirty(streak);
        } else {
            self.state = VolatilityState::Checking;
        }

        self.check_count = 0;
        false
    }
}
