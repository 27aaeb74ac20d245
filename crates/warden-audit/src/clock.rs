//! Time source for entry timestamps.

use chrono::{DateTime, Utc};

/// Supplies commit timestamps.
///
/// The timestamp is hashed with the entry, but chain linkage does not
/// depend on clock order: a skewed clock makes timestamps inaccurate
/// without breaking verification.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
