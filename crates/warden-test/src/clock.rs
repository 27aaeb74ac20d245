//! A clock tests can move by hand.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use warden_audit::Clock;

/// Clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// A clock stopped at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// A clock stopped at 2026-01-01T00:00:00Z.
    #[must_use]
    pub fn fixed() -> Self {
        Self::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        )
    }

    /// Jump to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    /// Move forward by `delta`. Saturates instead of overflowing.
    pub fn advance(&self, delta: TimeDelta) {
        if let Ok(mut now) = self.now.lock() {
            *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::fixed()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |now| *now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::fixed();
        let other = clock.clone();
        let start = clock.now();

        other.advance(TimeDelta::minutes(90));
        assert_eq!(clock.now(), start + TimeDelta::minutes(90));

        clock.set(start);
        assert_eq!(other.now(), start);
    }
}
