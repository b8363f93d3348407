use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of wall-clock and monotonic time.
///
/// Wall-clock readings are what gets persisted. Monotonic readings never go
/// backwards and are only meaningful within one process; the session manager
/// uses them to measure a running timer when the wall clock jumps back.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Time elapsed since an arbitrary, fixed origin.
    fn monotonic(&self) -> Duration;
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock that only moves when told to. Used by tests and replay tools.
///
/// `advance` moves both readings forward; `set` moves only the wall clock,
/// which is how clock skew is simulated.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    wall: DateTime<Utc>,
    mono: Duration,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                wall: start,
                mono: Duration::ZERO,
            }),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut state = self.lock();
        state.wall += by;
        if let Ok(std) = by.to_std() {
            state.mono += std;
        }
    }

    pub fn set(&self, wall: DateTime<Utc>) {
        self.lock().wall = wall;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // The state is two plain values, so a poisoned guard is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().wall
    }

    fn monotonic(&self) -> Duration {
        self.lock().mono
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn manual_clock_advances_both_readings() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(t0);

        clock.advance(chrono::Duration::minutes(5));

        assert_eq!(clock.now(), t0 + chrono::Duration::minutes(5));
        assert_eq!(clock.monotonic(), Duration::from_secs(300));
    }

    #[test]
    fn setting_wall_time_backwards_leaves_monotonic_alone() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        clock.advance(chrono::Duration::seconds(30));

        clock.set(t0 - chrono::Duration::hours(1));

        assert_eq!(clock.now(), t0 - chrono::Duration::hours(1));
        assert_eq!(clock.monotonic(), Duration::from_secs(30));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
