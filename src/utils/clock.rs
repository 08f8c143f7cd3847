use chrono::{Local, NaiveDateTime, Timelike};
use parking_lot::Mutex;

/// Source of local wall-clock time for schedules and hourly content.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn hour(&self) -> u32 {
        self.now().hour()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to. Handy for hosts replaying a
/// scripted day and for tests of availability windows.
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_manual_clock_advances() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(23, 30, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.hour(), 23);

        clock.advance(chrono::Duration::minutes(45));
        assert_eq!(clock.hour(), 0);
    }
}
