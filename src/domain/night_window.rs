//! Night window predicate
//!
//! The window is a daily `[start, end)` range of wall-clock time. When
//! `start >= end` the window spans midnight: `[start, 24:00) ∪ [00:00, end)`.

use chrono::Timelike;

pub const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightWindow {
    start: u32,
    end: u32,
}

impl NightWindow {
    /// Build a window from explicit start and end clock times.
    /// Out-of-range values are wrapped into the day.
    pub fn new(start_hour: u32, start_minute: u32, end_hour: u32, end_minute: u32) -> Self {
        Self {
            start: (start_hour * 60 + start_minute) % MINUTES_PER_DAY,
            end: (end_hour * 60 + end_minute) % MINUTES_PER_DAY,
        }
    }

    /// Build a window whose end is derived from the start plus a length.
    /// A full day or more leaves the window always open.
    pub fn from_duration(start_hour: u32, start_minute: u32, duration_minutes: u32) -> Self {
        let start = (start_hour * 60 + start_minute) % MINUTES_PER_DAY;
        Self {
            start,
            end: (start + duration_minutes % MINUTES_PER_DAY) % MINUTES_PER_DAY,
        }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start >= self.end
    }

    /// Check a minute-of-day (0..1440)
    pub fn contains_minute(&self, minute_of_day: u32) -> bool {
        let m = minute_of_day % MINUTES_PER_DAY;
        if self.wraps_midnight() {
            m >= self.start || m < self.end
        } else {
            m >= self.start && m < self.end
        }
    }

    pub fn contains<T: Timelike>(&self, time: &T) -> bool {
        self.contains_minute(time.hour() * 60 + time.minute())
    }
}
