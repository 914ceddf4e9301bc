//! Core standing time: the recurring daily window in which the fleet is
//! expected at the depot and available for scheduled charging.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};

/// A daily time window. A window whose `end` is not after its `start` wraps
/// past midnight (e.g. 22:00–06:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Whether `time` falls inside the window. `start` is inclusive, `end`
    /// exclusive.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Recurring standing-time description: one or more daily windows plus
/// optional whole weekdays on which the fleet never drives.
#[derive(Debug, Clone, Default)]
pub struct CoreStandingTime {
    pub windows: Vec<TimeWindow>,
    pub full_days: Vec<Weekday>,
}

impl CoreStandingTime {
    /// Membership test: pure function of wall-clock time.
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        if self.full_days.contains(&at.weekday()) {
            return true;
        }
        self.windows.iter().any(|w| w.contains(at.time()))
    }
}
