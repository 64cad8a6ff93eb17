//! The game calendar.
//!
//! Dates use a fixed 365-day year: the usual month lengths with February
//! always at 28 days and **no leap years**. The simplification keeps date
//! arithmetic exact and save files stable regardless of the era played.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const HOURS_PER_DAY: i64 = 24;
pub const MONTHS_PER_YEAR: u8 = 12;
pub const DAYS_PER_YEAR: i64 = 365;

const DAYS_IN_MONTH: [u8; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Days in the given 1-based month.
pub fn days_in_month(month: u8) -> u8 {
    DAYS_IN_MONTH[(month as usize - 1) % 12]
}

/// A calendar timestamp: year, month (1-12), day (1-based), hour (0-23).
///
/// Ordering is chronological; the field order makes the derived `Ord` do the
/// right thing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GameDate {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
}

impl GameDate {
    pub fn new(year: i32, month: u8, day: u8, hour: u8) -> Self {
        debug_assert!((1..=12).contains(&month), "month out of range");
        debug_assert!(day >= 1 && day <= days_in_month(month), "day out of range");
        debug_assert!(hour < 24, "hour out of range");
        Self {
            year,
            month,
            day,
            hour,
        }
    }

    /// Hours elapsed since year 0, month 1, day 1, hour 0. Total ordering
    /// and all hour/day arithmetic go through this.
    fn total_hours(self) -> i64 {
        let days_before_month: i64 = DAYS_IN_MONTH[..self.month as usize - 1]
            .iter()
            .map(|&days| days as i64)
            .sum();
        let days = self.year as i64 * DAYS_PER_YEAR + days_before_month + (self.day as i64 - 1);
        days * HOURS_PER_DAY + self.hour as i64
    }

    fn from_total_hours(total: i64) -> Self {
        let days = total.div_euclid(HOURS_PER_DAY);
        let hour = total.rem_euclid(HOURS_PER_DAY) as u8;

        let year = days.div_euclid(DAYS_PER_YEAR);
        let mut day_of_year = days.rem_euclid(DAYS_PER_YEAR);

        let mut month = 1u8;
        for &month_days in &DAYS_IN_MONTH {
            if day_of_year < month_days as i64 {
                break;
            }
            day_of_year -= month_days as i64;
            month += 1;
        }

        Self {
            year: year as i32,
            month,
            day: day_of_year as u8 + 1,
            hour,
        }
    }

    /// Adds (or, negative, subtracts) whole hours, carrying through days,
    /// months, and years.
    pub fn add_hours(self, hours: i64) -> Self {
        Self::from_total_hours(self.total_hours() + hours)
    }

    pub fn add_days(self, days: i64) -> Self {
        self.add_hours(days * HOURS_PER_DAY)
    }

    /// Adds whole months; the day is clamped into the target month.
    pub fn add_months(self, months: i64) -> Self {
        let total = self.year as i64 * 12 + (self.month as i64 - 1) + months;
        let year = total.div_euclid(12) as i32;
        let month = total.rem_euclid(12) as u8 + 1;
        Self {
            year,
            month,
            day: self.day.min(days_in_month(month)),
            hour: self.hour,
        }
    }

    pub fn add_years(self, years: i32) -> Self {
        Self {
            year: self.year + years,
            ..self
        }
    }

    /// Signed whole hours from `self` to `other`.
    pub fn hours_until(self, other: GameDate) -> i64 {
        other.total_hours() - self.total_hours()
    }
}

impl fmt::Display for GameDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:00",
            self.year, self.month, self.day, self.hour
        )
    }
}

/// Granularity of a tick boundary. The ordering is the fan-out order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TickClass {
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl TickClass {
    pub const ALL: [TickClass; 4] = [
        TickClass::Hourly,
        TickClass::Daily,
        TickClass::Monthly,
        TickClass::Yearly,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            TickClass::Hourly => 0,
            TickClass::Daily => 1,
            TickClass::Monthly => 2,
            TickClass::Yearly => 3,
        }
    }
}

/// Simulation speed setting.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TimeScale {
    Paused,
    Slow,
    Normal,
    Fast,
    VeryFast,
}

impl TimeScale {
    /// Dimensionless multiplier applied to the base hours-per-second rate.
    pub fn multiplier(self) -> f64 {
        match self {
            TimeScale::Paused => 0.0,
            TimeScale::Slow => 0.25,
            TimeScale::Normal => 1.0,
            TimeScale::Fast => 4.0,
            TimeScale::VeryFast => 16.0,
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            TimeScale::Paused => 0,
            TimeScale::Slow => 1,
            TimeScale::Normal => 2,
            TimeScale::Fast => 3,
            TimeScale::VeryFast => 4,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(TimeScale::Paused),
            1 => Some(TimeScale::Slow),
            2 => Some(TimeScale::Normal),
            3 => Some(TimeScale::Fast),
            4 => Some(TimeScale::VeryFast),
            _ => None,
        }
    }
}
