//! Clocks and calendar formatting
//!
//! Two time bases are used by the kit:
//! - a monotonic [`Clock`] (`embassy_time::Instant`) for every millisecond
//!   scale timer (tick cadence, retry windows, fragment timeouts)
//! - the wall-clock [`Rtc`] in Unix seconds, used to timestamp readings and
//!   schedule read/publish intervals
//!
//! Date conversion uses Howard Hinnant's civil_from_days algorithm.
//! Reference: http://howardhinnant.github.io/date_algorithms.html

use core::fmt::Write;

use embassy_time::Instant;
use heapless::String;

/// Any RTC epoch before 2018-01-01 means the clock was never synced.
pub const MIN_VALID_EPOCH: u32 = 1_514_764_800;

/// Maximum drift accepted when reading back a freshly written RTC.
pub const RTC_SET_TOLERANCE_SECS: u32 = 2;

/// `YYYY-MM-DDTHH:MM:SSZ`
pub type IsoTime = String<20>;

/// `YY-MM-DD`.
pub type ShortDate = String<8>;

pub trait Clock {
    fn now(&self) -> Instant;
}

pub trait Rtc {
    fn epoch(&self) -> u32;
    fn set_epoch(&mut self, epoch: u32);
    fn is_configured(&self) -> bool;

    /// Whether the wall clock holds a plausible synced time.
    fn is_synced(&self) -> bool {
        self.is_configured() && self.epoch() > MIN_VALID_EPOCH
    }
}

/// Broken-down UTC date and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    pub fn from_epoch(epoch: u32) -> Self {
        const SECONDS_PER_DAY: u32 = 86_400;

        let days = (epoch / SECONDS_PER_DAY) as i32;
        let secs_today = epoch % SECONDS_PER_DAY;
        let (year, month, day) = civil_from_days(days);

        Self {
            year,
            month,
            day,
            hour: (secs_today / 3600) as u8,
            minute: ((secs_today % 3600) / 60) as u8,
            second: (secs_today % 60) as u8,
        }
    }

    pub fn iso8601(&self) -> IsoTime {
        let mut out = IsoTime::new();
        // Exactly 20 ASCII characters for years below 10000.
        let _ = write!(
            out,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        );
        out
    }

    /// Short `YY-MM-DD` prefix used for card file names.
    pub fn short_date(&self) -> ShortDate {
        let mut out = String::new();
        let _ = write!(
            out,
            "{:02}-{:02}-{:02}",
            self.year % 100,
            self.month,
            self.day
        );
        out
    }
}

pub fn epoch_to_iso(epoch: u32) -> IsoTime {
    DateTime::from_epoch(epoch).iso8601()
}

/// Days since 1970-01-01 to (year, month, day).
fn civil_from_days(days: i32) -> (u16, u8, u8) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32; // [0, 146096]
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365; // [0, 399]
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8; // [1, 31]
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8; // [1, 12]

    let year = if m <= 2 { y + 1 } else { y };
    (year as u16, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_zero() {
        assert_eq!(epoch_to_iso(0).as_str(), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_known_timestamp() {
        // 2018-07-17T06:55:06Z
        assert_eq!(epoch_to_iso(1_531_810_506).as_str(), "2018-07-17T06:55:06Z");
    }

    #[test]
    fn test_leap_day() {
        let dt = DateTime::from_epoch(1_709_164_800); // 2024-02-29
        assert_eq!((dt.year, dt.month, dt.day), (2024, 2, 29));
        assert_eq!(dt.short_date().as_str(), "24-02-29");
    }

    #[test]
    fn test_end_of_year() {
        let dt = DateTime::from_epoch(1_704_067_199); // 2023-12-31T23:59:59Z
        assert_eq!(dt.iso8601().as_str(), "2023-12-31T23:59:59Z");
    }
}
