//! Market-session boundary helper.
//!
//! Resolves a named trading session to a concrete UTC window, computed in
//! the market's local timezone so daylight-saving shifts are handled by the
//! tz database rather than by hand.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketSession {
    /// US cash session, 09:30-16:00 America/New_York.
    UsRegular,
    /// US extended session, 04:00-20:00 America/New_York.
    UsExtended,
    /// US pre-market, 04:00-09:30 America/New_York.
    UsPre,
    /// US after-hours, 16:00-20:00 America/New_York.
    UsAfter,
    /// London cash session, 08:00-16:30 Europe/London.
    UkRegular,
    /// Tokyo cash session, 09:00-15:00 Asia/Tokyo.
    JpRegular,
    /// US futures overnight, 18:00 previous day - 09:30 America/New_York.
    Overnight,
}

impl MarketSession {
    fn tz(&self) -> Tz {
        match self {
            Self::UkRegular => chrono_tz::Europe::London,
            Self::JpRegular => chrono_tz::Asia::Tokyo,
            _ => chrono_tz::America::New_York,
        }
    }

    /// Session bounds as (open, close) in minutes from local midnight. The
    /// overnight session opens on the previous calendar day.
    fn local_bounds(&self) -> (i64, i64, bool) {
        match self {
            Self::UsRegular => (9 * 60 + 30, 16 * 60, false),
            Self::UsExtended => (4 * 60, 20 * 60, false),
            Self::UsPre => (4 * 60, 9 * 60 + 30, false),
            Self::UsAfter => (16 * 60, 20 * 60, false),
            Self::UkRegular => (8 * 60, 16 * 60 + 30, false),
            Self::JpRegular => (9 * 60, 15 * 60, false),
            Self::Overnight => (18 * 60, 9 * 60 + 30, true),
        }
    }

    /// Resolve the most recent occurrence of this session relative to
    /// `now`: the session currently in progress, or the last completed one.
    /// Returns `(start_us, end_us)` in UTC microseconds.
    pub fn window_ending_at(&self, now: DateTime<Utc>) -> Result<(i64, i64), ServiceError> {
        let tz = self.tz();
        let local_now = now.with_timezone(&tz);
        let (open_min, close_min, spans_midnight) = self.local_bounds();

        // Walk back day by day until we find a session day whose window has
        // started; weekends are skipped.
        for days_back in 0..7 {
            let day = trading_day(local_now.date_naive() - ChronoDuration::days(days_back));
            let close_day = if spans_midnight {
                day + ChronoDuration::days(1)
            } else {
                day
            };

            let start = local_datetime(tz, day, open_min)?;
            let end = local_datetime(tz, close_day, close_min)?;
            if start.with_timezone(&Utc) <= now {
                return Ok((
                    start.with_timezone(&Utc).timestamp_micros(),
                    end.with_timezone(&Utc).timestamp_micros(),
                ));
            }
        }
        Err(ServiceError::InvalidRange(format!(
            "no recent session window for {self:?}"
        )))
    }

    /// True when `now` falls inside the session window. Used to qualify
    /// staleness: a silent stream outside market hours is expected.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        match self.window_ending_at(now) {
            Ok((start, end)) => {
                let now_us = now.timestamp_micros();
                now_us >= start && now_us <= end
            }
            Err(_) => false,
        }
    }
}

impl FromStr for MarketSession {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "us_regular" | "regular" => Ok(Self::UsRegular),
            "us_extended" | "extended" => Ok(Self::UsExtended),
            "us_pre" | "pre" => Ok(Self::UsPre),
            "us_after" | "after" => Ok(Self::UsAfter),
            "uk_regular" => Ok(Self::UkRegular),
            "jp_regular" => Ok(Self::JpRegular),
            "overnight" => Ok(Self::Overnight),
            other => Err(ServiceError::InvalidRange(format!(
                "unknown market session: {other}"
            ))),
        }
    }
}

/// Step back to the most recent weekday.
fn trading_day(mut day: chrono::NaiveDate) -> chrono::NaiveDate {
    loop {
        match day.weekday() {
            Weekday::Sat | Weekday::Sun => day -= ChronoDuration::days(1),
            _ => return day,
        }
    }
}

fn local_datetime(
    tz: Tz,
    day: chrono::NaiveDate,
    minutes: i64,
) -> Result<DateTime<Tz>, ServiceError> {
    let naive = day
        .and_hms_opt((minutes / 60) as u32, (minutes % 60) as u32, 0)
        .ok_or_else(|| ServiceError::InvalidRange("bad session bound".to_string()))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ServiceError::InvalidRange("session bound not representable".to_string()))
}
