//! Accounting windows for order limits.
//!
//! Windows are aligned to the store's local calendar: hourly windows begin at
//! the top of the hour, daily windows at midnight, weekly windows at midnight
//! on the store's first day of the week and monthly windows on the 1st.
//! Consecutive windows of the same interval are contiguous.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, FixedOffset, Months, NaiveDate, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use tracing::trace;

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;

/// 1970-01-01 was a Thursday.
const EPOCH_DAYS_FROM_SUNDAY: i64 = 4;

/// Seconds past the minute at which minute-based windows roll over.
///
/// Minute windows have always started at `hh:mm:30` in deployed stores, not
/// on the minute. Counts recorded against those windows only line up if the
/// anchor stays where it is.
pub const MINUTE_WINDOW_ANCHOR_SECS: i64 = 30;

/// How often the order allowance resets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IntervalSpec {
    /// Every `n` minutes
    Minutes(u32),
    /// At the top of every hour
    Hourly,
    /// At midnight
    #[default]
    Daily,
    /// At midnight on the first day of the week
    Weekly,
    /// At midnight on the 1st of the month
    Monthly,
    /// A value that names no known interval; produces zero-width windows
    Unrecognized(String),
}

impl IntervalSpec {
    /// Parse a stored interval key such as `min15`, `hourly` or `monthly`.
    ///
    /// Never fails: anything unknown becomes [`IntervalSpec::Unrecognized`].
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "hourly" => IntervalSpec::Hourly,
            "daily" => IntervalSpec::Daily,
            "weekly" => IntervalSpec::Weekly,
            "monthly" => IntervalSpec::Monthly,
            other => match other.strip_prefix("min").and_then(|n| n.parse::<u32>().ok()) {
                Some(minutes) if minutes > 0 => IntervalSpec::Minutes(minutes),
                _ => IntervalSpec::Unrecognized(other.to_string()),
            },
        }
    }

    /// The key this interval is stored under.
    pub fn key(&self) -> String {
        match self {
            IntervalSpec::Minutes(n) => format!("min{}", n),
            IntervalSpec::Hourly => "hourly".to_string(),
            IntervalSpec::Daily => "daily".to_string(),
            IntervalSpec::Weekly => "weekly".to_string(),
            IntervalSpec::Monthly => "monthly".to_string(),
            IntervalSpec::Unrecognized(raw) => raw.clone(),
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, IntervalSpec::Unrecognized(_))
    }

    /// Trailing lookback used when orders are counted on a rolling basis.
    ///
    /// Months are approximated as 30 days.
    pub fn lookback(&self) -> TimeDelta {
        match self {
            IntervalSpec::Minutes(n) => TimeDelta::minutes(i64::from(*n)),
            IntervalSpec::Hourly => TimeDelta::hours(1),
            IntervalSpec::Daily => TimeDelta::days(1),
            IntervalSpec::Weekly => TimeDelta::days(7),
            IntervalSpec::Monthly => TimeDelta::days(30),
            IntervalSpec::Unrecognized(_) => TimeDelta::zero(),
        }
    }

    /// Compute the window containing `now`.
    ///
    /// Boundaries are computed in `now`'s offset. Unrecognized intervals
    /// yield a zero-width window at `now`.
    pub fn window(&self, now: DateTime<FixedOffset>, week_starts_on: Weekday) -> Window {
        let offset = *now.offset();
        let local = now.naive_local().and_utc().timestamp();

        let bounds = match self {
            // Slots are laid out from the local epoch, so intervals that
            // divide an hour still line up with the top of the hour.
            IntervalSpec::Minutes(n) => {
                let step = i64::from(*n) * SECS_PER_MINUTE;
                let start = (local - MINUTE_WINDOW_ANCHOR_SECS).div_euclid(step) * step
                    + MINUTE_WINDOW_ANCHOR_SECS;
                Some((start, start + step))
            }
            IntervalSpec::Hourly => {
                let start = local.div_euclid(SECS_PER_HOUR) * SECS_PER_HOUR;
                Some((start, start + SECS_PER_HOUR))
            }
            IntervalSpec::Daily => {
                let start = local.div_euclid(SECS_PER_DAY) * SECS_PER_DAY;
                Some((start, start + SECS_PER_DAY))
            }
            IntervalSpec::Weekly => {
                let day = local.div_euclid(SECS_PER_DAY);
                let weekday = (day + EPOCH_DAYS_FROM_SUNDAY).rem_euclid(7);
                let diff = (weekday - i64::from(week_starts_on.num_days_from_sunday())).rem_euclid(7);
                let start = (day - diff) * SECS_PER_DAY;
                Some((start, start + 7 * SECS_PER_DAY))
            }
            IntervalSpec::Monthly => month_bounds(now.date_naive()),
            IntervalSpec::Unrecognized(_) => None,
        };

        let window = bounds
            .and_then(|(start, end)| {
                Some(Window {
                    start: from_local_secs(offset, start)?,
                    end: from_local_secs(offset, end)?,
                })
            })
            .unwrap_or_else(|| Window::at(now));

        trace!(
            interval = %self,
            start = %window.start,
            end = %window.end,
            "Computed window"
        );

        window
    }
}

impl From<String> for IntervalSpec {
    fn from(raw: String) -> Self {
        IntervalSpec::parse(&raw)
    }
}

impl From<IntervalSpec> for String {
    fn from(interval: IntervalSpec) -> Self {
        interval.key()
    }
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Adjusts a computed window. Receives the interval and the instant the
/// window was computed for; an adjusted window that no longer contains that
/// instant is discarded.
pub type WindowHook = Arc<dyn Fn(&IntervalSpec, DateTime<FixedOffset>, &mut Window) + Send + Sync>;

/// A half-open accounting period `[start, end)`.
///
/// `end` is the start of the following window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl Window {
    /// A zero-width window at `instant`.
    pub fn at(instant: DateTime<FixedOffset>) -> Self {
        Self {
            start: instant,
            end: instant,
        }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<FixedOffset>) -> bool {
        self.start <= instant && instant < self.end
    }

    pub fn is_zero_width(&self) -> bool {
        self.start == self.end
    }

    /// Whole seconds from `now` until the window ends, never negative.
    pub fn seconds_until_end(&self, now: DateTime<FixedOffset>) -> i64 {
        (self.end - now).num_seconds().max(0)
    }
}

/// Start of the window containing `now`.
pub fn window_start(
    interval: &IntervalSpec,
    now: DateTime<FixedOffset>,
    week_starts_on: Weekday,
) -> DateTime<FixedOffset> {
    interval.window(now, week_starts_on).start
}

/// End of the window containing `now`, i.e. the start of the next one.
pub fn window_end(
    interval: &IntervalSpec,
    now: DateTime<FixedOffset>,
    week_starts_on: Weekday,
) -> DateTime<FixedOffset> {
    interval.window(now, week_starts_on).end
}

/// Seconds left in the window containing `now`.
pub fn seconds_until_window_end(
    interval: &IntervalSpec,
    now: DateTime<FixedOffset>,
    week_starts_on: Weekday,
) -> i64 {
    interval.window(now, week_starts_on).seconds_until_end(now)
}

/// Map a 0=Sunday..6=Saturday index to a weekday.
pub fn weekday_from_sunday(index: u8) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

fn month_bounds(date: NaiveDate) -> Option<(i64, i64)> {
    let first = date.with_day(1)?;
    let next = first.checked_add_months(Months::new(1))?;
    Some((
        first.and_time(NaiveTime::MIN).and_utc().timestamp(),
        next.and_time(NaiveTime::MIN).and_utc().timestamp(),
    ))
}

/// Convert seconds on the local wall clock back into an instant at `offset`.
fn from_local_secs(offset: FixedOffset, local_secs: i64) -> Option<DateTime<FixedOffset>> {
    let utc = DateTime::from_timestamp(local_secs - i64::from(offset.local_minus_utc()), 0)?;
    Some(utc.with_timezone(&offset))
}
