use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};

use super::scenario::{Cadence, Scenario};
use crate::error::CleanerError;

/// Scenario weekday numbering (0 = Sunday .. 6 = Saturday) to chrono's.
const WEEKDAY_TABLE: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// Longest gap between two calendar matches: a day 31 that only
/// recurs two months later, with margin.
const CALENDAR_SEARCH_DAYS: i64 = 400;

pub const FAST_ONCE_DELAY: Duration = Duration::seconds(10);
pub const FAST_HOURLY_PERIOD: Duration = Duration::seconds(10);
pub const FAST_DAILY_PERIOD: Duration = Duration::minutes(1);
pub const FAST_WEEKLY_PERIOD: Duration = Duration::minutes(5);
pub const FAST_MONTHLY_PERIOD: Duration = Duration::minutes(10);

pub fn weekday_from_index(index: u8) -> Option<Weekday> {
    WEEKDAY_TABLE.get(index as usize).copied()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarDays {
    Daily,
    Weekdays(BTreeSet<u32>),
    DayOfMonth(u32),
}

impl CalendarDays {
    fn matches(&self, date: chrono::NaiveDate) -> bool {
        match self {
            CalendarDays::Daily => true,
            // Keyed by days-from-Monday so the set orders naturally
            CalendarDays::Weekdays(days) => days.contains(&date.weekday().num_days_from_monday()),
            CalendarDays::DayOfMonth(day) => date.day() == *day,
        }
    }
}

/// When a registered scenario fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fires once.
    At(NaiveDateTime),
    /// Fires at `anchor + k * period` for k >= 1.
    Every { period: Duration, anchor: NaiveDateTime },
    /// Fires at `time` on matching dates.
    Calendar { time: NaiveTime, days: CalendarDays },
}

impl Trigger {
    /// First fire strictly after `after`; `None` once a one-shot has passed.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Trigger::At(at) => (*at > after).then_some(*at),
            Trigger::Every { period, anchor } => {
                let period_ms = period.num_milliseconds();
                if period_ms <= 0 {
                    return None;
                }
                let first = *anchor + *period;
                if after < first {
                    return Some(first);
                }
                let elapsed = (after - *anchor).num_milliseconds();
                let k = elapsed / period_ms + 1;
                Some(*anchor + Duration::milliseconds(k * period_ms))
            }
            Trigger::Calendar { time, days } => {
                let start = after.date();
                (0..CALENDAR_SEARCH_DAYS)
                    .filter_map(|offset| start.checked_add_signed(Duration::days(offset)))
                    .filter(|date| days.matches(*date))
                    .map(|date| date.and_time(*time))
                    .find(|candidate| *candidate > after)
            }
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::At(_))
    }
}

/// Builds the trigger for a scenario registered at `now`. With `fast_mode`
/// every cadence maps to a short fixed interval, including a `Once` whose
/// time of day has already passed.
pub fn build_trigger(
    scenario: &Scenario,
    now: NaiveDateTime,
    fast_mode: bool,
) -> Result<Trigger, CleanerError> {
    let config_error = |reason: String| CleanerError::TriggerConfig {
        scenario: scenario.name.clone(),
        reason,
    };

    if fast_mode {
        return Ok(match &scenario.cadence {
            Cadence::Once => Trigger::At(now + FAST_ONCE_DELAY),
            Cadence::Hourly => every(FAST_HOURLY_PERIOD, now),
            Cadence::Daily => every(FAST_DAILY_PERIOD, now),
            Cadence::Weekly { .. } => every(FAST_WEEKLY_PERIOD, now),
            Cadence::Monthly { .. } => every(FAST_MONTHLY_PERIOD, now),
        });
    }

    match &scenario.cadence {
        Cadence::Once => {
            let today = now.date().and_time(scenario.time);
            if today > now {
                Ok(Trigger::At(today))
            } else {
                let tomorrow = now
                    .date()
                    .succ_opt()
                    .ok_or_else(|| config_error("date out of range".into()))?;
                Ok(Trigger::At(tomorrow.and_time(scenario.time)))
            }
        }
        Cadence::Hourly => Ok(every(Duration::hours(1), now)),
        Cadence::Daily => Ok(Trigger::Calendar {
            time: scenario.time,
            days: CalendarDays::Daily,
        }),
        Cadence::Weekly { weekdays } => {
            if weekdays.is_empty() {
                return Err(config_error("no weekdays given".into()));
            }
            let mut days = BTreeSet::new();
            for index in weekdays {
                let weekday = weekday_from_index(*index)
                    .ok_or_else(|| config_error(format!("weekday {} out of range 0-6", index)))?;
                days.insert(weekday.num_days_from_monday());
            }
            Ok(Trigger::Calendar {
                time: scenario.time,
                days: CalendarDays::Weekdays(days),
            })
        }
        Cadence::Monthly { day_of_month } => {
            if !(1..=31).contains(day_of_month) {
                return Err(config_error(format!(
                    "day_of_month {} out of range 1-31",
                    day_of_month
                )));
            }
            Ok(Trigger::Calendar {
                time: scenario.time,
                days: CalendarDays::DayOfMonth(*day_of_month),
            })
        }
    }
}

fn every(period: Duration, anchor: NaiveDateTime) -> Trigger {
    Trigger::Every { period, anchor }
}
