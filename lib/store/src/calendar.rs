//! Calendars: named rules excluding time from trigger schedules.
//!
//! All rules are evaluated in UTC. A calendar may chain onto a base calendar;
//! a time is included only if every calendar in the chain includes it.

use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Upper bound on exclusion boundaries crossed while searching for an included time.
const MAX_SEARCH_STEPS: usize = 10_000;

/// The exclusion rule of one calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarRule {
    /// Excludes whole dates.
    Holiday { excluded_dates: BTreeSet<NaiveDate> },
    /// Excludes whole days of the week.
    Weekly { excluded_days: Vec<Weekday> },
    /// Excludes a time-of-day range `[range_start, range_end)` every day,
    /// or everything outside it when inverted.
    Daily {
        range_start: NaiveTime,
        range_end: NaiveTime,
        invert: bool,
    },
}

/// A named exclusion rule set referenced by triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    /// Human-readable description.
    pub description: Option<String>,
    /// Calendar whose exclusions also apply.
    pub base: Option<Box<Calendar>>,
    /// This calendar's own rule.
    pub rule: CalendarRule,
}

impl Calendar {
    /// Creates a calendar from a rule.
    #[must_use]
    pub fn new(rule: CalendarRule) -> Self {
        Self {
            description: None,
            base: None,
            rule,
        }
    }

    /// Creates a calendar excluding the given dates.
    #[must_use]
    pub fn holidays(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self::new(CalendarRule::Holiday {
            excluded_dates: dates.into_iter().collect(),
        })
    }

    /// Creates a calendar excluding the given weekdays.
    #[must_use]
    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self::new(CalendarRule::Weekly {
            excluded_days: days.into_iter().collect(),
        })
    }

    /// Creates a calendar excluding a daily time range.
    #[must_use]
    pub fn daily(range_start: NaiveTime, range_end: NaiveTime) -> Self {
        Self::new(CalendarRule::Daily {
            range_start,
            range_end,
            invert: false,
        })
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Chains a base calendar.
    #[must_use]
    pub fn with_base(mut self, base: Calendar) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    /// Inverts a daily range so only times inside it are included.
    #[must_use]
    pub fn inverted(mut self) -> Self {
        if let CalendarRule::Daily { invert, .. } = &mut self.rule {
            *invert = !*invert;
        }
        self
    }

    /// Validates this calendar and its base chain.
    ///
    /// # Errors
    ///
    /// Returns an error if a daily range is empty or reversed.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if let CalendarRule::Daily {
            range_start,
            range_end,
            ..
        } = &self.rule
        {
            if range_start >= range_end {
                return Err(ScheduleError::InvalidCalendar {
                    reason: format!("daily range {range_start}..{range_end} is empty"),
                });
            }
        }
        match &self.base {
            Some(base) => base.validate(),
            None => Ok(()),
        }
    }

    /// Returns whether the calendar chain includes a time.
    #[must_use]
    pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        self.exclusion_end(time).is_none()
    }

    /// Returns the first included time strictly after `time`, if any can be
    /// found within a bounded search.
    #[must_use]
    pub fn next_included_time(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = time.checked_add_signed(Duration::milliseconds(1))?;
        for _ in 0..MAX_SEARCH_STEPS {
            match self.exclusion_end(candidate) {
                None => return Some(candidate),
                Some(next) => candidate = next,
            }
        }
        None
    }

    /// Returns `None` if `time` is included, otherwise the instant the
    /// exclusion covering it ends.
    fn exclusion_end(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(end) = self.base.as_ref().and_then(|base| base.exclusion_end(time)) {
            return Some(end);
        }
        self.rule.exclusion_end(time)
    }
}

impl CalendarRule {
    fn exclusion_end(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = time.date_naive();
        match self {
            Self::Holiday { excluded_dates } => {
                excluded_dates.contains(&date).then(|| start_of_next_day(date))?
            }
            Self::Weekly { excluded_days } => {
                excluded_days.contains(&time.weekday()).then(|| start_of_next_day(date))?
            }
            Self::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let time_of_day = time.time();
                let in_range = *range_start <= time_of_day && time_of_day < *range_end;
                match (invert, in_range) {
                    (false, true) => Some(date.and_time(*range_end).and_utc()),
                    (true, false) if time_of_day < *range_start => {
                        Some(date.and_time(*range_start).and_utc())
                    }
                    (true, false) => date
                        .succ_opt()
                        .map(|next| next.and_time(*range_start).and_utc()),
                    _ => None,
                }
            }
        }
    }
}

fn start_of_next_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.succ_opt()
        .map(|next| next.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn holiday_excludes_whole_date() {
        let christmas = NaiveDate::from_ymd_opt(2026, 12, 25).unwrap();
        let calendar = Calendar::holidays([christmas]);

        assert!(!calendar.is_time_included(utc(2026, 12, 25, 9, 0)));
        assert!(calendar.is_time_included(utc(2026, 12, 26, 9, 0)));
        assert_eq!(
            calendar.next_included_time(utc(2026, 12, 25, 9, 0)),
            Some(utc(2026, 12, 26, 0, 0))
        );
    }

    #[test]
    fn weekly_skips_weekend() {
        let calendar = Calendar::weekly([Weekday::Sat, Weekday::Sun]);
        // 2026-10-17 is a Saturday.
        let saturday_noon = utc(2026, 10, 17, 12, 0);

        assert!(!calendar.is_time_included(saturday_noon));
        assert_eq!(
            calendar.next_included_time(saturday_noon),
            Some(utc(2026, 10, 19, 0, 0))
        );
    }

    #[test]
    fn daily_range_and_inversion() {
        let maintenance = Calendar::daily(hm(2, 0), hm(4, 0));
        assert!(!maintenance.is_time_included(utc(2026, 1, 5, 3, 0)));
        assert!(maintenance.is_time_included(utc(2026, 1, 5, 4, 0)));

        let business_hours = Calendar::daily(hm(9, 0), hm(17, 0)).inverted();
        assert!(business_hours.is_time_included(utc(2026, 1, 5, 10, 0)));
        assert_eq!(
            business_hours.next_included_time(utc(2026, 1, 5, 18, 0)),
            Some(utc(2026, 1, 6, 9, 0))
        );
    }

    #[test]
    fn base_calendar_exclusions_apply() {
        let calendar = Calendar::daily(hm(9, 0), hm(17, 0))
            .inverted()
            .with_base(Calendar::weekly([Weekday::Sat, Weekday::Sun]));

        // Friday 2026-10-16 after hours → Monday 09:00.
        assert_eq!(
            calendar.next_included_time(utc(2026, 10, 16, 18, 0)),
            Some(utc(2026, 10, 19, 9, 0))
        );
    }

    #[test]
    fn empty_daily_range_is_invalid() {
        assert!(Calendar::daily(hm(5, 0), hm(5, 0)).validate().is_err());
        assert!(Calendar::daily(hm(1, 0), hm(5, 0)).validate().is_ok());
    }
}
