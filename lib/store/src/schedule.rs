//! Repeat-interval schedules and misfire instructions.

use crate::error::ScheduleError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How many times a schedule repeats after its first firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatCount {
    /// Repeats this many times (zero means fire once).
    Times(u32),
    /// Repeats until the end time, if any.
    Indefinitely,
}

impl RepeatCount {
    fn exceeded_by(self, count: i64) -> bool {
        match self {
            Self::Times(limit) => count > i64::from(limit),
            Self::Indefinitely => false,
        }
    }
}

/// What to do with a trigger found more than the misfire threshold late.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfireInstruction {
    /// Leave the fire time alone; the trigger fires late.
    Ignore,
    /// Fire now for one-shot schedules, skip to the next slot for repeating ones.
    #[default]
    Smart,
    /// Fire as soon as possible.
    FireNow,
    /// Skip missed slots and resume at the next one after now.
    RescheduleNextWithRemainingCount,
}

impl MisfireInstruction {
    /// Resolves `Smart` to the concrete instruction for a schedule.
    #[must_use]
    pub fn resolve(self, schedule: &SimpleSchedule) -> Self {
        match self {
            Self::Smart if schedule.is_one_shot() => Self::FireNow,
            Self::Smart => Self::RescheduleNextWithRemainingCount,
            other => other,
        }
    }
}

/// A schedule that fires at a start time and then every repeat interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    /// First fire time.
    pub start_time: DateTime<Utc>,
    /// No fire time at or after this instant.
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between fire times.
    pub repeat_interval_ms: u64,
    /// Repeats after the first fire time.
    pub repeat_count: RepeatCount,
}

impl SimpleSchedule {
    /// Creates a schedule that fires once.
    #[must_use]
    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            start_time: at,
            end_time: None,
            repeat_interval_ms: 0,
            repeat_count: RepeatCount::Times(0),
        }
    }

    /// Creates a repeating schedule.
    #[must_use]
    pub fn repeating(start_time: DateTime<Utc>, interval: Duration, repeat_count: RepeatCount) -> Self {
        Self {
            start_time,
            end_time: None,
            repeat_interval_ms: u64::try_from(interval.num_milliseconds()).unwrap_or(0),
            repeat_count,
        }
    }

    /// Sets the end time.
    #[must_use]
    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Returns whether the schedule fires exactly once.
    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        self.repeat_count == RepeatCount::Times(0)
    }

    /// Validates the schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if a repeating schedule has no interval or the end
    /// time precedes the start time.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if !self.is_one_shot() && self.repeat_interval_ms == 0 {
            return Err(ScheduleError::InvalidSchedule {
                reason: "repeat interval must be positive for repeating schedules".to_string(),
            });
        }
        if self.end_time.is_some_and(|end| end < self.start_time) {
            return Err(ScheduleError::InvalidSchedule {
                reason: "end time precedes start time".to_string(),
            });
        }
        if i64::try_from(self.repeat_interval_ms).is_err() {
            return Err(ScheduleError::InvalidSchedule {
                reason: "repeat interval out of range".to_string(),
            });
        }
        Ok(())
    }

    /// Returns the first fire time strictly after `after`, given how many
    /// times the schedule has already fired.
    #[must_use]
    pub fn fire_time_after(&self, after: DateTime<Utc>, times_triggered: u32) -> Option<DateTime<Utc>> {
        if self.repeat_count.exceeded_by(i64::from(times_triggered)) {
            return None;
        }
        if self.is_one_shot() && after >= self.start_time {
            return None;
        }
        if self.end_time.is_some_and(|end| end <= after) {
            return None;
        }
        if after < self.start_time {
            return Some(self.start_time);
        }

        let interval = i64::try_from(self.repeat_interval_ms).ok().filter(|ms| *ms > 0)?;
        let elapsed = (after - self.start_time).num_milliseconds();
        let executed = elapsed / interval + 1;
        if self.repeat_count.exceeded_by(executed) {
            return None;
        }

        let offset = executed.checked_mul(interval)?;
        let time = self
            .start_time
            .checked_add_signed(Duration::milliseconds(offset))?;
        if self.end_time.is_some_and(|end| end <= time) {
            return None;
        }
        Some(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    #[test]
    fn one_shot_fires_only_at_start() {
        let schedule = SimpleSchedule::once(at(1_000));

        assert_eq!(schedule.fire_time_after(at(0), 0), Some(at(1_000)));
        assert_eq!(schedule.fire_time_after(at(1_000), 0), None);
    }

    #[test]
    fn repeating_schedule_steps_by_interval() {
        let schedule =
            SimpleSchedule::repeating(at(0), Duration::milliseconds(100), RepeatCount::Indefinitely);

        assert_eq!(schedule.fire_time_after(at(0), 1), Some(at(100)));
        assert_eq!(schedule.fire_time_after(at(150), 2), Some(at(200)));
        assert_eq!(schedule.fire_time_after(at(-5), 0), Some(at(0)));
    }

    #[test]
    fn repeat_count_limits_fire_times() {
        let schedule =
            SimpleSchedule::repeating(at(0), Duration::milliseconds(100), RepeatCount::Times(2));

        assert_eq!(schedule.fire_time_after(at(150), 2), Some(at(200)));
        assert_eq!(schedule.fire_time_after(at(200), 3), None);
    }

    #[test]
    fn end_time_is_exclusive() {
        let schedule =
            SimpleSchedule::repeating(at(0), Duration::milliseconds(100), RepeatCount::Indefinitely)
                .with_end_time(at(300));

        assert_eq!(schedule.fire_time_after(at(150), 2), Some(at(200)));
        assert_eq!(schedule.fire_time_after(at(250), 3), None);
    }

    #[test]
    fn validation() {
        let no_interval = SimpleSchedule::repeating(at(0), Duration::zero(), RepeatCount::Times(3));
        assert!(no_interval.validate().is_err());

        let backwards = SimpleSchedule::once(at(100)).with_end_time(at(0));
        assert!(backwards.validate().is_err());

        assert!(SimpleSchedule::once(at(0)).validate().is_ok());
    }

    #[test]
    fn smart_instruction_resolution() {
        let once = SimpleSchedule::once(at(0));
        let repeating =
            SimpleSchedule::repeating(at(0), Duration::seconds(1), RepeatCount::Indefinitely);

        assert_eq!(MisfireInstruction::Smart.resolve(&once), MisfireInstruction::FireNow);
        assert_eq!(
            MisfireInstruction::Smart.resolve(&repeating),
            MisfireInstruction::RescheduleNextWithRemainingCount
        );
        assert_eq!(MisfireInstruction::Ignore.resolve(&once), MisfireInstruction::Ignore);
    }
}
