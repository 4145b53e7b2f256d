//! Triggers: schedules that fire jobs.
//!
//! A trigger carries both its schedule definition and its runtime position
//! in that schedule (next/previous fire time, fire count). The host engine
//! advances it through `triggered` and `update_after_misfire`; the store calls
//! those on the copy it holds in the shared trigger map.

use crate::calendar::Calendar;
use crate::error::ScheduleError;
use crate::job::JobDataMap;
use crate::schedule::{MisfireInstruction, SimpleSchedule};
use chime_core::{FireInstanceId, JobKey, TriggerKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Priority given to triggers that do not set one.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Upper bound on calendar exclusions skipped while computing a fire time.
const MAX_CALENDAR_SKIPS: usize = 10_000;

/// A trigger bound to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger identity.
    pub key: TriggerKey,
    /// The job this trigger fires.
    pub job_key: JobKey,
    /// Human-readable description.
    pub description: Option<String>,
    /// Calendar excluding times from the schedule.
    pub calendar_name: Option<String>,
    /// Higher priority wins when fire times tie.
    pub priority: i32,
    /// Handling for fire times missed by more than the misfire threshold.
    pub misfire_instruction: MisfireInstruction,
    /// Trigger-level data merged over the job's data by the host engine.
    pub data: JobDataMap,
    /// The schedule definition.
    pub schedule: SimpleSchedule,
    /// Next time the trigger is due; `None` once it can never fire again.
    pub next_fire_time: Option<DateTime<Utc>>,
    /// Last time the trigger fired.
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// How many times the trigger has fired.
    pub times_triggered: u32,
    /// Id of the current firing, assigned at acquisition.
    pub fire_instance_id: Option<FireInstanceId>,
}

impl Trigger {
    /// Creates a trigger whose first fire time is the schedule's start time.
    #[must_use]
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: SimpleSchedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            calendar_name: None,
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::default(),
            data: JobDataMap::new(),
            next_fire_time: Some(schedule.start_time),
            previous_fire_time: None,
            times_triggered: 0,
            fire_instance_id: None,
            schedule,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the calendar.
    #[must_use]
    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    /// Sets the misfire instruction.
    #[must_use]
    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Validates the trigger's schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the schedule is inconsistent.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.schedule.validate()
    }

    /// Returns whether the trigger will fire again.
    #[must_use]
    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// Returns the next scheduled time strictly after `after`, ignoring calendars.
    #[must_use]
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.fire_time_after(after, self.times_triggered)
    }

    /// Sets and returns the first fire time, honoring a calendar.
    pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        self.next_fire_time = self.skip_excluded(Some(self.schedule.start_time), calendar);
        self.next_fire_time
    }

    /// Records a firing and advances to the following fire time.
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;
        let following = self.next_fire_time.and_then(|time| self.fire_time_after(time));
        self.next_fire_time = self.skip_excluded(following, calendar);
    }

    /// Moves the next fire time according to the misfire instruction.
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        match self.misfire_instruction.resolve(&self.schedule) {
            MisfireInstruction::Ignore | MisfireInstruction::Smart => {}
            MisfireInstruction::FireNow => {
                self.next_fire_time = self.skip_excluded(Some(now), calendar);
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                let rescheduled = self.skip_excluded(self.fire_time_after(now), calendar);
                if let (Some(missed_from), Some(new_time)) = (self.next_fire_time, rescheduled) {
                    self.times_triggered = self
                        .times_triggered
                        .saturating_add(self.fire_times_between(missed_from, new_time));
                }
                self.next_fire_time = rescheduled;
            }
        }
    }

    /// Recomputes the next fire time after the trigger's calendar changed.
    ///
    /// A recomputed time more than `misfire_threshold` in the past is skipped
    /// in favor of the next slot after `now`.
    pub fn update_with_new_calendar(
        &mut self,
        calendar: &Calendar,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
    ) {
        let resume_after = self
            .previous_fire_time
            .unwrap_or(self.schedule.start_time - Duration::milliseconds(1));
        let mut next = self.skip_excluded(self.fire_time_after(resume_after), Some(calendar));
        if next.is_some_and(|time| now - time >= misfire_threshold) {
            next = self.skip_excluded(self.fire_time_after(now), Some(calendar));
        }
        self.next_fire_time = next;
    }

    /// Advances `candidate` past any times the calendar excludes.
    fn skip_excluded(
        &self,
        mut candidate: Option<DateTime<Utc>>,
        calendar: Option<&Calendar>,
    ) -> Option<DateTime<Utc>> {
        let Some(calendar) = calendar else {
            return candidate;
        };
        for _ in 0..MAX_CALENDAR_SKIPS {
            let time = candidate?;
            if calendar.is_time_included(time) {
                return Some(time);
            }
            let included_from = calendar.next_included_time(time)?;
            // Strictly-after search from just before the included instant.
            candidate = self.fire_time_after(included_from - Duration::milliseconds(1));
        }
        None
    }

    fn fire_times_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
        let interval = i64::try_from(self.schedule.repeat_interval_ms).unwrap_or(0);
        if interval <= 0 || to <= from {
            return 0;
        }
        u32::try_from((to - from).num_milliseconds() / interval).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::RepeatCount;
    use chrono::{NaiveDate, TimeZone};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn repeating(start: DateTime<Utc>, every_ms: i64) -> Trigger {
        Trigger::new(
            TriggerKey::in_default_group("t"),
            JobKey::in_default_group("j"),
            SimpleSchedule::repeating(start, Duration::milliseconds(every_ms), RepeatCount::Indefinitely),
        )
    }

    #[test]
    fn new_trigger_is_due_at_start() {
        let trigger = repeating(at(500), 100);
        assert_eq!(trigger.next_fire_time, Some(at(500)));
        assert_eq!(trigger.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn triggered_advances_schedule() {
        let mut trigger = repeating(at(0), 100);
        trigger.triggered(None);

        assert_eq!(trigger.previous_fire_time, Some(at(0)));
        assert_eq!(trigger.next_fire_time, Some(at(100)));
        assert_eq!(trigger.times_triggered, 1);
    }

    #[test]
    fn one_shot_has_no_next_fire_after_triggering() {
        let mut trigger = Trigger::new(
            TriggerKey::in_default_group("once"),
            JobKey::in_default_group("j"),
            SimpleSchedule::once(at(0)),
        );
        trigger.triggered(None);

        assert!(!trigger.may_fire_again());
    }

    #[test]
    fn smart_misfire_of_one_shot_fires_now() {
        let mut trigger = Trigger::new(
            TriggerKey::in_default_group("once"),
            JobKey::in_default_group("j"),
            SimpleSchedule::once(at(0)),
        );
        trigger.update_after_misfire(None, at(10_000));

        assert_eq!(trigger.next_fire_time, Some(at(10_000)));
    }

    #[test]
    fn smart_misfire_of_repeating_skips_to_next_slot() {
        let mut trigger = repeating(at(0), 1_000);
        trigger.update_after_misfire(None, at(10_500));

        assert_eq!(trigger.next_fire_time, Some(at(11_000)));
        assert_eq!(trigger.times_triggered, 11);
    }

    #[test]
    fn ignore_misfire_leaves_fire_time() {
        let mut trigger = repeating(at(0), 1_000).with_misfire_instruction(MisfireInstruction::Ignore);
        trigger.update_after_misfire(None, at(10_500));

        assert_eq!(trigger.next_fire_time, Some(at(0)));
    }

    #[test]
    fn calendar_exclusions_are_skipped() {
        let start = Utc.with_ymd_and_hms(2026, 12, 24, 12, 0, 0).unwrap();
        let christmas = NaiveDate::from_ymd_opt(2026, 12, 25).unwrap();
        let calendar = Calendar::holidays([christmas]);
        let mut trigger = repeating(start, Duration::hours(12).num_milliseconds());

        trigger.triggered(Some(&calendar));

        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2026, 12, 26, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn new_calendar_recomputes_from_previous_fire() {
        let start = Utc.with_ymd_and_hms(2026, 12, 24, 0, 0, 0).unwrap();
        let mut trigger = repeating(start, Duration::days(1).num_milliseconds());
        trigger.triggered(None);
        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2026, 12, 25, 0, 0, 0).unwrap())
        );

        let christmas = NaiveDate::from_ymd_opt(2026, 12, 25).unwrap();
        trigger.update_with_new_calendar(&Calendar::holidays([christmas]), Duration::minutes(1), start);

        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2026, 12, 26, 0, 0, 0).unwrap())
        );
    }
}
