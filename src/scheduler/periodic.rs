//! Wall-clock remembrance slots
//!
//! Periodic events are anchored to local times, not prayers: a morning and
//! an evening remembrance every day, plus an optional fixed interval counted
//! from local midnight.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::config::SchedulerConfig;
use crate::groups::GroupSchedulePolicy;
use crate::models::{EventClass, OccurrenceKey, PayloadRef, PeriodicKind, ScheduledEvent};
use crate::utils::localize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicPlan {
    pub morning: NaiveTime,
    pub evening: NaiveTime,
}

impl Default for PeriodicPlan {
    fn default() -> Self {
        Self {
            morning: NaiveTime::from_hms_opt(5, 30, 0).unwrap_or(NaiveTime::MIN),
            evening: NaiveTime::from_hms_opt(19, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl PeriodicPlan {
    pub fn new(morning: NaiveTime, evening: NaiveTime) -> Self {
        Self { morning, evening }
    }

    pub fn from_config(config: &SchedulerConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.morning()?, config.evening()?))
    }

    /// Local slots of one civil date, in time order
    pub fn slots(&self, date: NaiveDate, interval_minutes: Option<u32>) -> Vec<(PeriodicKind, NaiveDateTime)> {
        let mut slots = vec![
            (PeriodicKind::MorningDhikr, date.and_time(self.morning)),
            (PeriodicKind::EveningDhikr, date.and_time(self.evening)),
        ];

        if let Some(step) = interval_minutes.filter(|m| *m > 0) {
            let start = date.and_time(NaiveTime::MIN);
            let step = chrono::Duration::minutes(i64::from(step));
            let mut slot = start;
            while slot.date() == date {
                slots.push((PeriodicKind::IntervalDhikr, slot));
                slot += step;
            }
        }

        slots.sort_by_key(|(_, at)| *at);
        slots
    }

    /// Events of `date` for a group that fire after `after`
    pub fn events(
        &self,
        policy: &GroupSchedulePolicy,
        tz: &Tz,
        date: NaiveDate,
        after: DateTime<Utc>,
    ) -> Vec<ScheduledEvent> {
        if !policy.receives(EventClass::Periodic) {
            return Vec::new();
        }

        self.slots(date, policy.periodic_interval_minutes)
            .into_iter()
            .filter_map(|(kind, local)| {
                let fire_at = localize(tz, local);
                (fire_at > after).then(|| ScheduledEvent {
                    class: EventClass::Periodic,
                    group: policy.group,
                    fire_at,
                    local_time: local,
                    payload: PayloadRef::Remembrance { remembrance: kind },
                    occurrence: OccurrenceKey::periodic(kind, local),
                    stale: false,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GroupId;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    #[test]
    fn test_morning_and_evening_only() {
        let slots = PeriodicPlan::default().slots(date(), None);
        let kinds: Vec<_> = slots.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![PeriodicKind::MorningDhikr, PeriodicKind::EveningDhikr]);
        assert_eq!(slots[0].1, date().and_hms_opt(5, 30, 0).unwrap());
    }

    #[test]
    fn test_interval_slots_stay_within_day() {
        let slots = PeriodicPlan::default().slots(date(), Some(360));
        let interval: Vec<_> = slots
            .iter()
            .filter(|(k, _)| *k == PeriodicKind::IntervalDhikr)
            .map(|(_, at)| at.time().to_string())
            .collect();
        assert_eq!(interval, vec!["00:00:00", "06:00:00", "12:00:00", "18:00:00"]);
        assert!(slots.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_events_respect_toggle_and_after() {
        let tz: Tz = "Africa/Cairo".parse().unwrap();
        let plan = PeriodicPlan::default();
        let mut policy = GroupSchedulePolicy::new(GroupId(7));

        // 11:00 Cairo (UTC+2) on a non-DST day
        let after = date().and_hms_opt(9, 0, 0).unwrap().and_utc();
        let events = plan.events(&policy, &tz, date(), after);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].local_time.time(), NaiveTime::from_hms_opt(19, 30, 0).unwrap());
        assert_eq!(events[0].fire_at, date().and_hms_opt(17, 30, 0).unwrap().and_utc());
        assert_eq!(events[0].occurrence.as_str(), "evening_dhikr/2025-03-10T19:30");

        policy.toggles.periodic = false;
        assert!(plan.events(&policy, &tz, date(), after).is_empty());
    }
}
