//! Event computation from a day's prayer times
//!
//! For every obligatory prayer the computer derives up to three instants in
//! the group's timezone:
//!
//! ```text
//!   pre-alert          prayer start         delayed action
//!  start - lead ──────────► start ──────────► start + offset
//! ```
//!
//! Sunrise is carried in the data but never produces an event.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use super::error::{SchedulerError, SchedulerResult};
use super::periodic::PeriodicPlan;
use crate::groups::GroupSchedulePolicy;
use crate::models::{
    sort_events, EventClass, OccurrenceKey, PayloadRef, Prayer, ScheduledEvent,
};
use crate::resolver::{ResolvedTimes, TimesLookup};
use crate::utils::localize;

/// Turns prayer times and a group policy into ordered events
#[derive(Debug, Clone, Default)]
pub struct ScheduleComputer {
    periodic: PeriodicPlan,
}

impl ScheduleComputer {
    pub fn new(periodic: PeriodicPlan) -> Self {
        Self { periodic }
    }

    fn timezone(policy: &GroupSchedulePolicy) -> SchedulerResult<Tz> {
        policy
            .tz()
            .map_err(|_| SchedulerError::invalid_timezone(&policy.timezone))
    }

    /// Upcoming events for a group, strictly after `now`, sorted.
    ///
    /// Includes delayed actions of yesterday that still lie ahead and rolls
    /// into tomorrow once today's prayers are all behind.
    pub async fn next_events(
        &self,
        now: DateTime<Utc>,
        policy: &GroupSchedulePolicy,
        lookup: &dyn TimesLookup,
    ) -> SchedulerResult<Vec<ScheduledEvent>> {
        let tz = Self::timezone(policy)?;
        let today = now.with_timezone(&tz).date_naive();
        let tomorrow = today + Duration::days(1);

        let mut events = Vec::new();

        if let Some(yesterday) = lookup.cached(today - Duration::days(1), now).await? {
            events.extend(Self::prayer_events(&yesterday, policy, &tz, now));
        }

        let current = lookup.times_for(today, now).await?;
        let upcoming_today = Self::prayer_events(&current, policy, &tz, now);
        let exhausted = upcoming_today.is_empty();
        events.extend(upcoming_today);

        if exhausted {
            match lookup.times_for(tomorrow, now).await {
                Ok(next) => events.extend(Self::prayer_events(&next, policy, &tz, now)),
                Err(e) if events.is_empty() => return Err(e),
                Err(e) => tracing::warn!(group = %policy.group, error = %e, "Cannot roll schedule forward"),
            }
        }

        events.extend(self.periodic.events(policy, &tz, today, now));
        events.extend(self.periodic.events(policy, &tz, tomorrow, now));

        sort_events(&mut events);
        Ok(events)
    }

    /// Remembrance events only, for when no prayer times can be had
    pub fn periodic_events(
        &self,
        now: DateTime<Utc>,
        policy: &GroupSchedulePolicy,
    ) -> SchedulerResult<Vec<ScheduledEvent>> {
        let tz = Self::timezone(policy)?;
        let today = now.with_timezone(&tz).date_naive();

        let mut events = self.periodic.events(policy, &tz, today, now);
        events.extend(self.periodic.events(policy, &tz, today + Duration::days(1), now));
        sort_events(&mut events);
        Ok(events)
    }

    /// Time from `now` until the group's next event
    pub async fn time_until_next(
        &self,
        now: DateTime<Utc>,
        policy: &GroupSchedulePolicy,
        lookup: &dyn TimesLookup,
    ) -> Option<Duration> {
        match self.next_events(now, policy, lookup).await {
            Ok(events) => events.first().map(|e| e.fire_at - now),
            Err(e) => {
                tracing::debug!(group = %policy.group, error = %e, "No next event");
                None
            }
        }
    }

    /// Prayer-anchored events of one resolved day after `after`
    pub fn prayer_events(
        resolved: &ResolvedTimes,
        policy: &GroupSchedulePolicy,
        tz: &Tz,
        after: DateTime<Utc>,
    ) -> Vec<ScheduledEvent> {
        let times = &resolved.times;
        let lead = Duration::minutes(i64::from(policy.lead_minutes));
        let offset = Duration::minutes(i64::from(policy.offset_minutes));

        let mut events = Vec::new();
        for prayer in Prayer::OBLIGATORY {
            let Some(local) = times.local_datetime(prayer) else {
                continue;
            };
            let start = localize(tz, local);
            let occurrence = OccurrenceKey::prayer(prayer, times.date);

            let candidates = [
                (
                    EventClass::PreAlert,
                    start - lead,
                    PayloadRef::PrayerReminder {
                        prayer,
                        minutes_before: policy.lead_minutes,
                    },
                ),
                (EventClass::PrayerStart, start, PayloadRef::PrayerCall { prayer }),
                (
                    EventClass::DelayedAction,
                    start + offset,
                    PayloadRef::QuranPortion {
                        prayer,
                        minutes_after: policy.offset_minutes,
                    },
                ),
            ];

            for (class, fire_at, payload) in candidates {
                if fire_at <= after || !policy.receives(class) {
                    continue;
                }
                events.push(ScheduledEvent {
                    class,
                    group: policy.group,
                    fire_at,
                    local_time: fire_at.with_timezone(tz).naive_local(),
                    payload,
                    occurrence: occurrence.clone(),
                    stale: resolved.stale,
                });
            }
        }
        events
    }
}

/// Earliest event in a list of per-group schedules
pub fn earliest(events: &[ScheduledEvent]) -> Option<&ScheduledEvent> {
    events.iter().min_by_key(|e| (e.fire_at, e.class.priority()))
}
