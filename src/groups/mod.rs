//! Group eligibility, scheduling policies and at-most-once dispatch
//!
//! Each chat group owns a [`GroupSchedulePolicy`]. Policies are validated on
//! every write, so nothing out of bounds ever reaches the scheduler. The
//! dispatch ledger records a [`DedupKey`] before an event is handed to the
//! delivery collaborator; the first recorder wins, every later pass sees
//! the occurrence as already handled.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{DedupKey, EventClass, GroupId, OccurrenceKey};
use crate::storage::{LedgerEntry, LedgerMark, SharedDispatchLedger, SharedGroupPolicyRepository};
use crate::utils::parse_timezone;

/// Bounds for policy values
pub const LEAD_MINUTES_RANGE: std::ops::RangeInclusive<u32> = 1..=30;
pub const OFFSET_MINUTES_RANGE: std::ops::RangeInclusive<u32> = 1..=120;
pub const INTERVAL_MINUTES_RANGE: std::ops::RangeInclusive<u32> = 15..=1440;

pub const DEFAULT_TIMEZONE: &str = "Africa/Cairo";
pub const DEFAULT_LEAD_MINUTES: u32 = 5;
pub const DEFAULT_OFFSET_MINUTES: u32 = 30;

// ============================================================================
// Errors
// ============================================================================

/// Rejected policy write or failed ledger access
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("lead minutes must be within 1-30, got {0}")]
    LeadOutOfRange(u32),

    #[error("offset minutes must be within 1-120, got {0}")]
    OffsetOutOfRange(u32),

    #[error("periodic interval must be within 15-1440 minutes, got {0}")]
    IntervalOutOfRange(u32),

    #[error("group {0} is not registered")]
    UnknownGroup(GroupId),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PolicyError {
    /// Write-time configuration errors never succeed on retry
    pub fn is_config_error(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;

// ============================================================================
// Policy
// ============================================================================

/// Which event classes a group receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventToggles {
    pub pre_alert: bool,
    pub prayer_start: bool,
    pub delayed_action: bool,
    pub periodic: bool,
}

impl Default for EventToggles {
    fn default() -> Self {
        Self {
            pre_alert: true,
            prayer_start: true,
            delayed_action: true,
            periodic: true,
        }
    }
}

impl EventToggles {
    pub fn allows(&self, class: EventClass) -> bool {
        match class {
            EventClass::PreAlert => self.pre_alert,
            EventClass::PrayerStart => self.prayer_start,
            EventClass::DelayedAction => self.delayed_action,
            EventClass::Periodic => self.periodic,
        }
    }
}

/// Per-group scheduling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSchedulePolicy {
    pub group: GroupId,
    pub title: Option<String>,
    /// IANA timezone name
    pub timezone: String,
    /// Minutes between the pre-alert and prayer start
    pub lead_minutes: u32,
    /// Minutes between prayer start and the delayed action
    pub offset_minutes: u32,
    pub toggles: EventToggles,
    /// Extra remembrance every N minutes, off when `None`
    pub periodic_interval_minutes: Option<u32>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupSchedulePolicy {
    pub fn new(group: GroupId) -> Self {
        let now = Utc::now();
        Self {
            group,
            title: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            lead_minutes: DEFAULT_LEAD_MINUTES,
            offset_minutes: DEFAULT_OFFSET_MINUTES,
            toggles: EventToggles::default(),
            periodic_interval_minutes: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn tz(&self) -> PolicyResult<Tz> {
        parse_timezone(&self.timezone).ok_or_else(|| PolicyError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn validate(&self) -> PolicyResult<()> {
        self.tz()?;
        if !LEAD_MINUTES_RANGE.contains(&self.lead_minutes) {
            return Err(PolicyError::LeadOutOfRange(self.lead_minutes));
        }
        if !OFFSET_MINUTES_RANGE.contains(&self.offset_minutes) {
            return Err(PolicyError::OffsetOutOfRange(self.offset_minutes));
        }
        if let Some(interval) = self.periodic_interval_minutes {
            if !INTERVAL_MINUTES_RANGE.contains(&interval) {
                return Err(PolicyError::IntervalOutOfRange(interval));
            }
        }
        Ok(())
    }

    /// Active and opted in to `class`
    pub fn receives(&self, class: EventClass) -> bool {
        self.active && self.toggles.allows(class)
    }

    /// Apply a partial update, leaving `self` untouched if the result is invalid
    pub fn apply(&mut self, update: &PolicyUpdate, at: DateTime<Utc>) -> PolicyResult<()> {
        let mut next = self.clone();
        if let Some(title) = &update.title {
            next.title = Some(title.clone());
        }
        if let Some(timezone) = &update.timezone {
            next.timezone = timezone.clone();
        }
        if let Some(lead) = update.lead_minutes {
            next.lead_minutes = lead;
        }
        if let Some(offset) = update.offset_minutes {
            next.offset_minutes = offset;
        }
        if let Some(on) = update.pre_alert {
            next.toggles.pre_alert = on;
        }
        if let Some(on) = update.prayer_start {
            next.toggles.prayer_start = on;
        }
        if let Some(on) = update.delayed_action {
            next.toggles.delayed_action = on;
        }
        if let Some(on) = update.periodic {
            next.toggles.periodic = on;
        }
        if let Some(interval) = update.periodic_interval_minutes {
            next.periodic_interval_minutes = interval;
        }

        next.validate()?;
        next.updated_at = at;
        *self = next;
        Ok(())
    }
}

/// Partial settings change; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyUpdate {
    pub title: Option<String>,
    pub timezone: Option<String>,
    pub lead_minutes: Option<u32>,
    pub offset_minutes: Option<u32>,
    pub pre_alert: Option<bool>,
    pub prayer_start: Option<bool>,
    pub delayed_action: Option<bool>,
    pub periodic: Option<bool>,
    /// `Some(None)` turns interval remembrance off
    pub periodic_interval_minutes: Option<Option<u32>>,
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStatistics {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    /// Active groups opted in per event class
    pub by_event_class: BTreeMap<String, usize>,
    pub with_interval_remembrance: usize,
    pub by_timezone: BTreeMap<String, usize>,
}

// ============================================================================
// Manager
// ============================================================================

/// Owns group policies and the dispatch ledger
#[derive(Clone)]
pub struct ActiveGroupsManager {
    policies: SharedGroupPolicyRepository,
    ledger: SharedDispatchLedger,
    default_timezone: String,
}

impl ActiveGroupsManager {
    pub fn new(policies: SharedGroupPolicyRepository, ledger: SharedDispatchLedger) -> Self {
        Self {
            policies,
            ledger,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }

    /// Timezone given to newly added groups
    pub fn with_default_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.default_timezone = timezone.into();
        self
    }

    /// Register a group, or reactivate it keeping its settings
    pub fn add_group(&self, group: GroupId, title: Option<String>) -> PolicyResult<GroupSchedulePolicy> {
        let now = Utc::now();
        let policy = match self.policies.get_policy(group)? {
            Some(mut existing) => {
                existing.active = true;
                if title.is_some() {
                    existing.title = title;
                }
                existing.updated_at = now;
                existing
            }
            None => {
                let mut policy = GroupSchedulePolicy::new(group).with_timezone(&self.default_timezone);
                policy.title = title;
                policy
            }
        };

        policy.validate()?;
        self.policies.upsert_policy(&policy)?;
        tracing::info!(group = %group, timezone = %policy.timezone, "Group activated");
        Ok(policy)
    }

    /// Deactivate a group; its settings and ledger are kept
    pub fn remove_group(&self, group: GroupId) -> PolicyResult<bool> {
        let removed = self.policies.set_active(group, false, Utc::now())?;
        if removed {
            tracing::info!(group = %group, "Group deactivated");
        }
        Ok(removed)
    }

    pub fn update_policy(&self, group: GroupId, update: &PolicyUpdate) -> PolicyResult<GroupSchedulePolicy> {
        let mut policy = self
            .policies
            .get_policy(group)?
            .ok_or(PolicyError::UnknownGroup(group))?;
        policy.apply(update, Utc::now())?;
        self.policies.upsert_policy(&policy)?;
        tracing::info!(group = %group, "Group policy updated");
        Ok(policy)
    }

    pub fn policy(&self, group: GroupId) -> PolicyResult<Option<GroupSchedulePolicy>> {
        Ok(self.policies.get_policy(group)?)
    }

    pub fn active_policies(&self) -> PolicyResult<Vec<GroupSchedulePolicy>> {
        Ok(self.policies.list_policies(true)?)
    }

    /// Active groups opted in to `class`
    pub fn eligible_targets(&self, class: EventClass) -> PolicyResult<Vec<GroupSchedulePolicy>> {
        Ok(self
            .active_policies()?
            .into_iter()
            .filter(|p| p.receives(class))
            .collect())
    }

    /// Claim an occurrence for delivery. True only for the first caller.
    pub fn record_dispatched(
        &self,
        group: GroupId,
        class: EventClass,
        occurrence: &OccurrenceKey,
    ) -> PolicyResult<bool> {
        self.claim(&DedupKey::new(group, class, occurrence.clone()), LedgerMark::Dispatched)
    }

    /// Claim an occurrence that will not be delivered (overdue)
    pub fn record_skipped(&self, key: &DedupKey) -> PolicyResult<bool> {
        self.claim(key, LedgerMark::Skipped)
    }

    /// Atomic check-and-record of a dedup key
    pub fn claim(&self, key: &DedupKey, mark: LedgerMark) -> PolicyResult<bool> {
        Ok(self.ledger.try_record(key, mark, Utc::now())?)
    }

    pub fn already_dispatched(
        &self,
        group: GroupId,
        class: EventClass,
        occurrence: &OccurrenceKey,
    ) -> PolicyResult<bool> {
        Ok(self
            .ledger
            .contains(&DedupKey::new(group, class, occurrence.clone()))?)
    }

    pub fn last_dispatched(&self, group: GroupId) -> PolicyResult<Option<LedgerEntry>> {
        Ok(self.ledger.last_for_group(group)?)
    }

    pub fn prune_ledger(&self, before: DateTime<Utc>) -> PolicyResult<usize> {
        Ok(self.ledger.prune_before(before)?)
    }

    pub fn statistics(&self) -> PolicyResult<GroupStatistics> {
        let all = self.policies.list_policies(false)?;
        let mut stats = GroupStatistics {
            total: all.len(),
            ..Default::default()
        };

        for policy in &all {
            if !policy.active {
                stats.inactive += 1;
                continue;
            }
            stats.active += 1;
            for class in EventClass::ALL {
                if policy.toggles.allows(class) {
                    *stats.by_event_class.entry(class.as_str().to_string()).or_default() += 1;
                }
            }
            if policy.periodic_interval_minutes.is_some() {
                stats.with_interval_remembrance += 1;
            }
            *stats.by_timezone.entry(policy.timezone.clone()).or_default() += 1;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Prayer;
    use crate::storage::Repositories;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn managers() -> Vec<ActiveGroupsManager> {
        let mut repos = vec![Repositories::mock()];
        repos.push(Repositories::from_store(std::sync::Arc::new(
            crate::storage::SqliteRepository::in_memory().unwrap(),
        )));
        repos
            .into_iter()
            .map(|r| ActiveGroupsManager::new(r.groups, r.ledger))
            .collect()
    }

    fn occurrence() -> OccurrenceKey {
        OccurrenceKey::prayer(Prayer::Dhuhr, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
    }

    #[test]
    fn test_policy_validation_bounds() {
        let mut policy = GroupSchedulePolicy::new(GroupId(1));
        assert!(policy.validate().is_ok());

        policy.lead_minutes = 31;
        assert!(matches!(policy.validate(), Err(PolicyError::LeadOutOfRange(31))));
        policy.lead_minutes = 5;

        policy.offset_minutes = 0;
        assert!(matches!(policy.validate(), Err(PolicyError::OffsetOutOfRange(0))));
        policy.offset_minutes = 30;

        policy.periodic_interval_minutes = Some(5);
        assert!(matches!(policy.validate(), Err(PolicyError::IntervalOutOfRange(5))));
        policy.periodic_interval_minutes = None;

        policy.timezone = "Mars/Olympus".to_string();
        assert!(matches!(policy.validate(), Err(PolicyError::InvalidTimezone(_))));
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut policy = GroupSchedulePolicy::new(GroupId(1));
        let before = policy.clone();
        let update = PolicyUpdate {
            lead_minutes: Some(10),
            offset_minutes: Some(500),
            ..Default::default()
        };
        assert!(policy.apply(&update, Utc::now()).is_err());
        assert_eq!(policy, before);

        let update = PolicyUpdate {
            lead_minutes: Some(10),
            delayed_action: Some(false),
            periodic_interval_minutes: Some(Some(60)),
            ..Default::default()
        };
        policy.apply(&update, Utc::now()).unwrap();
        assert_eq!(policy.lead_minutes, 10);
        assert!(!policy.toggles.delayed_action);
        assert_eq!(policy.periodic_interval_minutes, Some(60));
    }

    #[test]
    fn test_add_remove_and_eligibility() {
        for manager in managers() {
            manager.add_group(GroupId(1), Some("Masjid".to_string())).unwrap();
            manager.add_group(GroupId(2), None).unwrap();
            manager
                .update_policy(
                    GroupId(2),
                    &PolicyUpdate {
                        pre_alert: Some(false),
                        ..Default::default()
                    },
                )
                .unwrap();

            let pre: Vec<_> = manager
                .eligible_targets(EventClass::PreAlert)
                .unwrap()
                .into_iter()
                .map(|p| p.group)
                .collect();
            assert_eq!(pre, vec![GroupId(1)]);
            assert_eq!(manager.eligible_targets(EventClass::PrayerStart).unwrap().len(), 2);

            assert!(manager.remove_group(GroupId(1)).unwrap());
            assert!(manager.eligible_targets(EventClass::PrayerStart).unwrap().len() == 1);

            // Re-adding keeps the earlier settings
            let readded = manager.add_group(GroupId(2), None).unwrap();
            assert!(!readded.toggles.pre_alert);
        }
    }

    #[test]
    fn test_update_unknown_group() {
        for manager in managers() {
            let err = manager
                .update_policy(GroupId(404), &PolicyUpdate::default())
                .unwrap_err();
            assert!(matches!(err, PolicyError::UnknownGroup(GroupId(404))));
            assert!(err.is_config_error());
        }
    }

    #[test]
    fn test_at_most_once_record() {
        for manager in managers() {
            let occ = occurrence();
            assert!(!manager.already_dispatched(GroupId(1), EventClass::PrayerStart, &occ).unwrap());
            assert!(manager.record_dispatched(GroupId(1), EventClass::PrayerStart, &occ).unwrap());
            assert!(manager.already_dispatched(GroupId(1), EventClass::PrayerStart, &occ).unwrap());
            assert!(!manager.record_dispatched(GroupId(1), EventClass::PrayerStart, &occ).unwrap());

            // Other classes of the same occurrence are independent
            assert!(!manager.already_dispatched(GroupId(1), EventClass::PreAlert, &occ).unwrap());

            let last = manager.last_dispatched(GroupId(1)).unwrap().unwrap();
            assert_eq!(last.key.class, EventClass::PrayerStart);
        }
    }

    #[test]
    fn test_statistics() {
        for manager in managers() {
            manager.add_group(GroupId(1), None).unwrap();
            manager.add_group(GroupId(2), None).unwrap();
            manager.add_group(GroupId(3), None).unwrap();
            manager
                .update_policy(
                    GroupId(3),
                    &PolicyUpdate {
                        timezone: Some("Asia/Riyadh".to_string()),
                        periodic: Some(false),
                        ..Default::default()
                    },
                )
                .unwrap();
            manager.remove_group(GroupId(2)).unwrap();

            let stats = manager.statistics().unwrap();
            assert_eq!(stats.total, 3);
            assert_eq!(stats.active, 2);
            assert_eq!(stats.inactive, 1);
            assert_eq!(stats.by_event_class["prayer_start"], 2);
            assert_eq!(stats.by_event_class["periodic"], 1);
            assert_eq!(stats.by_timezone["Asia/Riyadh"], 1);
        }
    }

    proptest! {
        #[test]
        fn prop_only_first_claim_wins(attempts in 1usize..20, group in -1000i64..1000) {
            let manager = ActiveGroupsManager::new(
                Repositories::mock().groups,
                Repositories::mock().ledger,
            );
            let occ = occurrence();
            let wins = (0..attempts)
                .filter(|_| manager.record_dispatched(GroupId(group), EventClass::DelayedAction, &occ).unwrap())
                .count();
            prop_assert_eq!(wins, 1);
            prop_assert!(manager.already_dispatched(GroupId(group), EventClass::DelayedAction, &occ).unwrap());
        }
    }
}
