//! Sanity checks for resolved prayer times
//!
//! Upstream payloads are untrusted. Before a day of times is cached it must
//! pass two layers of checks:
//!
//! - **Structural** (always fatal): every obligatory prayer present, instants
//!   strictly increasing in canonical order, inside the civil day, and no two
//!   instants closer than the minimum gap.
//! - **Plausibility** (scored): per-prayer hour windows and the spacing
//!   between consecutive prayers. Each issue lowers a quality score; a day
//!   scoring under the configured minimum is rejected as well.
//!
//! Rejections are data-quality failures, tracked separately from transport
//! failures by the health monitor.

use chrono::{NaiveTime, Timelike};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::config::ValidationConfig;
use crate::models::{DailyPrayerTimes, Prayer};

// ============================================================================
// Errors and Reports
// ============================================================================

/// A day of times that must not be trusted
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid prayer times from '{origin}': {reason}")]
pub struct InvalidTimesError {
    /// Source that produced the data
    pub origin: String,
    pub reason: String,
}

impl InvalidTimesError {
    pub fn new(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

/// Severity of a single validation finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl IssueSeverity {
    /// Points deducted from the quality score
    pub fn penalty(&self) -> i32 {
        match self {
            Self::Info => 2,
            Self::Warning => 10,
            Self::Error => 20,
            Self::Critical => 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub prayer: Option<Prayer>,
    pub message: String,
}

/// Outcome of validating one day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    /// 100 minus the penalties of every issue, floored at zero
    pub score: i32,
}

impl ValidationReport {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        let penalty: i32 = issues.iter().map(|i| i.severity.penalty()).sum();
        Self {
            issues,
            score: (100 - penalty).max(0),
        }
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
    }
}

// ============================================================================
// Time Parsing
// ============================================================================

/// Parse an upstream time string.
///
/// Accepts `HH:MM`, `HH:MM:SS`, a trailing zone label such as
/// `04:58 (EET)`, and 12-hour `hh:mm AM/PM`.
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();

    let re = TIME_RE.get_or_init(|| {
        Regex::new(r"^\s*(\d{1,2}):(\d{2})(?::(\d{2}))?\s*([AaPp][Mm])?(?:\s*\(.*\))?\s*$")
            .expect("Invalid regex pattern")
    });

    let caps = re.captures(raw)?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(2)?.as_str().parse().ok()?;
    let second: u32 = match caps.get(3) {
        Some(s) => s.as_str().parse().ok()?,
        None => 0,
    };

    if let Some(meridiem) = caps.get(4) {
        if !(1..=12).contains(&hour) {
            return None;
        }
        let pm = meridiem.as_str().eq_ignore_ascii_case("pm");
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }

    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Turn provider-named time strings into typed instants.
///
/// Unknown names (imsak, midnight, ...) are ignored; a known name with an
/// unparseable value is a data-quality failure.
pub fn standardize<'a>(
    origin: &str,
    raw: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<BTreeMap<Prayer, NaiveTime>, InvalidTimesError> {
    let mut times = BTreeMap::new();

    for (name, value) in raw {
        let Ok(prayer) = name.parse::<Prayer>() else {
            continue;
        };
        let time = parse_time(value).ok_or_else(|| {
            InvalidTimesError::new(origin, format!("unparseable time for {prayer}: '{value}'"))
        })?;
        times.insert(prayer, time);
    }

    Ok(times)
}

// ============================================================================
// Validator
// ============================================================================

/// Plausible hour range for a prayer, inclusive
#[derive(Debug, Clone, Copy)]
struct HourWindow {
    prayer: Prayer,
    first_hour: u32,
    last_hour: u32,
}

/// Plausible spacing in minutes between two prayers
#[derive(Debug, Clone, Copy)]
struct IntervalWindow {
    from: Prayer,
    to: Prayer,
    min_minutes: i64,
    max_minutes: i64,
}

const HOUR_WINDOWS: [HourWindow; 5] = [
    HourWindow { prayer: Prayer::Fajr, first_hour: 3, last_hour: 6 },
    HourWindow { prayer: Prayer::Dhuhr, first_hour: 11, last_hour: 14 },
    HourWindow { prayer: Prayer::Asr, first_hour: 14, last_hour: 18 },
    HourWindow { prayer: Prayer::Maghrib, first_hour: 17, last_hour: 20 },
    HourWindow { prayer: Prayer::Isha, first_hour: 19, last_hour: 23 },
];

const INTERVAL_WINDOWS: [IntervalWindow; 4] = [
    IntervalWindow { from: Prayer::Fajr, to: Prayer::Dhuhr, min_minutes: 360, max_minutes: 600 },
    IntervalWindow { from: Prayer::Dhuhr, to: Prayer::Asr, min_minutes: 180, max_minutes: 360 },
    IntervalWindow { from: Prayer::Asr, to: Prayer::Maghrib, min_minutes: 120, max_minutes: 300 },
    IntervalWindow { from: Prayer::Maghrib, to: Prayer::Isha, min_minutes: 60, max_minutes: 180 },
];

/// Validates one day of prayer times
#[derive(Debug, Clone)]
pub struct DataValidator {
    config: ValidationConfig,
}

impl Default for DataValidator {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

impl DataValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Only the structural checks, for locations outside the default windows
    pub fn structural_only() -> Self {
        Self::new(ValidationConfig {
            check_windows: false,
            ..ValidationConfig::default()
        })
    }

    /// Validate a day, returning the report when the data can be trusted
    pub fn validate(&self, times: &DailyPrayerTimes) -> Result<ValidationReport, InvalidTimesError> {
        let mut issues = self.structural_issues(times);
        if self.config.check_windows {
            issues.extend(self.plausibility_issues(times));
        }

        let report = ValidationReport::from_issues(issues);

        if let Some(critical) = report
            .issues
            .iter()
            .find(|i| i.severity == IssueSeverity::Critical)
        {
            return Err(InvalidTimesError::new(&times.source, critical.message.clone()));
        }

        if report.score < self.config.min_quality_score {
            return Err(InvalidTimesError::new(
                &times.source,
                format!(
                    "quality score {} below minimum {} ({} issues)",
                    report.score,
                    self.config.min_quality_score,
                    report.issues.len()
                ),
            ));
        }

        for issue in report.warnings() {
            tracing::debug!(
                source = %times.source,
                date = %times.date,
                prayer = ?issue.prayer,
                issue = %issue.message,
                "Validation warning"
            );
        }

        Ok(report)
    }

    fn structural_issues(&self, times: &DailyPrayerTimes) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for prayer in Prayer::OBLIGATORY {
            if !times.times.contains_key(&prayer) {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Critical,
                    prayer: Some(prayer),
                    message: format!("missing required prayer: {prayer}"),
                });
            }
        }

        // NaiveTime cannot leave the day; only the last minute is suspect
        let last_minute = NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN);
        for (prayer, time) in times.iter() {
            if time > last_minute {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Critical,
                    prayer: Some(prayer),
                    message: format!("{prayer} at {time} falls outside the civil day"),
                });
            }
        }

        // BTreeMap iterates in canonical order, so adjacent pairs are the ones to compare
        let ordered: Vec<(Prayer, NaiveTime)> = times.iter().collect();
        for pair in ordered.windows(2) {
            let ((a, ta), (b, tb)) = (pair[0], pair[1]);
            if tb <= ta {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Critical,
                    prayer: Some(b),
                    message: format!("{b} ({tb}) is not after {a} ({ta})"),
                });
            } else if (tb - ta).num_minutes() < self.config.min_gap_minutes {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Critical,
                    prayer: Some(b),
                    message: format!(
                        "{a} and {b} are only {} minutes apart",
                        (tb - ta).num_minutes()
                    ),
                });
            }
        }

        issues
    }

    fn plausibility_issues(&self, times: &DailyPrayerTimes) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for window in HOUR_WINDOWS {
            let Some(time) = times.time_of(window.prayer) else {
                continue;
            };
            if !(window.first_hour..=window.last_hour).contains(&time.hour()) {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Warning,
                    prayer: Some(window.prayer),
                    message: format!(
                        "{} at {time} outside expected hours {:02}-{:02}",
                        window.prayer, window.first_hour, window.last_hour
                    ),
                });
            }
        }

        for window in INTERVAL_WINDOWS {
            let (Some(from), Some(to)) = (times.time_of(window.from), times.time_of(window.to))
            else {
                continue;
            };
            let minutes = (to - from).num_minutes();
            if !(window.min_minutes..=window.max_minutes).contains(&minutes) {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Warning,
                    prayer: Some(window.to),
                    message: format!(
                        "{} to {} is {minutes} minutes, expected {}-{}",
                        window.from, window.to, window.min_minutes, window.max_minutes
                    ),
                });
            }
        }

        issues
    }
}
