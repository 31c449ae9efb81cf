//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mawaqit::config::{Config, ProviderConfig};
use mawaqit::models::{DailyPrayerTimes, Prayer, ScheduledEvent};
use mawaqit::scheduler::{DeliveryChannel, DeliveryError};
use mawaqit::source::ProviderKind;

/// The reference day used across scenarios
pub fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
}

pub fn cairo() -> Tz {
    "Africa/Cairo".parse().unwrap()
}

/// Absolute instant of a Cairo wall-clock time on `day`
pub fn cairo_on(day: NaiveDate, h: u32, m: u32) -> DateTime<Utc> {
    cairo()
        .from_local_datetime(&day.and_hms_opt(h, m, 0).unwrap())
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

pub fn cairo_at(h: u32, m: u32) -> DateTime<Utc> {
    cairo_on(date(), h, m)
}

/// Plausible Cairo times for early March
pub fn cairo_times() -> BTreeMap<Prayer, NaiveTime> {
    [
        (Prayer::Fajr, (4, 40)),
        (Prayer::Sunrise, (6, 5)),
        (Prayer::Dhuhr, (12, 5)),
        (Prayer::Asr, (15, 28)),
        (Prayer::Maghrib, (18, 4)),
        (Prayer::Isha, (19, 21)),
    ]
    .into_iter()
    .map(|(p, (h, m))| (p, NaiveTime::from_hms_opt(h, m, 0).unwrap()))
    .collect()
}

pub fn cairo_day(day: NaiveDate, fetched_at: DateTime<Utc>) -> DailyPrayerTimes {
    DailyPrayerTimes::new(day, cairo_times(), "aladhan", fetched_at, Duration::hours(24))
}

/// Upstream JSON in the aladhan shape
pub fn aladhan_body() -> Value {
    json!({
        "code": 200,
        "status": "OK",
        "data": {
            "timings": {
                "Fajr": "04:40 (EET)",
                "Sunrise": "06:05 (EET)",
                "Dhuhr": "12:05 (EET)",
                "Asr": "15:28 (EET)",
                "Sunset": "18:04 (EET)",
                "Maghrib": "18:04 (EET)",
                "Isha": "19:21 (EET)",
                "Imsak": "04:30 (EET)",
                "Midnight": "00:05 (EET)"
            }
        }
    })
}

/// Upstream JSON in the islamicfinder shape
pub fn islamicfinder_body() -> Value {
    json!({
        "results": {
            "Fajr": "4:40 am",
            "Duha": "6:25 am",
            "Dhuhr": "12:05 pm",
            "Asr": "3:28 pm",
            "Maghrib": "6:04 pm",
            "Isha": "7:21 pm"
        },
        "success": true
    })
}

/// Config whose providers all point at a local mock server
pub fn config_for(server_uri: &str) -> Config {
    let mut config = Config::default();
    config.sources.attempt_timeout_secs = 5;
    config.sources.requests_per_second = 50;
    config.sources.providers = vec![
        ProviderConfig {
            name: "aladhan".to_string(),
            kind: ProviderKind::Aladhan,
            base_url: format!("{server_uri}/v1/timingsByCity"),
            priority: 1,
            enabled: true,
        },
        ProviderConfig {
            name: "islamicfinder".to_string(),
            kind: ProviderKind::IslamicFinder,
            base_url: format!("{server_uri}/api/prayer_times"),
            priority: 2,
            enabled: true,
        },
    ];
    config
}

/// Delivery channel that records what it was handed
#[derive(Default)]
pub struct Recorder {
    pub delivered: Mutex<Vec<ScheduledEvent>>,
    pub fail_with: Option<DeliveryError>,
}

impl Recorder {
    pub fn failing(error: DeliveryError) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(error),
            ..Default::default()
        })
    }

    pub fn keys(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.dedup_key().to_string())
            .collect()
    }
}

#[async_trait]
impl DeliveryChannel for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn deliver(&self, event: &ScheduledEvent) -> Result<(), DeliveryError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.delivered.lock().unwrap().push(event.clone());
        Ok(())
    }
}
