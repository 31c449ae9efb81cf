//! HTTP time source for the supported upstream providers
//!
//! Each provider is rate limited with governor and returns JSON with a
//! different shape. Extraction only pulls the provider-named time strings;
//! parsing and validation happen in the client.

use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{header::ACCEPT, Client, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;

use super::{ProviderKind, RawPrayerTimes, SourceFailure, TimeSource};
use crate::config::{ProviderConfig, SourcesConfig};
use crate::models::Location;

/// Upstream provider reached over HTTP
pub struct HttpTimeSource {
    name: String,
    kind: ProviderKind,
    base_url: String,
    priority: u32,

    /// HTTP client with configured timeout and compression
    client: Client,

    /// Keeps outbound requests under the provider's quota
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,

    timeout: Duration,
}

impl HttpTimeSource {
    pub fn new(provider: &ProviderConfig, sources: &SourcesConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(sources.attempt_timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(sources.user_agent.clone())
            .build()?;

        let rate = NonZeroU32::new(sources.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            name: provider.name.clone(),
            kind: provider.kind,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            priority: provider.priority,
            client,
            rate_limiter: RateLimiter::direct(Quota::per_second(rate)),
            timeout,
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Request URL and query for a date
    fn request_parts(&self, date: NaiveDate, location: &Location) -> (String, Vec<(&'static str, String)>) {
        match self.kind {
            ProviderKind::Aladhan => (
                format!("{}/{}", self.base_url, date.format("%d-%m-%Y")),
                vec![
                    ("city", location.city.clone()),
                    ("country", location.country.clone()),
                    ("method", location.method.to_string()),
                    ("school", location.school.to_string()),
                ],
            ),
            ProviderKind::IslamicFinder => (
                self.base_url.clone(),
                vec![
                    ("city", location.city.clone()),
                    ("country", location.country_code.clone()),
                    ("method", location.method.to_string()),
                    ("juristic", location.school.to_string()),
                    ("date", date.format("%Y-%m-%d").to_string()),
                ],
            ),
            ProviderKind::PrayZone => (
                self.base_url.clone(),
                vec![
                    ("city", location.city.to_lowercase()),
                    ("date", date.format("%Y-%m-%d").to_string()),
                ],
            ),
        }
    }

    fn classify(&self, error: &reqwest::Error) -> SourceFailure {
        if error.is_timeout() {
            SourceFailure::Timeout(self.timeout)
        } else if error.is_decode() {
            SourceFailure::Malformed(error.to_string())
        } else {
            SourceFailure::Connect(error.to_string())
        }
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn fetch(
        &self,
        date: NaiveDate,
        location: &Location,
    ) -> Result<RawPrayerTimes, SourceFailure> {
        self.rate_limiter.until_ready().await;

        let (url, query) = self.request_parts(date, location);
        tracing::debug!(source = %self.name, %url, "Fetching prayer times");

        let response = self
            .client
            .get(&url)
            .query(&query)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceFailure::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceFailure::Status(status.as_u16()));
        }

        let body: Value = response.json().await.map_err(|e| self.classify(&e))?;
        let times = extract_timings(self.kind, &body)?;

        Ok(RawPrayerTimes {
            source: self.name.clone(),
            date,
            times,
        })
    }
}

/// Pull the provider-named time strings out of a response body
pub fn extract_timings(
    kind: ProviderKind,
    body: &Value,
) -> Result<BTreeMap<String, String>, SourceFailure> {
    let timings = match kind {
        ProviderKind::Aladhan => {
            let code = body.get("code").and_then(Value::as_i64);
            if code != Some(200) {
                let status = body.get("status").and_then(Value::as_str).unwrap_or("unknown");
                return Err(SourceFailure::Malformed(format!(
                    "aladhan answered code {code:?} ({status})"
                )));
            }
            body.pointer("/data/timings")
        }
        ProviderKind::IslamicFinder => body.get("results"),
        ProviderKind::PrayZone => body.pointer("/results/datetime/0/times"),
    };

    let object = timings
        .and_then(Value::as_object)
        .ok_or_else(|| SourceFailure::Malformed(format!("{kind} payload has no timings object")))?;

    let times: BTreeMap<String, String> = object
        .iter()
        .filter_map(|(name, value)| value.as_str().map(|v| (name.clone(), v.to_string())))
        .collect();

    if times.is_empty() {
        return Err(SourceFailure::Malformed(format!("{kind} payload has empty timings")));
    }

    Ok(times)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(kind: ProviderKind) -> HttpTimeSource {
        let provider = ProviderConfig {
            name: kind.as_str().to_string(),
            kind,
            base_url: "https://example.com/api/".to_string(),
            priority: 1,
            enabled: true,
        };
        HttpTimeSource::new(&provider, &SourcesConfig::default()).unwrap()
    }

    #[test]
    fn test_extract_aladhan() {
        let body = json!({
            "code": 200,
            "status": "OK",
            "data": { "timings": { "Fajr": "04:58 (EET)", "Dhuhr": "12:05 (EET)", "Imsak": "04:48" } }
        });
        let times = extract_timings(ProviderKind::Aladhan, &body).unwrap();
        assert_eq!(times["Fajr"], "04:58 (EET)");
        assert_eq!(times.len(), 3);
    }

    #[test]
    fn test_extract_aladhan_error_code() {
        let body = json!({ "code": 400, "status": "Bad Request", "data": "Invalid date" });
        let err = extract_timings(ProviderKind::Aladhan, &body).unwrap_err();
        assert!(matches!(err, SourceFailure::Malformed(ref m) if m.contains("Bad Request")));
    }

    #[test]
    fn test_extract_islamicfinder_and_prayzone() {
        let finder = json!({ "results": { "Fajr": "4:58 AM", "Isha": "7:15 PM" } });
        assert_eq!(
            extract_timings(ProviderKind::IslamicFinder, &finder).unwrap()["Isha"],
            "7:15 PM"
        );

        let zone = json!({
            "results": { "datetime": [ { "times": { "Asr": "15:30" }, "date": {} } ] }
        });
        assert_eq!(extract_timings(ProviderKind::PrayZone, &zone).unwrap()["Asr"], "15:30");

        assert!(extract_timings(ProviderKind::PrayZone, &json!({ "results": {} })).is_err());
    }

    #[test]
    fn test_request_parts() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let location = Location::default();

        let (url, query) = source(ProviderKind::Aladhan).request_parts(date, &location);
        assert_eq!(url, "https://example.com/api/10-03-2025");
        assert!(query.contains(&("method", "5".to_string())));

        let (url, query) = source(ProviderKind::PrayZone).request_parts(date, &location);
        assert_eq!(url, "https://example.com/api");
        assert!(query.contains(&("city", "cairo".to_string())));
        assert!(query.contains(&("date", "2025-03-10".to_string())));
    }
}
