use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, FixedOffset, SecondsFormat, TimeZone, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::trace;

use crate::budget::{RequestBudget, RequestKind};
use crate::cache::{Cache, CachePolicy, RequestMemo};
use crate::errors::{AppError, AppResult};
use crate::geo::Coordinates;
use crate::http::HttpClient;
use crate::profile::TravelPolicy;

pub const ROUTES_FIELD_MASK: &str = "routes.duration";

/// Destination of one travel-time lookup.
#[derive(Debug, Clone, Copy)]
pub struct TravelTarget<'a> {
    pub place_id: &'a str,
    pub location: Coordinates,
}

pub struct TravelClient {
    http: HttpClient,
    cache: Arc<Cache>,
    budget: Arc<RequestBudget>,
    url: String,
    bucket_minutes: u32,
    utc_offset: FixedOffset,
    policy: CachePolicy,
    memo: Mutex<RequestMemo<Option<u64>>>,
}

impl TravelClient {
    pub fn new(
        http: HttpClient,
        cache: Arc<Cache>,
        budget: Arc<RequestBudget>,
        url: impl Into<String>,
        travel: &TravelPolicy,
        policy: CachePolicy,
    ) -> AppResult<Self> {
        if travel.bucket_minutes == 0 {
            return Err(AppError::config("travel bucket minutes must be positive"));
        }
        Ok(Self {
            http,
            cache,
            budget,
            url: url.into(),
            bucket_minutes: travel.bucket_minutes,
            utc_offset: utc_offset(travel.utc_offset_minutes)?,
            policy,
            memo: Mutex::new(RequestMemo::default()),
        })
    }

    /// Route duration in seconds, `None` when the backend found no route.
    pub async fn compute_duration(
        &self,
        origin_id: &str,
        origin: Coordinates,
        target: TravelTarget<'_>,
        departure: DateTime<Utc>,
        mode: &str,
    ) -> AppResult<Option<u64>> {
        let bucket = bucket_departure_key(departure, self.bucket_minutes, self.utc_offset);
        let key = format!("{origin_id}|{}|{mode}|{bucket}", target.place_id);
        let metrics = self.budget.metrics();

        if let Some(previous) = self.memo.lock().lookup(&key) {
            metrics.record_dedup_skip(RequestKind::Travel);
            trace!(origin_id, place_id = target.place_id, "travel request deduplicated");
            return Ok(if self.policy.writes() { previous.flatten() } else { None });
        }

        if self.policy.reads() {
            if let Some(cached) = self.cache.get_travel_duration(&key)? {
                metrics.record_cache_hit(RequestKind::Travel);
                self.memo.lock().remember(&key, Some(cached));
                return Ok(cached);
            }
        }

        self.budget.consume(RequestKind::Travel)?;
        self.memo.lock().remember(&key, None);
        let body = build_routes_body(origin, target.location, departure, mode);
        let response = self
            .http
            .post_json(&self.url, &body, ROUTES_FIELD_MASK, None)
            .await?;
        let duration = parse_routes_duration(&response);
        if self.policy.writes() {
            self.cache
                .set_travel_duration(&key, origin_id, target.place_id, mode, duration)?;
            self.memo.lock().remember(&key, Some(duration));
        }
        Ok(duration)
    }
}

pub fn utc_offset(minutes: i32) -> AppResult<FixedOffset> {
    FixedOffset::east_opt(minutes.saturating_mul(60))
        .ok_or_else(|| AppError::config(format!("invalid UTC offset: {minutes} minutes")))
}

pub fn build_routes_body(
    origin: Coordinates,
    destination: Coordinates,
    departure: DateTime<Utc>,
    mode: &str,
) -> Value {
    json!({
        "origin": {"location": {"latLng": {"latitude": origin.lat, "longitude": origin.lon}}},
        "destination": {"location": {"latLng": {"latitude": destination.lat, "longitude": destination.lon}}},
        "travelMode": mode,
        "departureTime": departure.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// Duration of the first route: `"123s"`, `"123.4s"` or a bare number.
pub fn parse_routes_duration(response: &Value) -> Option<u64> {
    let duration = response.get("routes")?.as_array()?.first()?.get("duration")?;
    let seconds = match duration {
        Value::String(text) => text.trim().trim_end_matches('s').parse::<f64>().ok()?,
        Value::Number(number) => number.as_f64()?,
        _ => return None,
    };
    (seconds.is_finite() && seconds >= 0.0).then(|| seconds as u64)
}

/// `wd{weekday}_{HHMM}` of the local bucket start; weekday counts from Monday = 0.
pub fn bucket_departure_key(departure: DateTime<Utc>, bucket_minutes: u32, offset: FixedOffset) -> String {
    let local = departure.with_timezone(&offset);
    let bucket = bucket_minutes.max(1);
    let total = local.hour() * 60 + local.minute();
    let start = (total / bucket) * bucket;
    format!(
        "wd{}_{:02}{:02}",
        local.weekday().num_days_from_monday(),
        start / 60,
        start % 60
    )
}

/// Next weekday at the configured local wall-clock time, strictly after `now`.
pub fn compute_departure_time(now: DateTime<Utc>, travel: &TravelPolicy) -> AppResult<DateTime<Utc>> {
    let offset = utc_offset(travel.utc_offset_minutes)?;
    let local_now = now.with_timezone(&offset);
    let naive = local_now
        .date_naive()
        .and_hms_opt(travel.departure_hour, travel.departure_minute, 0)
        .ok_or_else(|| AppError::config("departure time is not a valid wall-clock time"))?;
    let mut candidate = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| AppError::config("departure time is ambiguous"))?;
    if candidate <= local_now {
        candidate = candidate + Duration::days(1);
    }
    while matches!(candidate.weekday(), Weekday::Sat | Weekday::Sun) {
        candidate = candidate + Duration::days(1);
    }
    Ok(candidate.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    fn plus_one_hour() -> FixedOffset {
        utc_offset(60).unwrap()
    }

    #[test]
    fn departures_in_one_window_share_a_bucket() {
        let a = bucket_departure_key(at("2026-01-26T16:10:00Z"), 15, plus_one_hour());
        let b = bucket_departure_key(at("2026-01-26T16:14:00Z"), 15, plus_one_hour());
        let c = bucket_departure_key(at("2026-01-26T16:25:00Z"), 15, plus_one_hour());
        assert_eq!(a, "wd0_1700");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(c, "wd0_1715");
    }

    #[test]
    fn departure_skips_weekends_and_past_times() {
        let travel = TravelPolicy::default();
        // Saturday morning rolls to Monday 17:00 local.
        assert_eq!(
            compute_departure_time(at("2026-01-24T10:00:00Z"), &travel).unwrap(),
            at("2026-01-26T16:00:00Z")
        );
        assert_eq!(
            compute_departure_time(at("2026-01-26T15:00:00Z"), &travel).unwrap(),
            at("2026-01-26T16:00:00Z")
        );
        assert_eq!(
            compute_departure_time(at("2026-01-26T16:30:00Z"), &travel).unwrap(),
            at("2026-01-27T16:00:00Z")
        );
        assert_eq!(
            compute_departure_time(at("2026-01-30T17:00:00Z"), &travel).unwrap(),
            at("2026-02-02T16:00:00Z")
        );
    }

    #[test]
    fn parses_route_durations() {
        assert_eq!(parse_routes_duration(&json!({"routes": [{"duration": "123s"}]})), Some(123));
        assert_eq!(parse_routes_duration(&json!({"routes": [{"duration": "123.7s"}]})), Some(123));
        assert_eq!(parse_routes_duration(&json!({"routes": [{"duration": 90}]})), Some(90));
        assert_eq!(parse_routes_duration(&json!({"routes": []})), None);
        assert_eq!(parse_routes_duration(&json!({"routes": [{"duration": "soon"}]})), None);
        assert_eq!(parse_routes_duration(&json!({})), None);
    }

    #[test]
    fn routes_body_uses_utc_timestamp() {
        let body = build_routes_body(
            Coordinates::new(52.0, 21.0),
            Coordinates::new(52.1, 21.1),
            at("2026-01-26T16:00:00Z"),
            "TRANSIT",
        );
        assert_eq!(body["departureTime"], json!("2026-01-26T16:00:00Z"));
        assert_eq!(body["destination"]["location"]["latLng"]["longitude"], json!(21.1));
        assert_eq!(body["travelMode"], json!("TRANSIT"));
    }
}
