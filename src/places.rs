use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::trace;

use crate::budget::{RequestBudget, RequestKind};
use crate::cache::{make_request_cache_key, Cache, CachePolicy, RequestMemo};
use crate::errors::AppResult;
use crate::geo::HarvestPoint;
use crate::http::HttpClient;
use crate::place::PlaceRecord;

pub const PLACES_FIELD_MASK: &str = "places.id,places.displayName,places.rating,places.userRatingCount,places.location,places.types,places.businessStatus,nextPageToken";

/// Text-search client: in-run dedup, then persistent cache, then budgeted network.
pub struct PlacesClient {
    http: HttpClient,
    cache: Arc<Cache>,
    budget: Arc<RequestBudget>,
    url: String,
    field_mask: String,
    bias_radius_m: u32,
    policy: CachePolicy,
    memo: Mutex<RequestMemo<Value>>,
}

impl PlacesClient {
    pub fn new(
        http: HttpClient,
        cache: Arc<Cache>,
        budget: Arc<RequestBudget>,
        url: impl Into<String>,
        bias_radius_m: u32,
        policy: CachePolicy,
    ) -> Self {
        Self {
            http,
            cache,
            budget,
            url: url.into(),
            field_mask: PLACES_FIELD_MASK.to_string(),
            bias_radius_m,
            policy,
            memo: Mutex::new(RequestMemo::default()),
        }
    }

    /// One page of raw results for `query` biased around `point`.
    pub async fn search_text(
        &self,
        query: &str,
        point: &HarvestPoint,
        type_filter: Option<&str>,
        page_token: Option<&str>,
        radius_m: Option<u32>,
    ) -> AppResult<Value> {
        let radius = radius_m.unwrap_or(self.bias_radius_m);
        let body = build_text_search_body(query, point, type_filter, page_token, radius);
        let key = make_request_cache_key(&self.url, &self.field_mask, &body);
        let metrics = self.budget.metrics();

        if let Some(previous) = self.memo.lock().lookup(&key) {
            metrics.record_dedup_skip(RequestKind::Search);
            trace!(query, point = %point.id, "search request deduplicated");
            return Ok(match previous {
                Some(payload) if self.policy.writes() => payload,
                _ => Value::Object(Map::new()),
            });
        }

        if self.policy.reads() {
            if let Some(cached) = self.cache.get_search_response(&key)? {
                metrics.record_cache_hit(RequestKind::Search);
                self.memo.lock().remember(&key, Some(cached.clone()));
                return Ok(cached);
            }
        }

        self.budget.consume(RequestKind::Search)?;
        self.memo.lock().remember(&key, None);
        let response = self
            .http
            .post_json(&self.url, &body, &self.field_mask, None)
            .await?;
        if self.policy.writes() {
            self.cache.set_search_response(&key, &response)?;
            self.memo.lock().remember(&key, Some(response.clone()));
        }
        Ok(response)
    }

    /// Follows next-page tokens until exhausted or `max_pages` pages were read.
    pub async fn search_all(
        &self,
        query: &str,
        point: &HarvestPoint,
        type_filter: Option<&str>,
        max_pages: usize,
        radius_m: Option<u32>,
    ) -> AppResult<Vec<PlaceRecord>> {
        let mut places = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..max_pages {
            let response = self
                .search_text(query, point, type_filter, page_token.as_deref(), radius_m)
                .await?;
            places.extend(parse_places_response(&response));
            page_token = next_page_token(&response);
            if page_token.is_none() {
                break;
            }
        }
        Ok(places)
    }
}

pub fn build_text_search_body(
    query: &str,
    point: &HarvestPoint,
    type_filter: Option<&str>,
    page_token: Option<&str>,
    radius_m: u32,
) -> Value {
    let mut body = json!({
        "textQuery": query,
        "locationBias": {
            "circle": {
                "center": {"latitude": point.lat, "longitude": point.lon},
                "radius": radius_m,
            }
        }
    });
    if let Some(map) = body.as_object_mut() {
        if let Some(token) = page_token.filter(|t| !t.is_empty()) {
            map.insert("pageToken".into(), Value::String(token.to_string()));
        }
        if let Some(filter) = type_filter.filter(|t| !t.is_empty()) {
            map.insert("includedType".into(), Value::String(filter.to_string()));
        }
    }
    body
}

pub fn next_page_token(response: &Value) -> Option<String> {
    response
        .get("nextPageToken")
        .or_else(|| response.get("next_page_token"))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Tolerant mapping of a search payload; entries without an id are skipped.
pub fn parse_places_response(response: &Value) -> Vec<PlaceRecord> {
    let Some(places) = response.get("places").and_then(Value::as_array) else {
        return Vec::new();
    };
    places.iter().filter_map(parse_place).collect()
}

fn parse_place(raw: &Value) -> Option<PlaceRecord> {
    let place_id = first_str(raw, &["id", "placeId"])?;
    let name = match raw.get("displayName") {
        Some(Value::Object(display)) => display
            .get("text")
            .or_else(|| display.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(Value::String(text)) => Some(text.clone()),
        _ => None,
    };
    let location = raw
        .get("location")
        .or_else(|| raw.get("latLng"))
        .cloned()
        .unwrap_or(Value::Null);
    let types = raw
        .get("types")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(PlaceRecord {
        name,
        rating: raw.get("rating").and_then(as_number),
        user_rating_count: raw
            .get("userRatingCount")
            .or_else(|| raw.get("user_ratings_total"))
            .and_then(as_count),
        lat: first_number(&location, &["latitude", "lat"]),
        lon: first_number(&location, &["longitude", "lng", "lon"]),
        types,
        business_status: first_str(raw, &["businessStatus", "business_status"]),
        ..PlaceRecord::new(place_id)
    })
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

fn first_number(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(as_number))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64)),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|v| *v >= 0.0).map(|v| v as u64),
        _ => None,
    }
}
