use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::backend::SearchBackend;
use crate::budget::{RequestBudget, RequestKind};
use crate::errors::AppResult;
use crate::geo::{Coordinates, HarvestPoint};
use crate::place::PlaceRecord;
use crate::routes::TravelTarget;

const ANY_POINT: &str = "*";

/// Scripted backend: pages per (query, point), durations per (origin, place).
/// Every page and every duration lookup consumes budget like the real clients.
pub struct ScenarioBackend {
    budget: Arc<RequestBudget>,
    pages: BTreeMap<(String, String), Vec<Vec<PlaceRecord>>>,
    durations: BTreeMap<(String, String), u64>,
    search_calls: Mutex<Vec<(String, String, Option<String>)>>,
    travel_calls: Mutex<Vec<(String, String)>>,
}

impl ScenarioBackend {
    pub fn new(budget: Arc<RequestBudget>) -> Self {
        Self {
            budget,
            pages: BTreeMap::new(),
            durations: BTreeMap::new(),
            search_calls: Mutex::new(Vec::new()),
            travel_calls: Mutex::new(Vec::new()),
        }
    }

    /// One page of results for `query` at `point_id` (`"*"` matches any point).
    pub fn page(mut self, query: &str, point_id: &str, places: Vec<PlaceRecord>) -> Self {
        self.pages
            .entry((query.to_string(), point_id.to_string()))
            .or_default()
            .push(places);
        self
    }

    pub fn anywhere(self, query: &str, places: Vec<PlaceRecord>) -> Self {
        self.page(query, ANY_POINT, places)
    }

    pub fn duration(mut self, origin_id: &str, place_id: &str, seconds: u64) -> Self {
        self.durations
            .insert((origin_id.to_string(), place_id.to_string()), seconds);
        self
    }

    pub fn search_calls(&self) -> Vec<(String, String, Option<String>)> {
        self.search_calls.lock().clone()
    }

    pub fn travel_calls(&self) -> Vec<(String, String)> {
        self.travel_calls.lock().clone()
    }

    fn script_for(&self, query: &str, point_id: &str) -> Option<&Vec<Vec<PlaceRecord>>> {
        self.pages
            .get(&(query.to_string(), point_id.to_string()))
            .or_else(|| self.pages.get(&(query.to_string(), ANY_POINT.to_string())))
    }
}

#[async_trait]
impl SearchBackend for ScenarioBackend {
    async fn search_all(
        &self,
        query: &str,
        point: &HarvestPoint,
        type_filter: Option<&str>,
        max_pages: usize,
        _radius_m: Option<u32>,
    ) -> AppResult<Vec<PlaceRecord>> {
        let script = match type_filter {
            None => self.script_for(query, &point.id),
            Some(_) => None,
        };
        let mut places = Vec::new();
        for page in 0..max_pages {
            self.budget.consume(RequestKind::Search)?;
            self.search_calls.lock().push((
                query.to_string(),
                point.id.clone(),
                type_filter.map(str::to_string),
            ));
            let Some(pages) = script else {
                break;
            };
            if let Some(results) = pages.get(page) {
                places.extend(results.iter().cloned());
            }
            if page + 1 >= pages.len() {
                break;
            }
        }
        Ok(places)
    }

    async fn compute_duration(
        &self,
        origin_id: &str,
        _origin: Coordinates,
        target: TravelTarget<'_>,
        _departure: DateTime<Utc>,
        _mode: &str,
    ) -> AppResult<Option<u64>> {
        self.budget.consume(RequestKind::Travel)?;
        self.travel_calls
            .lock()
            .push((origin_id.to_string(), target.place_id.to_string()));
        Ok(self
            .durations
            .get(&(origin_id.to_string(), target.place_id.to_string()))
            .copied())
    }
}

/// A place that passes every default filter near `(lat, lon)`.
pub fn listing(id: &str, name: &str, rating: f64, votes: u64, lat: f64, lon: f64) -> PlaceRecord {
    PlaceRecord {
        name: Some(name.to_string()),
        rating: Some(rating),
        user_rating_count: Some(votes),
        lat: Some(lat),
        lon: Some(lon),
        types: vec!["dentist".to_string()],
        business_status: Some("OPERATIONAL".to_string()),
        ..PlaceRecord::new(id)
    }
}
