use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::SearchBackend;
use crate::budget::{RequestBudget, RequestKind};
use crate::cache::Cache;
use crate::coverage::CoverageBudget;
use crate::errors::AppResult;
use crate::geo::HarvestPoint;
use crate::place::{PlaceRecord, Provenance, ProvenanceKey, QueryGroup, SearchMode};
use crate::profile::SearchProfile;
use crate::progress::ProgressReporter;

/// Which configured list a query came from.
#[derive(Debug, Clone, Default)]
pub struct QueryGroups {
    primary: BTreeSet<String>,
    general: BTreeSet<String>,
}

impl QueryGroups {
    pub fn from_profile(profile: &SearchProfile) -> Self {
        Self {
            primary: profile.queries.primary.iter().cloned().collect(),
            general: profile.queries.general.iter().cloned().collect(),
        }
    }

    pub fn group_for(&self, query: &str) -> QueryGroup {
        if self.primary.contains(query) {
            QueryGroup::Primary
        } else if self.general.contains(query) {
            QueryGroup::General
        } else {
            QueryGroup::Other
        }
    }
}

/// Every place seen during a run, keyed by id, with reverse indexes used by
/// the coverage report. Each sighting is also upserted into the cache.
#[derive(Default)]
pub struct PlaceCatalog {
    groups: QueryGroups,
    cache: Option<Arc<Cache>>,
    places: BTreeMap<String, PlaceRecord>,
    found_by: BTreeMap<String, BTreeSet<ProvenanceKey>>,
    by_query: BTreeMap<String, BTreeSet<String>>,
    by_point: BTreeMap<String, BTreeSet<String>>,
    by_query_point: BTreeMap<(String, String), BTreeSet<String>>,
    by_group: BTreeMap<QueryGroup, BTreeSet<String>>,
}

impl PlaceCatalog {
    pub fn new(groups: QueryGroups, cache: Option<Arc<Cache>>) -> Self {
        Self {
            groups,
            cache,
            ..Self::default()
        }
    }

    /// Merges one sighting: non-null fields overwrite, provenance is added once per key.
    pub fn record(
        &mut self,
        sighting: &PlaceRecord,
        query: &str,
        point_id: &str,
        mode: &SearchMode,
    ) -> AppResult<()> {
        let place_id = sighting.place_id.clone();
        let group = self.groups.group_for(query);

        let place = self
            .places
            .entry(place_id.clone())
            .and_modify(|existing| existing.merge_sighting(sighting))
            .or_insert_with(|| PlaceRecord {
                found_by: Vec::new(),
                ..sighting.clone()
            });
        let provenance = Provenance {
            query: query.to_string(),
            point_id: point_id.to_string(),
            mode: mode.clone(),
            group,
        };
        if self
            .found_by
            .entry(place_id.clone())
            .or_default()
            .insert(provenance.key())
        {
            place.found_by.push(provenance);
        }

        self.by_query
            .entry(query.to_string())
            .or_default()
            .insert(place_id.clone());
        self.by_point
            .entry(point_id.to_string())
            .or_default()
            .insert(place_id.clone());
        self.by_query_point
            .entry((query.to_string(), point_id.to_string()))
            .or_default()
            .insert(place_id.clone());
        self.by_group.entry(group).or_default().insert(place_id);

        if let Some(cache) = &self.cache {
            cache.upsert_place(place)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }

    pub fn get(&self, place_id: &str) -> Option<&PlaceRecord> {
        self.places.get(place_id)
    }

    pub fn places(&self) -> &BTreeMap<String, PlaceRecord> {
        &self.places
    }

    pub fn places_mut(&mut self) -> &mut BTreeMap<String, PlaceRecord> {
        &mut self.places
    }

    pub fn into_places(self) -> BTreeMap<String, PlaceRecord> {
        self.places
    }

    pub fn ids_for_query_point(&self, query: &str, point_id: &str) -> Option<&BTreeSet<String>> {
        self.by_query_point
            .get(&(query.to_string(), point_id.to_string()))
    }

    pub fn by_query(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.by_query
    }

    pub fn by_point(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.by_point
    }

    pub fn by_group(&self) -> &BTreeMap<QueryGroup, BTreeSet<String>> {
        &self.by_group
    }

    pub fn clear_filter_state(&mut self) {
        for place in self.places.values_mut() {
            place.clear_filter_state();
        }
    }
}

/// One sweep of points × queries × type filters.
#[derive(Debug, Clone, Copy)]
pub struct HarvestRequest<'a> {
    pub points: &'a [HarvestPoint],
    pub queries: &'a [String],
    pub type_filters: &'a [Option<String>],
    pub max_pages: usize,
    pub per_query_max_pages: &'a BTreeMap<String, usize>,
    pub radius_m: Option<u32>,
}

impl HarvestRequest<'_> {
    fn pages_for(&self, query: &str) -> usize {
        self.per_query_max_pages
            .get(query)
            .copied()
            .unwrap_or(self.max_pages)
            .max(1)
    }

    pub fn call_count(&self) -> u64 {
        (self.points.len() * self.queries.len() * self.type_filters.len()) as u64
    }
}

/// Runs a harvest sweep and returns whether it stopped early.
///
/// Without a coverage guard a budget failure propagates. With one, each
/// call's page cap is clamped to the guard's remaining capacity and budget
/// exhaustion ends the sweep quietly.
pub async fn harvest(
    backend: &dyn SearchBackend,
    catalog: &mut PlaceCatalog,
    request: &HarvestRequest<'_>,
    mut guard: Option<(&mut CoverageBudget, &RequestBudget)>,
    progress: &ProgressReporter,
) -> AppResult<bool> {
    let mut points: Vec<&HarvestPoint> = request.points.iter().collect();
    points.sort_by(|a, b| a.id.cmp(&b.id));

    for point in points {
        for query in request.queries {
            let query_pages = request.pages_for(query);
            for type_filter in request.type_filters {
                let max_pages = match guard.as_ref() {
                    Some((tracker, budget)) => {
                        let remaining = tracker.remaining(budget);
                        if remaining == 0 {
                            debug!(target: "harvest", point = %point.id, "coverage budget used up");
                            return Ok(true);
                        }
                        (query_pages as u64).min(remaining) as usize
                    }
                    None => query_pages,
                };

                let used_before = guard
                    .as_ref()
                    .map(|(_, budget)| budget.used(RequestKind::Search))
                    .unwrap_or_default();
                let result = backend
                    .search_all(
                        query,
                        point,
                        type_filter.as_deref(),
                        max_pages,
                        request.radius_m,
                    )
                    .await;
                if let Some((tracker, budget)) = guard.as_mut() {
                    tracker.charge_since(budget, used_before);
                }

                let places = match result {
                    Ok(places) => places,
                    Err(err) if err.is_budget_exceeded() && guard.is_some() => {
                        warn!(target: "harvest", %err, point = %point.id, query, "guarded harvest stopped early");
                        return Ok(true);
                    }
                    Err(err) => return Err(err),
                };
                let mode = SearchMode::for_filter(type_filter.as_deref());
                for place in &places {
                    catalog.record(place, query, &point.id, &mode)?;
                }
                progress.advance();
            }
        }
    }
    Ok(false)
}
