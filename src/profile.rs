use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::geo::{BoundingBox, Coordinates, HarvestPoint};

const DEFAULT_NON_TARGET_TYPES: &[&str] = &[
    "restaurant",
    "bar",
    "cafe",
    "bakery",
    "store",
    "shopping_mall",
    "clothing_store",
    "gym",
    "lodging",
    "real_estate_agency",
    "car_repair",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySet {
    pub primary: Vec<String>,
    pub general: Vec<String>,
    pub coverage: Vec<String>,
    /// Never sent from grid points.
    pub hubs_only: Vec<String>,
    pub max_pages: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterPolicy {
    pub min_user_rating_count: u64,
    pub max_distance_km: f64,
    pub operational_status: String,
    pub allowed_types: BTreeSet<String>,
    pub non_target_types: BTreeSet<String>,
    pub reject_name_substrings: Vec<String>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            min_user_rating_count: 50,
            max_distance_km: 20.0,
            operational_status: crate::place::OPERATIONAL.to_string(),
            allowed_types: BTreeSet::new(),
            non_target_types: DEFAULT_NON_TARGET_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            reject_name_substrings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub bayes_m: f64,
    pub wilson_z: f64,
    pub top_n: usize,
    pub weight_quality: f64,
    #[serde(alias = "transit_weight", alias = "weight_transit")]
    pub weight_travel: f64,
    pub weight_relevance: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            bayes_m: 200.0,
            wilson_z: 1.96,
            top_n: 30,
            weight_quality: 0.85,
            weight_travel: 0.10,
            weight_relevance: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevancePolicy {
    pub base: f64,
    pub query_bonus: f64,
    pub name_bonus: f64,
    pub generic_penalty: f64,
    pub general_only_penalty: f64,
    pub query_hints: Vec<String>,
    pub name_hints: Vec<String>,
    pub generic_query_hints: Vec<String>,
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        Self {
            base: 50.0,
            query_bonus: 25.0,
            name_bonus: 10.0,
            generic_penalty: 15.0,
            general_only_penalty: 5.0,
            query_hints: Vec::new(),
            name_hints: Vec::new(),
            generic_query_hints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestPolicy {
    pub max_pages_per_query: usize,
    pub general_max_pages: usize,
    pub min_candidates: usize,
    pub bias_radius_m: u32,
}

impl Default for HarvestPolicy {
    fn default() -> Self {
        Self {
            max_pages_per_query: 3,
            general_max_pages: 1,
            min_candidates: 150,
            bias_radius_m: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoveragePolicy {
    pub grid_size_initial: usize,
    pub grid_max_iterations: usize,
    pub uplift_threshold: f64,
    pub max_pages_per_query: usize,
}

impl Default for CoveragePolicy {
    fn default() -> Self {
        Self {
            grid_size_initial: 4,
            grid_max_iterations: 2,
            uplift_threshold: 0.10,
            max_pages_per_query: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TravelPolicy {
    pub mode: String,
    pub limit_minutes: f64,
    pub score_k: f64,
    pub bucket_minutes: u32,
    pub departure_hour: u32,
    pub departure_minute: u32,
    /// Local wall-clock offset used for departure policy and cache buckets.
    pub utc_offset_minutes: i32,
}

impl Default for TravelPolicy {
    fn default() -> Self {
        Self {
            mode: "TRANSIT".to_string(),
            limit_minutes: 75.0,
            score_k: 35.0,
            bucket_minutes: 15,
            departure_hour: 17,
            departure_minute: 0,
            utc_offset_minutes: 60,
        }
    }
}

/// Immutable description of one search area and how to rank what is found there.
#[derive(Debug, Clone)]
pub struct SearchProfile {
    pub hubs: Vec<HarvestPoint>,
    pub bbox: BoundingBox,
    pub queries: QuerySet,
    pub type_filters: Vec<String>,
    pub filters: FilterPolicy,
    pub scoring: ScoringPolicy,
    pub relevance: RelevancePolicy,
    pub harvest: HarvestPolicy,
    pub coverage: CoveragePolicy,
    pub travel: TravelPolicy,
}

#[derive(Debug, Clone, Deserialize)]
struct CenterEntry {
    lat: f64,
    lon: f64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct QueryFile {
    primary: Vec<String>,
    #[serde(alias = "secondary")]
    general: Vec<String>,
    coverage: Option<Vec<String>>,
    hubs_only: Vec<String>,
    max_pages: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ProfileFile {
    center: Option<CenterEntry>,
    hubs: Vec<HarvestPoint>,
    bbox: Option<BoundingBox>,
    max_distance_km: Option<f64>,
    min_reviews: Option<u64>,
    queries: QueryFile,
    type_filters: Vec<String>,
    allowed_types: Option<Vec<String>>,
    rejected_types: Option<Vec<String>>,
    domain_reject_substrings: Vec<String>,
    filters: Option<FilterPolicy>,
    scoring: Option<ScoringPolicy>,
    relevance: Option<RelevancePolicy>,
    harvest: Option<HarvestPolicy>,
    coverage: Option<CoveragePolicy>,
    travel: Option<TravelPolicy>,
}

impl SearchProfile {
    /// Minimal profile with default policies; the box spans every hub's radius.
    pub fn new(hubs: Vec<HarvestPoint>, primary_queries: Vec<String>) -> Self {
        let filters = FilterPolicy::default();
        let bbox = bbox_for_hubs(&hubs, filters.max_distance_km);
        let mut profile = Self {
            hubs,
            bbox,
            queries: QuerySet {
                primary: primary_queries,
                ..QuerySet::default()
            },
            type_filters: Vec::new(),
            filters,
            scoring: ScoringPolicy::default(),
            relevance: RelevancePolicy::default(),
            harvest: HarvestPolicy::default(),
            coverage: CoveragePolicy::default(),
            travel: TravelPolicy::default(),
        };
        profile.normalize();
        profile
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AppError::config(format!(
                    "search profile not found at {}",
                    path.display()
                )));
            }
            Err(err) => return Err(AppError::Io(err)),
        };
        let profile = Self::from_json_str(&contents)?;
        info!(
            target: "profile",
            path = %path.display(),
            hubs = profile.hubs.len(),
            primary_queries = profile.queries.primary.len(),
            "search profile loaded"
        );
        Ok(profile)
    }

    pub fn from_json_str(contents: &str) -> AppResult<Self> {
        let file: ProfileFile = serde_json::from_str(contents)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: ProfileFile) -> Self {
        let mut filters = file.filters.unwrap_or_default();
        if let Some(max_distance) = file.max_distance_km {
            filters.max_distance_km = max_distance;
        }
        if let Some(min_reviews) = file.min_reviews {
            filters.min_user_rating_count = min_reviews;
        }
        if let Some(allowed) = file.allowed_types {
            filters.allowed_types = allowed.into_iter().collect();
        }
        if let Some(rejected) = file.rejected_types {
            filters.non_target_types = rejected.into_iter().collect();
        }
        if !file.domain_reject_substrings.is_empty() {
            filters.reject_name_substrings = file.domain_reject_substrings;
        }

        let mut hubs = file.hubs;
        if let Some(center) = &file.center {
            let id = center.id.clone().unwrap_or_else(|| "center".to_string());
            let name = center.name.clone().unwrap_or_else(|| id.clone());
            hubs.push(HarvestPoint::named(id, name, center.lat, center.lon));
        }
        let bbox = match (file.bbox, &file.center) {
            (Some(bbox), _) => bbox,
            (None, Some(center)) => BoundingBox::around(
                Coordinates::new(center.lat, center.lon),
                filters.max_distance_km,
            ),
            (None, None) => bbox_for_hubs(&hubs, filters.max_distance_km),
        };

        let queries = QuerySet {
            coverage: file
                .queries
                .coverage
                .unwrap_or_else(|| file.queries.primary.iter().take(2).cloned().collect()),
            primary: file.queries.primary,
            general: file.queries.general,
            hubs_only: file.queries.hubs_only,
            max_pages: file.queries.max_pages,
        };

        let mut profile = Self {
            hubs,
            bbox,
            queries,
            type_filters: file.type_filters,
            filters,
            scoring: file.scoring.unwrap_or_default(),
            relevance: file.relevance.unwrap_or_default(),
            harvest: file.harvest.unwrap_or_default(),
            coverage: file.coverage.unwrap_or_default(),
            travel: file.travel.unwrap_or_default(),
        };
        profile.normalize();
        profile
    }

    /// Sorts hubs by id, drops duplicate queries, applies general page caps.
    fn normalize(&mut self) {
        self.hubs.sort_by(|a, b| a.id.cmp(&b.id));
        dedup_in_order(&mut self.queries.primary);
        dedup_in_order(&mut self.queries.general);
        dedup_in_order(&mut self.queries.coverage);
        for query in &self.queries.general {
            self.queries
                .max_pages
                .entry(query.clone())
                .or_insert(self.harvest.general_max_pages);
        }
    }

    pub fn hub(&self, id: &str) -> Option<&HarvestPoint> {
        self.hubs.iter().find(|hub| hub.id == id)
    }

    pub fn hubs_only_queries(&self) -> BTreeSet<String> {
        self.queries
            .hubs_only
            .iter()
            .chain(self.queries.general.iter())
            .cloned()
            .collect()
    }

    /// Primary queries allowed on grid points.
    pub fn grid_queries(&self) -> Vec<String> {
        let hubs_only = self.hubs_only_queries();
        self.queries
            .primary
            .iter()
            .filter(|q| !hubs_only.contains(*q))
            .cloned()
            .collect()
    }

    /// `None` first, then each configured category filter.
    pub fn type_filter_options(&self) -> Vec<Option<String>> {
        std::iter::once(None)
            .chain(self.type_filters.iter().cloned().map(Some))
            .collect()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.hubs.is_empty() {
            return Err(AppError::config("no hubs configured"));
        }
        let invalid: Vec<&str> = self
            .hubs
            .iter()
            .filter(|hub| hub.lat == 0.0 || hub.lon == 0.0)
            .map(|hub| hub.id.as_str())
            .collect();
        if !invalid.is_empty() {
            return Err(AppError::config(format!(
                "hub coordinates are not set for: {}",
                invalid.join(", ")
            )));
        }
        if self.filters.max_distance_km.is_nan() || self.filters.max_distance_km <= 0.0 {
            return Err(AppError::config("max distance must be positive"));
        }
        if self.travel.bucket_minutes == 0 {
            return Err(AppError::config("travel bucket minutes must be positive"));
        }
        if self.travel.departure_hour > 23 || self.travel.departure_minute > 59 {
            return Err(AppError::config("departure time is not a valid wall-clock time"));
        }
        if self.coverage.grid_size_initial <= 1 {
            return Err(AppError::config("coverage grid size must be > 1"));
        }
        Ok(())
    }
}

fn dedup_in_order(items: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

fn bbox_for_hubs(hubs: &[HarvestPoint], radius_km: f64) -> BoundingBox {
    let mut boxes = hubs
        .iter()
        .map(|hub| BoundingBox::around(hub.coordinates(), radius_km));
    let Some(first) = boxes.next() else {
        return BoundingBox {
            lat_min: 0.0,
            lat_max: 0.0,
            lon_min: 0.0,
            lon_max: 0.0,
        };
    };
    boxes.fold(first, |acc, next| BoundingBox {
        lat_min: acc.lat_min.min(next.lat_min),
        lat_max: acc.lat_max.max(next.lat_max),
        lon_min: acc.lon_min.min(next.lon_min),
        lon_max: acc.lon_max.max(next.lon_max),
    })
}
