use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};

use crate::geo::Coordinates;

pub const OPERATIONAL: &str = "OPERATIONAL";

/// How a listing was asked for: plain text or text narrowed to one category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SearchMode {
    Text,
    TextWithType(String),
}

impl SearchMode {
    pub fn for_filter(type_filter: Option<&str>) -> Self {
        match type_filter {
            Some(filter) if !filter.is_empty() => SearchMode::TextWithType(filter.to_string()),
            _ => SearchMode::Text,
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Text => f.write_str("text"),
            SearchMode::TextWithType(filter) => write!(f, "text+type:{filter}"),
        }
    }
}

impl Serialize for SearchMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SearchMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.strip_prefix("text+type:") {
            Some(filter) => SearchMode::TextWithType(filter.to_string()),
            None => SearchMode::Text,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryGroup {
    Primary,
    General,
    Other,
}

impl QueryGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryGroup::Primary => "primary",
            QueryGroup::General => "general",
            QueryGroup::Other => "other",
        }
    }
}

/// One sighting of a place: which query at which point in which mode found it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub query: String,
    pub point_id: String,
    pub mode: SearchMode,
    pub group: QueryGroup,
}

impl Provenance {
    pub fn key(&self) -> ProvenanceKey {
        ProvenanceKey {
            query: self.query.clone(),
            point_id: self.point_id.clone(),
            mode: self.mode.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvenanceKey {
    pub query: String,
    pub point_id: String,
    pub mode: SearchMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    RatingMissing,
    MissingUserRatingCount,
    InsufficientReviews,
    MissingLocation,
    TooFar,
    BusinessStatusNotOperational,
    NonTargetTypes,
    IrrelevantDomain,
    NoTravelRoute,
    TravelOverLimit,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::RatingMissing => "rating_missing",
            RejectReason::MissingUserRatingCount => "missing_user_rating_count",
            RejectReason::InsufficientReviews => "insufficient_reviews",
            RejectReason::MissingLocation => "missing_location",
            RejectReason::TooFar => "too_far",
            RejectReason::BusinessStatusNotOperational => "business_status_not_operational",
            RejectReason::NonTargetTypes => "non_target_types",
            RejectReason::IrrelevantDomain => "irrelevant_domain",
            RejectReason::NoTravelRoute => "no_travel_route",
            RejectReason::TravelOverLimit => "travel_over_limit",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Filters,
    ListingFilters,
    RadiusScanFilters,
    RadiusScanMerge,
    Travel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub stage: FilterStage,
}

/// A listing as harvested, plus the fields later stages attach to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub place_id: String,
    pub name: Option<String>,
    pub rating: Option<f64>,
    pub user_rating_count: Option<u64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(default)]
    pub types: Vec<String>,
    pub business_status: Option<String>,
    #[serde(default)]
    pub found_by: Vec<Provenance>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_bayes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_wilson: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_min_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nearest_point_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub distance_km_by_center: BTreeMap<String, Option<f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub centers_in_range: Vec<String>,
}

impl PlaceRecord {
    pub fn new(place_id: impl Into<String>) -> Self {
        Self {
            place_id: place_id.into(),
            ..Self::default()
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        }
    }

    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    pub fn reject(&mut self, reason: RejectReason, stage: FilterStage) {
        self.rejection = Some(Rejection { reason, stage });
    }

    /// Drops everything a filtering pass attaches so a fresh pass starts clean.
    pub fn clear_filter_state(&mut self) {
        self.rejection = None;
        self.distance_km = None;
        self.nearest_point_id = None;
    }

    /// Drops every score so the place can be ranked again from scratch.
    pub fn clear_scores(&mut self) {
        self.quality_bayes = None;
        self.quality_wilson = None;
        self.quality = None;
        self.relevance = None;
        self.travel_min_minutes = None;
        self.travel_score = None;
        self.final_score = None;
    }

    /// Later sightings win for every field they actually carry.
    pub fn merge_sighting(&mut self, other: &PlaceRecord) {
        if other.name.is_some() {
            self.name = other.name.clone();
        }
        if other.rating.is_some() {
            self.rating = other.rating;
        }
        if other.user_rating_count.is_some() {
            self.user_rating_count = other.user_rating_count;
        }
        if other.lat.is_some() {
            self.lat = other.lat;
        }
        if other.lon.is_some() {
            self.lon = other.lon;
        }
        if !other.types.is_empty() {
            self.types = other.types.clone();
        }
        if other.business_status.is_some() {
            self.business_status = other.business_status.clone();
        }
    }

    /// Only fills fields still absent here; existing values are kept.
    pub fn fill_missing_from(&mut self, other: &PlaceRecord) {
        if self.name.is_none() {
            self.name = other.name.clone();
        }
        if self.rating.is_none() {
            self.rating = other.rating;
        }
        if self.user_rating_count.is_none() {
            self.user_rating_count = other.user_rating_count;
        }
        if self.lat.is_none() {
            self.lat = other.lat;
        }
        if self.lon.is_none() {
            self.lon = other.lon;
        }
        if self.types.is_empty() {
            self.types = other.types.clone();
        }
        if self.business_status.is_none() {
            self.business_status = other.business_status.clone();
        }
    }

    /// Appends provenance entries not yet present, keeping first-seen order.
    pub fn extend_found_by<'a>(&mut self, entries: impl IntoIterator<Item = &'a Provenance>) {
        let mut seen: HashSet<ProvenanceKey> = self.found_by.iter().map(Provenance::key).collect();
        for entry in entries {
            if seen.insert(entry.key()) {
                self.found_by.push(entry.clone());
            }
        }
    }

    pub fn found_by_queries(&self) -> Vec<String> {
        let mut queries: Vec<String> = self.found_by.iter().map(|f| f.query.clone()).collect();
        queries.sort();
        queries.dedup();
        queries
    }

    pub fn found_by_points(&self) -> Vec<String> {
        let mut points: Vec<String> = self.found_by.iter().map(|f| f.point_id.clone()).collect();
        points.sort();
        points.dedup();
        points
    }

    pub fn has_group(&self, group: QueryGroup) -> bool {
        self.found_by.iter().any(|f| f.group == group)
    }
}
