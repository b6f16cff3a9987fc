use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::place::{FilterStage, PlaceRecord, QueryGroup, RejectReason};
use crate::profile::{RelevancePolicy, ScoringPolicy};
use crate::scoring::quality_score;

/// Mean rating over the given survivors; 0 when there are none.
pub fn corpus_mean(places: &BTreeMap<String, PlaceRecord>, ids: &[String]) -> f64 {
    if ids.is_empty() {
        return 0.0;
    }
    let total: f64 = ids
        .iter()
        .filter_map(|id| places.get(id).and_then(|p| p.rating))
        .sum();
    total / ids.len() as f64
}

/// Attaches the quality fields to every survivor.
pub fn score_quality(places: &mut BTreeMap<String, PlaceRecord>, ids: &[String], policy: &ScoringPolicy) {
    let mean = corpus_mean(places, ids);
    for id in ids {
        let Some(place) = places.get_mut(id) else {
            continue;
        };
        let (Some(rating), Some(votes)) = (place.rating, place.user_rating_count) else {
            continue;
        };
        let score = quality_score(rating, votes, mean, policy.bayes_m, policy.wilson_z);
        place.quality_bayes = Some(score.quality_bayes);
        place.quality_wilson = Some(score.quality_wilson);
        place.quality = Some(score.quality);
    }
}

fn desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    b.unwrap_or(0.0).total_cmp(&a.unwrap_or(0.0))
}

fn by_name_then_id(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    a.name_or_empty()
        .cmp(b.name_or_empty())
        .then_with(|| a.place_id.cmp(&b.place_id))
}

/// Quality desc, votes desc, rating desc, name asc, id asc.
pub fn quality_order(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    desc(a.quality, b.quality)
        .then_with(|| b.user_rating_count.unwrap_or(0).cmp(&a.user_rating_count.unwrap_or(0)))
        .then_with(|| desc(a.rating, b.rating))
        .then_with(|| by_name_then_id(a, b))
}

/// Final desc, votes desc, rating desc, name asc, id asc; unscored rows count as 0.
pub fn result_order(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    desc(a.final_score, b.final_score)
        .then_with(|| b.user_rating_count.unwrap_or(0).cmp(&a.user_rating_count.unwrap_or(0)))
        .then_with(|| desc(a.rating, b.rating))
        .then_with(|| by_name_then_id(a, b))
}

/// Quality desc, name asc, id asc.
pub fn listing_order(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    desc(a.quality, b.quality).then_with(|| by_name_then_id(a, b))
}

/// Reason asc, name asc, id asc.
pub fn rejected_order(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    let reason = |p: &PlaceRecord| p.rejection.map(|r| r.reason.as_str()).unwrap_or("");
    reason(a).cmp(reason(b)).then_with(|| by_name_then_id(a, b))
}

/// Top `top_n` survivor ids by [`quality_order`].
pub fn shortlist(places: &BTreeMap<String, PlaceRecord>, ids: &[String], top_n: usize) -> Vec<String> {
    let mut ranked: Vec<&PlaceRecord> = ids.iter().filter_map(|id| places.get(id)).collect();
    ranked.sort_by(|a, b| quality_order(a, b));
    ranked
        .into_iter()
        .take(top_n)
        .map(|place| place.place_id.clone())
        .collect()
}

fn matches_any(text: &str, hints: &[String]) -> bool {
    !text.is_empty()
        && hints
            .iter()
            .any(|hint| !hint.is_empty() && text.contains(&hint.to_lowercase()))
}

/// Provenance-based relevance in 0..=100.
pub fn relevance(place: &PlaceRecord, policy: &RelevancePolicy) -> f64 {
    let mut score = policy.base;
    let queries: Vec<String> = place
        .found_by
        .iter()
        .map(|f| f.query.to_lowercase())
        .collect();

    let has_hinted_query = queries.iter().any(|q| matches_any(q, &policy.query_hints));
    if has_hinted_query {
        score += policy.query_bonus;
    }
    if matches_any(&place.name_or_empty().to_lowercase(), &policy.name_hints) {
        score += policy.name_bonus;
    }
    if !queries.is_empty()
        && !has_hinted_query
        && queries
            .iter()
            .all(|q| matches_any(q, &policy.generic_query_hints))
    {
        score -= policy.generic_penalty;
    }
    if place.has_group(QueryGroup::General) && !place.has_group(QueryGroup::Primary) {
        score -= policy.general_only_penalty;
    }
    score.clamp(0.0, 100.0)
}

pub fn final_score(quality: f64, travel: Option<f64>, relevance: f64, weights: &ScoringPolicy) -> f64 {
    weights.weight_quality * quality
        + weights.weight_travel * travel.unwrap_or(0.0)
        + weights.weight_relevance * relevance
}

/// Output row shared by every mode; mode-specific fields stay empty elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub place_id: String,
    pub name: Option<String>,
    pub rating: Option<f64>,
    pub user_rating_count: Option<u64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub business_status: Option<String>,
    pub types: Vec<String>,
    pub quality_bayes: Option<f64>,
    pub quality_wilson: Option<f64>,
    pub quality: Option<f64>,
    pub relevance: Option<f64>,
    pub travel_min_minutes: Option<f64>,
    pub travel_score: Option<f64>,
    #[serde(rename = "final")]
    pub final_score: Option<f64>,
    pub distance_km: Option<f64>,
    pub nearest_point_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub distance_km_by_center: BTreeMap<String, Option<f64>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub centers_in_range: Vec<String>,
    pub found_by_queries: Vec<String>,
    pub found_by_points: Vec<String>,
    pub rejected_reason: Option<RejectReason>,
    pub rejected_stage: Option<FilterStage>,
}

impl From<&PlaceRecord> for ResultRow {
    fn from(place: &PlaceRecord) -> Self {
        Self {
            place_id: place.place_id.clone(),
            name: place.name.clone(),
            rating: place.rating,
            user_rating_count: place.user_rating_count,
            lat: place.lat,
            lon: place.lon,
            business_status: place.business_status.clone(),
            types: place.types.clone(),
            quality_bayes: place.quality_bayes,
            quality_wilson: place.quality_wilson,
            quality: place.quality,
            relevance: place.relevance,
            travel_min_minutes: place.travel_min_minutes,
            travel_score: place.travel_score,
            final_score: place.final_score,
            distance_km: place.distance_km,
            nearest_point_id: place.nearest_point_id.clone(),
            distance_km_by_center: place.distance_km_by_center.clone(),
            centers_in_range: place.centers_in_range.clone(),
            found_by_queries: place.found_by_queries(),
            found_by_points: place.found_by_points(),
            rejected_reason: place.rejection.map(|r| r.reason),
            rejected_stage: place.rejection.map(|r| r.stage),
        }
    }
}

/// Accepted rows ordered by `accepted_order`, then rejected rows by reason.
pub fn ordered_rows(
    places: &BTreeMap<String, PlaceRecord>,
    accepted_order: fn(&PlaceRecord, &PlaceRecord) -> Ordering,
) -> (Vec<ResultRow>, Vec<ResultRow>) {
    let (mut accepted, mut rejected): (Vec<&PlaceRecord>, Vec<&PlaceRecord>) =
        places.values().partition(|place| !place.is_rejected());
    accepted.sort_by(|a, b| accepted_order(a, b));
    rejected.sort_by(|a, b| rejected_order(a, b));
    (
        accepted.into_iter().map(ResultRow::from).collect(),
        rejected.into_iter().map(ResultRow::from).collect(),
    )
}
