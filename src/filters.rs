use std::collections::BTreeMap;

use crate::geo::{nearest_point, HarvestPoint};
use crate::place::{FilterStage, PlaceRecord, RejectReason};
use crate::profile::FilterPolicy;

/// Count of rejections per reason, sorted by label.
pub type RejectionCounts = BTreeMap<String, usize>;

pub fn count_rejection(counts: &mut RejectionCounts, reason: RejectReason) {
    *counts.entry(reason.as_str().to_string()).or_default() += 1;
}

/// Rules shared by every mode: rating, votes, location, then the
/// mode-specific distance verdict, then operating status.
fn basic_reason(
    place: &PlaceRecord,
    policy: &FilterPolicy,
    within_range: impl FnOnce(&PlaceRecord) -> bool,
) -> Option<RejectReason> {
    if place.rating.is_none() {
        return Some(RejectReason::RatingMissing);
    }
    let Some(votes) = place.user_rating_count else {
        return Some(RejectReason::MissingUserRatingCount);
    };
    if votes < policy.min_user_rating_count {
        return Some(RejectReason::InsufficientReviews);
    }
    if place.coordinates().is_none() {
        return Some(RejectReason::MissingLocation);
    }
    if !within_range(place) {
        return Some(RejectReason::TooFar);
    }
    match place.business_status.as_deref() {
        Some(status) if status != policy.operational_status => {
            Some(RejectReason::BusinessStatusNotOperational)
        }
        _ => None,
    }
}

fn domain_reason(place: &PlaceRecord, policy: &FilterPolicy) -> Option<RejectReason> {
    if !place.types.is_empty()
        && place.types.iter().all(|t| !policy.allowed_types.contains(t))
        && place.types.iter().any(|t| policy.non_target_types.contains(t))
    {
        return Some(RejectReason::NonTargetTypes);
    }
    let name = place.name_or_empty().to_lowercase();
    policy
        .reject_name_substrings
        .iter()
        .filter(|banned| !banned.is_empty())
        .any(|banned| name.contains(&banned.to_lowercase()))
        .then_some(RejectReason::IrrelevantDomain)
}

/// Distance to the closest of `points`, recorded on the place.
fn record_nearest(place: &mut PlaceRecord, points: &[HarvestPoint]) {
    let nearest = place
        .coordinates()
        .and_then(|location| nearest_point(location, points));
    place.distance_km = nearest.map(|(_, dist)| dist);
    place.nearest_point_id = nearest.map(|(point, _)| point.id.clone());
}

fn apply(
    places: &mut BTreeMap<String, PlaceRecord>,
    stage: FilterStage,
    mut verdict: impl FnMut(&mut PlaceRecord) -> Option<RejectReason>,
) -> (Vec<String>, RejectionCounts) {
    let mut survivors = Vec::new();
    let mut counts = RejectionCounts::new();
    for (place_id, place) in places.iter_mut() {
        match verdict(place) {
            Some(reason) => {
                place.reject(reason, stage);
                count_rejection(&mut counts, reason);
            }
            None => survivors.push(place_id.clone()),
        }
    }
    (survivors, counts)
}

/// Standard pass: distance is the minimum over hubs, then type and name rules.
pub fn apply_filters(
    places: &mut BTreeMap<String, PlaceRecord>,
    hubs: &[HarvestPoint],
    policy: &FilterPolicy,
) -> (Vec<String>, RejectionCounts) {
    apply(places, FilterStage::Filters, |place| {
        record_nearest(place, hubs);
        let max = policy.max_distance_km;
        basic_reason(place, policy, |p| p.distance_km.is_some_and(|d| d <= max))
            .or_else(|| domain_reason(place, policy))
    })
}

/// Listing pass: like the standard one but without type or name rules.
pub fn apply_listing_filters(
    places: &mut BTreeMap<String, PlaceRecord>,
    hubs: &[HarvestPoint],
    policy: &FilterPolicy,
) -> (Vec<String>, RejectionCounts) {
    apply(places, FilterStage::ListingFilters, |place| {
        record_nearest(place, hubs);
        let max = policy.max_distance_km;
        basic_reason(place, policy, |p| p.distance_km.is_some_and(|d| d <= max))
    })
}

/// Scan pass around one center with its own radius.
pub fn apply_scan_filters(
    places: &mut BTreeMap<String, PlaceRecord>,
    center: &HarvestPoint,
    radius_km: f64,
    policy: &FilterPolicy,
) -> (Vec<String>, RejectionCounts) {
    let centers = std::slice::from_ref(center);
    apply(places, FilterStage::RadiusScanFilters, |place| {
        record_nearest(place, centers);
        basic_reason(place, policy, |p| p.distance_km.is_some_and(|d| d <= radius_km))
    })
}

/// Merged multi-center pass: eligible when within radius of any center.
/// Expects `distance_km_by_center` filled; records nearest center and range.
pub fn apply_merge_filters(
    places: &mut BTreeMap<String, PlaceRecord>,
    radius_km: f64,
    policy: &FilterPolicy,
) -> (Vec<String>, RejectionCounts) {
    apply(places, FilterStage::RadiusScanMerge, |place| {
        let known: Vec<(&String, f64)> = place
            .distance_km_by_center
            .iter()
            .filter_map(|(center, dist)| dist.map(|d| (center, d)))
            .collect();
        let nearest = known
            .iter()
            .fold(None::<(&String, f64)>, |best, &(center, dist)| match best {
                Some((_, best_dist)) if best_dist <= dist => best,
                _ => Some((center, dist)),
            });
        let in_range: Vec<String> = known
            .iter()
            .filter(|(_, dist)| *dist <= radius_km)
            .map(|(center, _)| (*center).clone())
            .collect();
        place.nearest_point_id = nearest.map(|(center, _)| center.clone());
        place.distance_km = nearest.map(|(_, dist)| dist);
        place.centers_in_range = in_range;
        basic_reason(place, policy, |p| !p.centers_in_range.is_empty())
    })
}
