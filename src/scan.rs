use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::SearchBackend;
use crate::config::ScanSettings;
use crate::errors::{AppError, AppResult};
use crate::filters::{apply_merge_filters, apply_scan_filters, RejectionCounts};
use crate::geo::{radius_scan_points, HarvestPoint};
use crate::harvest::{PlaceCatalog, QueryGroups};
use crate::pipeline::{PipelineResult, RunSession, LISTING_PREVIEW};
use crate::place::{PlaceRecord, SearchMode};
use crate::profile::SearchProfile;
use crate::ranking::{listing_order, ordered_rows, quality_order, score_quality, ResultRow};
use crate::summary::{preview, CenterSummary, RunSummary, ScanSummary};

const DEFAULT_SCAN_STEP_KM: f64 = 2.0;
const DEFAULT_SCAN_SEARCH_RADIUS_M: u32 = 1500;
const MERGED_PREVIEW: usize = 50;

/// Points, queries and limits for a radius scan around one or more centers.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    pub centers: Vec<HarvestPoint>,
    pub radius_km: f64,
    pub grid_step_km: f64,
    pub search_radius_m: u32,
    pub max_pages: usize,
    pub queries: Vec<String>,
    pub types: Vec<String>,
}

impl ScanPlan {
    /// Explicit coordinates make a single ad-hoc center; otherwise centers
    /// name configured hubs.
    pub fn from_settings(settings: &ScanSettings, profile: &SearchProfile) -> AppResult<Self> {
        let centers = match (settings.center_lat, settings.center_lon) {
            (Some(lat), Some(lon)) => {
                let id = settings.center_id.clone().unwrap_or_else(|| "center".to_string());
                vec![HarvestPoint::new(id, lat, lon)]
            }
            _ if !settings.centers.is_empty() => settings
                .centers
                .iter()
                .map(|id| resolve_center(profile, id))
                .collect::<AppResult<Vec<_>>>()?,
            _ => match &settings.center_id {
                Some(id) => vec![resolve_center(profile, id)?],
                None => {
                    return Err(AppError::config(
                        "radius scan needs a center (coordinates, center id or center list)",
                    ))
                }
            },
        };

        let mut queries = settings.queries.clone().unwrap_or_else(|| {
            profile
                .queries
                .primary
                .iter()
                .chain(profile.queries.general.iter())
                .cloned()
                .collect()
        });
        let mut seen = BTreeSet::new();
        queries.retain(|query| seen.insert(query.clone()));

        Ok(Self {
            centers,
            radius_km: settings.radius_km.unwrap_or(profile.filters.max_distance_km),
            grid_step_km: settings.grid_step_km.unwrap_or(DEFAULT_SCAN_STEP_KM),
            search_radius_m: settings
                .search_radius_m
                .unwrap_or(DEFAULT_SCAN_SEARCH_RADIUS_M),
            max_pages: settings.max_pages.unwrap_or(1).max(1),
            queries,
            types: settings
                .types
                .clone()
                .unwrap_or_else(|| profile.type_filters.clone()),
        })
    }

    pub fn type_filters(&self) -> Vec<Option<String>> {
        std::iter::once(None)
            .chain(self.types.iter().cloned().map(Some))
            .collect()
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.centers.is_empty() {
            return Err(AppError::config("radius scan needs at least one center"));
        }
        if self.radius_km.is_nan() || self.radius_km <= 0.0 {
            return Err(AppError::config("scan radius must be positive"));
        }
        if self.grid_step_km.is_nan() || self.grid_step_km <= 0.0 {
            return Err(AppError::config("grid step must be positive"));
        }
        let mut ids = BTreeSet::new();
        if let Some(dup) = self.centers.iter().find(|c| !ids.insert(c.id.as_str())) {
            return Err(AppError::config(format!("duplicate scan center {}", dup.id)));
        }
        Ok(())
    }
}

fn resolve_center(profile: &SearchProfile, id: &str) -> AppResult<HarvestPoint> {
    profile
        .hub(id)
        .cloned()
        .ok_or_else(|| AppError::config(format!("unknown center id: {id}")))
}

struct CenterScan {
    places: BTreeMap<String, PlaceRecord>,
    accepted: Vec<ResultRow>,
    rejected: Vec<ResultRow>,
    rejection_counts: RejectionCounts,
    summary: CenterSummary,
}

async fn scan_center(
    profile: &SearchProfile,
    backend: &dyn SearchBackend,
    session: &RunSession,
    plan: &ScanPlan,
    center: &HarvestPoint,
) -> AppResult<CenterScan> {
    let progress = &session.progress;
    let mut catalog = PlaceCatalog::new(
        QueryGroups::from_profile(profile),
        Some(Arc::clone(&session.cache)),
    );
    let points = radius_scan_points(
        &center.id,
        center.coordinates(),
        plan.radius_km,
        plan.grid_step_km,
    )?;
    let type_filters = plan.type_filters();
    info!(target: "pipeline", center = %center.id, points = points.len(), "radius scan started");
    progress.set_stage(
        &format!("radius_scan_{}", center.id),
        Some((points.len() * plan.queries.len() * type_filters.len()) as u64),
    );

    let mut budget_exceeded = false;
    'scan: for point in &points {
        for query in &plan.queries {
            for type_filter in &type_filters {
                let result = backend
                    .search_all(
                        query,
                        point,
                        type_filter.as_deref(),
                        plan.max_pages,
                        Some(plan.search_radius_m),
                    )
                    .await;
                let places = match result {
                    Ok(places) => places,
                    Err(err) if err.is_budget_exceeded() => {
                        warn!(target: "pipeline", %err, center = %center.id, point = %point.id, "radius scan stopped early");
                        budget_exceeded = true;
                        break 'scan;
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

    progress.set_stage("filters", Some(catalog.len() as u64));
    let (survivors, rejection_counts) =
        apply_scan_filters(catalog.places_mut(), center, plan.radius_km, &profile.filters);
    progress.set_stage("quality", Some(survivors.len() as u64));
    score_quality(catalog.places_mut(), &survivors, &profile.scoring);
    let (accepted, rejected) = ordered_rows(catalog.places(), listing_order);

    let summary = CenterSummary {
        unique_place_ids: catalog.len(),
        accepted: accepted.len(),
        rejected: rejected.len(),
        scan_points: points.len(),
        budget_exceeded,
        rejection_counts: rejection_counts.clone(),
    };
    Ok(CenterScan {
        places: catalog.into_places(),
        accepted,
        rejected,
        rejection_counts,
        summary,
    })
}

/// Unions per-center results: the first sighting's fields win, gaps are
/// filled from later centers and provenance is concatenated without repeats.
fn merge_center_places(
    centers: &[HarvestPoint],
    per_center: Vec<BTreeMap<String, PlaceRecord>>,
) -> BTreeMap<String, PlaceRecord> {
    let mut merged: BTreeMap<String, PlaceRecord> = BTreeMap::new();
    for places in per_center {
        for (place_id, place) in places {
            match merged.get_mut(&place_id) {
                Some(existing) => {
                    existing.fill_missing_from(&place);
                    existing.extend_found_by(&place.found_by);
                }
                None => {
                    merged.insert(place_id, place);
                }
            }
        }
    }
    for place in merged.values_mut() {
        place.clear_filter_state();
        place.clear_scores();
        let location = place.coordinates();
        place.distance_km_by_center = centers
            .iter()
            .map(|center| {
                let distance = location.map(|loc| loc.distance_km(&center.coordinates()));
                (center.id.clone(), distance)
            })
            .collect();
    }
    merged
}

/// Scans every center in turn. A single center returns its own rows; several
/// centers are merged and re-filtered by distance to the nearest of them.
pub(crate) async fn run_radius_scan(
    profile: &SearchProfile,
    backend: &dyn SearchBackend,
    session: &RunSession,
    plan: &ScanPlan,
) -> AppResult<PipelineResult> {
    let mut scans = Vec::with_capacity(plan.centers.len());
    for center in &plan.centers {
        scans.push(scan_center(profile, backend, session, plan, center).await?);
    }

    let scan_summary = ScanSummary {
        radius_km: plan.radius_km,
        grid_step_km: plan.grid_step_km,
        search_radius_m: plan.search_radius_m,
        queries: plan.queries.clone(),
        types: plan.types.clone(),
        budget_exceeded: scans.iter().any(|scan| scan.summary.budget_exceeded),
        per_center: plan
            .centers
            .iter()
            .zip(&scans)
            .map(|(center, scan)| (center.id.clone(), scan.summary.clone()))
            .collect(),
    };
    let requests = session.budget.metrics().snapshot();

    if plan.centers.len() == 1 {
        let Some(scan) = scans.pop() else {
            return Err(AppError::config("radius scan needs at least one center"));
        };
        let summary = RunSummary {
            mode: "radius_scan".to_string(),
            requests,
            travel_skipped: true,
            unique_place_ids: scan.places.len(),
            accepted: scan.accepted.len(),
            rejected: scan.rejected.len(),
            rejection_counts: scan.rejection_counts,
            top: preview(&scan.accepted, LISTING_PREVIEW),
            scan: Some(scan_summary),
            ..RunSummary::default()
        };
        return Ok(PipelineResult {
            accepted: scan.accepted,
            rejected: scan.rejected,
            summary,
        });
    }

    info!(target: "pipeline", centers = plan.centers.len(), "merging radius scan centers");
    let mut merged = merge_center_places(
        &plan.centers,
        scans.into_iter().map(|scan| scan.places).collect(),
    );
    session.progress.set_stage("radius_scan_merge", Some(merged.len() as u64));
    let (survivors, rejection_counts) = apply_merge_filters(&mut merged, plan.radius_km, &profile.filters);
    score_quality(&mut merged, &survivors, &profile.scoring);
    let (accepted, rejected) = ordered_rows(&merged, quality_order);

    let summary = RunSummary {
        mode: "radius_scan_merged".to_string(),
        requests,
        travel_skipped: true,
        unique_place_ids: merged.len(),
        accepted: accepted.len(),
        rejected: rejected.len(),
        rejection_counts,
        top: preview(&accepted, MERGED_PREVIEW),
        scan: Some(scan_summary),
        ..RunSummary::default()
    };
    Ok(PipelineResult {
        accepted,
        rejected,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::RequestBudget;
    use crate::cache::Cache;
    use crate::coverage::CoverageMode;
    use crate::pipeline::{run, RunMode, RunOptions};
    use crate::place::{FilterStage, RejectReason};
    use crate::progress::ProgressReporter;
    use crate::testing::{listing, ScenarioBackend};

    fn profile() -> SearchProfile {
        let mut profile = SearchProfile::new(
            vec![
                HarvestPoint::new("hub_a", 52.0, 21.0),
                HarvestPoint::new("hub_b", 52.1, 21.1),
            ],
            vec!["orthodontist".into()],
        );
        profile.harvest.min_candidates = 0;
        profile
    }

    fn session(max_search: u64) -> RunSession {
        RunSession::new(
            Arc::new(RequestBudget::new(max_search, 0)),
            Arc::new(Cache::in_memory().unwrap()),
            ProgressReporter::new(100),
        )
    }

    fn scan_options(profile: &SearchProfile, plan: ScanPlan) -> RunOptions {
        RunOptions {
            mode: RunMode::RadiusScan(plan),
            coverage_mode: CoverageMode::Off,
            ..RunOptions::standard(profile)
        }
    }

    fn ids(rows: &[ResultRow]) -> Vec<String> {
        rows.iter().map(|row| row.place_id.clone()).collect()
    }

    fn row<'a>(rows: &'a [ResultRow], id: &str) -> &'a ResultRow {
        rows.iter().find(|row| row.place_id == id).unwrap()
    }

    fn scan_plan(centers: Vec<HarvestPoint>) -> ScanPlan {
        ScanPlan {
            centers,
            radius_km: 3.0,
            grid_step_km: 2.0,
            search_radius_m: 1500,
            max_pages: 1,
            queries: vec!["orthodontist".into()],
            types: Vec::new(),
        }
    }

    #[tokio::test]
    async fn multi_center_scan_merges_and_keeps_any_center_in_range() {
        let mut profile = profile();
        profile.hubs = vec![
            HarvestPoint::new("hub_a", 52.0, 21.0),
            HarvestPoint::new("hub_b", 52.5, 21.0),
        ];
        let session = session(100);
        let backend = ScenarioBackend::new(Arc::clone(&session.budget)).anywhere(
            "orthodontist",
            vec![
                listing("pa", "Near A", 4.5, 300, 52.0, 21.0),
                listing("pb", "Near B", 4.7, 300, 52.5, 21.0),
                listing("mid", "Midway", 4.9, 300, 52.25, 21.0),
            ],
        );
        let opts = scan_options(&profile, scan_plan(profile.hubs.clone()));
        let result = run(&profile, &backend, &session, &opts).await.unwrap();

        assert_eq!(result.summary.mode, "radius_scan_merged");
        assert_eq!(ids(&result.accepted), vec!["pb", "pa"]);
        let pa = row(&result.accepted, "pa");
        assert_eq!(pa.centers_in_range, vec!["hub_a".to_string()]);
        assert_eq!(pa.nearest_point_id.as_deref(), Some("hub_a"));
        assert_eq!(pa.distance_km_by_center.len(), 2);
        assert!(pa.found_by_points.iter().any(|p| p.starts_with("hub_a_")));
        assert!(pa.found_by_points.iter().any(|p| p.starts_with("hub_b_")));

        let mid = row(&result.rejected, "mid");
        assert_eq!(mid.rejected_reason, Some(RejectReason::TooFar));
        assert_eq!(mid.rejected_stage, Some(FilterStage::RadiusScanMerge));

        let scan = result.summary.scan.unwrap();
        assert_eq!(scan.per_center.len(), 2);
        assert_eq!(scan.per_center["hub_a"].accepted, 1);
        assert!(!scan.budget_exceeded);
    }

    #[tokio::test]
    async fn scan_budget_exhaustion_keeps_partial_results() {
        let profile = profile();
        let session = session(2);
        let backend = ScenarioBackend::new(Arc::clone(&session.budget)).anywhere(
            "orthodontist",
            vec![
                listing("p1", "Smile Ortho", 4.8, 200, 52.0, 21.0),
                listing("p2", "Braces Lab", 4.5, 400, 52.05, 21.05),
                listing("p3", "Tiny Clinic", 4.9, 10, 52.0, 21.0),
            ],
        );
        let center = HarvestPoint::new("center", 52.0, 21.0);
        let opts = scan_options(&profile, scan_plan(vec![center]));
        let result = run(&profile, &backend, &session, &opts).await.unwrap();

        assert_eq!(result.summary.mode, "radius_scan");
        let scan = result.summary.scan.unwrap();
        assert!(scan.budget_exceeded);
        assert!(scan.per_center["center"].budget_exceeded);
        assert_eq!(backend.search_calls().len(), 2);
        assert_eq!(ids(&result.accepted), vec!["p1"]);
        assert_eq!(
            result.accepted[0].nearest_point_id.as_deref(),
            Some("center")
        );
    }

    #[test]
    fn scan_plan_resolves_centers_and_defaults() {
        let mut profile = profile();
        profile.queries.general = vec!["dentist".into(), "orthodontist".into()];
        profile.type_filters = vec!["dentist".into()];

        let settings = ScanSettings {
            centers: vec!["hub_b".into(), "hub_a".into()],
            ..ScanSettings::default()
        };
        let plan = ScanPlan::from_settings(&settings, &profile).unwrap();
        assert_eq!(plan.centers[0].id, "hub_b");
        assert_eq!(plan.radius_km, profile.filters.max_distance_km);
        assert_eq!(plan.grid_step_km, 2.0);
        assert_eq!(plan.search_radius_m, 1500);
        assert_eq!(plan.queries, vec!["orthodontist", "dentist"]);
        assert_eq!(plan.type_filters(), vec![None, Some("dentist".to_string())]);

        let adhoc = ScanSettings {
            center_lat: Some(50.0),
            center_lon: Some(19.9),
            ..ScanSettings::default()
        };
        let plan = ScanPlan::from_settings(&adhoc, &profile).unwrap();
        assert_eq!(plan.centers, vec![HarvestPoint::new("center", 50.0, 19.9)]);

        let unknown = ScanSettings {
            centers: vec!["nowhere".into()],
            ..ScanSettings::default()
        };
        assert!(matches!(
            ScanPlan::from_settings(&unknown, &profile),
            Err(AppError::Config(_))
        ));
        assert!(ScanPlan::from_settings(&ScanSettings::default(), &profile).is_err());
    }
}
