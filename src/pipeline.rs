use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::SearchBackend;
use crate::budget::{RequestBudget, RequestKind};
use crate::cache::Cache;
use crate::config::{AppConfig, DEFAULT_COVERAGE_SHARE};
use crate::coverage::{
    coverage_check, unique_contributions, CoverageBudget, CoverageMode, CoveragePlan,
    CoverageReport, CoverageStats,
};
use crate::errors::{AppError, AppResult};
use crate::filters::{apply_filters, apply_listing_filters, count_rejection};
use crate::geo::{grid_points, Coordinates, HarvestPoint};
use crate::harvest::{harvest, HarvestRequest, PlaceCatalog, QueryGroups};
use crate::place::{FilterStage, PlaceRecord, QueryGroup, RejectReason};
use crate::profile::SearchProfile;
use crate::progress::ProgressReporter;
use crate::ranking::{
    final_score, listing_order, ordered_rows, relevance, result_order, score_quality, shortlist,
    ResultRow,
};
use crate::routes::{compute_departure_time, TravelTarget};
use crate::scan::{run_radius_scan, ScanPlan};
use crate::scoring::travel_score;
use crate::summary::{preview, RunSummary};

const STANDARD_PREVIEW: usize = 10;
pub(crate) const LISTING_PREVIEW: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    Standard,
    Listing,
    RadiusScan(ScanPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub mode: RunMode,
    pub coverage_mode: CoverageMode,
    pub coverage_budget_share: f64,
    pub top_n: usize,
    pub skip_travel: bool,
    /// Fixed departure for travel lookups; the next weekday slot when unset.
    pub departure: Option<DateTime<Utc>>,
}

impl RunOptions {
    pub fn standard(profile: &SearchProfile) -> Self {
        Self {
            mode: RunMode::Standard,
            coverage_mode: CoverageMode::default(),
            coverage_budget_share: DEFAULT_COVERAGE_SHARE,
            top_n: profile.scoring.top_n,
            skip_travel: false,
            departure: None,
        }
    }

    pub fn from_config(config: &AppConfig, profile: &SearchProfile) -> AppResult<Self> {
        let mode = match config.run_mode.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => RunMode::Standard,
            "listing" | "list" => RunMode::Listing,
            "radius_scan" | "radius-scan" | "scan" => {
                RunMode::RadiusScan(ScanPlan::from_settings(&config.scan, profile)?)
            }
            other => {
                return Err(AppError::config(format!(
                    "run mode must be one of standard, listing, radius_scan (got {other})"
                )))
            }
        };
        let options = Self {
            mode,
            coverage_mode: config.coverage_mode.parse()?,
            coverage_budget_share: config.coverage_budget_share,
            top_n: config.top_n.unwrap_or(profile.scoring.top_n),
            skip_travel: config.skip_travel,
            departure: None,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=1.0).contains(&self.coverage_budget_share) {
            return Err(AppError::config(format!(
                "coverage budget share must be within [0, 1], got {}",
                self.coverage_budget_share
            )));
        }
        match &self.mode {
            RunMode::RadiusScan(plan) => plan.validate(),
            RunMode::Standard | RunMode::Listing => Ok(()),
        }
    }

    fn label(&self) -> &'static str {
        match &self.mode {
            RunMode::Standard => "standard",
            RunMode::Listing => "listing",
            RunMode::RadiusScan(plan) if plan.centers.len() > 1 => "radius_scan_merged",
            RunMode::RadiusScan(_) => "radius_scan",
        }
    }
}

/// Shared state of one run: the request budget, the persistent cache and
/// the progress reporter.
pub struct RunSession {
    pub budget: Arc<RequestBudget>,
    pub cache: Arc<Cache>,
    pub progress: ProgressReporter,
}

impl RunSession {
    pub fn new(budget: Arc<RequestBudget>, cache: Arc<Cache>, progress: ProgressReporter) -> Self {
        Self {
            budget,
            cache,
            progress,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub accepted: Vec<ResultRow>,
    pub rejected: Vec<ResultRow>,
    pub summary: RunSummary,
}

/// Runs one pipeline pass. Configuration is validated before any request is
/// made. The cache and the progress log are flushed whether or not the run
/// succeeds; a failed run ends the log with a `run_failed` event.
pub async fn run(
    profile: &SearchProfile,
    backend: &dyn SearchBackend,
    session: &RunSession,
    options: &RunOptions,
) -> AppResult<PipelineResult> {
    profile.validate()?;
    options.validate()?;
    info!(target: "pipeline", mode = options.label(), "run started");

    let result = match &options.mode {
        RunMode::Standard => run_standard(profile, backend, session, options).await,
        RunMode::Listing => run_listing(profile, backend, session).await,
        RunMode::RadiusScan(plan) => run_radius_scan(profile, backend, session, plan).await,
    };

    match &result {
        Ok(result) => {
            let metrics = session.budget.metrics().snapshot();
            info!(
                target: "pipeline",
                mode = options.label(),
                accepted = result.accepted.len(),
                rejected = result.rejected.len(),
                search_requests = metrics.search_requests,
                travel_requests = metrics.travel_requests,
                "run finished"
            );
            session.progress.record_or_warn(
                "run_finished",
                serde_json::json!({
                    "mode": options.label(),
                    "accepted": result.accepted.len(),
                    "rejected": result.rejected.len(),
                }),
            );
        }
        Err(err) => {
            warn!(target: "pipeline", mode = options.label(), %err, "run aborted");
            session.progress.record_or_warn(
                "run_failed",
                serde_json::json!({"mode": options.label(), "error": err.to_string()}),
            );
        }
    }

    let flushed = session.cache.flush();
    session.progress.flush().unwrap_or_else(|err| {
        warn!(target: "pipeline", ?err, "failed to flush progress events");
    });
    let result = result?;
    flushed?;
    Ok(result)
}

async fn harvest_hubs(
    profile: &SearchProfile,
    backend: &dyn SearchBackend,
    catalog: &mut PlaceCatalog,
    progress: &ProgressReporter,
) -> AppResult<()> {
    let type_filters = profile.type_filter_options();
    let request = HarvestRequest {
        points: &profile.hubs,
        queries: &profile.queries.primary,
        type_filters: &type_filters,
        max_pages: profile.harvest.max_pages_per_query,
        per_query_max_pages: &profile.queries.max_pages,
        radius_m: None,
    };
    info!(target: "pipeline", stage = "harvest_hubs", hubs = profile.hubs.len(), "harvesting primary queries at hubs");
    progress.set_stage("harvest_hubs", Some(request.call_count()));
    harvest(backend, catalog, &request, None, progress).await?;
    Ok(())
}

/// Survivor count of a filter pass over a copy of the catalog.
fn preview_candidates(catalog: &PlaceCatalog, profile: &SearchProfile) -> usize {
    let mut preview = catalog.places().clone();
    for place in preview.values_mut() {
        place.clear_filter_state();
    }
    apply_filters(&mut preview, &profile.hubs, &profile.filters).0.len()
}

async fn run_standard(
    profile: &SearchProfile,
    backend: &dyn SearchBackend,
    session: &RunSession,
    options: &RunOptions,
) -> AppResult<PipelineResult> {
    let budget = session.budget.as_ref();
    let progress = &session.progress;
    let mut catalog = PlaceCatalog::new(
        QueryGroups::from_profile(profile),
        Some(Arc::clone(&session.cache)),
    );

    harvest_hubs(profile, backend, &mut catalog, progress).await?;

    let plan = CoveragePlan::resolve(options.coverage_mode, profile);
    let mut tracker = CoverageBudget::new(
        options.coverage_mode,
        budget.cap(RequestKind::Search),
        options.coverage_budget_share,
    );
    let mut stats = CoverageStats {
        mode: options.coverage_mode,
        ..CoverageStats::default()
    };
    let mut grid: Vec<HarvestPoint> = Vec::new();
    if options.coverage_mode == CoverageMode::Off {
        stats.skipped = true;
    } else if tracker.cap == 0 {
        stats.skipped = true;
        stats.stopped_early = true;
    } else if plan.queries.is_empty() {
        stats.skipped = true;
    } else {
        info!(target: "pipeline", stage = "coverage_check", mode = %plan.mode, cap = tracker.cap, "sampling coverage grid");
        let outcome = coverage_check(
            backend,
            &mut catalog,
            &profile.hubs,
            &profile.bbox,
            &plan,
            &mut tracker,
            budget,
            progress,
        )
        .await?;
        stats = outcome.stats;
        grid = outcome.grid;
    }

    let coverage_enabled = options.coverage_mode != CoverageMode::Off && tracker.cap > 0;
    if coverage_enabled && tracker.remaining(budget) > 0 && !plan.harvest_queries.is_empty() {
        if grid.is_empty() {
            grid = grid_points(&profile.bbox, plan.grid_size_initial)?;
        }
        let request = HarvestRequest {
            points: &grid,
            queries: &plan.harvest_queries,
            type_filters: &plan.harvest_type_filters,
            max_pages: plan.harvest_max_pages,
            per_query_max_pages: &profile.queries.max_pages,
            radius_m: None,
        };
        info!(target: "pipeline", stage = "harvest_grid", points = grid.len(), "harvesting grid points");
        progress.set_stage("harvest_grid", Some(request.call_count()));
        if harvest(backend, &mut catalog, &request, Some((&mut tracker, budget)), progress).await? {
            stats.stopped_early = true;
        }
    }

    let general = &profile.queries.general;
    let min_candidates = profile.harvest.min_candidates;
    if !general.is_empty() {
        let candidates = preview_candidates(&catalog, profile);
        if candidates < min_candidates {
            info!(target: "pipeline", stage = "harvest_general_hubs", candidates, min_candidates, "running general fallback");
            let general_pages: BTreeMap<String, usize> = general
                .iter()
                .map(|query| (query.clone(), profile.harvest.general_max_pages))
                .collect();
            let text_only: [Option<String>; 1] = [None];
            let request = HarvestRequest {
                points: &profile.hubs,
                queries: general,
                type_filters: &text_only,
                max_pages: profile.harvest.general_max_pages,
                per_query_max_pages: &general_pages,
                radius_m: None,
            };
            progress.set_stage("harvest_general_hubs", Some(request.call_count()));
            harvest(backend, &mut catalog, &request, None, progress).await?;

            let candidates = preview_candidates(&catalog, profile);
            let grid_allowed =
                options.coverage_mode != CoverageMode::Off && tracker.remaining(budget) > 0;
            if candidates < min_candidates && grid_allowed {
                let general_grid = grid_points(&profile.bbox, plan.grid_size_initial)?;
                let request = HarvestRequest {
                    points: &general_grid,
                    ..request
                };
                info!(target: "pipeline", stage = "harvest_general_grid", candidates, "running general fallback on grid");
                progress.set_stage("harvest_general_grid", Some(request.call_count()));
                if harvest(backend, &mut catalog, &request, Some((&mut tracker, budget)), progress)
                    .await?
                {
                    stats.stopped_early = true;
                }
            } else {
                debug!(target: "pipeline", candidates, grid_allowed, "general grid fallback skipped");
            }
        } else {
            debug!(target: "pipeline", candidates, min_candidates, "general fallback skipped");
        }
    }

    stats.mode = options.coverage_mode;
    stats.coverage_cap = tracker.cap;
    stats.coverage_consumed = tracker.consumed;
    stats.cap_reached = options.coverage_mode != CoverageMode::Off && tracker.cap_reached();

    catalog.clear_filter_state();
    progress.set_stage("filters", Some(catalog.len() as u64));
    let (survivors, mut rejection_counts) =
        apply_filters(catalog.places_mut(), &profile.hubs, &profile.filters);

    progress.set_stage("quality", Some(survivors.len() as u64));
    score_quality(catalog.places_mut(), &survivors, &profile.scoring);
    let shortlisted = shortlist(catalog.places(), &survivors, options.top_n);

    let travel_skipped = options.skip_travel || budget.cap(RequestKind::Travel) == 0;
    if travel_skipped {
        info!(target: "pipeline", stage = "travel", shortlisted = shortlisted.len(), "travel scoring skipped");
        for place_id in &shortlisted {
            if let Some(place) = catalog.places_mut().get_mut(place_id) {
                score_place(place, None, profile);
            }
        }
    } else {
        let departure = match options.departure {
            Some(departure) => departure,
            None => compute_departure_time(Utc::now(), &profile.travel)?,
        };
        info!(target: "pipeline", stage = "travel", shortlisted = shortlisted.len(), %departure, "scoring travel times");
        progress.set_stage("travel", Some(shortlisted.len() as u64));
        for place_id in &shortlisted {
            let Some(location) = catalog.get(place_id).and_then(PlaceRecord::coordinates) else {
                continue;
            };
            let fastest =
                fastest_route(backend, &profile.hubs, place_id, location, departure, &profile.travel.mode)
                    .await?;
            let Some(place) = catalog.places_mut().get_mut(place_id) else {
                continue;
            };
            match fastest {
                None => {
                    place.reject(RejectReason::NoTravelRoute, FilterStage::Travel);
                    count_rejection(&mut rejection_counts, RejectReason::NoTravelRoute);
                }
                Some(seconds) => {
                    let minutes = seconds as f64 / 60.0;
                    place.travel_min_minutes = Some(minutes);
                    if minutes > profile.travel.limit_minutes {
                        place.reject(RejectReason::TravelOverLimit, FilterStage::Travel);
                        count_rejection(&mut rejection_counts, RejectReason::TravelOverLimit);
                    } else {
                        score_place(place, Some(minutes), profile);
                    }
                }
            }
            progress.advance();
        }
    }

    let (accepted, rejected) = ordered_rows(catalog.places(), result_order);
    let coverage_report = CoverageReport::build(catalog.by_query(), catalog.by_point());
    let group_sets: BTreeMap<String, BTreeSet<String>> = catalog
        .by_group()
        .iter()
        .filter(|(group, _)| matches!(group, QueryGroup::Primary | QueryGroup::General))
        .map(|(group, ids)| (group.as_str().to_string(), ids.clone()))
        .collect();

    let summary = RunSummary {
        mode: options.label().to_string(),
        requests: budget.metrics().snapshot(),
        travel_skipped,
        unique_place_ids: catalog.len(),
        accepted: accepted.len(),
        rejected: rejected.len(),
        coverage: Some(stats),
        coverage_report: Some(coverage_report),
        query_group_totals: group_sets
            .iter()
            .map(|(group, ids)| (group.clone(), ids.len()))
            .collect(),
        query_group_uniques: unique_contributions(&group_sets),
        rejection_counts,
        scan: None,
        top: preview(&accepted, STANDARD_PREVIEW),
    };
    Ok(PipelineResult {
        accepted,
        rejected,
        summary,
    })
}

/// Minimum duration in seconds over all hubs, `None` when no hub has a route.
async fn fastest_route(
    backend: &dyn SearchBackend,
    hubs: &[HarvestPoint],
    place_id: &str,
    location: Coordinates,
    departure: DateTime<Utc>,
    mode: &str,
) -> AppResult<Option<u64>> {
    let mut fastest: Option<u64> = None;
    for hub in hubs {
        let target = TravelTarget { place_id, location };
        let duration = backend
            .compute_duration(&hub.id, hub.coordinates(), target, departure, mode)
            .await?;
        if let Some(seconds) = duration {
            fastest = Some(fastest.map_or(seconds, |best| best.min(seconds)));
        }
    }
    Ok(fastest)
}

fn score_place(place: &mut PlaceRecord, travel_minutes: Option<f64>, profile: &SearchProfile) {
    let travel = travel_minutes.map(|minutes| travel_score(minutes, profile.travel.score_k));
    let place_relevance = relevance(place, &profile.relevance);
    place.travel_score = travel;
    place.relevance = Some(place_relevance);
    place.final_score = Some(final_score(
        place.quality.unwrap_or(0.0),
        travel,
        place_relevance,
        &profile.scoring,
    ));
}

async fn run_listing(
    profile: &SearchProfile,
    backend: &dyn SearchBackend,
    session: &RunSession,
) -> AppResult<PipelineResult> {
    let progress = &session.progress;
    let mut catalog = PlaceCatalog::new(
        QueryGroups::from_profile(profile),
        Some(Arc::clone(&session.cache)),
    );
    harvest_hubs(profile, backend, &mut catalog, progress).await?;

    catalog.clear_filter_state();
    progress.set_stage("filters", Some(catalog.len() as u64));
    let (survivors, rejection_counts) =
        apply_listing_filters(catalog.places_mut(), &profile.hubs, &profile.filters);
    progress.set_stage("quality", Some(survivors.len() as u64));
    score_quality(catalog.places_mut(), &survivors, &profile.scoring);

    let (accepted, rejected) = ordered_rows(catalog.places(), listing_order);
    let summary = RunSummary {
        mode: "listing".to_string(),
        requests: session.budget.metrics().snapshot(),
        travel_skipped: true,
        unique_place_ids: catalog.len(),
        accepted: accepted.len(),
        rejected: rejected.len(),
        rejection_counts,
        top: preview(&accepted, LISTING_PREVIEW),
        ..RunSummary::default()
    };
    Ok(PipelineResult {
        accepted,
        rejected,
        summary,
    })
}
