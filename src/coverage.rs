use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{info, warn};

use crate::backend::SearchBackend;
use crate::budget::{RequestBudget, RequestKind};
use crate::errors::{AppError, AppResult};
use crate::geo::{grid_points, BoundingBox, HarvestPoint};
use crate::harvest::PlaceCatalog;
use crate::place::SearchMode;
use crate::profile::SearchProfile;
use crate::progress::ProgressReporter;

const LIGHT_QUERY_COUNT: usize = 2;
const LIGHT_GRID_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageMode {
    Off,
    #[default]
    Light,
    Full,
}

impl FromStr for CoverageMode {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(CoverageMode::Off),
            "light" => Ok(CoverageMode::Light),
            "full" => Ok(CoverageMode::Full),
            other => Err(AppError::config(format!(
                "coverage mode must be one of off, light, full (got {other})"
            ))),
        }
    }
}

impl fmt::Display for CoverageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoverageMode::Off => "off",
            CoverageMode::Light => "light",
            CoverageMode::Full => "full",
        })
    }
}

/// Share of the search budget reserved for grid sampling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoverageBudget {
    pub cap: u64,
    pub consumed: u64,
}

impl CoverageBudget {
    pub fn new(mode: CoverageMode, max_search: u64, share: f64) -> Self {
        let cap = match mode {
            CoverageMode::Off => 0,
            _ => (max_search as f64 * share).floor().max(0.0) as u64,
        };
        Self { cap, consumed: 0 }
    }

    /// Bounded by both the sub-budget and what the global budget has left.
    pub fn remaining(&self, budget: &RequestBudget) -> u64 {
        self.cap
            .saturating_sub(self.consumed)
            .min(budget.remaining(RequestKind::Search))
    }

    pub fn cap_reached(&self) -> bool {
        self.cap == 0 || self.consumed >= self.cap
    }

    /// Charges every network search made since `used_before` was read.
    pub fn charge_since(&mut self, budget: &RequestBudget, used_before: u64) {
        self.consumed += budget.used(RequestKind::Search).saturating_sub(used_before);
    }
}

/// Query lists and grid parameters for one coverage mode.
#[derive(Debug, Clone, PartialEq)]
pub struct CoveragePlan {
    pub mode: CoverageMode,
    pub queries: Vec<String>,
    pub max_pages_per_query: usize,
    pub grid_size_initial: usize,
    pub grid_max_iterations: usize,
    pub uplift_threshold: f64,
    pub harvest_queries: Vec<String>,
    pub harvest_type_filters: Vec<Option<String>>,
    pub harvest_max_pages: usize,
}

impl CoveragePlan {
    pub fn resolve(mode: CoverageMode, profile: &SearchProfile) -> Self {
        let hubs_only = profile.hubs_only_queries();
        let mut plan = match mode {
            CoverageMode::Light => {
                let queries: Vec<String> = profile
                    .queries
                    .coverage
                    .iter()
                    .take(LIGHT_QUERY_COUNT)
                    .cloned()
                    .collect();
                Self {
                    mode,
                    harvest_queries: queries.clone(),
                    queries,
                    max_pages_per_query: 1,
                    grid_size_initial: LIGHT_GRID_SIZE,
                    grid_max_iterations: 0,
                    uplift_threshold: profile.coverage.uplift_threshold,
                    harvest_type_filters: vec![None],
                    harvest_max_pages: 1,
                }
            }
            CoverageMode::Off | CoverageMode::Full => Self {
                mode,
                queries: profile.queries.coverage.clone(),
                max_pages_per_query: profile.coverage.max_pages_per_query.max(1),
                grid_size_initial: profile.coverage.grid_size_initial,
                grid_max_iterations: profile.coverage.grid_max_iterations,
                uplift_threshold: profile.coverage.uplift_threshold,
                harvest_queries: profile.grid_queries(),
                harvest_type_filters: profile.type_filter_options(),
                harvest_max_pages: profile.harvest.max_pages_per_query,
            },
        };
        plan.queries.retain(|q| !hubs_only.contains(q));
        plan.harvest_queries.retain(|q| !hubs_only.contains(q));
        plan
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageStats {
    pub u_hubs: usize,
    pub u_grid_total: usize,
    pub u_grid_new: usize,
    pub u_union_total: usize,
    pub uplift: f64,
    pub grid_size: usize,
    pub grid_points: usize,
    /// Grid sizes sampled, one per iteration.
    pub grid_sizes: Vec<usize>,
    pub iterations: usize,
    pub mode: CoverageMode,
    pub skipped: bool,
    pub stopped_early: bool,
    pub coverage_cap: u64,
    pub coverage_consumed: u64,
    pub cap_reached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CoverageOutcome {
    pub stats: CoverageStats,
    /// Grid of the last completed (or interrupted) iteration.
    pub grid: Vec<HarvestPoint>,
}

/// Per-query and per-point overlap statistics for the whole harvest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoverageReport {
    pub unique_by_query: BTreeMap<String, usize>,
    pub unique_by_point: BTreeMap<String, usize>,
    pub jaccard_by_query: BTreeMap<String, f64>,
}

impl CoverageReport {
    pub fn build(
        by_query: &BTreeMap<String, BTreeSet<String>>,
        by_point: &BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        Self {
            unique_by_query: unique_contributions(by_query),
            unique_by_point: unique_contributions(by_point),
            jaccard_by_query: pairwise_jaccard(by_query),
        }
    }
}

pub fn compute_uplift(u_hubs: usize, u_union_total: usize) -> f64 {
    (u_union_total as f64 - u_hubs as f64) / u_hubs.max(1) as f64
}

/// For each key, how many of its ids appear under no other key.
pub fn unique_contributions<K: Ord + Clone>(
    sets: &BTreeMap<K, BTreeSet<String>>,
) -> BTreeMap<K, usize> {
    sets.iter()
        .map(|(key, ids)| {
            let unique = ids
                .iter()
                .filter(|id| {
                    !sets
                        .iter()
                        .any(|(other, other_ids)| other != key && other_ids.contains(*id))
                })
                .count();
            (key.clone(), unique)
        })
        .collect()
}

pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union.max(1) as f64
}

pub fn pairwise_jaccard(sets: &BTreeMap<String, BTreeSet<String>>) -> BTreeMap<String, f64> {
    let keys: Vec<&String> = sets.keys().collect();
    let mut scores = BTreeMap::new();
    for (idx, first) in keys.iter().enumerate() {
        for second in &keys[idx + 1..] {
            scores.insert(
                format!("{first}|{second}"),
                jaccard(&sets[*first], &sets[*second]),
            );
        }
    }
    scores
}

/// Samples a uniform grid with the coverage queries, densifying while the
/// uplift over hub-only results stays above the threshold. Running out of
/// coverage budget ends the check early instead of failing the run.
#[allow(clippy::too_many_arguments)]
pub async fn coverage_check(
    backend: &dyn SearchBackend,
    catalog: &mut PlaceCatalog,
    hubs: &[HarvestPoint],
    bbox: &BoundingBox,
    plan: &CoveragePlan,
    tracker: &mut CoverageBudget,
    budget: &RequestBudget,
    progress: &ProgressReporter,
) -> AppResult<CoverageOutcome> {
    let mut u_hubs: BTreeSet<String> = BTreeSet::new();
    for query in &plan.queries {
        for hub in hubs {
            if let Some(ids) = catalog.ids_for_query_point(query, &hub.id) {
                u_hubs.extend(ids.iter().cloned());
            }
        }
    }

    let mut grid_size = plan.grid_size_initial;
    let mut outcome = CoverageOutcome {
        stats: CoverageStats {
            u_hubs: u_hubs.len(),
            u_union_total: u_hubs.len(),
            grid_size,
            mode: plan.mode,
            ..CoverageStats::default()
        },
        grid: Vec::new(),
    };
    if plan.queries.is_empty() {
        return Ok(outcome);
    }

    let mut stopped_early = false;
    let mut grid_sizes = Vec::new();
    let mut u_grid: BTreeSet<String> = BTreeSet::new();
    for iteration in 0..=plan.grid_max_iterations {
        let grid = grid_points(bbox, grid_size)?;
        grid_sizes.push(grid_size);
        progress.set_stage(
            "coverage_check",
            Some((grid.len() * plan.queries.len()) as u64),
        );
        u_grid.clear();
        'grid: for point in &grid {
            for query in &plan.queries {
                let remaining = tracker.remaining(budget);
                let max_pages = (plan.max_pages_per_query as u64).min(remaining) as usize;
                if max_pages == 0 {
                    stopped_early = true;
                    break 'grid;
                }
                let used_before = budget.used(RequestKind::Search);
                let result = backend
                    .search_all(query, point, None, max_pages, None)
                    .await;
                tracker.charge_since(budget, used_before);
                let places = match result {
                    Ok(places) => places,
                    Err(err) if err.is_budget_exceeded() => {
                        warn!(target: "coverage", %err, "coverage sampling stopped early");
                        stopped_early = true;
                        break 'grid;
                    }
                    Err(err) => return Err(err),
                };
                for place in &places {
                    catalog.record(place, query, &point.id, &SearchMode::Text)?;
                    u_grid.insert(place.place_id.clone());
                }
                progress.advance();
            }
        }
        outcome.grid = grid;

        let union_total = u_hubs.union(&u_grid).count();
        let uplift = compute_uplift(u_hubs.len(), union_total);
        info!(
            target: "coverage",
            iteration,
            grid_size,
            u_hubs = u_hubs.len(),
            u_grid = u_grid.len(),
            uplift,
            "coverage iteration finished"
        );
        if stopped_early || uplift <= plan.uplift_threshold || iteration >= plan.grid_max_iterations {
            break;
        }
        grid_size += 1;
    }

    let union_total = u_hubs.union(&u_grid).count();
    outcome.stats = CoverageStats {
        u_grid_total: u_grid.len(),
        u_grid_new: u_grid.difference(&u_hubs).count(),
        u_union_total: union_total,
        uplift: compute_uplift(u_hubs.len(), union_total),
        grid_size,
        grid_points: outcome.grid.len(),
        iterations: grid_sizes.len(),
        grid_sizes,
        stopped_early,
        ..outcome.stats
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::geo::Coordinates;
    use crate::harvest::QueryGroups;
    use crate::testing::{listing, ScenarioBackend};

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn uplift_is_relative_to_hub_results() {
        assert_eq!(compute_uplift(10, 12), 0.2);
        assert_eq!(compute_uplift(0, 3), 3.0);
        assert_eq!(compute_uplift(5, 5), 0.0);
    }

    #[test]
    fn unique_contributions_ignore_shared_ids() {
        let mut sets = BTreeMap::new();
        sets.insert("a".to_string(), set(&["1", "2", "3"]));
        sets.insert("b".to_string(), set(&["3", "4"]));
        sets.insert("c".to_string(), set(&[]));
        let unique = unique_contributions(&sets);
        assert_eq!(unique["a"], 2);
        assert_eq!(unique["b"], 1);
        assert_eq!(unique["c"], 0);
    }

    #[test]
    fn jaccard_pairs_use_sorted_keys() {
        let mut sets = BTreeMap::new();
        sets.insert("beta".to_string(), set(&["1", "2"]));
        sets.insert("alpha".to_string(), set(&["2", "3"]));
        sets.insert("empty".to_string(), set(&[]));
        let scores = pairwise_jaccard(&sets);
        assert_eq!(scores.len(), 3);
        assert!((scores["alpha|beta"] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(scores["beta|empty"], 0.0);
        assert_eq!(jaccard(&set(&[]), &set(&[])), 1.0);
    }

    #[test]
    fn sub_budget_is_a_floor_share_and_respects_global_remaining() {
        let budget = RequestBudget::new(10, 0);
        let mut tracker = CoverageBudget::new(CoverageMode::Light, 10, 0.25);
        assert_eq!(tracker.cap, 2);
        assert_eq!(tracker.remaining(&budget), 2);

        let before = budget.used(RequestKind::Search);
        budget.consume(RequestKind::Search).unwrap();
        tracker.charge_since(&budget, before);
        assert_eq!(tracker.remaining(&budget), 1);
        assert!(!tracker.cap_reached());

        for _ in 0..9 {
            budget.consume(RequestKind::Search).unwrap();
        }
        assert_eq!(tracker.remaining(&budget), 0);

        let off = CoverageBudget::new(CoverageMode::Off, 10, 0.5);
        assert_eq!(off.cap, 0);
        assert!(off.cap_reached());
    }

    #[test]
    fn modes_parse_case_insensitively() {
        assert_eq!("FULL".parse::<CoverageMode>().unwrap(), CoverageMode::Full);
        assert_eq!(" off ".parse::<CoverageMode>().unwrap(), CoverageMode::Off);
        assert!(matches!("dense".parse::<CoverageMode>(), Err(AppError::Config(_))));
    }

    #[test]
    fn light_plan_keeps_hubs_only_queries_off_the_grid() {
        let mut profile = SearchProfile::new(
            vec![HarvestPoint::new("hub", 52.0, 21.0)],
            vec!["q1".into(), "q2".into(), "q3".into()],
        );
        profile.queries.coverage = vec!["q1".into(), "q2".into(), "q3".into()];
        profile.queries.hubs_only = vec!["q2".into()];
        profile.type_filters = vec!["dentist".into()];

        let light = CoveragePlan::resolve(CoverageMode::Light, &profile);
        assert_eq!(light.queries, vec!["q1"]);
        assert_eq!(light.harvest_type_filters, vec![None]);
        assert_eq!(light.grid_size_initial, 3);

        let full = CoveragePlan::resolve(CoverageMode::Full, &profile);
        assert_eq!(full.queries, vec!["q1", "q3"]);
        assert_eq!(full.harvest_queries, vec!["q1", "q3"]);
        assert_eq!(full.harvest_type_filters.len(), 2);
    }

    fn grid_plan(max_iterations: usize) -> CoveragePlan {
        CoveragePlan {
            mode: CoverageMode::Full,
            queries: vec!["orthodontist".into()],
            max_pages_per_query: 1,
            grid_size_initial: 2,
            grid_max_iterations: max_iterations,
            uplift_threshold: 0.10,
            harvest_queries: Vec::new(),
            harvest_type_filters: vec![None],
            harvest_max_pages: 1,
        }
    }

    /// Each denser grid reaches a corner the previous one did not have.
    fn densifying_backend(budget: &Arc<RequestBudget>) -> ScenarioBackend {
        ScenarioBackend::new(Arc::clone(budget))
            .page("orthodontist", "grid_0_0", vec![listing("g0", "Corner", 4.5, 80, 52.0, 21.0)])
            .page("orthodontist", "grid_2_2", vec![listing("g2", "Ring Two", 4.6, 90, 52.0, 21.0)])
            .page("orthodontist", "grid_3_3", vec![listing("g3", "Ring Three", 4.7, 95, 52.0, 21.0)])
    }

    fn hub_catalog(hub: &HarvestPoint) -> PlaceCatalog {
        let profile = SearchProfile::new(vec![hub.clone()], vec!["orthodontist".into()]);
        let mut catalog = PlaceCatalog::new(QueryGroups::from_profile(&profile), None);
        catalog
            .record(
                &listing("h1", "Hub Clinic", 4.8, 120, hub.lat, hub.lon),
                "orthodontist",
                &hub.id,
                &SearchMode::Text,
            )
            .unwrap();
        catalog
    }

    #[tokio::test]
    async fn grid_densifies_until_the_iteration_limit() {
        let hub = HarvestPoint::new("hub_a", 52.0, 21.0);
        let bbox = BoundingBox::around(Coordinates::new(52.0, 21.0), 5.0);
        let budget = Arc::new(RequestBudget::new(100, 0));
        let backend = densifying_backend(&budget);
        let mut catalog = hub_catalog(&hub);
        let mut tracker = CoverageBudget::new(CoverageMode::Full, 100, 1.0);

        let outcome = coverage_check(
            &backend,
            &mut catalog,
            std::slice::from_ref(&hub),
            &bbox,
            &grid_plan(2),
            &mut tracker,
            &budget,
            &ProgressReporter::new(0),
        )
        .await
        .unwrap();

        let stats = outcome.stats;
        assert_eq!(stats.grid_sizes, vec![2, 3, 4]);
        assert_eq!(stats.iterations, 3);
        assert_eq!(stats.grid_size, 4);
        assert_eq!(stats.grid_points, 16);
        assert_eq!(stats.u_hubs, 1);
        assert_eq!(stats.u_grid_total, 3);
        assert_eq!(stats.u_grid_new, 3);
        assert_eq!(stats.u_union_total, 4);
        assert_eq!(stats.uplift, 3.0);
        assert!(!stats.stopped_early);
        assert_eq!(tracker.consumed, 4 + 9 + 16);
        assert_eq!(backend.search_calls().len(), 29);
        assert!(catalog.get("g3").is_some());
    }

    #[tokio::test]
    async fn grid_stops_when_uplift_falls_below_threshold() {
        let hub = HarvestPoint::new("hub_a", 52.0, 21.0);
        let bbox = BoundingBox::around(Coordinates::new(52.0, 21.0), 5.0);
        let budget = Arc::new(RequestBudget::new(100, 0));
        let backend = ScenarioBackend::new(Arc::clone(&budget));
        let mut catalog = hub_catalog(&hub);
        let mut tracker = CoverageBudget::new(CoverageMode::Full, 100, 1.0);

        let outcome = coverage_check(
            &backend,
            &mut catalog,
            std::slice::from_ref(&hub),
            &bbox,
            &grid_plan(2),
            &mut tracker,
            &budget,
            &ProgressReporter::new(0),
        )
        .await
        .unwrap();

        assert_eq!(outcome.stats.grid_sizes, vec![2]);
        assert_eq!(outcome.stats.iterations, 1);
        assert_eq!(outcome.stats.uplift, 0.0);
        assert_eq!(tracker.consumed, 4);
    }

    #[tokio::test]
    async fn exhausted_sub_budget_interrupts_a_denser_grid() {
        let hub = HarvestPoint::new("hub_a", 52.0, 21.0);
        let bbox = BoundingBox::around(Coordinates::new(52.0, 21.0), 5.0);
        let budget = Arc::new(RequestBudget::new(100, 0));
        let backend = densifying_backend(&budget);
        let mut catalog = hub_catalog(&hub);
        let mut tracker = CoverageBudget::new(CoverageMode::Full, 6, 1.0);

        let outcome = coverage_check(
            &backend,
            &mut catalog,
            std::slice::from_ref(&hub),
            &bbox,
            &grid_plan(2),
            &mut tracker,
            &budget,
            &ProgressReporter::new(0),
        )
        .await
        .unwrap();

        let stats = outcome.stats;
        assert!(stats.stopped_early);
        assert_eq!(stats.grid_sizes, vec![2, 3]);
        assert_eq!(stats.iterations, 2);
        assert_eq!(stats.grid_size, 3);
        assert_eq!(tracker.consumed, 6);
        assert!(tracker.cap_reached());
        assert_eq!(budget.used(RequestKind::Search), 6);
        assert!(catalog.get("g0").is_some());
        assert!(catalog.get("g2").is_none());
    }
}
