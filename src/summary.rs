use std::collections::BTreeMap;

use serde::Serialize;

use crate::budget::MetricsSnapshot;
use crate::coverage::{CoverageReport, CoverageStats};
use crate::filters::RejectionCounts;
use crate::ranking::ResultRow;

/// Short view of a leading accepted row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewRow {
    pub place_id: String,
    pub name: Option<String>,
    pub quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub travel_min_minutes: Option<f64>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_point_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

impl From<&ResultRow> for PreviewRow {
    fn from(row: &ResultRow) -> Self {
        Self {
            place_id: row.place_id.clone(),
            name: row.name.clone(),
            quality: row.quality,
            travel_min_minutes: row.travel_min_minutes,
            final_score: row.final_score,
            nearest_point_id: row.nearest_point_id.clone(),
            distance_km: row.distance_km,
        }
    }
}

pub fn preview(rows: &[ResultRow], limit: usize) -> Vec<PreviewRow> {
    rows.iter().take(limit).map(PreviewRow::from).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CenterSummary {
    pub unique_place_ids: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub scan_points: usize,
    pub budget_exceeded: bool,
    pub rejection_counts: RejectionCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanSummary {
    pub radius_km: f64,
    pub grid_step_km: f64,
    pub search_radius_m: u32,
    pub queries: Vec<String>,
    pub types: Vec<String>,
    pub budget_exceeded: bool,
    pub per_center: BTreeMap<String, CenterSummary>,
}

/// Everything a caller needs to report on one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub mode: String,
    #[serde(flatten)]
    pub requests: MetricsSnapshot,
    pub travel_skipped: bool,
    pub unique_place_ids: usize,
    pub accepted: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_report: Option<CoverageReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query_group_totals: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query_group_uniques: BTreeMap<String, usize>,
    pub rejection_counts: RejectionCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan: Option<ScanSummary>,
    pub top: Vec<PreviewRow>,
}
