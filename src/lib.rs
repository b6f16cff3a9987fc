pub mod backend;
pub mod budget;
pub mod cache;
pub mod config;
pub mod coverage;
pub mod errors;
pub mod filters;
pub mod geo;
pub mod harvest;
pub mod http;
pub mod pipeline;
pub mod place;
pub mod places;
pub mod profile;
pub mod progress;
pub mod ranking;
pub mod routes;
pub mod scan;
pub mod scoring;
pub mod summary;

#[cfg(test)]
mod testing;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use backend::{ApiBackend, SearchBackend};
pub use budget::{MetricsSnapshot, RequestBudget, RequestKind};
pub use cache::Cache;
pub use config::AppConfig;
pub use coverage::{CoverageMode, CoverageReport, CoverageStats};
pub use errors::{AppError, AppResult};
pub use geo::{BoundingBox, Coordinates, HarvestPoint};
pub use pipeline::{run, PipelineResult, RunMode, RunOptions, RunSession};
pub use scan::ScanPlan;
pub use place::PlaceRecord;
pub use profile::SearchProfile;
pub use progress::ProgressReporter;
pub use ranking::ResultRow;
pub use summary::RunSummary;

/// Installs the global subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hub_harvest=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
