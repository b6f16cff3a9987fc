use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::cache::DEFAULT_COMMIT_EVERY;

pub const PLACES_TEXT_SEARCH_URL: &str = "https://places.googleapis.com/v1/places:searchText";
pub const ROUTES_COMPUTE_URL: &str = "https://routes.googleapis.com/directions/v2:computeRoutes";

const DEFAULT_MAX_SEARCH_REQUESTS: u64 = 200;
const DEFAULT_MAX_TRAVEL_REQUESTS: u64 = 300;
pub const DEFAULT_COVERAGE_SHARE: f64 = 0.20;

#[derive(Clone, Debug)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub retry_max: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            retry_max: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

/// Process-level settings. Everything domain-specific lives in the search profile.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_key: Option<SecretString>,
    pub cache_path: PathBuf,
    pub cache_commit_every: usize,
    pub max_search_requests: u64,
    pub max_travel_requests: u64,
    pub http: HttpSettings,
    pub places_text_search_url: String,
    pub routes_compute_url: String,
    pub coverage_mode: String,
    pub coverage_budget_share: f64,
    pub output_dir: PathBuf,
    pub profile_path: PathBuf,
    pub progress_log_every: u64,
    pub progress_batch_size: usize,
    pub no_cache: bool,
    pub refresh_search: bool,
    pub refresh_travel: bool,
    pub skip_travel: bool,
    pub top_n: Option<usize>,
    pub run_mode: String,
    pub scan: ScanSettings,
}

#[derive(Clone, Debug, Default)]
pub struct ScanSettings {
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    pub center_id: Option<String>,
    pub centers: Vec<String>,
    pub radius_km: Option<f64>,
    pub grid_step_km: Option<f64>,
    pub search_radius_m: Option<u32>,
    pub max_pages: Option<usize>,
    pub queries: Option<Vec<String>>,
    pub types: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub cache_path: String,
    pub max_search_requests: u64,
    pub max_travel_requests: u64,
    pub coverage_mode: String,
    pub coverage_budget_share: f64,
    pub output_dir: String,
    pub run_mode: String,
    pub has_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = HttpSettings::default();
        Self {
            api_key: env::var("GOOGLE_MAPS_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            cache_path: PathBuf::from(
                env::var("HARVEST_CACHE_PATH").unwrap_or_else(|_| "cache/harvest.db".to_string()),
            ),
            cache_commit_every: parse_usize("CACHE_COMMIT_EVERY", DEFAULT_COMMIT_EVERY).max(1),
            max_search_requests: parse_u64("MAX_SEARCH_REQUESTS", DEFAULT_MAX_SEARCH_REQUESTS),
            max_travel_requests: parse_u64("MAX_TRAVEL_REQUESTS", DEFAULT_MAX_TRAVEL_REQUESTS),
            http: HttpSettings {
                timeout: Duration::from_secs(parse_u64(
                    "HTTP_TIMEOUT_SECS",
                    defaults.timeout.as_secs(),
                )),
                retry_max: parse_u32("HTTP_RETRY_MAX", defaults.retry_max).max(1),
                backoff_base: Duration::from_millis(parse_u64(
                    "HTTP_BACKOFF_BASE_MS",
                    defaults.backoff_base.as_millis() as u64,
                )),
                backoff_max: Duration::from_millis(parse_u64(
                    "HTTP_BACKOFF_MAX_MS",
                    defaults.backoff_max.as_millis() as u64,
                )),
            },
            places_text_search_url: env::var("PLACES_TEXT_SEARCH_URL")
                .unwrap_or_else(|_| PLACES_TEXT_SEARCH_URL.to_string()),
            routes_compute_url: env::var("ROUTES_COMPUTE_URL")
                .unwrap_or_else(|_| ROUTES_COMPUTE_URL.to_string()),
            coverage_mode: env::var("COVERAGE_MODE").unwrap_or_else(|_| "light".to_string()),
            coverage_budget_share: parse_f64("COVERAGE_BUDGET_SHARE", DEFAULT_COVERAGE_SHARE),
            output_dir: PathBuf::from(env::var("OUTPUT_DIR").unwrap_or_else(|_| "out".to_string())),
            profile_path: PathBuf::from(
                env::var("SEARCH_PROFILE_PATH").unwrap_or_else(|_| "search_config.json".to_string()),
            ),
            progress_log_every: parse_u64("PROGRESS_LOG_EVERY", 50).max(1),
            progress_batch_size: parse_usize("PROGRESS_BATCH_SIZE", 25).max(1),
            no_cache: parse_bool("NO_CACHE", false),
            refresh_search: parse_bool("REFRESH_SEARCH", false),
            refresh_travel: parse_bool("REFRESH_TRAVEL", false),
            skip_travel: parse_bool("SKIP_TRAVEL", false),
            top_n: parse_opt::<usize>("TOP_N"),
            run_mode: env::var("RUN_MODE").unwrap_or_else(|_| "standard".to_string()),
            scan: ScanSettings {
                center_lat: parse_opt("SCAN_CENTER_LAT"),
                center_lon: parse_opt("SCAN_CENTER_LON"),
                center_id: env::var("SCAN_CENTER_ID").ok().filter(|v| !v.trim().is_empty()),
                centers: parse_list("SCAN_CENTERS").unwrap_or_default(),
                radius_km: parse_opt("SCAN_RADIUS_KM"),
                grid_step_km: parse_opt("SCAN_GRID_STEP_KM"),
                search_radius_m: parse_opt("SCAN_SEARCH_RADIUS_M"),
                max_pages: parse_opt("SCAN_MAX_PAGES"),
                queries: parse_list("SCAN_QUERIES"),
                types: parse_list("SCAN_TYPES"),
            },
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            cache_path: self.cache_path.to_string_lossy().to_string(),
            max_search_requests: self.max_search_requests,
            max_travel_requests: self.max_travel_requests,
            coverage_mode: self.coverage_mode.clone(),
            coverage_budget_share: self.coverage_budget_share,
            output_dir: self.output_dir.to_string_lossy().to_string(),
            run_mode: self.run_mode.clone(),
            has_api_key: self.api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_u64(key: &str, default: u64) -> u64 {
    parse_opt(key).unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    parse_opt(key).unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    parse_opt(key).unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    parse_opt(key).unwrap_or(default)
}

fn parse_list(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}
